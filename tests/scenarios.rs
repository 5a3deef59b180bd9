//! End-to-end scenarios over real sockets and threads
//!
//! Each test boots a full server (workers + app threads + rings), speaks
//! RFC 6455 from a plain TCP client, and checks the exact bytes the spec
//! calls for.

use std::io::{ Read, Write };
use std::net::{ TcpListener, TcpStream };
use std::time::Duration;

use spool::config::RingTuning;
use spool::ring::{ link, UpdateEntry, UpdateQueue, WakeHandle };
use spool::wire::inbound;
use spool::{
    AppContext,
    AppHandler,
    AppSpec,
    ClientId,
    Message,
    PortConfig,
    Server,
    ServerConfig,
    Verdict,
};

// ---------------------------------------------------------------------------
// minimal WebSocket client
// ---------------------------------------------------------------------------

struct WsClient {
    sock: TcpStream,
}

impl WsClient {
    fn connect(port: u16) -> Self {
        let sock = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.set_nodelay(true).ok();
        let mut client = Self { sock };
        client.handshake();
        client
    }

    fn handshake(&mut self) {
        let request = "GET / HTTP/1.1\r\n\
             Host: 127.0.0.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n";
        self.sock.write_all(request.as_bytes()).unwrap();

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            self.sock.read_exact(&mut byte).expect("handshake response");
            response.push(byte[0]);
            assert!(response.len() < 4096);
        }
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101"), "unexpected response: {text}");
        assert!(text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mask = [0x13u8, 0x57, 0x9B, 0xDF];
        let mut out = Vec::with_capacity(payload.len() + 14);
        out.push(0x80 | opcode);
        if payload.len() <= 125 {
            out.push(0x80 | (payload.len() as u8));
        } else if payload.len() <= 65_535 {
            out.push(0x80 | 126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            out.push(b ^ mask[i & 3]);
        }
        self.sock.write_all(&out).unwrap();
    }

    fn send_text(&mut self, payload: &[u8]) {
        self.send_frame(0x1, payload);
    }

    /// Read one server frame; returns (opcode, payload).
    fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        self.sock.read_exact(&mut head).expect("frame head");
        assert_eq!(head[0] & 0x80, 0x80, "server frames carry FIN");
        assert_eq!(head[1] & 0x80, 0, "server frames are unmasked");
        let len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                self.sock.read_exact(&mut ext).unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.sock.read_exact(&mut ext).unwrap();
                u64::from_be_bytes(ext) as usize
            }
            small => small as usize,
        };
        let mut payload = vec![0u8; len];
        self.sock.read_exact(&mut payload).unwrap();
        (head[0] & 0x0F, payload)
    }

    fn read_raw(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.sock.read_exact(&mut buf).unwrap();
        buf
    }

    fn expect_silence(&mut self) {
        self.sock.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut byte = [0u8; 1];
        match self.sock.read(&mut byte) {
            Err(ref e) if
                e.kind() == std::io::ErrorKind::WouldBlock ||
                e.kind() == std::io::ErrorKind::TimedOut
            => {}
            other => panic!("expected silence, got {other:?}"),
        }
        self.sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// test apps
// ---------------------------------------------------------------------------

/// Echoes every message; "quit" earns an app-chosen close.
struct EchoApp;

impl AppHandler for EchoApp {
    fn on_read(
        &mut self,
        ctx: &mut AppContext<'_>,
        _client: ClientId,
        msg: &Message<'_>
    ) -> Verdict {
        if msg.is_text && msg.raw == b"quit" {
            return Verdict::Close(4000);
        }
        ctx.to_cur(msg.raw, !msg.is_text).map(|_| Verdict::Ok).unwrap_or(Verdict::Fatal)
    }
}

/// Command app: "bcast" broadcasts "X"; "notme" broadcasts "X" to everyone
/// but the sender.
struct BroadcastApp;

impl AppHandler for BroadcastApp {
    fn on_read(
        &mut self,
        ctx: &mut AppContext<'_>,
        _client: ClientId,
        msg: &Message<'_>
    ) -> Verdict {
        let result = match msg.raw {
            b"bcast" => ctx.to_every(b"X", false),
            b"notme" => {
                let cur = ctx.current().expect("read has a current client");
                ctx.to_every_except_single(cur, b"X", false)
            }
            _ => Ok(()),
        };
        result.map(|_| Verdict::Ok).unwrap_or(Verdict::Fatal)
    }
}

fn start(workers: usize, port: u16, app: Box<dyn AppHandler>) -> Server {
    let config = ServerConfig::new(workers)
        .unwrap()
        .with_port(PortConfig::plain(format!("127.0.0.1:{port}").parse().unwrap(), 0));
    Server::start(config, vec![AppSpec::new(app)]).expect("server start")
}

// ---------------------------------------------------------------------------
// scenarios
// ---------------------------------------------------------------------------

/// Scenario 1: a 3-byte text echo produces exactly 81 03 68 69 21.
#[test]
fn scenario_echo_exact_bytes() {
    let port = free_port();
    let server = start(1, port, Box::new(EchoApp));

    let mut client = WsClient::connect(port);
    client.send_text(b"hi!");
    assert_eq!(client.read_raw(5), [0x81, 0x03, 0x68, 0x69, 0x21]);

    drop(client);
    server.shutdown().unwrap();
}

/// Scenario 5: a 70 KiB payload reassembles into one message and echoes
/// back intact.
#[test]
fn scenario_large_message_reassembly() {
    let port = free_port();
    let server = start(1, port, Box::new(EchoApp));

    let payload: Vec<u8> = (0..70 * 1024).map(|i| (i % 251) as u8).collect();
    let mut client = WsClient::connect(port);
    client.send_frame(0x2, &payload);

    let (opcode, echoed) = client.read_frame();
    assert_eq!(opcode, 0x2);
    assert_eq!(echoed, payload);

    drop(client);
    server.shutdown().unwrap();
}

/// Per-peer ordering: echoes come back in send order.
#[test]
fn scenario_per_peer_ordering() {
    let port = free_port();
    let server = start(1, port, Box::new(EchoApp));

    let mut client = WsClient::connect(port);
    for i in 0..20u8 {
        client.send_text(&[b'0' + (i % 10)]);
    }
    for i in 0..20u8 {
        let (_, payload) = client.read_frame();
        assert_eq!(payload, [b'0' + (i % 10)], "echo {i} out of order");
    }

    drop(client);
    server.shutdown().unwrap();
}

/// Scenario 2 (wire half): to_every reaches all clients across workers.
#[test]
fn scenario_broadcast_reaches_everyone() {
    let port = free_port();
    let server = start(2, port, Box::new(BroadcastApp));

    let mut clients: Vec<WsClient> = (0..4).map(|_| WsClient::connect(port)).collect();
    clients[0].send_text(b"bcast");

    for client in clients.iter_mut() {
        assert_eq!(client.read_raw(3), [0x81, 0x01, 0x58]);
    }

    drop(clients);
    server.shutdown().unwrap();
}

/// Scenario 3 (wire half): the sender is excluded, everyone else delivered.
#[test]
fn scenario_broadcast_except_sender() {
    let port = free_port();
    let server = start(2, port, Box::new(BroadcastApp));

    let mut clients: Vec<WsClient> = (0..3).map(|_| WsClient::connect(port)).collect();
    clients[1].send_text(b"notme");

    assert_eq!(clients[0].read_raw(3), [0x81, 0x01, 0x58]);
    assert_eq!(clients[2].read_raw(3), [0x81, 0x01, 0x58]);
    clients[1].expect_silence();

    drop(clients);
    server.shutdown().unwrap();
}

/// An app close verdict reaches the client as a close frame with the
/// app-chosen code, followed by FIN.
#[test]
fn scenario_app_close_verdict() {
    let port = free_port();
    let server = start(1, port, Box::new(EchoApp));

    let mut client = WsClient::connect(port);
    client.send_text(b"quit");

    let (opcode, payload) = client.read_frame();
    assert_eq!(opcode, 0x8);
    assert_eq!(payload, 4000u16.to_be_bytes());

    // server half-closes after the close frame
    let mut tail = [0u8; 1];
    assert_eq!(client.sock.read(&mut tail).unwrap(), 0, "expected FIN");

    drop(client);
    server.shutdown().unwrap();
}

/// A client close frame is echoed and the connection winds down cleanly.
#[test]
fn scenario_client_close_handshake() {
    let port = free_port();
    let server = start(1, port, Box::new(EchoApp));

    let mut client = WsClient::connect(port);
    client.send_frame(0x8, &1000u16.to_be_bytes());

    let (opcode, payload) = client.read_frame();
    assert_eq!(opcode, 0x8);
    assert_eq!(payload, 1000u16.to_be_bytes());

    let mut tail = [0u8; 1];
    assert_eq!(client.sock.read(&mut tail).unwrap(), 0, "expected FIN");

    drop(client);
    server.shutdown().unwrap();
}

/// Pings are answered with matching pongs without app involvement.
#[test]
fn scenario_ping_pong() {
    let port = free_port();
    let server = start(1, port, Box::new(EchoApp));

    let mut client = WsClient::connect(port);
    client.send_frame(0x9, b"tick");
    let (opcode, payload) = client.read_frame();
    assert_eq!(opcode, 0xA);
    assert_eq!(payload, b"tick");

    drop(client);
    server.shutdown().unwrap();
}

/// Scenario 4: ten messages published while the consumer sleeps produce
/// one wake; the consumer drains all ten in order.
#[test]
fn scenario_sleeping_consumer_wakes_once_for_ten() {
    let tuning = RingTuning { initial_size: 4096, multiplier: 1.5 };
    let consumer_wake = WakeHandle::new().unwrap();
    let (worker_half, mut app_half) = link(
        tuning,
        tuning,
        WakeHandle::new().unwrap(),
        consumer_wake.clone()
    );

    // consumer: sleep protocol, then drain whatever one wake delivers
    let consumer = std::thread::spawn(move || {
        consumer_wake.sleep.fall_asleep();
        if !app_half.inbound.has_pending() {
            assert!(consumer_wake.wake.wait(Some(Duration::from_secs(5))).unwrap(), "lost wakeup");
        }
        consumer_wake.sleep.wake_up();

        // one drain pass must see all ten records, in order
        let mut seen = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.len() < 10 {
            assert!(std::time::Instant::now() < deadline, "drained only {}", seen.len());
            let mut drain = app_half.inbound.begin();
            let window = drain.window().to_vec();
            let mut used = 0;
            while used < window.len() {
                let (record, n) = inbound::parse_record(&window[used..]).unwrap();
                if let inbound::InboundRecord::Read { payload, .. } = record {
                    seen.push(payload[0]);
                }
                used += n;
            }
            drain.advance(used);
        }
        assert_eq!(seen, (0..10u8).collect::<Vec<_>>());

        // and no second wake is pending
        assert!(!consumer_wake.wake.wait(Some(Duration::from_millis(100))).unwrap());
    });

    // producer: ten records in tight succession, one flush
    std::thread::sleep(Duration::from_millis(50)); // let the consumer fall asleep
    let mut updates = UpdateQueue::new(64);
    let mut links = [worker_half];
    for i in 0..10u8 {
        let len = inbound::read_len(1);
        let dst = links[0].inbound.reserve(len).unwrap();
        inbound::write_read(&mut dst[..len], 1, false, &[i]);
        links[0].inbound.commit(len);
        let position = links[0].inbound.position();
        updates.record(&mut links, UpdateEntry { link: 0, position, is_write: true }).unwrap();
    }
    updates.flush(&mut links).unwrap();

    consumer.join().unwrap();
}

/// No lost wakeups under sustained sleep/publish races.
#[test]
fn wake_protocol_stress() {
    let tuning = RingTuning { initial_size: 1024, multiplier: 1.5 };
    let consumer_wake = WakeHandle::new().unwrap();
    let (worker_half, mut app_half) = link(
        tuning,
        tuning,
        WakeHandle::new().unwrap(),
        consumer_wake.clone()
    );

    const TOTAL: u32 = 5_000;

    let consumer = std::thread::spawn(move || {
        let mut received = 0u32;
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while received < TOTAL {
            assert!(std::time::Instant::now() < deadline, "stalled at {received} (lost wakeup?)");
            // drain
            loop {
                let used = {
                    let mut drain = app_half.inbound.begin();
                    let window = drain.window();
                    let mut used = 0;
                    while used < window.len() {
                        let (_, n) = inbound::parse_record(&window[used..]).unwrap();
                        received += 1;
                        used += n;
                    }
                    drain.advance(used);
                    used
                };
                app_half.inbound.publish_read();
                if used == 0 {
                    break;
                }
            }
            if received >= TOTAL {
                break;
            }
            // idle protocol with the mandatory double check
            consumer_wake.sleep.fall_asleep();
            if app_half.inbound.has_pending() {
                consumer_wake.sleep.wake_up();
                continue;
            }
            consumer_wake.wake.wait(Some(Duration::from_secs(5))).unwrap();
            consumer_wake.sleep.wake_up();
        }
        received
    });

    let mut updates = UpdateQueue::new(8);
    let mut links = [worker_half];
    for i in 0..TOTAL {
        let len = inbound::read_len(4);
        let dst = links[0].inbound.reserve(len).unwrap();
        inbound::write_read(&mut dst[..len], 1, false, &i.to_le_bytes());
        links[0].inbound.commit(len);
        let position = links[0].inbound.position();
        updates.record(&mut links, UpdateEntry { link: 0, position, is_write: true }).unwrap();
        if i % 7 == 0 {
            updates.flush(&mut links).unwrap();
            if i % 63 == 0 {
                std::thread::yield_now();
            }
        }
    }
    updates.flush(&mut links).unwrap();

    assert_eq!(consumer.join().unwrap(), TOTAL);
}
