//! Worker event loop
//!
//! A worker owns its peer table, its listener set, and one epoll instance
//! covering listeners, peer sockets, and the wake eventfd its app-side
//! producers signal. Each loop turn drains the outbound rings into per-peer
//! writes, services socket readiness by (layer, mortality) dispatch, and
//! flushes the update queue exactly once.

pub mod epoll;
pub mod fanout;
pub mod http;
pub mod listener;
pub mod ws;

use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use tracing::{ debug, info_span, trace, warn };

use crate::config::ServerConfig;
use crate::constants::{ EPOLL_EVENT_BATCH, MAX_HANDSHAKE_SIZE };
use crate::error::Result;
use crate::peer::tls::TlsSession;
use crate::peer::transport::{ FillStatus, ShutdownStatus, WriteOutcome };
use crate::peer::{ Layer, Mortality, PeerTable };
use crate::ring::{ UpdateEntry, UpdateQueue, WakeHandle, WorkerLink };
use crate::wire::frame::{ self, close_code };
use crate::wire::{ inbound, outbound };

use self::epoll::{ Epoll, Event, Token };
use self::listener::Listener;
use self::ws::WsOutcome;

/// Pin the calling thread to one CPU.
pub fn pin_to_cpu(cpu: usize) -> Result<()> {
    let mut set = nix::sched::CpuSet::new();
    set.set(cpu)?;
    nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set)?;
    Ok(())
}

/// One worker thread's state.
pub struct Worker {
    index: u32,
    epoll: Epoll,
    wake: WakeHandle,
    links: Vec<WorkerLink>,
    updates: UpdateQueue,
    peers: PeerTable,
    listeners: Vec<Listener>,
    max_ws_message: usize,
    pin_cpu: Option<usize>,
    shutdown: Arc<AtomicBool>,
    fanout_scratch: Vec<u32>,
}

impl Worker {
    pub fn new(
        index: u32,
        config: &ServerConfig,
        links: Vec<WorkerLink>,
        wake: WakeHandle,
        shutdown: Arc<AtomicBool>
    ) -> Result<Self> {
        let listeners = config.ports
            .iter()
            .map(Listener::bind)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            index,
            epoll: Epoll::new(EPOLL_EVENT_BATCH)?,
            wake,
            updates: UpdateQueue::new(config.worker_update_queue_size),
            links,
            peers: PeerTable::new(config.peers_per_worker),
            listeners,
            max_ws_message: config.max_ws_message_size,
            pin_cpu: config.pin_workers.then_some(index as usize),
            shutdown,
            fanout_scratch: Vec::new(),
        })
    }

    /// Run until the shutdown flag is observed.
    pub fn run(&mut self) -> Result<()> {
        let span = info_span!("worker", index = self.index);
        let _guard = span.enter();

        if let Some(cpu) = self.pin_cpu {
            if let Err(e) = pin_to_cpu(cpu) {
                warn!(cpu, error = %e, "CPU pinning failed");
            }
        }

        for (i, listener) in self.listeners.iter().enumerate() {
            self.epoll.add_read(listener.socket.as_raw_fd(), Token::Listener(i as u32))?;
        }
        self.epoll.add_read(self.wake.wake.raw(), Token::Wake)?;
        debug!(listeners = self.listeners.len(), links = self.links.len(), "worker running");

        loop {
            self.drain_outbound()?;
            self.updates.flush(&mut self.links)?;

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            // idle protocol: announce sleep, re-scan, only then block.
            // epoll itself is the blocking point; the wake fd is registered
            // there, so a producer that saw ASLEEP gets us out of the wait.
            self.wake.sleep.fall_asleep();
            if self.links.iter().any(|l| l.outbound.has_pending()) {
                self.wake.sleep.wake_up();
                continue;
            }
            let events = self.epoll.wait(-1)?;
            self.wake.sleep.wake_up();

            for event in events {
                self.dispatch(event)?;
            }
        }

        debug!(peers = self.peers.live_count(), "worker stopping");
        Ok(())
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event.token {
            Token::Wake => {
                self.wake.wake.drain();
                Ok(())
            }
            Token::Listener(i) => self.accept_loop(i as usize),
            Token::Peer(index) => self.peer_event(index, event),
        }
    }

    fn accept_loop(&mut self, listener_index: usize) -> Result<()> {
        loop {
            match self.listeners[listener_index].socket.accept() {
                Ok((stream, addr)) => {
                    trace!(%addr, "accepted");
                    self.admit(stream, listener_index)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, listener_index: usize) -> Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true).ok();

        let Some(index) = self.peers.alloc() else {
            warn!("peer table full, refusing connection");
            return Ok(());
        };

        let listener = &self.listeners[listener_index];
        let app = listener.app;
        let tls_config = listener.tls.clone();

        let slot = self.peers.slot_mut(index);
        slot.open(stream, app, tls_config.is_some());
        match tls_config {
            Some(config) => {
                match TlsSession::new(config) {
                    Ok(session) => {
                        slot.tls = Some(Box::new(session));
                        slot.layer = Layer::Tls;
                    }
                    Err(e) => {
                        warn!(error = %e, "TLS session setup failed");
                        self.peers.release(index);
                        return Ok(());
                    }
                }
            }
            None => {
                slot.layer = Layer::Http;
            }
        }

        let fd = self.peers
            .slot_mut(index)
            .socket.as_ref()
            .map(|s| s.as_raw_fd())
            .unwrap_or(-1);
        if let Err(e) = self.epoll.add_peer(fd, Token::Peer(index)) {
            warn!(error = %e, "epoll registration failed");
            self.peers.release(index);
            return Ok(());
        }
        debug!(peer = index, "admitted");
        Ok(())
    }

    fn peer_event(&mut self, index: u32, event: Event) -> Result<()> {
        let slot = self.peers.slot_mut(index);
        if slot.is_free() {
            return Ok(()); // readiness for a slot reaped earlier this turn
        }

        if !matches!(slot.mortality, Mortality::Live) {
            return self.progress_peer_shutdown(index);
        }

        if event.writable && slot.is_writing {
            match slot.flush_pending() {
                WriteOutcome::Error => {
                    return self.kill_peer(index, close_code::ABNORMAL);
                }
                WriteOutcome::Complete | WriteOutcome::Again => {}
            }
        }

        if event.readable {
            return self.readable_step(index);
        }
        Ok(())
    }

    fn readable_step(&mut self, index: u32) -> Result<()> {
        let result = self.peers.slot_mut(index).fill_inbuf();

        if result.read > 0 {
            self.parse_layer(index)?;
        }

        // handshake records and alerts may be queued even without plaintext
        let slot = self.peers.slot_mut(index);
        if !slot.is_free() && slot.tls_wants_write() && !slot.is_writing {
            if slot.pump_tls_out() == WriteOutcome::Error {
                return self.kill_peer(index, close_code::ABNORMAL);
            }
        }

        match result.status {
            FillStatus::Again => Ok(()),
            FillStatus::Eof => {
                // peer closed its write half; buffered frames were parsed
                // above, anything else ends the connection
                let slot = self.peers.slot_mut(index);
                if slot.is_free() {
                    return Ok(());
                }
                slot.begin_shutdown(close_code::ABNORMAL);
                self.progress_peer_shutdown(index)
            }
            FillStatus::Error => self.kill_peer(index, close_code::ABNORMAL),
        }
    }

    fn parse_layer(&mut self, index: u32) -> Result<()> {
        let slot = self.peers.slot_mut(index);
        if matches!(slot.layer, Layer::Tls) {
            let done = slot.tls
                .as_ref()
                .map(|t| !t.is_handshaking())
                .unwrap_or(false);
            if !done {
                return Ok(());
            }
            slot.layer = Layer::Http;
        }

        match self.peers.slot_mut(index).layer {
            Layer::Http => self.http_step(index),
            Layer::Ws => self.ws_step(index),
            _ => Ok(()),
        }
    }

    fn http_step(&mut self, index: u32) -> Result<()> {
        let slot = self.peers.slot_mut(index);
        match http::try_upgrade(&slot.inbuf) {
            http::Upgrade::Incomplete => {
                if slot.inbuf.len() > MAX_HANDSHAKE_SIZE {
                    return self.kill_peer(index, close_code::ABNORMAL);
                }
                Ok(())
            }
            http::Upgrade::Rejected { response } => {
                trace!(peer = index, "upgrade rejected");
                slot.enqueue_bytes(response);
                slot.begin_shutdown(close_code::PROTOCOL_ERROR);
                self.progress_peer_shutdown(index)
            }
            http::Upgrade::Accepted { response, consumed } => {
                slot.inbuf.drain(..consumed);
                if slot.send_bytes(&response) == WriteOutcome::Error {
                    return self.kill_peer(index, close_code::ABNORMAL);
                }
                slot.layer = Layer::Ws;
                slot.opened = true;
                debug!(peer = index, "upgraded");

                let Worker { links, updates, peers, .. } = self;
                let slot = peers.slot_mut(index);
                let app = slot.app as usize;
                let link = &mut links[app];
                let len = inbound::open_len();
                let dst = link.inbound.reserve(len)?;
                inbound::write_open(&mut dst[..len], index);
                link.inbound.commit(len);
                let position = link.inbound.position();
                updates.record(links, UpdateEntry {
                    link: app as u32,
                    position,
                    is_write: true,
                })?;

                // frames may ride in right behind the upgrade request
                if !self.peers.slot_mut(index).inbuf.is_empty() {
                    return self.ws_step(index);
                }
                Ok(())
            }
        }
    }

    fn ws_step(&mut self, index: u32) -> Result<()> {
        let outcome = {
            let Worker { links, updates, peers, max_ws_message, .. } = self;
            let slot = peers.slot_mut(index);
            let app = slot.app as usize;
            ws::process_inbound(slot, *max_ws_message, |is_text, payload| {
                let link = &mut links[app];
                let len = inbound::read_len(payload.len());
                let dst = link.inbound.reserve(len)?;
                inbound::write_read(&mut dst[..len], index, is_text, payload);
                link.inbound.commit(len);
                let position = link.inbound.position();
                updates.record(links, UpdateEntry {
                    link: app as u32,
                    position,
                    is_write: true,
                })
            })?
        };

        match outcome {
            WsOutcome::Continue => Ok(()),
            WsOutcome::TransportError => self.kill_peer(index, close_code::ABNORMAL),
            WsOutcome::Violation { code } => self.close_with_frame(index, code, code),
            WsOutcome::CloseReceived { echo_code, app_code } => {
                self.close_with_frame(index, echo_code, app_code)
            }
        }
    }

    /// Queue a close frame (once), then walk the shutdown progression.
    fn close_with_frame(&mut self, index: u32, echo_code: u16, app_code: u16) -> Result<()> {
        let slot = self.peers.slot_mut(index);
        if !slot.close_sent && matches!(slot.layer, Layer::Ws) {
            let mut close = Vec::with_capacity(4 + frame::server_header_len(2));
            frame::append_close_frame(&mut close, echo_code, b"");
            slot.enqueue_bytes(&close);
            slot.close_sent = true;
        }
        slot.begin_shutdown(app_code);
        self.progress_peer_shutdown(index)
    }

    fn progress_peer_shutdown(&mut self, index: u32) -> Result<()> {
        match self.peers.slot_mut(index).progress_shutdown()? {
            ShutdownStatus::InProgress => Ok(()),
            ShutdownStatus::Dead => self.reap(index),
        }
    }

    /// Abrupt close: no FIN handshake, straight to DEAD.
    fn kill_peer(&mut self, index: u32, app_code: u16) -> Result<()> {
        let slot = self.peers.slot_mut(index);
        if slot.is_free() {
            return Ok(());
        }
        slot.close_code = app_code;
        slot.mortality = Mortality::Dead;
        self.reap(index)
    }

    /// Close the socket, tell the owning app, zero the slot, recycle.
    fn reap(&mut self, index: u32) -> Result<()> {
        let Worker { links, updates, peers, .. } = self;
        let slot = peers.slot_mut(index);
        if slot.opened {
            let app = slot.app as usize;
            let code = slot.close_code;
            let link = &mut links[app];
            let len = inbound::close_len();
            let dst = link.inbound.reserve(len)?;
            inbound::write_close(&mut dst[..len], index, code);
            link.inbound.commit(len);
            let position = link.inbound.position();
            updates.record(links, UpdateEntry {
                link: app as u32,
                position,
                is_write: true,
            })?;
        }
        peers.release(index);
        debug!(peer = index, "reaped");
        Ok(())
    }

    /// Drain every app's outbound ring into per-peer writes.
    fn drain_outbound(&mut self) -> Result<()> {
        let mut kills: Vec<u32> = Vec::new();
        let mut closing: Vec<u32> = Vec::new();

        for app_idx in 0..self.links.len() {
            let consumed_total = {
                let Worker { links, peers, fanout_scratch, .. } = self;
                let link = &mut links[app_idx];
                let mut drain = link.outbound.begin();
                let window = drain.window();
                if window.is_empty() {
                    continue;
                }
                let mut consumed = 0usize;
                while consumed < window.len() {
                    let record = outbound::parse_record(&window[consumed..])?;
                    let mut report = fanout::fan_out(peers, &record, fanout_scratch);
                    kills.append(&mut report.failed);
                    closing.append(&mut report.closing);
                    consumed += record.consumed;
                }
                drain.advance(consumed);
                consumed
            };

            if consumed_total > 0 {
                let position = self.links[app_idx].outbound.position();
                self.updates.record(&mut self.links, UpdateEntry {
                    link: app_idx as u32,
                    position,
                    is_write: false,
                })?;
            }
        }

        // walk the shutdown for peers an app just closed, so their FIN
        // does not wait for an unrelated readiness event
        for index in closing {
            self.progress_peer_shutdown(index)?;
        }
        for index in kills {
            self.kill_peer(index, close_code::ABNORMAL)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_to_current_cpu() {
        // CPU 0 exists everywhere this test runs
        assert!(pin_to_cpu(0).is_ok());
    }
}
