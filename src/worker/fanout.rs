//! Worker-side fan-out
//!
//! Expands an outbound record's recipient-set tag into concrete per-peer
//! writes against this worker's own table. Stale slot indices miss the
//! liveness check and produce neither delivery nor error. A peer whose
//! kernel buffer is full keeps the remainder in its pending buffer and
//! never blocks the loop.

use tracing::trace;

use crate::constants::FANOUT_STACK_RECIPIENTS;
use crate::peer::transport::WriteOutcome;
use crate::peer::PeerTable;
use crate::wire::frame::{ close_code, OP_CLOSE };
use crate::wire::outbound::{ OutboundRecord, Recipients, SlotList };

/// Exclusion set for the EVERY_EXCEPT kinds. Small lists live in a fixed
/// stack array; anything longer spills to the heap.
enum Exclusions {
    None,
    One(u32),
    Stack {
        slots: [u32; FANOUT_STACK_RECIPIENTS],
        len: usize,
    },
    Heap(Vec<u32>),
}

impl Exclusions {
    fn from_list(list: &SlotList<'_>) -> Self {
        let len = list.len();
        if len == 0 {
            return Self::None;
        }
        if len <= FANOUT_STACK_RECIPIENTS {
            let mut slots = [0u32; FANOUT_STACK_RECIPIENTS];
            for (dst, slot) in slots.iter_mut().zip(list.iter()) {
                *dst = slot;
            }
            Self::Stack { slots, len }
        } else {
            Self::Heap(list.iter().collect())
        }
    }

    fn contains(&self, slot: u32) -> bool {
        match self {
            Self::None => false,
            Self::One(s) => *s == slot,
            Self::Stack { slots, len } => slots[..*len].contains(&slot),
            Self::Heap(slots) => slots.contains(&slot),
        }
    }
}

/// The close code a server close frame carries, for the app's close hook.
fn close_frame_code(frame: &[u8]) -> u16 {
    // close payloads fit the 1-byte length, so the header is always 2 bytes
    if frame.len() >= 4 { u16::from_be_bytes([frame[2], frame[3]]) } else { close_code::NORMAL }
}

/// What one fan-out pass did.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub delivered: usize,
    /// Slots whose transport failed outright; the caller reaps these
    pub failed: Vec<u32>,
    /// Slots an app-directed close frame moved into the shutdown
    /// progression; the caller walks it so the FIN does not wait for an
    /// unrelated socket event
    pub closing: Vec<u32>,
}

/// Deliver one record against this worker's table.
pub fn fan_out(
    table: &mut PeerTable,
    record: &OutboundRecord<'_>,
    scratch: &mut Vec<u32>
) -> FanOutReport {
    let mut report = FanOutReport::default();

    let mut deliver_to = |table: &mut PeerTable, slot_index: u32| {
        let Some(slot) = table.get_mut(slot_index) else {
            return; // recycled or unknown id: silent miss
        };
        if !slot.is_live_ws() {
            return;
        }
        let is_close = record.frame[0] & 0x0F == OP_CLOSE;
        match slot.send_bytes(record.frame) {
            WriteOutcome::Error => report.failed.push(slot_index),
            _ => {
                report.delivered += 1;
                if is_close {
                    slot.close_sent = true;
                    slot.begin_shutdown(close_frame_code(record.frame));
                    report.closing.push(slot_index);
                }
            }
        }
    };

    match record.recipients {
        Recipients::Single(slot) => deliver_to(table, slot),
        Recipients::Array(list) => {
            for slot in list.iter() {
                deliver_to(table, slot);
            }
        }
        Recipients::Every => {
            scratch.clear();
            scratch.extend(table.live_ws_indices());
            for &slot in scratch.iter() {
                deliver_to(table, slot);
            }
        }
        Recipients::EveryExceptSingle(excluded) => {
            let exclusions = Exclusions::One(excluded);
            scratch.clear();
            scratch.extend(table.live_ws_indices());
            for &slot in scratch.iter() {
                if !exclusions.contains(slot) {
                    deliver_to(table, slot);
                }
            }
        }
        Recipients::EveryExceptArray(list) => {
            let exclusions = Exclusions::from_list(&list);
            scratch.clear();
            scratch.extend(table.live_ws_indices());
            for &slot in scratch.iter() {
                if !exclusions.contains(slot) {
                    deliver_to(table, slot);
                }
            }
        }
    }

    trace!(delivered = report.delivered, failures = report.failed.len(), "fan-out");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ Layer, Mortality };
    use crate::wire::frame::{ append_server_frame, OP_TEXT };
    use crate::wire::outbound::{ parse_record, record_len, write_record, OutboundKind };
    use std::io::Read;
    use std::net::{ TcpListener, TcpStream };

    struct Harness {
        table: PeerTable,
        clients: Vec<Option<TcpStream>>,
    }

    impl Harness {
        fn new(peers: usize) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let mut table = PeerTable::new(peers.max(4));
            let mut clients = Vec::new();
            for _ in 0..peers {
                let client = TcpStream::connect(addr).unwrap();
                let (server, _) = listener.accept().unwrap();
                server.set_nonblocking(true).unwrap();
                let idx = table.alloc().unwrap();
                let slot = table.slot_mut(idx);
                slot.open(server, 0, false);
                slot.layer = Layer::Ws;
                clients.push(Some(client));
            }
            Self { table, clients }
        }

        fn read_client(&mut self, idx: usize, len: usize) -> Vec<u8> {
            let mut buf = vec![0u8; len];
            let client = self.clients[idx].as_mut().unwrap();
            client.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
            client.read_exact(&mut buf).unwrap();
            buf
        }

        fn client_is_quiet(&mut self, idx: usize) -> bool {
            let client = self.clients[idx].as_mut().unwrap();
            client
                .set_read_timeout(Some(std::time::Duration::from_millis(50)))
                .unwrap();
            let mut buf = [0u8; 1];
            matches!(client.read(&mut buf), Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut)
        }
    }

    fn record_buf(kind: OutboundKind, slots: &[u32], payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        append_server_frame(&mut frame, OP_TEXT, payload);
        let mut buf = vec![0u8; record_len(kind, slots.len(), frame.len())];
        write_record(&mut buf, kind, slots, &frame);
        buf
    }

    #[test]
    fn test_single_delivery() {
        let mut harness = Harness::new(2);
        let buf = record_buf(OutboundKind::Single, &[0], b"hi!");
        let record = parse_record(&buf).unwrap();

        let mut scratch = Vec::new();
        let report = fan_out(&mut harness.table, &record, &mut scratch);
        assert_eq!((report.delivered, report.failed.len()), (1, 0));

        assert_eq!(harness.read_client(0, 5), [0x81, 0x03, 0x68, 0x69, 0x21]);
        assert!(harness.client_is_quiet(1));
    }

    #[test]
    fn test_every_delivery() {
        let mut harness = Harness::new(3);
        let buf = record_buf(OutboundKind::Every, &[], b"X");
        let record = parse_record(&buf).unwrap();

        let mut scratch = Vec::new();
        let report = fan_out(&mut harness.table, &record, &mut scratch);
        assert_eq!(report.delivered, 3);
        for idx in 0..3 {
            assert_eq!(harness.read_client(idx, 3), [0x81, 0x01, 0x58]);
        }
    }

    #[test]
    fn test_every_except_single() {
        let mut harness = Harness::new(3);
        let buf = record_buf(OutboundKind::EveryExceptSingle, &[1], b"X");
        let record = parse_record(&buf).unwrap();

        let mut scratch = Vec::new();
        let report = fan_out(&mut harness.table, &record, &mut scratch);
        assert_eq!(report.delivered, 2);
        assert_eq!(harness.read_client(0, 3), [0x81, 0x01, 0x58]);
        assert!(harness.client_is_quiet(1));
        assert_eq!(harness.read_client(2, 3), [0x81, 0x01, 0x58]);
    }

    #[test]
    fn test_every_except_array() {
        let mut harness = Harness::new(4);
        let buf = record_buf(OutboundKind::EveryExceptArray, &[0, 2], b"X");
        let record = parse_record(&buf).unwrap();

        let mut scratch = Vec::new();
        let report = fan_out(&mut harness.table, &record, &mut scratch);
        assert_eq!(report.delivered, 2);
        assert!(harness.client_is_quiet(0));
        assert_eq!(harness.read_client(1, 3), [0x81, 0x01, 0x58]);
        assert!(harness.client_is_quiet(2));
        assert_eq!(harness.read_client(3, 3), [0x81, 0x01, 0x58]);
    }

    #[test]
    fn test_stale_slot_misses_silently() {
        let mut harness = Harness::new(2);
        harness.table.release(1);

        let buf = record_buf(OutboundKind::Single, &[1], b"hi!");
        let record = parse_record(&buf).unwrap();
        let mut scratch = Vec::new();
        let report = fan_out(&mut harness.table, &record, &mut scratch);
        assert_eq!((report.delivered, report.failed.len()), (0, 0));

        // out-of-range ids miss too
        let buf = record_buf(OutboundKind::Single, &[700], b"hi!");
        let record = parse_record(&buf).unwrap();
        let report = fan_out(&mut harness.table, &record, &mut scratch);
        assert_eq!((report.delivered, report.failed.len()), (0, 0));
    }

    #[test]
    fn test_non_ws_peers_excluded_from_every() {
        let mut harness = Harness::new(3);
        harness.table.slot_mut(0).layer = Layer::Http;
        harness.table.slot_mut(2).mortality = Mortality::ShutdownWrite;

        let buf = record_buf(OutboundKind::Every, &[], b"X");
        let record = parse_record(&buf).unwrap();
        let mut scratch = Vec::new();
        let report = fan_out(&mut harness.table, &record, &mut scratch);
        assert_eq!(report.delivered, 1);
        assert_eq!(harness.read_client(1, 3), [0x81, 0x01, 0x58]);
    }

    #[test]
    fn test_heap_spill_exclusions() {
        let list: Vec<u32> = (0..(FANOUT_STACK_RECIPIENTS as u32) + 8).collect();
        let mut harness = Harness::new(2);
        let buf = record_buf(OutboundKind::EveryExceptArray, &list, b"X");
        let record = parse_record(&buf).unwrap();

        let mut scratch = Vec::new();
        let report = fan_out(&mut harness.table, &record, &mut scratch);
        // both live peers appear in the exclusion list
        assert_eq!(report.delivered, 0);
    }
}
