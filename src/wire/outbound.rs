//! Outbound ring records (app to worker)
//!
//! A record is a kind tag, an optional recipient list of worker-local peer
//! slot indices, and one complete server-to-client WebSocket frame. The
//! frame delimits itself, so records need no outer length field. All
//! multi-byte fields are explicit byte writes in native order; records
//! never leave the process.

use crate::error::{ Result, SpoolError };
use crate::wire::frame::parse_server_frame_len;

/// Recipient-set kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutboundKind {
    Single = 0,
    Array = 1,
    Every = 2,
    EveryExceptSingle = 3,
    EveryExceptArray = 4,
}

impl OutboundKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Single),
            1 => Some(Self::Array),
            2 => Some(Self::Every),
            3 => Some(Self::EveryExceptSingle),
            4 => Some(Self::EveryExceptArray),
            _ => None,
        }
    }

    fn has_count(self) -> bool {
        matches!(self, Self::Array | Self::EveryExceptArray)
    }

    fn single_slot(self) -> bool {
        matches!(self, Self::Single | Self::EveryExceptSingle)
    }
}

/// Byte length of a record with `slots` listed recipients and a
/// `frame_len`-byte frame.
pub fn record_len(kind: OutboundKind, slots: usize, frame_len: usize) -> usize {
    let list = if kind.has_count() {
        4 + 4 * slots
    } else if kind.single_slot() {
        4
    } else {
        0
    };
    1 + list + frame_len
}

/// Write a record into `dst`, returning the bytes written. `slots` must
/// match the kind: exactly one for the single kinds, any number for the
/// array kinds, none for `Every`.
pub fn write_record(dst: &mut [u8], kind: OutboundKind, slots: &[u32], frame: &[u8]) -> usize {
    debug_assert!(!kind.single_slot() || slots.len() == 1);
    debug_assert!(kind != OutboundKind::Every || slots.is_empty());

    dst[0] = kind as u8;
    let mut at = 1;
    if kind.has_count() {
        dst[at..at + 4].copy_from_slice(&(slots.len() as u32).to_ne_bytes());
        at += 4;
    }
    if kind.has_count() || kind.single_slot() {
        for slot in slots {
            dst[at..at + 4].copy_from_slice(&slot.to_ne_bytes());
            at += 4;
        }
    }
    dst[at..at + frame.len()].copy_from_slice(frame);
    at + frame.len()
}

/// A raw recipient list borrowed from the ring window.
#[derive(Debug, Clone, Copy)]
pub struct SlotList<'a> {
    raw: &'a [u8],
}

impl<'a> SlotList<'a> {
    pub fn len(&self) -> usize {
        self.raw.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + 'a {
        self.raw.chunks_exact(4).map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
    }
}

/// The recipient set of one parsed record.
#[derive(Debug, Clone, Copy)]
pub enum Recipients<'a> {
    Single(u32),
    Array(SlotList<'a>),
    Every,
    EveryExceptSingle(u32),
    EveryExceptArray(SlotList<'a>),
}

/// One record parsed out of a consumer window.
#[derive(Debug, Clone, Copy)]
pub struct OutboundRecord<'a> {
    pub recipients: Recipients<'a>,
    /// The complete embedded WebSocket frame
    pub frame: &'a [u8],
    /// Total record length consumed from the window
    pub consumed: usize,
}

/// Parse the record at the head of `buf`. Producers publish only whole
/// records, so a short buffer is a ring protocol violation, not a retry.
pub fn parse_record(buf: &[u8]) -> Result<OutboundRecord<'_>> {
    let truncated = || SpoolError::ring("truncated outbound record");

    let kind = OutboundKind::from_u8(*buf.first().ok_or_else(truncated)?)
        .ok_or_else(|| SpoolError::ring("unknown outbound record kind"))?;
    let mut at = 1;

    let count = if kind.has_count() {
        let raw = buf.get(at..at + 4).ok_or_else(truncated)?;
        at += 4;
        u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
    } else if kind.single_slot() {
        1
    } else {
        0
    };

    let list_bytes = 4 * count;
    let list = SlotList {
        raw: buf.get(at..at + list_bytes).ok_or_else(truncated)?,
    };
    at += list_bytes;

    let frame_buf = &buf[at..];
    let frame_len = parse_server_frame_len(frame_buf).ok_or_else(truncated)?;
    let frame = frame_buf.get(..frame_len).ok_or_else(truncated)?;

    let one = || list.iter().next().expect("single kinds carry one slot");
    let recipients = match kind {
        OutboundKind::Single => Recipients::Single(one()),
        OutboundKind::Array => Recipients::Array(list),
        OutboundKind::Every => Recipients::Every,
        OutboundKind::EveryExceptSingle => Recipients::EveryExceptSingle(one()),
        OutboundKind::EveryExceptArray => Recipients::EveryExceptArray(list),
    };

    Ok(OutboundRecord {
        recipients,
        frame,
        consumed: at + frame_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame::{ append_server_frame, OP_TEXT };

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        append_server_frame(&mut out, OP_TEXT, payload);
        out
    }

    fn encode(kind: OutboundKind, slots: &[u32], frame: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; record_len(kind, slots.len(), frame.len())];
        let written = write_record(&mut buf, kind, slots, frame);
        assert_eq!(written, buf.len());
        buf
    }

    #[test]
    fn test_single_record() {
        let f = frame(b"hi!");
        let buf = encode(OutboundKind::Single, &[9], &f);
        let rec = parse_record(&buf).unwrap();
        assert!(matches!(rec.recipients, Recipients::Single(9)));
        assert_eq!(rec.frame, &f[..]);
        assert_eq!(rec.consumed, buf.len());
    }

    #[test]
    fn test_every_record_has_no_list() {
        let f = frame(b"X");
        let buf = encode(OutboundKind::Every, &[], &f);
        assert_eq!(buf.len(), 1 + f.len());
        let rec = parse_record(&buf).unwrap();
        assert!(matches!(rec.recipients, Recipients::Every));
    }

    #[test]
    fn test_array_record() {
        let f = frame(b"payload");
        let buf = encode(OutboundKind::Array, &[3, 5, 8], &f);
        let rec = parse_record(&buf).unwrap();
        match rec.recipients {
            Recipients::Array(list) => {
                assert_eq!(list.iter().collect::<Vec<_>>(), vec![3, 5, 8]);
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_every_except_single() {
        let f = frame(b"z");
        let buf = encode(OutboundKind::EveryExceptSingle, &[7], &f);
        let rec = parse_record(&buf).unwrap();
        assert!(matches!(rec.recipients, Recipients::EveryExceptSingle(7)));
    }

    #[test]
    fn test_back_to_back_records() {
        let f1 = frame(b"one");
        let f2 = frame(b"two");
        let mut buf = encode(OutboundKind::Single, &[1], &f1);
        buf.extend_from_slice(&encode(OutboundKind::Every, &[], &f2));

        let first = parse_record(&buf).unwrap();
        assert_eq!(first.frame, &f1[..]);
        let second = parse_record(&buf[first.consumed..]).unwrap();
        assert_eq!(second.frame, &f2[..]);
        assert_eq!(first.consumed + second.consumed, buf.len());
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let f = frame(b"hi!");
        let buf = encode(OutboundKind::Single, &[2], &f);
        assert!(parse_record(&buf[..buf.len() - 1]).is_err());
        assert!(parse_record(&buf[..3]).is_err());
    }
}
