//! Inbound ring records (worker to app)
//!
//! Each record names the originating peer slot and carries either the
//! reassembled message payload (OPEN carries none, READ carries one) or
//! the close code observed when the peer departed. Fields are explicit
//! native-order byte writes; records never leave the process.

use crate::error::{ Result, SpoolError };

const KIND_OPEN: u8 = 0;
const KIND_READ_TEXT: u8 = 1;
const KIND_READ_BINARY: u8 = 2;
const KIND_CLOSE: u8 = 3;

/// One record parsed out of a consumer window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRecord<'a> {
    /// Peer completed the upgrade and is now a WS peer
    Open { slot: u32 },
    /// Peer delivered one complete message
    Read { slot: u32, is_text: bool, payload: &'a [u8] },
    /// Peer departed
    Close { slot: u32, code: u16 },
}

/// Byte length of an OPEN record.
pub fn open_len() -> usize {
    5
}

/// Byte length of a READ record with `payload_len` payload bytes.
pub fn read_len(payload_len: usize) -> usize {
    9 + payload_len
}

/// Byte length of a CLOSE record.
pub fn close_len() -> usize {
    7
}

/// Write an OPEN record, returning bytes written.
pub fn write_open(dst: &mut [u8], slot: u32) -> usize {
    dst[0] = KIND_OPEN;
    dst[1..5].copy_from_slice(&slot.to_ne_bytes());
    5
}

/// Write a READ record, returning bytes written.
pub fn write_read(dst: &mut [u8], slot: u32, is_text: bool, payload: &[u8]) -> usize {
    dst[0] = if is_text { KIND_READ_TEXT } else { KIND_READ_BINARY };
    dst[1..5].copy_from_slice(&slot.to_ne_bytes());
    dst[5..9].copy_from_slice(&(payload.len() as u32).to_ne_bytes());
    dst[9..9 + payload.len()].copy_from_slice(payload);
    9 + payload.len()
}

/// Write a CLOSE record, returning bytes written.
pub fn write_close(dst: &mut [u8], slot: u32, code: u16) -> usize {
    dst[0] = KIND_CLOSE;
    dst[1..5].copy_from_slice(&slot.to_ne_bytes());
    dst[5..7].copy_from_slice(&code.to_ne_bytes());
    7
}

/// Parse the record at the head of `buf`, returning it and the bytes it
/// consumed. Producers publish only whole records, so a short buffer is a
/// ring protocol violation.
pub fn parse_record(buf: &[u8]) -> Result<(InboundRecord<'_>, usize)> {
    let truncated = || SpoolError::ring("truncated inbound record");

    let kind = *buf.first().ok_or_else(truncated)?;
    let slot_raw = buf.get(1..5).ok_or_else(truncated)?;
    let slot = u32::from_ne_bytes([slot_raw[0], slot_raw[1], slot_raw[2], slot_raw[3]]);

    match kind {
        KIND_OPEN => Ok((InboundRecord::Open { slot }, 5)),
        KIND_READ_TEXT | KIND_READ_BINARY => {
            let len_raw = buf.get(5..9).ok_or_else(truncated)?;
            let len = u32::from_ne_bytes([len_raw[0], len_raw[1], len_raw[2], len_raw[3]]) as usize;
            let payload = buf.get(9..9 + len).ok_or_else(truncated)?;
            Ok((
                InboundRecord::Read {
                    slot,
                    is_text: kind == KIND_READ_TEXT,
                    payload,
                },
                9 + len,
            ))
        }
        KIND_CLOSE => {
            let code_raw = buf.get(5..7).ok_or_else(truncated)?;
            let code = u16::from_ne_bytes([code_raw[0], code_raw[1]]);
            Ok((InboundRecord::Close { slot, code }, 7))
        }
        _ => Err(SpoolError::ring("unknown inbound record kind")),
    }
}
