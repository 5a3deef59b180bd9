//! Inbound WebSocket stream processing
//!
//! Parses buffered client bytes into frames, unmasks in place, replies to
//! pings, reassembles fragmented messages up to the configured cap, and
//! hands complete messages to the caller's delivery closure. Parsing stops
//! at the first violation or close frame; the caller owns the resulting
//! close handshake.

use std::mem;

use crate::error::Result;
use crate::peer::PeerSlot;
use crate::peer::transport::WriteOutcome;
use crate::wire::frame::{
    self,
    close_code,
    parse_close_payload,
    parse_client_header,
    unmask,
    FrameHeader,
    HeaderParse,
};

/// What the buffered byte stream produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOutcome {
    /// All parseable frames handled; wait for more bytes
    Continue,
    /// Transport failed while replying to a control frame
    TransportError,
    /// Peer sent a close frame
    CloseReceived {
        /// Code to echo back in our close frame
        echo_code: u16,
        /// Code to surface to the app's close hook
        app_code: u16,
    },
    /// Protocol violation; close with this code
    Violation { code: u16 },
}

/// Process every complete frame buffered in `slot.inbuf`.
///
/// `deliver` receives each complete (possibly reassembled) message; its
/// errors are fatal ring conditions and propagate unchanged.
pub fn process_inbound(
    slot: &mut PeerSlot,
    max_message: usize,
    mut deliver: impl FnMut(bool, &[u8]) -> Result<()>
) -> Result<WsOutcome> {
    // take the buffer so control replies can borrow the slot freely
    let mut inbuf = mem::take(&mut slot.inbuf);
    let mut consumed = 0usize;

    let outcome = loop {
        let header = match parse_client_header(&inbuf[consumed..]) {
            HeaderParse::Incomplete => break WsOutcome::Continue,
            HeaderParse::Violation(code) => break WsOutcome::Violation { code },
            HeaderParse::Frame(h) => h,
        };

        if header.payload_len > max_message as u64 {
            break WsOutcome::Violation { code: close_code::MESSAGE_TOO_BIG };
        }
        let payload_len = header.payload_len as usize;
        let frame_end = consumed + header.header_len + payload_len;
        if inbuf.len() < frame_end {
            break WsOutcome::Continue; // payload still in flight
        }

        let payload_start = consumed + header.header_len;
        unmask(&mut inbuf[payload_start..frame_end], header.mask);
        consumed = frame_end;
        let payload = &inbuf[payload_start..frame_end];

        match handle_frame(slot, &header, payload, max_message, &mut deliver)? {
            WsOutcome::Continue => {}
            stop => break stop,
        }
    };

    inbuf.drain(..consumed);
    slot.inbuf = inbuf;
    Ok(outcome)
}

fn handle_frame(
    slot: &mut PeerSlot,
    header: &FrameHeader,
    payload: &[u8],
    max_message: usize,
    deliver: &mut impl FnMut(bool, &[u8]) -> Result<()>
) -> Result<WsOutcome> {
    match header.opcode {
        frame::OP_TEXT | frame::OP_BINARY => {
            if slot.fragment_active {
                // a new data frame may not preempt an open message
                return Ok(WsOutcome::Violation { code: close_code::PROTOCOL_ERROR });
            }
            let is_text = header.opcode == frame::OP_TEXT;
            if header.fin {
                if is_text && std::str::from_utf8(payload).is_err() {
                    return Ok(WsOutcome::Violation { code: close_code::INVALID_PAYLOAD });
                }
                deliver(is_text, payload)?;
            } else {
                slot.fragment_active = true;
                slot.fragment_is_text = is_text;
                slot.fragment.clear();
                slot.fragment.extend_from_slice(payload);
            }
            Ok(WsOutcome::Continue)
        }
        frame::OP_CONTINUATION => {
            if !slot.fragment_active {
                return Ok(WsOutcome::Violation { code: close_code::PROTOCOL_ERROR });
            }
            if slot.fragment.len() + payload.len() > max_message {
                return Ok(WsOutcome::Violation { code: close_code::MESSAGE_TOO_BIG });
            }
            slot.fragment.extend_from_slice(payload);
            if header.fin {
                let message = mem::take(&mut slot.fragment);
                slot.fragment_active = false;
                if slot.fragment_is_text && std::str::from_utf8(&message).is_err() {
                    return Ok(WsOutcome::Violation { code: close_code::INVALID_PAYLOAD });
                }
                deliver(slot.fragment_is_text, &message)?;
                slot.fragment = message; // hand the allocation back for reuse
                slot.fragment.clear();
            }
            Ok(WsOutcome::Continue)
        }
        frame::OP_PING => {
            let mut pong = Vec::with_capacity(frame::server_frame_len(payload.len()));
            frame::append_server_frame(&mut pong, frame::OP_PONG, payload);
            match slot.send_bytes(&pong) {
                WriteOutcome::Error => Ok(WsOutcome::TransportError),
                _ => Ok(WsOutcome::Continue),
            }
        }
        frame::OP_PONG => Ok(WsOutcome::Continue),
        frame::OP_CLOSE => {
            match parse_close_payload(payload) {
                Ok(code) => Ok(WsOutcome::CloseReceived { echo_code: code, app_code: code }),
                Err(code) => Ok(WsOutcome::Violation { code }),
            }
        }
        _ => Ok(WsOutcome::Violation { code: close_code::PROTOCOL_ERROR }),
    }
}
