//! Per-peer transport I/O
//!
//! Non-blocking reads and writes over TCP with an optional TLS layer, with
//! every outcome collapsed into the same classes: progress, would-block,
//! peer-closed, or drop-the-peer. Writes resume from `old_wsize` against
//! the unchanged `pending` buffer, which keeps the TLS retry contract
//! (identical input across retries) for free. Completion is the only
//! success: a partial write parks the peer on the writable notifier.

use std::io::{ self, Read, Write };
use std::net::Shutdown;

use tracing::trace;

use crate::constants::READ_CHUNK_SIZE;
use crate::error::{ Result, SpoolError };
use crate::peer::tls::{ TlsFlush, TlsRead };
use crate::peer::{ Layer, Mortality, PeerSlot };

/// Why one read pass over the transport stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// Socket drained; wait for the next readable event
    Again,
    /// Peer closed its write half
    Eof,
    /// Transport failure; drop the peer
    Error,
}

/// Result of one read pass: bytes appended to `inbuf`, and why the pass
/// stopped. Edge-triggered notifiers deliver data and EOF as one event, so
/// both facts must survive the same pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillResult {
    pub read: usize,
    pub status: FillStatus,
}

/// Outcome of one write pass over the peer's pending bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything pending reached the transport
    Complete,
    /// Blocked mid-message; `old_wsize` holds the resume offset
    Again,
    /// Transport failure; drop the peer
    Error,
}

/// Shutdown progression step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    InProgress,
    Dead,
}

impl PeerSlot {
    /// Read as much as the transport offers into `inbuf`.
    pub fn fill_inbuf(&mut self) -> FillResult {
        let PeerSlot { socket, tls, inbuf, .. } = self;
        let Some(sock) = socket.as_mut() else {
            return FillResult { read: 0, status: FillStatus::Error };
        };

        let mut total = 0usize;
        loop {
            let old = inbuf.len();
            inbuf.resize(old + READ_CHUNK_SIZE, 0);

            let outcome = if let Some(session) = tls.as_mut() {
                match session.read_into(sock, &mut inbuf[old..]) {
                    TlsRead::Data(n) => Ok(n),
                    TlsRead::Again => Err(FillStatus::Again),
                    TlsRead::Eof => Err(FillStatus::Eof),
                    TlsRead::Violation => Err(FillStatus::Error),
                }
            } else {
                match sock.read(&mut inbuf[old..]) {
                    Ok(0) => Err(FillStatus::Eof),
                    Ok(n) => Ok(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        Err(FillStatus::Again)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        inbuf.truncate(old);
                        continue;
                    }
                    Err(_) => Err(FillStatus::Error),
                }
            };

            match outcome {
                Ok(n) => {
                    inbuf.truncate(old + n);
                    total += n;
                }
                Err(status) => {
                    inbuf.truncate(old);
                    return FillResult { read: total, status };
                }
            }
        }
    }

    /// Queue a complete frame behind any bytes already pending.
    pub fn enqueue_bytes(&mut self, frame: &[u8]) {
        self.pending.extend_from_slice(frame);
    }

    /// Queue a frame and immediately push as far as the transport allows.
    pub fn send_bytes(&mut self, frame: &[u8]) -> WriteOutcome {
        self.enqueue_bytes(frame);
        self.flush_pending()
    }

    /// Push `pending[old_wsize..]` to the transport. `Complete` is the only
    /// success; anything partial parks the peer with `is_writing` set.
    pub fn flush_pending(&mut self) -> WriteOutcome {
        let PeerSlot { socket, tls, pending, old_wsize, is_writing, .. } = self;
        let Some(sock) = socket.as_mut() else {
            return WriteOutcome::Error;
        };

        if let Some(session) = tls.as_mut() {
            loop {
                let mut progressed = false;
                if *old_wsize < pending.len() {
                    match session.push_plain(&pending[*old_wsize..]) {
                        Ok(n) => {
                            *old_wsize += n;
                            progressed = n > 0;
                        }
                        Err(_) => return WriteOutcome::Error,
                    }
                }
                match session.flush_out(sock) {
                    TlsFlush::Clean => {
                        if *old_wsize == pending.len() {
                            pending.clear();
                            *old_wsize = 0;
                            *is_writing = false;
                            return WriteOutcome::Complete;
                        }
                        if !progressed {
                            // session drained yet accepting nothing: stuck
                            return WriteOutcome::Error;
                        }
                    }
                    TlsFlush::Again => {
                        *is_writing = true;
                        return WriteOutcome::Again;
                    }
                    TlsFlush::Error => return WriteOutcome::Error,
                }
            }
        } else {
            while *old_wsize < pending.len() {
                match sock.write(&pending[*old_wsize..]) {
                    Ok(0) => return WriteOutcome::Error,
                    Ok(n) => {
                        *old_wsize += n;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        *is_writing = true;
                        return WriteOutcome::Again;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => return WriteOutcome::Error,
                }
            }
            pending.clear();
            *old_wsize = 0;
            *is_writing = false;
            WriteOutcome::Complete
        }
    }

    /// Push queued TLS ciphertext (handshake records, alerts) without any
    /// new plaintext.
    pub fn pump_tls_out(&mut self) -> WriteOutcome {
        let PeerSlot { socket, tls, is_writing, .. } = self;
        let (Some(sock), Some(session)) = (socket.as_mut(), tls.as_mut()) else {
            return WriteOutcome::Complete;
        };
        match session.flush_out(sock) {
            TlsFlush::Clean => WriteOutcome::Complete,
            TlsFlush::Again => {
                *is_writing = true;
                WriteOutcome::Again
            }
            TlsFlush::Error => WriteOutcome::Error,
        }
    }

    /// Enter the shutdown progression. The layer drops back to TCP; any
    /// already-queued bytes (typically a close frame) still flush before
    /// the FIN.
    pub fn begin_shutdown(&mut self, close_code: u16) {
        if matches!(self.mortality, Mortality::Live) {
            self.mortality = Mortality::ShutdownWrite;
            self.layer = Layer::Tcp;
            self.close_code = close_code;
            if let Some(session) = self.tls.as_mut() {
                session.send_close_notify();
            }
        }
    }

    /// Advance the shutdown state machine one step.
    ///
    /// `ShutdownWrite` flushes pending bytes then half-closes the write
    /// side exactly once; `ShutdownRead` discards inbound bytes until the
    /// peer's FIN arrives, which keeps the kernel from turning our close
    /// into an RST. A failed `shutdown(2)` on a healthy socket is fatal.
    pub fn progress_shutdown(&mut self) -> Result<ShutdownStatus> {
        loop {
            match self.mortality {
                Mortality::Live => return Ok(ShutdownStatus::InProgress),
                Mortality::Dead => return Ok(ShutdownStatus::Dead),
                Mortality::ShutdownWrite => {
                    match self.flush_pending() {
                        WriteOutcome::Again => return Ok(ShutdownStatus::InProgress),
                        WriteOutcome::Error => {
                            self.mortality = Mortality::Dead;
                            return Ok(ShutdownStatus::Dead);
                        }
                        WriteOutcome::Complete => {
                            let Some(sock) = self.socket.as_ref() else {
                                self.mortality = Mortality::Dead;
                                return Ok(ShutdownStatus::Dead);
                            };
                            match sock.shutdown(Shutdown::Write) {
                                Ok(()) => {
                                    trace!("write half closed");
                                    self.mortality = Mortality::ShutdownRead;
                                }
                                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                                    self.mortality = Mortality::Dead;
                                    return Ok(ShutdownStatus::Dead);
                                }
                                Err(e) => {
                                    return Err(SpoolError::Io(e));
                                }
                            }
                        }
                    }
                }
                Mortality::ShutdownRead => {
                    let Some(sock) = self.socket.as_mut() else {
                        self.mortality = Mortality::Dead;
                        return Ok(ShutdownStatus::Dead);
                    };
                    let mut discard = [0u8; 4096];
                    loop {
                        match sock.read(&mut discard) {
                            Ok(0) => {
                                self.mortality = Mortality::Dead;
                                return Ok(ShutdownStatus::Dead);
                            }
                            Ok(_) => {}
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(ShutdownStatus::InProgress);
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(_) => {
                                self.mortality = Mortality::Dead;
                                return Ok(ShutdownStatus::Dead);
                            }
                        }
                    }
                }
            }
        }
    }
}
