//! rustls server session adapter
//!
//! Maps the rustls want-read/want-write/fatal signals onto the same outcome
//! classes the plain TCP path produces, so the peer state machine dispatches
//! identically at both transports.

use std::io::{ self, Read, Write };
use std::net::TcpStream;
use std::sync::Arc;

use crate::constants::TLS_PLAINTEXT_BUFFER_LIMIT;
use crate::error::{ Result, SpoolError };

/// Outcome classes for one TLS read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRead {
    /// Plaintext bytes were produced
    Data(usize),
    /// Nothing to do until the socket is readable again
    Again,
    /// Peer closed (close_notify or TCP FIN)
    Eof,
    /// TLS-level failure; drop the peer
    Violation,
}

/// Outcome classes for pushing buffered ciphertext to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFlush {
    /// No ciphertext remains buffered
    Clean,
    /// Socket would block; resume on writable
    Again,
    /// Socket failure; drop the peer
    Error,
}

/// One peer's server-side TLS session.
pub struct TlsSession {
    conn: rustls::ServerConnection,
}

impl TlsSession {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let mut conn = rustls::ServerConnection
            ::new(config)
            .map_err(|e| SpoolError::tls(format!("session setup: {e}")))?;
        // cap buffered plaintext so partial writes resume from the caller's
        // copy of the message instead of an unbounded internal one
        conn.set_buffer_limit(Some(TLS_PLAINTEXT_BUFFER_LIMIT));
        Ok(Self { conn })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// One read step: drain decrypted plaintext into `buf`, pulling and
    /// processing ciphertext from the socket when none is pending.
    pub fn read_into(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> TlsRead {
        match self.read_plaintext(buf) {
            TlsRead::Again => {}
            done => return done,
        }

        loop {
            match self.conn.read_tls(sock) {
                Ok(0) => return TlsRead::Eof,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return TlsRead::Again,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return TlsRead::Violation,
            }
            if self.conn.process_new_packets().is_err() {
                // the alert is queued; the caller flushes it best-effort
                return TlsRead::Violation;
            }
            match self.read_plaintext(buf) {
                TlsRead::Again => continue,
                done => return done,
            }
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> TlsRead {
        match self.conn.reader().read(buf) {
            Ok(0) => TlsRead::Eof,
            Ok(n) => TlsRead::Data(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => TlsRead::Again,
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => TlsRead::Eof,
            Err(_) => TlsRead::Violation,
        }
    }

    /// Accept plaintext into the session's outgoing buffer. The session may
    /// take fewer bytes than offered; callers resume from their own cursor.
    pub fn push_plain(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(bytes)
    }

    /// Push buffered ciphertext to the socket until drained or blocked.
    pub fn flush_out(&mut self, sock: &mut TcpStream) -> TlsFlush {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return TlsFlush::Again,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return TlsFlush::Error,
            }
        }
        TlsFlush::Clean
    }

    /// Queue a close_notify alert; flushed like any other ciphertext.
    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}
