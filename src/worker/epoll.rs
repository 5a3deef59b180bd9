//! Thin epoll wrapper
//!
//! Event sources are encoded into the epoll user data word: the wake
//! eventfd, a listener index, or a peer slot index. Peer sockets register
//! edge-triggered for both directions once and are never re-armed; closing
//! the descriptor drops the registration.

use std::io;
use std::os::fd::{ AsRawFd, FromRawFd, OwnedFd, RawFd };

use crate::error::Result;

/// Decoded epoll user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// The worker's wake eventfd
    Wake,
    /// A listening socket
    Listener(u32),
    /// A peer slot
    Peer(u32),
}

const TAG_WAKE: u64 = 0;
const TAG_LISTENER: u64 = 1;
const TAG_PEER: u64 = 2;

impl Token {
    fn encode(self) -> u64 {
        match self {
            Token::Wake => TAG_WAKE << 32,
            Token::Listener(i) => (TAG_LISTENER << 32) | u64::from(i),
            Token::Peer(i) => (TAG_PEER << 32) | u64::from(i),
        }
    }

    fn decode(raw: u64) -> Self {
        let index = raw as u32;
        match raw >> 32 {
            TAG_LISTENER => Token::Listener(index),
            TAG_PEER => Token::Peer(index),
            _ => Token::Wake,
        }
    }
}

/// One readiness report.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup; treated as readable so the read path observes it
    pub closed: bool,
}

/// An epoll instance plus its reusable event buffer.
pub struct Epoll {
    fd: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new(event_capacity: usize) -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            fd: unsafe {
                // SAFETY: fd is a freshly created, owned descriptor
                OwnedFd::from_raw_fd(fd)
            },
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; event_capacity],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: Token) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: token.encode() };
        let rc = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Register a level-triggered read-only source (listener, wake fd).
    pub fn add_read(&self, fd: RawFd, token: Token) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, (libc::EPOLLIN as u32) | (libc::EPOLLRDHUP as u32), token)
    }

    /// Register a peer socket edge-triggered for both directions.
    pub fn add_peer(&self, fd: RawFd, token: Token) -> Result<()> {
        let events = (libc::EPOLLIN as u32)
            | (libc::EPOLLOUT as u32)
            | (libc::EPOLLRDHUP as u32)
            | (libc::EPOLLET as u32);
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    /// Collect readiness events, blocking up to `timeout_ms` (-1 blocks
    /// indefinitely). Returns decoded events from the internal buffer.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<Vec<Event>> {
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr(),
                    self.buf.len() as i32,
                    timeout_ms
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        };

        Ok(
            self.buf[..n]
                .iter()
                .map(|raw| {
                    let closed =
                        raw.events &
                            ((libc::EPOLLHUP as u32) |
                                (libc::EPOLLERR as u32) |
                                (libc::EPOLLRDHUP as u32)) != 0;
                    Event {
                        token: Token::decode(raw.u64),
                        readable: raw.events & (libc::EPOLLIN as u32) != 0 || closed,
                        writable: raw.events & (libc::EPOLLOUT as u32) != 0,
                        closed,
                    }
                })
                .collect()
        )
    }
}
