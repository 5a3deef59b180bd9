//! Consumer sleep state and eventfd wakes
//!
//! Producers never wake a consumer per message. They publish cursors, then
//! consult the consumer's sleep word and signal its eventfd only when the
//! consumer was observed ASLEEP. The consumer, in turn, re-scans every ring
//! after announcing ASLEEP, so a producer that published before the
//! announcement is caught by the scan and a producer that publishes after
//! it observes ASLEEP and signals. Both sides fence with SeqCst between
//! their store and their cross-check load; that store/load ordering is the
//! whole correctness argument.

use std::io;
use std::os::fd::{ AsRawFd, FromRawFd, OwnedFd, RawFd };
use std::sync::Arc;
use std::sync::atomic::{ fence, AtomicU32, Ordering };
use std::time::Duration;

use crate::error::Result;

const AWAKE: u32 = 0;
const ASLEEP: u32 = 1;

/// Per-consumer sleep flag word.
pub struct SleepState {
    state: AtomicU32,
}

impl SleepState {
    pub fn new() -> Self {
        Self { state: AtomicU32::new(AWAKE) }
    }

    /// Consumer: announce the intent to sleep. Every ring must be re-scanned
    /// after this call and before blocking.
    pub fn fall_asleep(&self) {
        self.state.store(ASLEEP, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Consumer: back to running.
    pub fn wake_up(&self) {
        self.state.store(AWAKE, Ordering::SeqCst);
    }

    /// Producer: check the flag after publishing a cursor. The fence orders
    /// the cursor store before this load, pairing with the consumer's fence
    /// in [`fall_asleep`](Self::fall_asleep).
    pub fn needs_signal(&self) -> bool {
        fence(Ordering::SeqCst);
        self.state.load(Ordering::SeqCst) == ASLEEP
    }
}

impl Default for SleepState {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-thread wake descriptor (an eventfd counter).
///
/// Cloneable; the producer side calls [`signal`](Self::signal), the
/// consumer side either registers the fd with epoll or blocks in
/// [`wait`](Self::wait).
#[derive(Clone)]
pub struct WakeFd {
    fd: Arc<OwnedFd>,
}

impl WakeFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            fd: Arc::new(unsafe {
                // SAFETY: fd is a freshly created, owned descriptor
                OwnedFd::from_raw_fd(fd)
            }),
        })
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Bump the counter. A full counter means the consumer is hopelessly
    /// behind on drains and already has a pending wake, so EAGAIN is
    /// ignored.
    pub fn signal(&self) {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(self.raw(), (&one as *const u64).cast(), std::mem::size_of::<u64>())
        };
        debug_assert!(rc == 8 || io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock);
    }

    /// Reset the counter after a wake.
    pub fn drain(&self) {
        let mut count: u64 = 0;
        unsafe {
            libc::read(self.raw(), (&mut count as *mut u64).cast(), std::mem::size_of::<u64>());
        }
    }

    /// Block until signaled or until `timeout` elapses. Returns `true` when
    /// signaled, `false` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.raw(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        loop {
            let n = unsafe { libc::poll(&mut pfd, 1, ms) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if n == 0 {
                return Ok(false);
            }
            self.drain();
            return Ok(true);
        }
    }
}
