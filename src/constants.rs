//! spool tuning constants and configuration limits
//!
//! This module contains the tuning constants and protocol limits used
//! throughout the spool library.

use static_assertions::const_assert;

/// Default initial size of an outbound (app to worker) ring in bytes
pub const DEFAULT_OUTBOUND_RING_SIZE: usize = 512 * 1024;

/// Default initial size of an inbound (worker to app) ring in bytes
pub const DEFAULT_INBOUND_RING_SIZE: usize = 512 * 1024;

/// Default growth multiplier applied when a ring must relocate
pub const DEFAULT_RING_MULTIPLIER: f64 = 1.5;

/// Lowest accepted ring growth multiplier (must stay above 1.0)
pub const MIN_RING_MULTIPLIER: f64 = 1.0625;

/// Default capacity of a producer-side update queue, in entries
pub const DEFAULT_UPDATE_QUEUE_SIZE: usize = 1024;

/// Default maximum reassembled WebSocket message size in bytes
pub const DEFAULT_MAX_WS_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default number of peer slots per worker
pub const DEFAULT_PEERS_PER_WORKER: usize = 4096;

/// Cache line size for alignment optimizations (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Maximum accepted HTTP upgrade request size in bytes
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Read chunk size for one nonblocking read call
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Largest WebSocket payload encodable with a 1-byte length
pub const WS_SMALL_PAYLOAD_MAX: usize = 125;

/// Largest WebSocket payload encodable with the 2-byte extended length
pub const WS_MEDIUM_PAYLOAD_MAX: usize = 65_535;

/// Longest WebSocket frame header the server ever writes (1 + 9 bytes)
pub const WS_MAX_SERVER_HEADER: usize = 10;

/// Longest WebSocket frame header a client can send (2 + 8 + 4 bytes)
pub const WS_MAX_CLIENT_HEADER: usize = 14;

/// Fan-out recipient lists up to this length stay on the stack;
/// longer lists spill to the heap
pub const FANOUT_STACK_RECIPIENTS: usize = 32;

/// Number of epoll events collected per wait call
pub const EPOLL_EVENT_BATCH: usize = 256;

/// Listen backlog for accepting sockets
pub const LISTEN_BACKLOG: i32 = 1024;

/// Plaintext rustls buffers at most this many bytes per peer, so a partial
/// TLS write resumes from the caller-held message rather than growing an
/// unbounded internal copy
pub const TLS_PLAINTEXT_BUFFER_LIMIT: usize = 64 * 1024;

/// First close code an application may choose
pub const APP_CLOSE_CODE_MIN: u16 = 4000;

/// Last close code an application may choose
pub const APP_CLOSE_CODE_MAX: u16 = 4899;

/// First close code reserved for internal use
pub const INTERNAL_CLOSE_CODE_MIN: u16 = 4900;

/// Last close code reserved for internal use
pub const INTERNAL_CLOSE_CODE_MAX: u16 = 4999;

const_assert!(CACHE_LINE_SIZE.is_power_of_two());
const_assert!(APP_CLOSE_CODE_MAX < INTERNAL_CLOSE_CODE_MIN);
const_assert!(WS_SMALL_PAYLOAD_MAX < WS_MEDIUM_PAYLOAD_MAX);

/// Validate that all constants are properly configured
pub fn validate_constants() -> Result<(), &'static str> {
    if DEFAULT_RING_MULTIPLIER <= 1.0 || MIN_RING_MULTIPLIER <= 1.0 {
        return Err("ring multipliers must be greater than 1");
    }
    if DEFAULT_OUTBOUND_RING_SIZE == 0 || DEFAULT_INBOUND_RING_SIZE == 0 {
        return Err("ring sizes must be greater than 0");
    }
    if DEFAULT_UPDATE_QUEUE_SIZE == 0 {
        return Err("update queue size must be greater than 0");
    }
    if WS_SMALL_PAYLOAD_MAX >= WS_MEDIUM_PAYLOAD_MAX {
        return Err("WebSocket length tiers must be ordered");
    }
    if APP_CLOSE_CODE_MIN >= APP_CLOSE_CODE_MAX || INTERNAL_CLOSE_CODE_MIN >= INTERNAL_CLOSE_CODE_MAX {
        return Err("close code ranges must be non-empty");
    }
    if APP_CLOSE_CODE_MAX >= INTERNAL_CLOSE_CODE_MIN {
        return Err("application close codes must not reach into the internal range");
    }
    if !CACHE_LINE_SIZE.is_power_of_two() {
        return Err("CACHE_LINE_SIZE must be a power of 2");
    }
    Ok(())
}
