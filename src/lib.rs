//! spool - horizontally scalable WebSocket server core
//!
//! Many client connections multiplex across a pool of I/O worker threads
//! and a separate pool of application threads, coordinated entirely through
//! lockless SPSC ring buffers. Workers own sockets, epoll, and RFC 6455
//! framing; apps own the callback surface; every (worker, app) link is a
//! pair of byte rings with batched cursor publication and eventfd wakes.

pub mod app;
pub mod client_id;
pub mod config;
pub mod constants;
pub mod error;
pub mod peer;
pub mod ring;
pub mod server;
pub mod wire;
pub mod worker;

// Re-export main components
pub use app::{ AppContext, AppHandler, FieldSpec, IntWidth, Message, MessageSchema, Verdict };
pub use client_id::ClientId;
pub use config::{ AppTuning, PortConfig, RingTuning, ServerConfig };
pub use error::{ Result, SpoolError };
pub use server::{ AppSpec, Server };

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring;

    #[test]
    fn test_ring_round_trip() {
        let tuning = RingTuning { initial_size: 1024, multiplier: 1.5 };
        let (mut tx, mut rx) = ring(tuning);
        tx.push_bytes(b"hello, spool").unwrap();
        tx.publish();
        assert_eq!(rx.begin().window(), b"hello, spool");
    }

    #[test]
    fn test_client_id_round_trip() {
        let id = ClientId::new(2, 77);
        assert_eq!((id.worker(), id.slot()), (2, 77));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default()
            .with_port(PortConfig::plain("127.0.0.1:0".parse().unwrap(), 0));
        assert!(config.validate(1).is_ok());
    }
}
