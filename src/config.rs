//! Frozen server configuration
//!
//! Configuration is assembled programmatically with validating builders and
//! then frozen; environment and file parsing live outside this crate, as
//! does TLS certificate loading (a TLS port consumes a prebuilt
//! [`rustls::ServerConfig`]).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{
    DEFAULT_INBOUND_RING_SIZE,
    DEFAULT_MAX_WS_MESSAGE_SIZE,
    DEFAULT_OUTBOUND_RING_SIZE,
    DEFAULT_PEERS_PER_WORKER,
    DEFAULT_RING_MULTIPLIER,
    DEFAULT_UPDATE_QUEUE_SIZE,
    MIN_RING_MULTIPLIER,
};
use crate::error::{ Result, SpoolError };

/// Sizing knobs for one direction of ring allocation.
#[derive(Debug, Clone, Copy)]
pub struct RingTuning {
    /// Initial ring size in bytes
    pub initial_size: usize,
    /// Growth multiplier applied at relocation (must exceed 1.0)
    pub multiplier: f64,
}

impl RingTuning {
    /// Create a tuning block, validating both knobs.
    pub fn new(initial_size: usize, multiplier: f64) -> Result<Self> {
        if initial_size == 0 {
            return Err(SpoolError::config("ring initial size must be greater than 0"));
        }
        if multiplier < MIN_RING_MULTIPLIER {
            return Err(
                SpoolError::config(
                    format!("ring multiplier {multiplier} below minimum {MIN_RING_MULTIPLIER}")
                )
            );
        }
        Ok(Self { initial_size, multiplier })
    }
}

/// One listening endpoint and the app that owns its peers.
#[derive(Clone)]
pub struct PortConfig {
    /// Address and port to listen on
    pub listen: SocketAddr,
    /// Index of the owning app (into the app registration list)
    pub app: usize,
    /// TLS configuration when this port terminates TLS
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl PortConfig {
    /// A plaintext port owned by `app`.
    pub fn plain(listen: SocketAddr, app: usize) -> Self {
        Self { listen, app, tls: None }
    }

    /// A TLS port owned by `app`.
    pub fn tls(listen: SocketAddr, app: usize, tls: Arc<rustls::ServerConfig>) -> Self {
        Self { listen, app, tls: Some(tls) }
    }
}

impl std::fmt::Debug for PortConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortConfig")
            .field("listen", &self.listen)
            .field("app", &self.app)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Per-app loop parameters (the callback surface itself registers at
/// server start).
#[derive(Debug, Clone, Copy)]
pub struct AppTuning {
    /// Update queue capacity in entries
    pub update_queue_size: usize,
    /// Periodic timer interval, when the app has a timer callback
    pub timer_interval: Option<Duration>,
}

impl Default for AppTuning {
    fn default() -> Self {
        Self {
            update_queue_size: DEFAULT_UPDATE_QUEUE_SIZE,
            timer_interval: None,
        }
    }
}

/// Frozen configuration consumed by [`crate::server::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Peer slots per worker
    pub peers_per_worker: usize,
    /// Outbound (app to worker) ring tuning
    pub outbound_ring: RingTuning,
    /// Inbound (worker to app) ring tuning
    pub inbound_ring: RingTuning,
    /// Worker-side update queue capacity in entries
    pub worker_update_queue_size: usize,
    /// Maximum reassembled WebSocket message size in bytes
    pub max_ws_message_size: usize,
    /// Listening endpoints
    pub ports: Vec<PortConfig>,
    /// Pin worker `i` to CPU `i` when set
    pub pin_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            peers_per_worker: DEFAULT_PEERS_PER_WORKER,
            outbound_ring: RingTuning {
                initial_size: DEFAULT_OUTBOUND_RING_SIZE,
                multiplier: DEFAULT_RING_MULTIPLIER,
            },
            inbound_ring: RingTuning {
                initial_size: DEFAULT_INBOUND_RING_SIZE,
                multiplier: DEFAULT_RING_MULTIPLIER,
            },
            worker_update_queue_size: DEFAULT_UPDATE_QUEUE_SIZE,
            max_ws_message_size: DEFAULT_MAX_WS_MESSAGE_SIZE,
            ports: Vec::new(),
            pin_workers: false,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with the given worker count.
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(SpoolError::config("worker count must be greater than 0"));
        }
        Ok(Self {
            workers,
            ..Default::default()
        })
    }

    /// Set the peer slot capacity per worker.
    pub fn with_peers_per_worker(mut self, peers: usize) -> Result<Self> {
        if peers == 0 || peers > (u32::MAX as usize) {
            return Err(SpoolError::config("peer capacity must fit a 32-bit slot index"));
        }
        self.peers_per_worker = peers;
        Ok(self)
    }

    /// Set the outbound ring tuning.
    pub fn with_outbound_ring(mut self, tuning: RingTuning) -> Self {
        self.outbound_ring = tuning;
        self
    }

    /// Set the inbound ring tuning.
    pub fn with_inbound_ring(mut self, tuning: RingTuning) -> Self {
        self.inbound_ring = tuning;
        self
    }

    /// Set the worker-side update queue capacity.
    pub fn with_worker_update_queue(mut self, entries: usize) -> Result<Self> {
        if entries == 0 {
            return Err(SpoolError::config("update queue size must be greater than 0"));
        }
        self.worker_update_queue_size = entries;
        Ok(self)
    }

    /// Set the maximum reassembled WebSocket message size.
    pub fn with_max_ws_message_size(mut self, bytes: usize) -> Result<Self> {
        if bytes == 0 {
            return Err(SpoolError::config("maximum message size must be greater than 0"));
        }
        self.max_ws_message_size = bytes;
        Ok(self)
    }

    /// Add a listening endpoint.
    pub fn with_port(mut self, port: PortConfig) -> Self {
        self.ports.push(port);
        self
    }

    /// Pin worker threads to CPUs, worker `i` to CPU `i`.
    pub fn with_pinned_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    /// Validate cross-field consistency against the app registration count.
    pub fn validate(&self, apps: usize) -> Result<()> {
        if apps == 0 {
            return Err(SpoolError::config("at least one app must be registered"));
        }
        if self.ports.is_empty() {
            return Err(SpoolError::config("at least one listening port is required"));
        }
        for port in &self.ports {
            if port.app >= apps {
                return Err(
                    SpoolError::config(
                        format!("port {} names app {} but only {} registered", port.listen, port.app, apps)
                    )
                );
            }
        }
        Ok(())
    }
}
