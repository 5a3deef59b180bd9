//! Peer slots and the per-worker peer table
//!
//! A peer is one accepted client socket and its connection state. Slots
//! live in a fixed-capacity table indexed by a 32-bit slot index; a slot is
//! either fully cleared (free, on the free list) or fully populated (live).
//! Slot indices recycle only after a full clear, so a stale client id
//! referencing a recycled slot fails the liveness check and simply misses.

pub mod tls;
pub mod transport;

use std::net::TcpStream;

use crate::wire::frame::close_code;
use self::tls::TlsSession;

/// The protocol layer currently interpreting the peer's bytes.
///
/// Transitions are monotone: `Tcp -> (Tls ->) Http -> Ws`, with a drop back
/// to `Tcp` only when shutdown begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layer {
    /// Free slot marker
    #[default]
    None,
    Tcp,
    Tls,
    Http,
    Ws,
}

/// Position in the peer's shutdown progression. Transitions are monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mortality {
    #[default]
    Live,
    /// Flush queued bytes, then half-close the write side
    ShutdownWrite,
    /// Discard reads until the peer closes too
    ShutdownRead,
    /// Ready to clear and recycle
    Dead,
}

/// One client connection's state.
#[derive(Default)]
pub struct PeerSlot {
    pub socket: Option<TcpStream>,
    pub tls: Option<Box<TlsSession>>,
    pub layer: Layer,
    pub mortality: Mortality,
    pub is_encrypted: bool,
    /// Readiness shadow: true while blocked waiting for writable
    pub is_writing: bool,
    /// Resume offset into `pending` for partial writes
    pub old_wsize: usize,
    /// Owning app index
    pub app: u16,
    /// An OPEN record has been delivered for this peer
    pub opened: bool,
    /// A server close frame has been queued already
    pub close_sent: bool,
    /// Close code to surface to the app's close hook
    pub close_code: u16,
    /// Unparsed inbound bytes (HTTP head, then WS stream)
    pub inbuf: Vec<u8>,
    /// Reassembly buffer for a fragmented message
    pub fragment: Vec<u8>,
    pub fragment_is_text: bool,
    pub fragment_active: bool,
    /// Outgoing bytes not yet accepted by the transport
    pub pending: Vec<u8>,
}

impl PeerSlot {
    /// True when this slot is free.
    pub fn is_free(&self) -> bool {
        matches!(self.layer, Layer::None)
    }

    /// True when fan-out may deliver to this peer.
    pub fn is_live_ws(&self) -> bool {
        matches!(self.layer, Layer::Ws) && matches!(self.mortality, Mortality::Live)
    }

    /// Populate a cleared slot for a freshly accepted socket.
    pub fn open(&mut self, socket: TcpStream, app: u16, encrypted: bool) {
        debug_assert!(self.is_free());
        self.socket = Some(socket);
        self.layer = Layer::Tcp;
        self.mortality = Mortality::Live;
        self.is_encrypted = encrypted;
        self.app = app;
        self.close_code = close_code::NORMAL;
    }

    /// True when the TLS session has ciphertext (handshake records, alerts)
    /// waiting to go out.
    pub fn tls_wants_write(&self) -> bool {
        self.tls.as_ref().map(|t| t.wants_write()).unwrap_or(false)
    }

    /// Return the slot to its zeroed state, keeping buffer capacity for the
    /// next occupant. Dropping the socket closes the descriptor, which also
    /// removes its epoll registrations.
    pub fn clear(&mut self) {
        self.socket = None;
        self.tls = None;
        self.layer = Layer::None;
        self.mortality = Mortality::Live;
        self.is_encrypted = false;
        self.is_writing = false;
        self.old_wsize = 0;
        self.app = 0;
        self.opened = false;
        self.close_sent = false;
        self.close_code = 0;
        self.inbuf.clear();
        self.fragment.clear();
        self.fragment_is_text = false;
        self.fragment_active = false;
        self.pending.clear();
    }
}

/// Fixed-capacity peer table with free-list slot recycling.
pub struct PeerTable {
    slots: Vec<PeerSlot>,
    free: Vec<u32>,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, PeerSlot::default);
        // pop order hands out low indices first
        let free = (0..capacity as u32).rev().collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot index, if any remain.
    pub fn alloc(&mut self) -> Option<u32> {
        self.free.pop()
    }

    /// Clear a slot and return its index to the free list.
    pub fn release(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            debug_assert!(!slot.is_free());
            slot.clear();
            self.free.push(index);
        }
    }

    /// Direct slot access for the owning worker, free slots included.
    /// Everything addressing peers by possibly-stale index goes through
    /// [`get`](Self::get)/[`get_mut`](Self::get_mut) instead.
    pub fn slot_mut(&mut self, index: u32) -> &mut PeerSlot {
        &mut self.slots[index as usize]
    }

    /// A live slot by index; `None` for free or out-of-range indices.
    pub fn get(&self, index: u32) -> Option<&PeerSlot> {
        self.slots.get(index as usize).filter(|s| !s.is_free())
    }

    /// A live slot by index, mutably.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut PeerSlot> {
        self.slots.get_mut(index as usize).filter(|s| !s.is_free())
    }

    /// Indices of every slot fan-out may deliver to.
    pub fn live_ws_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_live_ws())
            .map(|(i, _)| i as u32)
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
