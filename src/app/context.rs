//! Application send surface
//!
//! The context handed to every callback. It carries the originating client
//! id, a lazily-grown scratch buffer the frame is built in once, and the
//! outbound ring producers. Multi-worker recipient sets are partitioned
//! here: each worker receives one record covering exactly its local slots,
//! so worker-side fan-out never looks beyond its own peer table.

use crate::client_id::{ partition_by_worker, ClientId };
use crate::constants::{ APP_CLOSE_CODE_MAX, APP_CLOSE_CODE_MIN };
use crate::error::{ Result, SpoolError };
use crate::ring::{ AppLink, UpdateEntry, UpdateQueue };
use crate::wire::frame::{ self, OP_BINARY, OP_TEXT };
use crate::wire::outbound::{ self, OutboundKind };

/// Callback context: identity of the current event plus the send API.
pub struct AppContext<'a> {
    pub(crate) links: &'a mut Vec<AppLink>,
    pub(crate) updates: &'a mut UpdateQueue,
    pub(crate) scratch: &'a mut Vec<u8>,
    pub(crate) scratch_multiplier: f64,
    pub(crate) current: Option<ClientId>,
}

impl AppContext<'_> {
    /// The client this callback is about (`None` in init/timer hooks).
    pub fn current(&self) -> Option<ClientId> {
        self.current
    }

    /// Number of workers this app is linked to.
    pub fn workers(&self) -> usize {
        self.links.len()
    }

    /// Send to the client the current callback is about.
    pub fn to_cur(&mut self, payload: &[u8], binary: bool) -> Result<()> {
        let Some(id) = self.current else {
            return Err(SpoolError::config("to_cur outside a peer callback"));
        };
        self.to_single(id, payload, binary)
    }

    /// Send to one client.
    pub fn to_single(&mut self, to: ClientId, payload: &[u8], binary: bool) -> Result<()> {
        let frame_len = self.build_frame(payload, binary);
        self.emit(to.worker(), OutboundKind::Single, &[to.slot()], frame_len)
    }

    /// Send to a set of clients.
    pub fn to_array(&mut self, to: &[ClientId], payload: &[u8], binary: bool) -> Result<()> {
        let frame_len = self.build_frame(payload, binary);
        let parts = partition_by_worker(to, self.links.len());
        for (worker, slots) in parts.iter().enumerate() {
            match slots.len() {
                0 => {}
                1 => self.emit(worker as u32, OutboundKind::Single, slots, frame_len)?,
                _ => self.emit(worker as u32, OutboundKind::Array, slots, frame_len)?,
            }
        }
        Ok(())
    }

    /// Send to every connected client of this app.
    pub fn to_every(&mut self, payload: &[u8], binary: bool) -> Result<()> {
        let frame_len = self.build_frame(payload, binary);
        for worker in 0..self.links.len() as u32 {
            self.emit(worker, OutboundKind::Every, &[], frame_len)?;
        }
        Ok(())
    }

    /// Send to every client except one.
    pub fn to_every_except_single(
        &mut self,
        except: ClientId,
        payload: &[u8],
        binary: bool
    ) -> Result<()> {
        let frame_len = self.build_frame(payload, binary);
        for worker in 0..self.links.len() as u32 {
            if worker == except.worker() {
                self.emit(worker, OutboundKind::EveryExceptSingle, &[except.slot()], frame_len)?;
            } else {
                self.emit(worker, OutboundKind::Every, &[], frame_len)?;
            }
        }
        Ok(())
    }

    /// Send to every client except a set.
    pub fn to_every_except_array(
        &mut self,
        except: &[ClientId],
        payload: &[u8],
        binary: bool
    ) -> Result<()> {
        let frame_len = self.build_frame(payload, binary);
        let parts = partition_by_worker(except, self.links.len());
        for (worker, excluded) in parts.iter().enumerate() {
            let worker = worker as u32;
            match excluded.len() {
                0 => self.emit(worker, OutboundKind::Every, &[], frame_len)?,
                1 => self.emit(worker, OutboundKind::EveryExceptSingle, excluded, frame_len)?,
                _ => self.emit(worker, OutboundKind::EveryExceptArray, excluded, frame_len)?,
            }
        }
        Ok(())
    }

    /// Queue a close frame for one client; its worker walks the shutdown
    /// progression once the frame flushes.
    pub(crate) fn send_close(&mut self, to: ClientId, code: u16) -> Result<()> {
        self.scratch.clear();
        frame::append_close_frame(self.scratch, code, b"");
        let frame_len = self.scratch.len();
        self.emit(to.worker(), OutboundKind::Single, &[to.slot()], frame_len)
    }

    /// Validate an app-chosen close code against its reserved range.
    pub(crate) fn validate_app_close_code(code: u16) -> Result<()> {
        if !(APP_CLOSE_CODE_MIN..=APP_CLOSE_CODE_MAX).contains(&code) {
            return Err(
                SpoolError::config(
                    format!(
                        "close code {code} outside [{APP_CLOSE_CODE_MIN}, {APP_CLOSE_CODE_MAX}]"
                    )
                )
            );
        }
        Ok(())
    }

    /// Build the frame once in the scratch buffer; every per-worker record
    /// copies the same bytes.
    fn build_frame(&mut self, payload: &[u8], binary: bool) -> usize {
        let needed = frame::server_frame_len(payload.len());
        ensure_scratch(self.scratch, self.scratch_multiplier, needed);
        self.scratch.clear();
        frame::append_server_frame(
            self.scratch,
            if binary { OP_BINARY } else { OP_TEXT },
            payload
        );
        self.scratch.len()
    }

    fn emit(
        &mut self,
        worker: u32,
        kind: OutboundKind,
        slots: &[u32],
        frame_len: usize
    ) -> Result<()> {
        let Some(link) = self.links.get_mut(worker as usize) else {
            return Ok(()); // id names a worker this app is not linked to
        };
        let len = outbound::record_len(kind, slots.len(), frame_len);
        let dst = link.outbound.reserve(len)?;
        let written = outbound::write_record(dst, kind, slots, &self.scratch[..frame_len]);
        debug_assert_eq!(written, len);
        link.outbound.commit(len);
        let position = link.outbound.position();
        self.updates.record(self.links, UpdateEntry {
            link: worker,
            position,
            is_write: true,
        })
    }
}

/// Grow `scratch` capacity to at least `needed`, scaling by the configured
/// multiplier so repeated sends settle quickly.
fn ensure_scratch(scratch: &mut Vec<u8>, multiplier: f64, needed: usize) {
    if scratch.capacity() < needed {
        let target = (((needed as f64) * multiplier) as usize).max(needed);
        scratch.reserve(target - scratch.len());
    }
}
