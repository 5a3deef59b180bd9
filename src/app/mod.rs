//! Application threads
//!
//! Each app runs one single-threaded cooperative loop: drain every worker's
//! inbound ring, decode payloads through the declared schema, invoke the
//! lifecycle hooks, and batch outbound publications through the update
//! queue. Between bursts the loop parks on its eventfd using the
//! double-check sleep protocol, optionally with a timeout driving the
//! periodic timer hook.

pub mod context;
pub mod schema;

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::{ Duration, Instant };

use tracing::{ debug, info_span, warn };

use crate::client_id::ClientId;
use crate::config::AppTuning;
use crate::error::{ Result, SpoolError };
use crate::ring::{ AppLink, UpdateQueue, WakeHandle };
use crate::wire::frame::close_code;
use crate::wire::inbound::{ self, InboundRecord };

pub use context::AppContext;
pub use schema::{ Decoded, FieldSpec, IntWidth, MessageSchema, Value };

/// What a callback asks the server to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Carry on
    Ok,
    /// Terminate the whole server
    Fatal,
    /// Close the current peer with an app-chosen code in [4000, 4899]
    Close(u16),
}

/// One received message as handed to the read hook.
pub struct Message<'a> {
    pub is_text: bool,
    /// The raw reassembled payload
    pub raw: &'a [u8],
    /// Schema-decoded fields, when the app declared a schema
    pub decoded: Option<Decoded>,
}

/// The five lifecycle hooks an app may implement.
///
/// Only `on_read` is mandatory; the rest default to no-ops.
pub trait AppHandler: Send {
    /// Called once, before any I/O reaches this app.
    fn on_init(&mut self, _ctx: &mut AppContext<'_>) -> Verdict {
        Verdict::Ok
    }

    /// A peer completed the WebSocket upgrade.
    fn on_open(&mut self, _ctx: &mut AppContext<'_>, _client: ClientId) -> Verdict {
        Verdict::Ok
    }

    /// A peer delivered one complete message.
    fn on_read(&mut self, ctx: &mut AppContext<'_>, client: ClientId, msg: &Message<'_>) -> Verdict;

    /// A peer departed; `code` is the close code observed or chosen.
    fn on_close(&mut self, _ctx: &mut AppContext<'_>, _client: ClientId, _code: u16) -> Verdict {
        Verdict::Ok
    }

    /// Periodic tick, when a timer interval is configured.
    fn on_timer(&mut self, _ctx: &mut AppContext<'_>) -> Verdict {
        Verdict::Ok
    }
}

/// Everything one app thread owns.
pub struct AppRuntime {
    index: u16,
    links: Vec<AppLink>,
    wake: WakeHandle,
    updates: UpdateQueue,
    handler: Box<dyn AppHandler>,
    schema: Option<MessageSchema>,
    scratch: Vec<u8>,
    scratch_multiplier: f64,
    timer_interval: Option<Duration>,
    shutdown: Arc<AtomicBool>,
    // reusable copy buffer for the record being dispatched
    msg_buf: Vec<u8>,
}

/// A record copied out of a ring window so dispatch can borrow the links.
enum OwnedRecord {
    Open { slot: u32 },
    Read { slot: u32, is_text: bool },
    Close { slot: u32, code: u16 },
}

impl AppRuntime {
    pub fn new(
        index: u16,
        tuning: AppTuning,
        links: Vec<AppLink>,
        wake: WakeHandle,
        handler: Box<dyn AppHandler>,
        schema: Option<MessageSchema>,
        scratch_multiplier: f64,
        shutdown: Arc<AtomicBool>
    ) -> Self {
        Self {
            index,
            updates: UpdateQueue::new(tuning.update_queue_size),
            links,
            wake,
            handler,
            schema,
            scratch: Vec::new(),
            scratch_multiplier,
            timer_interval: tuning.timer_interval,
            shutdown,
            msg_buf: Vec::new(),
        }
    }

    /// Run until the shutdown flag is observed.
    pub fn run(&mut self) -> Result<()> {
        let span = info_span!("app", index = self.index);
        let _guard = span.enter();
        debug!(links = self.links.len(), "app running");

        let verdict = self.with_ctx(None, |handler, ctx| handler.on_init(ctx))?;
        self.apply_verdict(verdict, None)?;

        let mut next_tick = self.timer_interval.map(|d| Instant::now() + d);

        loop {
            let progressed = self.drain_all()?;
            self.updates.flush(&mut self.links)?;

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Some(tick) = next_tick {
                if Instant::now() >= tick {
                    let verdict = self.with_ctx(None, |handler, ctx| handler.on_timer(ctx))?;
                    self.apply_verdict(verdict, None)?;
                    self.updates.flush(&mut self.links)?;
                    next_tick = self.timer_interval.map(|d| Instant::now() + d);
                }
            }

            if progressed {
                continue;
            }

            // idle protocol: announce sleep, re-scan every ring, then block
            self.wake.sleep.fall_asleep();
            if self.links.iter().any(|l| l.inbound.has_pending()) {
                self.wake.sleep.wake_up();
                continue;
            }
            let timeout = next_tick.map(|t| t.saturating_duration_since(Instant::now()));
            self.wake.wake.wait(timeout)?;
            self.wake.sleep.wake_up();
        }

        debug!("app stopping");
        Ok(())
    }

    /// Drain every inbound ring once; true when any record was handled.
    fn drain_all(&mut self) -> Result<bool> {
        let mut progressed = false;
        for worker in 0..self.links.len() {
            let mut drained_any = false;
            loop {
                let record = self.take_record(worker)?;
                let Some(record) = record else {
                    break;
                };
                drained_any = true;
                progressed = true;
                self.dispatch(worker as u32, record)?;
            }
            if drained_any {
                let position = self.links[worker].inbound.position();
                self.updates.record(
                    &mut self.links,
                    crate::ring::UpdateEntry {
                        link: worker as u32,
                        position,
                        is_write: false,
                    }
                )?;
            }
        }
        Ok(progressed)
    }

    /// Copy the next record (if any) out of one ring so the window borrow
    /// ends before callbacks run.
    fn take_record(&mut self, worker: usize) -> Result<Option<OwnedRecord>> {
        let link = &mut self.links[worker];
        let mut drain = link.inbound.begin();
        let window = drain.window();
        if window.is_empty() {
            return Ok(None);
        }
        let (record, used) = inbound::parse_record(window)?;
        let owned = match record {
            InboundRecord::Open { slot } => OwnedRecord::Open { slot },
            InboundRecord::Read { slot, is_text, payload } => {
                self.msg_buf.clear();
                self.msg_buf.extend_from_slice(payload);
                OwnedRecord::Read { slot, is_text }
            }
            InboundRecord::Close { slot, code } => OwnedRecord::Close { slot, code },
        };
        drain.advance(used);
        Ok(Some(owned))
    }

    fn dispatch(&mut self, worker: u32, record: OwnedRecord) -> Result<()> {
        match record {
            OwnedRecord::Open { slot } => {
                let client = ClientId::new(worker, slot);
                let verdict = self.with_ctx(Some(client), |handler, ctx| {
                    handler.on_open(ctx, client)
                })?;
                self.apply_verdict(verdict, Some(client))
            }
            OwnedRecord::Close { slot, code } => {
                let client = ClientId::new(worker, slot);
                let verdict = self.with_ctx(Some(client), |handler, ctx| {
                    handler.on_close(ctx, client, code)
                })?;
                // the peer is already gone; a close verdict is meaningless
                match verdict {
                    Verdict::Fatal => Err(SpoolError::AppFatal { app: self.index as usize }),
                    _ => Ok(()),
                }
            }
            OwnedRecord::Read { slot, is_text } => {
                let client = ClientId::new(worker, slot);

                let decoded = match &self.schema {
                    None => Ok(None),
                    Some(schema) => schema.decode(&self.msg_buf).map(Some),
                };
                let decoded = match decoded {
                    Ok(decoded) => decoded,
                    Err(violation) => {
                        // malformed per the app's declared schema
                        warn!(%client, %violation, "schema violation");
                        let AppRuntime { links, updates, scratch, scratch_multiplier, .. } = self;
                        let mut ctx = AppContext {
                            links,
                            updates,
                            scratch,
                            scratch_multiplier: *scratch_multiplier,
                            current: Some(client),
                        };
                        return ctx.send_close(client, close_code::INVALID_PAYLOAD);
                    }
                };

                let AppRuntime {
                    links,
                    updates,
                    scratch,
                    scratch_multiplier,
                    handler,
                    msg_buf,
                    ..
                } = self;
                let message = Message {
                    is_text,
                    raw: msg_buf.as_slice(),
                    decoded,
                };
                let mut ctx = AppContext {
                    links,
                    updates,
                    scratch,
                    scratch_multiplier: *scratch_multiplier,
                    current: Some(client),
                };
                let verdict = handler.on_read(&mut ctx, client, &message);
                self.apply_verdict(verdict, Some(client))
            }
        }
    }

    fn with_ctx(
        &mut self,
        current: Option<ClientId>,
        f: impl FnOnce(&mut dyn AppHandler, &mut AppContext<'_>) -> Verdict
    ) -> Result<Verdict> {
        let AppRuntime { links, updates, scratch, scratch_multiplier, handler, .. } = self;
        let mut ctx = AppContext {
            links,
            updates,
            scratch,
            scratch_multiplier: *scratch_multiplier,
            current,
        };
        Ok(f(handler.as_mut(), &mut ctx))
    }

    fn apply_verdict(&mut self, verdict: Verdict, client: Option<ClientId>) -> Result<()> {
        match verdict {
            Verdict::Ok => Ok(()),
            Verdict::Fatal => Err(SpoolError::AppFatal { app: self.index as usize }),
            Verdict::Close(code) => {
                AppContext::validate_app_close_code(code)?;
                let Some(client) = client else {
                    return Err(SpoolError::config("close verdict outside a peer callback"));
                };
                let AppRuntime { links, updates, scratch, scratch_multiplier, .. } = self;
                let mut ctx = AppContext {
                    links,
                    updates,
                    scratch,
                    scratch_multiplier: *scratch_multiplier,
                    current: Some(client),
                };
                ctx.send_close(client, code)
            }
        }
    }
}
