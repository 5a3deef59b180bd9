//! I/O pairs: the two rings binding one (worker, app) link
//!
//! Each link carries an outbound ring (app to worker) and an inbound ring
//! (worker to app), both strictly SPSC. The link splits into a worker half
//! and an app half; each half bundles its producer and consumer endpoints
//! with the remote thread's sleep state and wake descriptor so the update
//! queue can flush without reaching across ownership lines.

use std::sync::Arc;

use crate::config::RingTuning;
use crate::error::Result;
use crate::ring::buffer::{ ring, RingConsumer, RingProducer };
use crate::ring::update::UpdateTarget;
use crate::ring::wake::{ SleepState, WakeFd };

/// One thread's sleep state and wake descriptor, cloned into every link
/// whose producer may need to wake it.
#[derive(Clone)]
pub struct WakeHandle {
    pub sleep: Arc<SleepState>,
    pub wake: WakeFd,
}

impl WakeHandle {
    pub fn new() -> Result<Self> {
        Ok(Self {
            sleep: Arc::new(SleepState::new()),
            wake: WakeFd::new()?,
        })
    }
}

/// Worker-side endpoint of one link.
pub struct WorkerLink {
    /// Producer of worker-to-app records
    pub inbound: RingProducer,
    /// Consumer of app-to-worker records
    pub outbound: RingConsumer,
    /// The app thread's wake handles
    pub app: WakeHandle,
}

/// App-side endpoint of one link.
pub struct AppLink {
    /// Producer of app-to-worker records
    pub outbound: RingProducer,
    /// Consumer of worker-to-app records
    pub inbound: RingConsumer,
    /// The worker thread's wake handles
    pub worker: WakeHandle,
}

/// Build the ring pair for one (worker, app) link and split it.
pub fn link(
    outbound: RingTuning,
    inbound: RingTuning,
    worker_wake: WakeHandle,
    app_wake: WakeHandle
) -> (WorkerLink, AppLink) {
    let (out_tx, out_rx) = ring(outbound);
    let (in_tx, in_rx) = ring(inbound);
    (
        WorkerLink {
            inbound: in_tx,
            outbound: out_rx,
            app: app_wake,
        },
        AppLink {
            outbound: out_tx,
            inbound: in_rx,
            worker: worker_wake,
        },
    )
}

impl UpdateTarget for WorkerLink {
    fn publish_write(&mut self) -> Option<u64> {
        self.inbound.publish()
    }

    fn publish_read(&mut self) {
        self.outbound.publish_read();
    }

    fn consumer_sleep(&self) -> &SleepState {
        &self.app.sleep
    }

    fn consumer_wake(&self) -> &WakeFd {
        &self.app.wake
    }
}

impl UpdateTarget for AppLink {
    fn publish_write(&mut self) -> Option<u64> {
        self.outbound.publish()
    }

    fn publish_read(&mut self) {
        self.inbound.publish_read();
    }

    fn consumer_sleep(&self) -> &SleepState {
        &self.worker.sleep
    }

    fn consumer_wake(&self) -> &WakeFd {
        &self.worker.wake
    }
}
