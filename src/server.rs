//! Server assembly
//!
//! Builds the W x A link matrix, spawns worker and app threads, and owns
//! cooperative shutdown: set the flag, signal every wake descriptor, let
//! each loop reach its safe point, join. A fatal error in any thread trips
//! the whole fleet the same way.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{ error, info };

use crate::app::{ AppHandler, AppRuntime, MessageSchema };
use crate::config::{ AppTuning, ServerConfig };
use crate::constants::validate_constants;
use crate::error::{ Result, SpoolError };
use crate::ring::{ link, AppLink, WakeFd, WakeHandle, WorkerLink };
use crate::worker::Worker;

/// One app registration: its callbacks plus per-app loop parameters.
pub struct AppSpec {
    pub handler: Box<dyn AppHandler>,
    pub schema: Option<MessageSchema>,
    pub tuning: AppTuning,
}

impl AppSpec {
    pub fn new(handler: Box<dyn AppHandler>) -> Self {
        Self {
            handler,
            schema: None,
            tuning: AppTuning::default(),
        }
    }

    pub fn with_schema(mut self, schema: MessageSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_tuning(mut self, tuning: AppTuning) -> Self {
        self.tuning = tuning;
        self
    }
}

/// Shutdown broadcast shared by every thread: the flag plus every wake
/// descriptor, so sleepers notice.
#[derive(Clone)]
struct Fleet {
    shutdown: Arc<AtomicBool>,
    wakes: Arc<Vec<WakeFd>>,
}

impl Fleet {
    fn trip(&self) {
        self.shutdown.store(true, Ordering::Release);
        for wake in self.wakes.iter() {
            wake.signal();
        }
    }
}

/// A running server: worker and app threads behind one shutdown switch.
pub struct Server {
    fleet: Fleet,
    threads: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl Server {
    /// Validate, wire the link matrix, bind every listener, spawn the
    /// fleet.
    pub fn start(config: ServerConfig, apps: Vec<AppSpec>) -> Result<Self> {
        validate_constants().map_err(SpoolError::config)?;
        config.validate(apps.len())?;

        let workers = config.workers;
        let app_count = apps.len();
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_wakes = (0..workers)
            .map(|_| WakeHandle::new())
            .collect::<Result<Vec<_>>>()?;
        let app_wakes = (0..app_count)
            .map(|_| WakeHandle::new())
            .collect::<Result<Vec<_>>>()?;

        // the W x A matrix: worker w's links indexed by app, app a's links
        // indexed by worker
        let mut worker_links: Vec<Vec<WorkerLink>> = (0..workers)
            .map(|_| Vec::with_capacity(app_count))
            .collect();
        let mut app_links: Vec<Vec<AppLink>> = (0..app_count)
            .map(|_| Vec::with_capacity(workers))
            .collect();
        for (w, row) in worker_links.iter_mut().enumerate() {
            for (a, column) in app_links.iter_mut().enumerate() {
                let (worker_half, app_half) = link(
                    config.outbound_ring,
                    config.inbound_ring,
                    worker_wakes[w].clone(),
                    app_wakes[a].clone()
                );
                row.push(worker_half);
                column.push(app_half);
            }
        }

        let all_wakes: Vec<WakeFd> = worker_wakes
            .iter()
            .chain(app_wakes.iter())
            .map(|h| h.wake.clone())
            .collect();
        let fleet = Fleet {
            shutdown: shutdown.clone(),
            wakes: Arc::new(all_wakes),
        };

        // build workers first so listener bind errors surface before any
        // thread starts
        let mut built_workers = Vec::with_capacity(workers);
        for (w, links) in worker_links.into_iter().enumerate() {
            built_workers.push(
                Worker::new(w as u32, &config, links, worker_wakes[w].clone(), shutdown.clone())?
            );
        }

        let mut threads = Vec::with_capacity(workers + app_count);
        for (w, mut worker) in built_workers.into_iter().enumerate() {
            let fleet = fleet.clone();
            let handle = std::thread::Builder
                ::new()
                .name(format!("spool-worker-{w}"))
                .spawn(move || {
                    let result = worker.run();
                    if let Err(ref e) = result {
                        error!(worker = w, error = %e, "worker failed");
                        fleet.trip();
                    }
                    result
                })?;
            threads.push(handle);
        }

        let scratch_multiplier = config.outbound_ring.multiplier;
        for (a, (links, spec)) in app_links.into_iter().zip(apps).enumerate() {
            let mut runtime = AppRuntime::new(
                a as u16,
                spec.tuning,
                links,
                app_wakes[a].clone(),
                spec.handler,
                spec.schema,
                scratch_multiplier,
                shutdown.clone()
            );
            let fleet = fleet.clone();
            let handle = std::thread::Builder
                ::new()
                .name(format!("spool-app-{a}"))
                .spawn(move || {
                    let result = runtime.run();
                    if let Err(ref e) = result {
                        error!(app = a, error = %e, "app failed");
                        fleet.trip();
                    }
                    result
                })?;
            threads.push(handle);
        }

        info!(workers, apps = app_count, "server started");
        Ok(Self {
            fleet,
            threads: Mutex::new(threads),
        })
    }

    /// Request cooperative shutdown: flag plus a wake for every sleeper.
    pub fn stop(&self) {
        info!("shutdown requested");
        self.fleet.trip();
    }

    /// Wait for every thread. Returns the first fatal error, if any.
    pub fn join(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.threads.lock());
        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // make sure the rest of the fleet stops too
                    self.fleet.trip();
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    self.fleet.trip();
                    first_error.get_or_insert(SpoolError::unexpected("thread panicked"));
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Stop, then join.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();
        self.join()
    }
}
