//! Lockless inter-thread messaging substrate
//!
//! Worker and app threads share nothing except these primitives:
//!
//! - [`buffer`]: the SPSC byte ring with producer-side relocation
//! - [`update`]: batched cursor publication and wake coalescing
//! - [`wake`]: the consumer sleep word and eventfd wake descriptor
//! - [`pair`]: the two-ring link binding one worker to one app
//!
//! Every ring has exactly one writing thread and exactly one reading
//! thread; ownership of each endpoint is moved into its thread at startup
//! and never shared.

pub mod buffer;
pub mod pair;
pub mod update;
pub mod wake;

pub use buffer::{ ring, Drain, RingConsumer, RingProducer };
pub use pair::{ link, AppLink, WakeHandle, WorkerLink };
pub use update::{ UpdateEntry, UpdateQueue, UpdateTarget };
pub use wake::{ SleepState, WakeFd };
