//! Indigo credential lifecycle engine.
//!
//! This crate owns every state change a credential goes through:
//!
//! - **[`machine`]** -- the pure state machine (`Pending → Active ⇄ Rotating
//!   → Expired | Revoked`) with its guards.
//! - **[`engine`]** -- [`LifecycleEngine`]: issue, read, rotate, revoke and
//!   the scheduled evaluation of one credential, all persisted through
//!   compare-and-swap.
//! - **[`scanner`]** -- the periodic loop that finds due credentials and
//!   drives them through the engine on a bounded worker pool.
//! - **[`policy`]** -- per-kind lifetimes, validation hooks and the
//!   exponential-backoff retry budget.
//! - **[`events`]** -- broadcast bus of [`LifecycleEvent`]s.
//! - **[`clock`]** -- injectable time source.
//! - **[`error`]** -- [`LifecycleError`] and its retry classification.
//!
//! All shared state lives in the credential store; the engine holds no lock
//! across a network or database round trip.

pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod machine;
pub mod policy;
pub mod scanner;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{LifecycleEngine, Outcome};
pub use error::{LifecycleError, Result};
pub use events::{EventBus, LifecycleEvent};
pub use machine::{Transition, apply};
pub use policy::{
    KindPolicies, KindPolicy, LifecyclePolicy, MAX_LIFETIME_SECS, RetryPolicy, Schedule,
};
pub use scanner::{RotationJob, ScanReport, Scanner, ScannerConfig};
