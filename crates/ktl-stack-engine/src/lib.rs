//! Stack run engine.
//!
//! The pieces that drive a plan to completion: the ready-set [`Scheduler`]
//! with its multi-dimensional admission budgets, the outcome-driven
//! [`AdaptiveController`], the exclusive [`RunLock`], the observer fan-out,
//! and the [`Runner`] that wires them to the state store, the hook runner
//! and a caller-provided [`NodeExecutor`]. Resume, replay and drift live in
//! [`resume`].

mod adaptive;
mod executor;
mod lock;
mod observer;
mod resume;
mod runner;
mod scheduler;

pub use adaptive::{AdaptiveController, TargetChange};
pub use executor::{DigestProvider, NodeExecutor, RunContext};
pub use lock::{LOCK_FILE, LockInfo, RunLock, default_owner};
pub use observer::{ObserverHub, RunObserver};
pub use resume::{
    DriftEntry, ReplayedRun, drift_report, load_most_recent_run, replay_run, rerun_candidates,
};
pub use runner::{RunOptions, RunReport, Runner};
pub use scheduler::{BlockedNode, BudgetHold, ReadyNode, Scheduler};
