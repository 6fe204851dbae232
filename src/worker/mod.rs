//! Evaluator subprocesses and the pools that own them.
//!
//! External functions run in separate evaluator processes that speak a
//! line-framed protocol on stdin/stdout. A [`ProcessPool`] keeps a bounded
//! number of them alive per cache key and reuses them across calls.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   ProcessPool   │
//!                     │  (one per key)  │
//!                     └────────┬────────┘
//!                              │  lease / release
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │ evaluator │  │ evaluator │  │ evaluator │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: A crashing evaluator cannot take the caller down
//! - **Hard limit**: Never more than the call site's process limit per pool
//! - **Crash recovery**: Failed workers are discarded and the call retried once
//! - **Fair waiting**: Callers blocked at the limit are served in arrival order

mod communicator;
mod ipc;
mod pool;
mod proc;
mod protocol;
mod signals;
mod spawn;
pub mod worker_main;

pub use communicator::ProcessCommunicator;
pub use pool::{PoolStats, ProcessPool};
pub use proc::KillHandle;
pub use protocol::{Token, WorkRequest, WorkResponse};
pub use signals::TerminationReason;
pub use spawn::LaunchCommand;
pub use worker_main::run_worker_main;
