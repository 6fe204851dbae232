//! evalcache - pooled out-of-process evaluators for external functions.
//!
//! A compiler evaluating external functions at compile time runs them in
//! separate evaluator processes. [`MultiCache`] maps each cache key to a
//! [`ProcessPool`] that keeps a bounded number of those processes alive and
//! reuses them across calls.
//!
//! ```no_run
//! use evalcache::{EvalType, EvalValue, ExternalCall, MultiCache};
//!
//! let cache = MultiCache::new();
//! let call = ExternalCall::new("add")
//!     .with_library("/opt/ext", vec!["evaluator".into()])
//!     .with_args([EvalValue::Real(1.0), EvalValue::Real(2.0)])
//!     .with_results([EvalType::Real]);
//!
//! cache.get_or_create("ext").evaluate(&call)?;
//! assert_eq!(call.result_values(), vec![Some(EvalValue::Real(3.0))]);
//! # Ok::<(), evalcache::EvalError>(())
//! ```

pub mod cache;
pub mod config;
pub mod contract;
pub mod error;
pub mod logging;
pub mod model;
pub mod worker;

pub use cache::MultiCache;
pub use config::{EvalOptions, PoolConfig};
pub use contract::{CallSite, ResponseReader, Value, ValueType, Variable};
pub use error::{EvalError, Result};
pub use model::{EvalType, EvalValue, ExternalCall, Var};
pub use worker::{LaunchCommand, PoolStats, ProcessCommunicator, ProcessPool};
