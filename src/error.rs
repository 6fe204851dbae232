//! Error types for evalcache.

use std::time::Duration;
use thiserror::Error;

/// Main error type for external function evaluation.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Failed to spawn evaluator '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Evaluator transport failure: {0}")]
    Transport(String),

    #[error("Malformed evaluator response: {0}")]
    Malformed(String),

    #[error("Evaluator did not respond within {0:?}")]
    Timeout(Duration),

    #[error("External function reported an error: {0}")]
    Remote(String),

    #[error("No evaluator process became available within {0:?}")]
    Exhausted(Duration),

    #[error("Process pool has been torn down")]
    PoolClosed,

    #[error("Invalid evaluator configuration: {0}")]
    Config(String),

    #[error("Evaluation of '{name}' failed: {source}")]
    Evaluation {
        name: String,
        #[source]
        source: Box<EvalError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvalError {
    /// Wrap an error with the name of the call site being evaluated.
    pub fn in_call(name: impl Into<String>, source: EvalError) -> Self {
        match source {
            already @ Self::Evaluation { .. } => already,
            other => Self::Evaluation {
                name: name.into(),
                source: Box::new(other),
            },
        }
    }

    /// Whether the error means the worker process can no longer be trusted.
    ///
    /// These are the failures the pool retries once on a fresh worker.
    pub fn is_worker_failure(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Malformed(_) | Self::Timeout(_) | Self::Io(_) => true,
            Self::Evaluation { source, .. } => source.is_worker_failure(),
            _ => false,
        }
    }

    /// The innermost error, skipping call-site wrappers.
    pub fn root(&self) -> &EvalError {
        match self {
            Self::Evaluation { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for evalcache operations.
pub type Result<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_spawn_error_message() {
        let err = EvalError::Spawn {
            command: "/opt/lib/extfn".to_string(),
            message: "No such file or directory".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/opt/lib/extfn"));
        assert!(msg.contains("No such file"));
    }

    #[test]
    fn test_evaluation_wrapper_names_call_site() {
        let err = EvalError::in_call("Modelica.Math.sin", EvalError::Malformed("bad tag".into()));
        let msg = err.to_string();
        assert!(msg.contains("Modelica.Math.sin"));
        assert!(msg.contains("bad tag"));
        assert!(matches!(err.root(), EvalError::Malformed(_)));
    }

    #[test]
    fn test_in_call_does_not_double_wrap() {
        let inner = EvalError::in_call("f", EvalError::PoolClosed);
        let outer = EvalError::in_call("g", inner);
        match outer {
            EvalError::Evaluation { name, .. } => assert_eq!(name, "f"),
            other => panic!("Expected Evaluation, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_failure_classification() {
        assert!(EvalError::Transport("eof".into()).is_worker_failure());
        assert!(EvalError::Malformed("x".into()).is_worker_failure());
        assert!(EvalError::Timeout(Duration::from_secs(1)).is_worker_failure());
        assert!(EvalError::in_call("f", EvalError::Transport("eof".into())).is_worker_failure());

        assert!(!EvalError::Remote("division by zero".into()).is_worker_failure());
        assert!(!EvalError::PoolClosed.is_worker_failure());
        assert!(!EvalError::Config("missing".into()).is_worker_failure());
        assert!(
            !EvalError::Spawn {
                command: "x".into(),
                message: "y".into()
            }
            .is_worker_failure()
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: EvalError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
        assert!(err.is_worker_failure());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid").unwrap_err();
        let err: EvalError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_exhausted_message() {
        let err = EvalError::Exhausted(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
