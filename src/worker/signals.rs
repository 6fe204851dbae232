//! Exit analysis for evaluator processes.
//!
//! A reaped wait status becomes a [`TerminationReason`], which the
//! communicator folds into the transport error for the call in flight.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// How an evaluator process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Returned from main or called exit.
    Exited(i32),
    /// The external code faulted (SIGSEGV, SIGBUS, SIGFPE, SIGILL, SIGABRT).
    Crashed(Signal),
    /// SIGKILL, from the pool or from outside.
    Killed,
    /// Any other fatal signal.
    Signaled(Signal),
    /// Not reaped within the grace period.
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Whether the external code itself faulted.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crashed(_))
    }

    /// Message for a call that lost its evaluator, e.g.
    /// `evaluator exited with code 3 while reading response`.
    pub fn failure(&self, during: &str) -> String {
        if during.is_empty() {
            format!("evaluator {}", self)
        } else {
            format!("evaluator {} while {}", self, during)
        }
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, Signal::SIGKILL, _) => Self::Killed,
            WaitStatus::Signaled(
                _,
                signal @ (Signal::SIGSEGV
                | Signal::SIGBUS
                | Signal::SIGFPE
                | Signal::SIGILL
                | Signal::SIGABRT),
                _,
            ) => Self::Crashed(signal),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            WaitStatus::StillAlive => Self::StillAlive,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Crashed(signal) => write!(f, "crashed ({})", signal.as_str()),
            Self::Killed => f.write_str("was killed"),
            Self::Signaled(signal) => write!(f, "terminated by {}", signal.as_str()),
            Self::StillAlive => f.write_str("stopped responding"),
            Self::Unknown => f.write_str("went away"),
        }
    }
}
