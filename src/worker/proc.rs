//! Process handle for evaluator subprocesses.
//!
//! Wraps a child process with IPC channels for communication.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::Token;
use super::signals::TerminationReason;
use crate::error::{EvalError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Reaped flag shared between a [`Proc`] and its [`KillHandle`]s.
///
/// Every `waitpid` happens while holding the lock, so a kill through a
/// handle can never hit a recycled pid.
type ReapState = Arc<Mutex<bool>>;

/// How long a SIGTERM gets before SIGKILL follows.
const SIGTERM_GRACE: Duration = Duration::from_millis(100);

fn lock_reaped(state: &ReapState) -> MutexGuard<'_, bool> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle that can force-kill an evaluator from another thread.
#[derive(Debug, Clone)]
pub struct KillHandle {
    pid: Pid,
    reaped: ReapState,
}

impl KillHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send SIGKILL unless the process has already been reaped.
    ///
    /// The owning [`Proc`] still reaps the process.
    pub fn kill(&self) {
        let reaped = lock_reaped(&self.reaped);
        if !*reaped {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
        }
    }
}

/// Handle to an evaluator subprocess with IPC channels.
pub struct Proc {
    /// Process ID
    pid: Pid,
    /// Writer for the evaluator's stdin
    writer: LineWriter,
    /// Reader for the evaluator's stdout
    reader: LineReader,
    /// Whether the process has been reaped
    reaped: ReapState,
    /// Exit status, once reaped
    status: Option<WaitStatus>,
}

impl Proc {
    /// Create a new process handle from its components.
    ///
    /// # Arguments
    /// * `pid` - The process ID
    /// * `stdin` - File descriptor for writing to the evaluator's stdin
    /// * `stdout` - File descriptor for reading from the evaluator's stdout
    pub fn new(pid: Pid, stdin: PipeFd, stdout: PipeFd) -> Self {
        Self {
            pid,
            writer: LineWriter::new(stdin),
            reader: LineReader::new(stdout),
            reaped: Arc::new(Mutex::new(false)),
            status: None,
        }
    }

    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EvalError::Transport("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EvalError::Transport("Child stdout not captured".into()))?;

        let stdin_fd = PipeFd::new(OwnedFd::from(stdin));
        let stdout_fd = PipeFd::new(OwnedFd::from(stdout));

        Ok(Self::new(pid, stdin_fd, stdout_fd))
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            pid: self.pid,
            reaped: Arc::clone(&self.reaped),
        }
    }

    pub fn reader(&mut self) -> &mut LineReader {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut LineWriter {
        &mut self.writer
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Reap without blocking. `None` while the process runs; the recorded
    /// status once it has been reaped.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        self.reap(Some(WaitPidFlag::WNOHANG))
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        self.reap(None)?
            .ok_or_else(|| EvalError::Transport(format!("evaluator {} not reaped", self.pid)))
    }

    fn reap(&mut self, flags: Option<WaitPidFlag>) -> Result<Option<WaitStatus>> {
        let mut reaped = lock_reaped(&self.reaped);
        if *reaped {
            return Ok(self.status);
        }
        match waitpid(self.pid, flags) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                *reaped = true;
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(e) => {
                // ECHILD: nothing left to reap or signal
                *reaped = true;
                Err(EvalError::Transport(format!("waitpid({}) failed: {}", self.pid, e)))
            }
        }
    }

    /// Poll for exit until `within` elapses.
    fn exited_within(&mut self, within: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !matches!(self.try_wait(), Ok(None)) {
                return true;
            }
            if start.elapsed() >= within {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Wait up to `grace` for the process to exit and report why it did.
    ///
    /// Used after the pipe reports EOF, when the process is usually on its
    /// way out but may not have been reaped yet.
    pub fn termination_reason(&mut self, grace: Duration) -> TerminationReason {
        if !self.exited_within(grace) {
            return TerminationReason::StillAlive;
        }
        match self.status {
            Some(status) => status.into(),
            None => TerminationReason::Unknown,
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        let reaped = lock_reaped(&self.reaped);
        if *reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| EvalError::Transport(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        {
            let reaped = lock_reaped(&self.reaped);
            if *reaped {
                return Ok(());
            }
            signal::kill(self.pid, Signal::SIGKILL)
                .map_err(|e| EvalError::Transport(format!("Failed to send SIGKILL: {}", e)))?;
        }
        self.wait()?;
        Ok(())
    }

    /// Ask the evaluator to leave with `EXIT`, escalating to SIGTERM after
    /// `grace` and to SIGKILL if that is ignored too.
    pub fn stop(&mut self, grace: Duration) -> Result<()> {
        if *lock_reaped(&self.reaped) {
            return Ok(());
        }

        // EXIT goes out only if the evaluator is still reading.
        self.writer.set_deadline(Some(Instant::now() + grace));
        if self.writer.write_line(Token::Exit.as_str()).is_ok() && self.exited_within(grace) {
            return Ok(());
        }
        if self.terminate().is_ok() && self.exited_within(SIGTERM_GRACE) {
            return Ok(());
        }
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !*lock_reaped(&self.reaped) {
            let _ = self.kill();
        }
        // Unsent request bytes are dropped instead of flushed.
        self.writer.set_deadline(Some(Instant::now()));
    }
}
