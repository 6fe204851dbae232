//! Framed channel to one evaluator process.
//!
//! The communicator owns the process and its pipes. Reads and writes are
//! bounded by the I/O timeout. Any I/O error, timeout, EOF or protocol
//! violation marks it dead; a dead communicator is never handed out again.

use super::ipc::LineWriter;
use super::proc::{KillHandle, Proc};
use super::signals::TerminationReason;
use super::spawn::{LaunchCommand, spawn_evaluator};
use crate::contract::{ResponseReader, Value, ValueType};
use crate::error::{EvalError, Result};
use nix::unistd::Pid;
use std::io::{self, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How long to wait for an exiting evaluator to be reaped when describing it.
const EXIT_REAP_GRACE: Duration = Duration::from_millis(200);

/// Bidirectional byte-stream channel to a live evaluator.
pub struct ProcessCommunicator {
    proc: Proc,
    /// Timeout for a single read.
    timeout: Option<Duration>,
    /// Deadline shared by all reads of the response in progress.
    response_deadline: Option<Instant>,
    dead: bool,
}

impl ProcessCommunicator {
    pub fn new(proc: Proc, timeout: Option<Duration>) -> Self {
        Self {
            proc,
            timeout,
            response_deadline: None,
            dead: false,
        }
    }

    /// Spawn an evaluator and wrap it.
    pub fn spawn(command: &LaunchCommand, timeout: Option<Duration>) -> Result<Self> {
        let proc = spawn_evaluator(command)?;
        debug!(pid = proc.pid().as_raw(), command = %command, "Spawned evaluator");
        Ok(Self::new(proc, timeout))
    }

    pub fn pid(&self) -> Pid {
        self.proc.pid()
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.proc.kill_handle()
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Whether the channel is usable and the process still runs.
    pub fn is_alive(&mut self) -> bool {
        if self.dead {
            return false;
        }
        if !self.proc.is_running() {
            self.dead = true;
        }
        !self.dead
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Bound every read of the coming response by one timeout.
    pub fn start_response_clock(&mut self) {
        self.response_deadline = self.timeout.map(|t| Instant::now() + t);
    }

    pub fn stop_response_clock(&mut self) {
        self.response_deadline = None;
    }

    fn deadline(&self) -> Option<Instant> {
        self.response_deadline
            .or_else(|| self.timeout.map(|t| Instant::now() + t))
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.dead {
            Err(EvalError::Transport(format!(
                "evaluator {} already failed",
                self.proc.pid()
            )))
        } else {
            Ok(())
        }
    }

    /// Mark dead and describe why the process went away.
    fn lost(&mut self, what: &str) -> EvalError {
        self.dead = true;
        let reason = self.proc.termination_reason(EXIT_REAP_GRACE);
        EvalError::Transport(format!("{} (pid {})", reason.failure(what), self.proc.pid()))
    }

    fn fail_io(&mut self, err: io::Error, what: &str) -> EvalError {
        self.dead = true;
        match err.kind() {
            io::ErrorKind::TimedOut => {
                EvalError::Timeout(self.timeout.unwrap_or_default())
            }
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => self.lost(what),
            io::ErrorKind::InvalidData => EvalError::Malformed(format!("{}: {}", what, err)),
            _ => EvalError::Transport(format!("{}: {}", what, err)),
        }
    }

    /// Writer bounded by the current deadline, so an evaluator that stops
    /// reading its stdin cannot block the caller.
    fn writer(&mut self) -> &mut LineWriter {
        let deadline = self.deadline();
        let writer = self.proc.writer();
        writer.set_deadline(deadline);
        writer
    }

    /// Write bytes as-is. The text must carry its own framing.
    pub fn write_raw(&mut self, text: &str) -> Result<()> {
        self.ensure_usable()?;
        self.writer()
            .stream()
            .write_all(text.as_bytes())
            .map_err(|e| self.fail_io(e, "writing request"))
    }

    /// Write one control token line.
    pub fn write_token(&mut self, token: &str) -> Result<()> {
        self.ensure_usable()?;
        self.writer()
            .push_line(token)
            .map_err(|e| self.fail_io(e, "writing request"))
    }

    /// Write a value through its own encoder.
    pub fn write_value<V: Value + ?Sized>(&mut self, value: &V) -> Result<()> {
        self.ensure_usable()?;
        value
            .serialize(self.writer().stream())
            .map_err(|e| self.fail_io(e, "serializing argument"))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.writer()
            .flush()
            .map_err(|e| self.fail_io(e, "sending request"))
    }

    /// Read up to the next newline.
    pub fn read_line(&mut self) -> Result<String> {
        self.ensure_usable()?;
        let deadline = self.deadline();
        match self.proc.reader().read_line_until(deadline) {
            Ok(Some(line)) => {
                let line = line.to_string();
                trace!(pid = self.proc.pid().as_raw(), line = %line, "Evaluator line");
                Ok(line)
            }
            Ok(None) => Err(self.lost("reading response")),
            Err(e) => Err(self.fail_io(e, "reading response")),
        }
    }

    /// Read exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        let deadline = self.deadline();
        self.proc
            .reader()
            .read_exact_until(len, deadline)
            .map_err(|e| self.fail_io(e, "reading response"))
    }

    /// Read a line and require it to be `expected`.
    pub fn accept(&mut self, expected: &str) -> Result<()> {
        let line = self.read_line()?;
        if line == expected {
            Ok(())
        } else {
            self.dead = true;
            Err(EvalError::Malformed(format!(
                "expected '{}', got '{}'",
                expected, line
            )))
        }
    }

    /// Read one value of the given type.
    pub fn read_value<T: ValueType + ?Sized>(&mut self, ty: &T) -> Result<T::Value> {
        match ty.deserialize(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_worker_failure() {
                    self.dead = true;
                }
                Err(e)
            }
        }
    }

    /// Wait for the startup token, using `timeout` instead of the read timeout.
    pub fn await_token(&mut self, token: &str, timeout: Option<Duration>) -> Result<()> {
        self.response_deadline = timeout.map(|t| Instant::now() + t);
        let result = self.accept(token);
        self.response_deadline = None;
        result
    }

    /// Why the process ended, if it has.
    pub fn termination_reason(&mut self) -> TerminationReason {
        self.proc.termination_reason(Duration::ZERO)
    }

    /// Forcibly kill the process.
    pub fn terminate(&mut self) {
        self.dead = true;
        if let Err(e) = self.proc.kill() {
            debug!(pid = self.proc.pid().as_raw(), error = %e, "Failed to kill evaluator");
        }
    }

    /// Ask the process to exit, escalating to signals after `grace`.
    pub fn stop(&mut self, grace: Duration) {
        let was_dead = self.dead;
        self.dead = true;
        let result = if was_dead {
            self.proc.kill()
        } else {
            self.proc.stop(grace)
        };
        if let Err(e) = result {
            debug!(pid = self.proc.pid().as_raw(), error = %e, "Failed to stop evaluator");
        }
    }
}

impl ResponseReader for ProcessCommunicator {
    fn next_line(&mut self) -> Result<String> {
        self.read_line()
    }

    fn next_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.read_bytes(len)
    }
}
