//! Process pool for one cache key.
//!
//! Holds up to `limit` evaluator processes. Callers lease a worker, run one
//! request/response exchange outside the pool lock, and hand it back through
//! the lease's `Drop`. When the pool is full, callers queue in FIFO order.

use super::communicator::ProcessCommunicator;
use super::proc::KillHandle;
use super::protocol::{Token, WorkRequest, WorkResponse};
use super::spawn::LaunchCommand;
use crate::config::PoolConfig;
use crate::contract::{CallSite, Value, Variable};
use crate::error::{EvalError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Value type produced by a call site's result variables.
type SiteValue<S> = <<S as CallSite>::Var as Variable>::Value;

/// A single evaluator in the pool.
struct Worker {
    /// Worker ID for logging.
    id: usize,
    /// Command the process was started with.
    command: LaunchCommand,
    com: ProcessCommunicator,
    /// Pool generation the worker belongs to.
    generation: u64,
    /// External objects whose state this worker has seen.
    markers: HashSet<String>,
    /// Call sites this worker has evaluated.
    served: HashSet<String>,
    /// Number of calls completed by this worker.
    jobs_completed: usize,
    /// A request was started and its `READY` not yet read.
    mid_exchange: bool,
}

impl Worker {
    /// Spawn the process and wait for its `START` token.
    fn start(id: usize, command: LaunchCommand, generation: u64, config: &PoolConfig) -> Result<Self> {
        let started = Instant::now();
        let mut com = ProcessCommunicator::spawn(&command, config.io_timeout)?;

        if let Err(e) = com.await_token(Token::Start.as_str(), config.startup_timeout) {
            com.terminate();
            return Err(EvalError::Spawn {
                command: command.to_string(),
                message: format!("evaluator did not start: {}", e),
            });
        }

        info!(
            worker_id = id,
            pid = com.pid().as_raw(),
            startup_ms = started.elapsed().as_millis(),
            "Evaluator started"
        );

        Ok(Self {
            id,
            command,
            com,
            generation,
            markers: HashSet::new(),
            served: HashSet::new(),
            jobs_completed: 0,
            mid_exchange: false,
        })
    }

    /// Send one call and read its results.
    ///
    /// `mid_exchange` stays set if this returns early or unwinds, since the
    /// stream then holds part of a request or response.
    fn call<S: CallSite + ?Sized>(&mut self, site: &S) -> Result<Vec<SiteValue<S>>> {
        let request_start = Instant::now();
        self.mid_exchange = true;
        let com = &mut self.com;

        com.write_raw(&WorkRequest::eval(site.name()).to_line())?;
        if let Some(object) = site.cached_external_object() {
            com.write_value(&object.ceval())?;
        }
        for var in site.external_objects_to_serialize() {
            com.write_value(&var.ceval())?;
        }
        match site.function_args_serialized() {
            Some(text) => write_verbatim(com, text)?,
            None => {
                for var in site.function_args_to_serialize() {
                    com.write_value(&var.ceval())?;
                }
            }
        }
        if let Some(text) = site.function_return_arg_serialized() {
            write_verbatim(com, text)?;
        }
        com.write_token(Token::End.as_str())?;
        com.flush()?;
        let send_time = request_start.elapsed();

        com.start_response_clock();
        let response = read_response(com, site);
        com.stop_response_clock();

        trace!(
            worker_id = self.id,
            function = site.name(),
            send_time_us = send_time.as_micros(),
            total_time_us = request_start.elapsed().as_micros(),
            "Evaluator request/response"
        );
        let outcome = response?;
        self.mid_exchange = false;
        outcome.map_err(EvalError::Remote)
    }

    fn record(&mut self, site_name: &str, marker: Option<&str>) {
        self.jobs_completed += 1;
        if !self.served.contains(site_name) {
            self.served.insert(site_name.to_string());
        }
        if let Some(marker) = marker {
            self.markers.insert(marker.to_string());
        }
    }

    /// Stop the process, gracefully unless it already failed.
    fn shutdown(mut self, grace: std::time::Duration) {
        debug!(
            worker_id = self.id,
            pid = self.com.pid().as_raw(),
            jobs_completed = self.jobs_completed,
            call_sites = self.served.len(),
            "Stopping evaluator"
        );
        self.com.stop(grace);
    }
}

/// Write cached request text, keeping the stream newline-terminated.
fn write_verbatim(com: &mut ProcessCommunicator, text: &str) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    com.write_raw(text)?;
    if !text.ends_with('\n') {
        com.write_raw("\n")?;
    }
    Ok(())
}

/// Read one response through its `READY`. The inner error is a failure the
/// evaluator reported itself.
fn read_response<S: CallSite + ?Sized>(
    com: &mut ProcessCommunicator,
    site: &S,
) -> Result<std::result::Result<Vec<SiteValue<S>>, String>> {
    let header = com.read_line()?;
    match WorkResponse::from_line(&header) {
        Some(WorkResponse::Result { count }) => {
            let vars = site.vars_to_deserialize();
            if count != vars.len() {
                com.mark_dead();
                return Err(EvalError::Malformed(format!(
                    "expected {} results, evaluator announced {}",
                    vars.len(),
                    count
                )));
            }
            let mut values = Vec::with_capacity(count);
            for var in vars {
                values.push(com.read_value(var.value_type())?);
            }
            com.accept(Token::Ready.as_str())?;
            Ok(Ok(values))
        }
        Some(WorkResponse::Error { message }) => {
            com.accept(Token::Ready.as_str())?;
            Ok(Err(message))
        }
        None => {
            com.mark_dead();
            Err(EvalError::Malformed(format!(
                "unexpected response header '{}'",
                header
            )))
        }
    }
}

/// Statistics about a process pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live processes, including ones starting up.
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    /// Current process limit.
    pub limit: usize,
    /// Callers waiting for a worker.
    pub waiting: usize,
    /// Processes started.
    pub spawned: usize,
    /// Processes stopped or discarded.
    pub retired: usize,
    /// Successful evaluations.
    pub evaluations: usize,
    /// Evaluations that failed after any retry.
    pub failures: usize,
    /// Evaluations retried on a fresh worker.
    pub retries: usize,
    /// Highest number of simultaneously busy workers.
    pub peak_busy: usize,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    spawned: usize,
    retired: usize,
    evaluations: usize,
    failures: usize,
    retries: usize,
    peak_busy: usize,
}

/// Mutable pool state, guarded by the pool mutex.
struct PoolState {
    idle: VecDeque<Worker>,
    /// Kill handles of leased workers, by worker ID.
    busy: HashMap<usize, KillHandle>,
    /// Idle + busy + starting.
    live: usize,
    limit: usize,
    /// Bumped by `destroy_processes`; older workers are discarded on release.
    generation: u64,
    closed: bool,
    /// FIFO tickets of waiting callers.
    queue: VecDeque<u64>,
    next_ticket: u64,
    counters: Counters,
}

impl PoolState {
    fn mark_busy(&mut self, worker: &Worker) {
        self.busy.insert(worker.id, worker.com.kill_handle());
        self.counters.peak_busy = self.counters.peak_busy.max(self.busy.len());
    }

    /// Take an idle worker started with `command`, preferring one that has
    /// seen `marker`. Idle workers whose process died are moved to `retired`.
    fn take_idle(
        &mut self,
        command: &LaunchCommand,
        marker: Option<&str>,
        retired: &mut Vec<Worker>,
    ) -> Option<Worker> {
        let mut i = 0;
        while i < self.idle.len() {
            if self.idle[i].com.is_alive() {
                i += 1;
            } else if let Some(dead) = self.idle.remove(i) {
                self.live -= 1;
                self.counters.retired += 1;
                retired.push(dead);
            }
        }

        let matching = |w: &Worker| w.command == *command;
        let preferred = marker.and_then(|m| {
            self.idle
                .iter()
                .position(|w| matching(w) && w.markers.contains(m))
        });
        let index = preferred.or_else(|| self.idle.iter().position(matching))?;
        self.idle.remove(index)
    }

    /// Retire the longest-idle worker to make room for a new process.
    fn retire_one_idle(&mut self, retired: &mut Vec<Worker>) -> bool {
        match self.idle.pop_front() {
            Some(worker) => {
                self.live -= 1;
                self.counters.retired += 1;
                retired.push(worker);
                true
            }
            None => false,
        }
    }
}

enum Assignment {
    Idle(Worker),
    /// A slot was reserved; spawn a worker for this generation.
    Spawn(u64),
}

/// Lease on one worker. Dropping it returns the worker to the pool, or
/// discards it if the exchange left it unusable: dead, interrupted by an
/// error before `READY`, or unwound by a panic.
struct WorkerLease<'a> {
    pool: &'a ProcessPool,
    worker: Option<Worker>,
}

impl WorkerLease<'_> {
    fn worker(&mut self) -> &mut Worker {
        self.worker
            .as_mut()
            .expect("lease holds its worker until dropped")
    }
}

impl Drop for WorkerLease<'_> {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            if worker.mid_exchange || std::thread::panicking() {
                worker.com.mark_dead();
            }
            self.pool.release(worker);
        }
    }
}

/// A bounded pool of evaluator processes for one cache key.
pub struct ProcessPool {
    key: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled on release, spawn completion, limit change, destroy and tear-down.
    changed: Condvar,
    next_worker_id: AtomicUsize,
}

impl ProcessPool {
    /// Create an empty pool. No process is started until the first evaluation.
    pub fn new(key: impl Into<String>, config: PoolConfig) -> Self {
        let limit = config.process_limit.max(1);
        Self {
            key: key.into(),
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                busy: HashMap::new(),
                live: 0,
                limit,
                generation: 0,
                closed: false,
                queue: VecDeque::new(),
                next_ticket: 0,
                counters: Counters::default(),
            }),
            changed: Condvar::new(),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluate one call site, caching the results in its result variables.
    ///
    /// A worker that dies or answers with garbage is discarded and the call
    /// is retried once on a fresh worker. Results are stored only when every
    /// value was read.
    #[instrument(level = "debug", skip_all, fields(key = %self.key, function = site.name()))]
    pub fn evaluate<S: CallSite + ?Sized>(&self, site: &S) -> Result<()> {
        self.set_process_limit(site.process_limit());

        let command =
            LaunchCommand::for_call_site(site).map_err(|e| EvalError::in_call(site.name(), e))?;
        let marker = site
            .cached_external_object()
            .and_then(|var| var.ceval().marked_external_object().map(str::to_owned));

        let mut retried = false;
        loop {
            let result = self
                .acquire(&command, marker.as_deref(), retried)
                .and_then(|mut lease| {
                    let worker = lease.worker();
                    match worker.call(site) {
                        Ok(values) => {
                            worker.record(site.name(), marker.as_deref());
                            Ok(values)
                        }
                        Err(e) => {
                            if e.is_worker_failure() {
                                worker.com.mark_dead();
                            }
                            Err(e)
                        }
                    }
                });

            match result {
                Ok(values) => {
                    for (var, value) in site.vars_to_deserialize().iter().zip(values) {
                        var.cache_value(value);
                    }
                    self.lock_state().counters.evaluations += 1;
                    return Ok(());
                }
                Err(e) if e.is_worker_failure() && !retried => {
                    warn!(
                        key = %self.key,
                        function = site.name(),
                        error = %e,
                        "Evaluator failed, retrying on a fresh process"
                    );
                    self.lock_state().counters.retries += 1;
                    retried = true;
                }
                Err(e) => {
                    self.lock_state().counters.failures += 1;
                    return Err(EvalError::in_call(site.name(), e));
                }
            }
        }
    }

    /// Assign a worker to the caller, waiting in FIFO order when the pool is full.
    fn acquire(
        &self,
        command: &LaunchCommand,
        marker: Option<&str>,
        fresh: bool,
    ) -> Result<WorkerLease<'_>> {
        let mut retired = Vec::new();
        let mut state = self.lock_state();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);
        let deadline = self.config.wait_timeout.map(|t| Instant::now() + t);

        let assignment = loop {
            if state.closed {
                break Err(EvalError::PoolClosed);
            }
            if state.queue.front() == Some(&ticket) {
                if !fresh && let Some(worker) = state.take_idle(command, marker, &mut retired) {
                    break Ok(Assignment::Idle(worker));
                }
                if state.live < state.limit {
                    state.live += 1;
                    break Ok(Assignment::Spawn(state.generation));
                }
                if state.retire_one_idle(&mut retired) {
                    continue;
                }
            }

            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break Err(EvalError::Exhausted(self.config.wait_timeout.unwrap_or_default()));
                    }
                    self.changed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        };

        state.queue.retain(|&t| t != ticket);
        if let Ok(Assignment::Idle(worker)) = &assignment {
            state.mark_busy(worker);
        }
        self.changed.notify_all();
        drop(state);

        for worker in retired {
            worker.shutdown(self.config.stop_grace);
        }

        match assignment? {
            Assignment::Idle(worker) => {
                trace!(key = %self.key, worker_id = worker.id, "Reusing idle evaluator");
                Ok(WorkerLease {
                    pool: self,
                    worker: Some(worker),
                })
            }
            Assignment::Spawn(generation) => self.spawn_reserved(command, generation),
        }
    }

    /// Start a worker in a slot reserved by `acquire`.
    fn spawn_reserved(&self, command: &LaunchCommand, generation: u64) -> Result<WorkerLease<'_>> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let started = Worker::start(id, command.clone(), generation, &self.config);

        let mut state = self.lock_state();
        let mut worker = match started {
            Ok(worker) => worker,
            Err(e) => {
                state.live -= 1;
                self.changed.notify_all();
                return Err(e);
            }
        };
        state.counters.spawned += 1;

        if state.closed {
            state.live -= 1;
            state.counters.retired += 1;
            self.changed.notify_all();
            drop(state);
            worker.shutdown(self.config.stop_grace);
            return Err(EvalError::PoolClosed);
        }

        // Processes destroyed while this one was starting did not include it.
        worker.generation = state.generation;
        state.mark_busy(&worker);
        drop(state);

        Ok(WorkerLease {
            pool: self,
            worker: Some(worker),
        })
    }

    /// Return a leased worker, keeping it only if it is still usable.
    fn release(&self, worker: Worker) {
        let mut state = self.lock_state();
        state.busy.remove(&worker.id);

        let reusable = !worker.com.is_dead()
            && !state.closed
            && worker.generation == state.generation
            && state.live <= state.limit;

        let discarded = if reusable {
            state.idle.push_back(worker);
            None
        } else {
            state.live -= 1;
            state.counters.retired += 1;
            Some(worker)
        };
        self.changed.notify_all();
        drop(state);

        if let Some(worker) = discarded {
            debug!(key = %self.key, worker_id = worker.id, "Discarding evaluator");
            worker.shutdown(self.config.stop_grace);
        }
    }

    /// Change the process limit. Surplus idle workers are stopped now, busy
    /// ones when they are released.
    pub fn set_process_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let mut retired = Vec::new();
        {
            let mut state = self.lock_state();
            if state.limit == limit {
                return;
            }
            debug!(key = %self.key, from = state.limit, to = limit, "Process limit changed");
            state.limit = limit;
            while state.live > state.limit && state.retire_one_idle(&mut retired) {}
            self.changed.notify_all();
        }
        for worker in retired {
            worker.shutdown(self.config.stop_grace);
        }
    }

    pub fn process_limit(&self) -> usize {
        self.lock_state().limit
    }

    /// Terminate every evaluator, idle or busy. The pool stays usable and
    /// starts new processes on demand.
    pub fn destroy_processes(&self) {
        self.shut_down_processes(false);
    }

    /// Terminate every evaluator and close the pool. Waiting and later
    /// callers fail with [`EvalError::PoolClosed`].
    pub fn tear_down(&self) {
        self.shut_down_processes(true);
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn shut_down_processes(&self, close: bool) {
        let idle: Vec<Worker> = {
            let mut state = self.lock_state();
            if close {
                state.closed = true;
            }
            state.generation += 1;
            let idle: Vec<Worker> = state.idle.drain(..).collect();
            state.live -= idle.len();
            state.counters.retired += idle.len();
            for handle in state.busy.values() {
                handle.kill();
            }
            if !idle.is_empty() || !state.busy.is_empty() {
                info!(
                    key = %self.key,
                    idle = idle.len(),
                    busy = state.busy.len(),
                    closing = close,
                    "Destroying evaluator processes"
                );
            }
            self.changed.notify_all();
            idle
        };

        for worker in idle {
            worker.shutdown(self.config.stop_grace);
        }
    }

    /// Get statistics about the pool.
    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            busy: state.busy.len(),
            limit: state.limit,
            waiting: state.queue.len(),
            spawned: state.counters.spawned,
            retired: state.counters.retired,
            evaluations: state.counters.evaluations,
            failures: state.counters.failures,
            retries: state.counters.retries,
            peak_busy: state.counters.peak_busy,
            closed: state.closed,
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.tear_down();
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("key", &self.key)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvalOptions;
    use crate::model::{EvalType, EvalValue, ExternalCall, Var};
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::path::Path;
    use std::time::Duration;

    /// Evaluator that answers every request with one real.
    const CONSTANT_EVALUATOR: &str = r#"echo START
while IFS= read -r line; do
  case "$line" in
    END) printf 'RESULT 1\nR 42.0\nREADY\n' ;;
    EXIT) exit 0 ;;
  esac
done"#;

    /// Evaluator that announces a result it never sends.
    const LYING_EVALUATOR: &str = r#"echo START
while IFS= read -r line; do
  case "$line" in
    END) printf 'RESULT 1\nI 1\nREADY\n' ;;
  esac
done"#;

    fn shell_call(script: &str, limit: usize) -> ExternalCall {
        ExternalCall::new("constant")
            .with_options(EvalOptions::new().with_process_limit(limit))
            .with_library("", vec!["sh".into(), "-c".into(), script.into()])
            .with_args([EvalValue::Real(1.0)])
            .with_results([EvalType::Real])
    }

    /// Variable whose value cannot be computed.
    enum TestVar {
        Plain(Var),
        Exploding(EvalType),
    }

    impl Variable for TestVar {
        type Value = EvalValue;
        type Type = EvalType;

        fn ceval(&self) -> EvalValue {
            match self {
                Self::Plain(var) => var.ceval(),
                Self::Exploding(_) => panic!("argument could not be computed"),
            }
        }

        fn value_type(&self) -> &EvalType {
            match self {
                Self::Plain(var) => var.value_type(),
                Self::Exploding(ty) => ty,
            }
        }

        fn cache_value(&self, value: EvalValue) {
            if let Self::Plain(var) = self {
                var.cache_value(value);
            }
        }
    }

    struct TestSite {
        options: EvalOptions,
        library: Vec<String>,
        args: Vec<TestVar>,
        results: Vec<TestVar>,
    }

    impl CallSite for TestSite {
        type Var = TestVar;

        fn name(&self) -> &str {
            "constant"
        }

        fn options(&self) -> &EvalOptions {
            &self.options
        }

        fn library_directory(&self) -> &Path {
            Path::new("")
        }

        fn library(&self) -> &[String] {
            &self.library
        }

        fn cached_external_object(&self) -> Option<&TestVar> {
            None
        }

        fn external_objects_to_serialize(&self) -> &[TestVar] {
            &[]
        }

        fn function_args_to_serialize(&self) -> &[TestVar] {
            &self.args
        }

        fn function_args_serialized(&self) -> Option<&str> {
            None
        }

        fn function_return_arg_serialized(&self) -> Option<&str> {
            None
        }

        fn vars_to_deserialize(&self) -> &[TestVar] {
            &self.results
        }
    }

    fn pool(limit: usize) -> ProcessPool {
        let config = PoolConfig {
            process_limit: limit,
            io_timeout: Some(Duration::from_secs(5)),
            startup_timeout: Some(Duration::from_secs(5)),
            wait_timeout: None,
            stop_grace: Duration::from_millis(200),
        };
        ProcessPool::new("test", config)
    }

    #[test]
    fn test_new_pool_spawns_nothing() {
        let pool = pool(2);
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.spawned, 0);
        assert_eq!(stats.limit, 2);
        assert!(!stats.closed);
    }

    #[test]
    fn test_evaluate_and_reuse() {
        let pool = pool(2);
        let call = shell_call(CONSTANT_EVALUATOR, 2);

        pool.evaluate(&call).unwrap();
        pool.evaluate(&call).unwrap();

        assert_eq!(call.result_values(), vec![Some(EvalValue::Real(42.0))]);
        let stats = pool.stats();
        assert_eq!(stats.spawned, 1);
        assert_eq!(stats.evaluations, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.busy, 0);
    }

    #[test]
    fn test_type_mismatch_retries_then_fails() {
        let pool = pool(1);
        let call = shell_call(LYING_EVALUATOR, 1);

        let err = pool.evaluate(&call).unwrap_err();
        assert!(matches!(err.root(), EvalError::Malformed(_)));
        assert!(err.to_string().contains("constant"));
        assert_eq!(call.result_values(), vec![None]);

        let stats = pool.stats();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.live, 0);
        assert_eq!(stats.busy, 0);
    }

    #[test]
    fn test_spawn_failure_releases_slot() {
        let pool = pool(1);
        let call = ExternalCall::new("missing")
            .with_library("/nonexistent/lib", vec!["evaluator".into()])
            .with_results([EvalType::Real]);

        let err = pool.evaluate(&call).unwrap_err();
        assert!(matches!(err.root(), EvalError::Spawn { .. }));
        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().retries, 0);
    }

    #[test]
    fn test_evaluator_that_never_starts() {
        let pool = pool(1);
        let call = shell_call("echo HELLO", 1);
        let err = pool.evaluate(&call).unwrap_err();
        match err.root() {
            EvalError::Spawn { message, .. } => assert!(message.contains("did not start")),
            other => panic!("Expected Spawn, got {:?}", other),
        }
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_tear_down_rejects_callers() {
        let pool = pool(1);
        let call = shell_call(CONSTANT_EVALUATOR, 1);
        pool.evaluate(&call).unwrap();

        pool.tear_down();
        assert!(pool.is_closed());
        assert_eq!(pool.stats().live, 0);

        let err = pool.evaluate(&call).unwrap_err();
        assert!(matches!(err.root(), EvalError::PoolClosed));
    }

    #[test]
    fn test_destroy_processes_respawns() {
        let pool = pool(1);
        let call = shell_call(CONSTANT_EVALUATOR, 1);
        pool.evaluate(&call).unwrap();

        pool.destroy_processes();
        assert_eq!(pool.stats().live, 0);

        pool.evaluate(&call).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.live, 1);
    }

    #[test]
    fn test_lowering_limit_retires_idle() {
        let pool = pool(3);
        let command = LaunchCommand::new("sh").with_args(["-c", CONSTANT_EVALUATOR]);
        let first = pool.acquire(&command, None, false).unwrap();
        let second = pool.acquire(&command, None, false).unwrap();
        drop(first);
        drop(second);
        assert_eq!(pool.stats().idle, 2);

        pool.set_process_limit(1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.retired, 1);
        assert_eq!(pool.process_limit(), 1);

        pool.set_process_limit(0);
        assert_eq!(pool.process_limit(), 1);
    }

    #[test]
    fn test_wait_timeout_when_full() {
        let config = PoolConfig {
            process_limit: 1,
            wait_timeout: Some(Duration::from_millis(100)),
            ..PoolConfig::default()
        };
        let pool = ProcessPool::new("full", config);
        let command = LaunchCommand::new("sh").with_args(["-c", CONSTANT_EVALUATOR]);

        let lease = pool.acquire(&command, None, false).unwrap();
        let started = Instant::now();
        let err = pool.acquire(&command, None, false).err().unwrap();
        assert!(matches!(err, EvalError::Exhausted(_)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.stats().waiting, 0);

        drop(lease);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_idle_worker_of_other_command_is_replaced() {
        let pool = pool(1);
        let first = LaunchCommand::new("sh").with_args(["-c", CONSTANT_EVALUATOR]);
        let second = LaunchCommand::new("sh").with_args(["-c", CONSTANT_EVALUATOR, "other"]);

        drop(pool.acquire(&first, None, false).unwrap());
        let lease = pool.acquire(&second, None, false).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.retired, 1);
        assert_eq!(stats.live, 1);
        drop(lease);
    }

    #[test]
    fn test_dead_idle_worker_is_not_reused() {
        let pool = pool(2);
        let command = LaunchCommand::new("sh").with_args(["-c", CONSTANT_EVALUATOR]);

        let mut lease = pool.acquire(&command, None, false).unwrap();
        let handle = lease.worker().com.kill_handle();
        drop(lease);
        handle.kill();
        std::thread::sleep(Duration::from_millis(50));

        let lease = pool.acquire(&command, None, false).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.live, 1);
        drop(lease);
    }

    #[test]
    fn test_panic_mid_request_discards_worker() {
        let pool = pool(1);
        let site = TestSite {
            options: EvalOptions::new().with_process_limit(1),
            library: vec!["sh".into(), "-c".into(), CONSTANT_EVALUATOR.into()],
            args: vec![
                TestVar::Plain(Var::input("x", EvalValue::Real(1.0))),
                TestVar::Exploding(EvalType::Real),
            ],
            results: vec![TestVar::Plain(Var::output("y", EvalType::Real))],
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| pool.evaluate(&site)));
        assert!(outcome.is_err());

        // The half-written request must not reach the next caller
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.retired, 1);

        let call = shell_call(CONSTANT_EVALUATOR, 1);
        pool.evaluate(&call).unwrap();
        assert_eq!(call.result_values(), vec![Some(EvalValue::Real(42.0))]);
        assert_eq!(pool.stats().spawned, 2);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_evaluator_not_reading_times_out() {
        let pool = ProcessPool::new(
            "test",
            PoolConfig {
                process_limit: 1,
                io_timeout: Some(Duration::from_millis(300)),
                startup_timeout: Some(Duration::from_secs(5)),
                wait_timeout: None,
                stop_grace: Duration::from_millis(200),
            },
        );
        let call = ExternalCall::new("stuck")
            .with_options(EvalOptions::new().with_process_limit(1))
            .with_library(
                "",
                vec!["sh".into(), "-c".into(), "echo START; exec sleep 30".into()],
            )
            .with_args([EvalValue::String("x".repeat(4 * 1024 * 1024))])
            .with_results([EvalType::Real]);

        let started = Instant::now();
        let err = pool.evaluate(&call).unwrap_err();
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "blocked for {:?}",
            started.elapsed()
        );
        assert!(matches!(err.root(), EvalError::Timeout(_)), "{}", err);

        let stats = pool.stats();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.live, 0);
        assert_eq!(stats.busy, 0);
    }
}
