use crate::config::{ConfigError, DEFAULT_POOL_SIZE, UNBOUNDED_LIMIT};
use crate::handler::{FailureReport, FileOutputHandler, Handler, HandlerError};
use crate::input::Input;
use crate::ipc::{self, SupervisorEnd, SupervisorMessage, WorkerMessage};
use crate::suite::{SuiteSet, TestSuite};
use crate::sys::{self, Fork, Pid, WaitStatus};
use crate::worker;
use rand::Rng;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest the supervisor sleeps before re-checking for dead workers,
/// timeouts and shutdown requests.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spreads per-worker seeds apart so consecutive workers do not draw
/// correlated streams.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Outcome of one fuzzing iteration, as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The deploy operation returned cleanly. Never reported.
    Ok,
    /// The deploy operation returned an error or panicked; the worker survived.
    Fault(String),
    /// The worker process was terminated by this signal.
    Signaled(i32),
    /// The worker process exited with this code in the middle of an iteration.
    Exited(i32),
    /// The supervisor killed a worker whose iteration ran longer than allowed.
    Timeout(Duration),
}

impl ExecutionStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ExecutionStatus::Ok)
    }

    /// Whether the worker process was lost, as opposed to surviving a fault.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Signaled(_) | ExecutionStatus::Exited(_) | ExecutionStatus::Timeout(_)
        )
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExecutionStatus::Signaled(signal) => Some(*signal),
            _ => None,
        }
    }
}

impl From<WaitStatus> for ExecutionStatus {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(code) => ExecutionStatus::Exited(code),
            WaitStatus::Signaled(signal) => ExecutionStatus::Signaled(signal),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Ok => write!(f, "ok"),
            ExecutionStatus::Fault(msg) => write!(f, "unrescued fault: {msg}"),
            ExecutionStatus::Signaled(signal) => write!(
                f,
                "terminated by signal {signal} ({})",
                sys::signal_name(*signal)
            ),
            ExecutionStatus::Exited(code) => write!(f, "exited with code {code} mid-iteration"),
            ExecutionStatus::Timeout(after) => write!(f, "timed out after {after:?}"),
        }
    }
}

/// What `limit` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitScope {
    /// `limit` iterations in total, across the whole pool.
    #[default]
    Global,
    /// `limit` iterations per pool slot. A replacement worker inherits the
    /// count of the slot it fills.
    PerWorker,
}

/// Cooperative stop request for a running executor.
///
/// Once requested, workers are denied new iterations and the run returns
/// after every worker has finished its current one.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    interrupts: bool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also trips on SIGINT. Installs a process-wide handler.
    pub fn with_interrupts() -> io::Result<Self> {
        sys::install_interrupt_flag()?;
        Ok(Self {
            flag: Arc::default(),
            interrupts: true,
        })
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.interrupts && sys::interrupted())
    }
}

/// Construction options for an [`Executor`].
pub struct ExecutorOptions<I: Input> {
    pub pool_size: usize,
    pub limit: i64,
    pub handler: Box<dyn Handler<I>>,
    pub limit_scope: LimitScope,
    /// `None` never preempts a hung worker.
    pub iteration_timeout: Option<Duration>,
    /// Base seed for the workers' random streams; random when `None`.
    pub seed: Option<u64>,
    pub shutdown: ShutdownSignal,
}

impl<I: Input> ExecutorOptions<I> {
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn handler<H: Handler<I> + 'static>(self, handler: H) -> Self {
        self.boxed_handler(Box::new(handler))
    }

    pub fn boxed_handler(mut self, handler: Box<dyn Handler<I>>) -> Self {
        self.handler = handler;
        self
    }

    pub fn limit_scope(mut self, scope: LimitScope) -> Self {
        self.limit_scope = scope;
        self
    }

    pub fn iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }
}

impl<I: Input> Default for ExecutorOptions<I> {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            limit: UNBOUNDED_LIMIT,
            handler: Box::new(FileOutputHandler::default()),
            limit_scope: LimitScope::default(),
            iteration_timeout: None,
            seed: None,
            shutdown: ShutdownSignal::default(),
        }
    }
}

/// Counters for one call to [`Executor::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations that completed or died in flight.
    pub iterations: u64,
    /// Unrescued faults reported by surviving workers.
    pub faults: u64,
    /// Workers lost to a signal, an unexpected exit or a timeout.
    pub crashes: u64,
    pub workers_spawned: u64,
}

impl RunSummary {
    pub fn failures(&self) -> u64 {
        self.faults + self.crashes
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("handler '{handler}' failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: HandlerError,
    },
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("supervisor I/O failure: {0}")]
    Supervisor(#[source] io::Error),
}

/// Iteration ids claimed so far, against the configured limit.
#[derive(Debug)]
struct Budget {
    limit: Option<u64>,
    scope: LimitScope,
    claimed: u64,
    per_slot: Vec<u64>,
}

impl Budget {
    fn new(limit: i64, scope: LimitScope, pool_size: usize) -> Self {
        Self {
            limit: u64::try_from(limit).ok(),
            scope,
            claimed: 0,
            per_slot: vec![0; pool_size],
        }
    }

    fn exhausted(&self, slot: usize) -> bool {
        match (self.limit, self.scope) {
            (None, _) => false,
            (Some(limit), LimitScope::Global) => self.claimed >= limit,
            (Some(limit), LimitScope::PerWorker) => self.per_slot[slot] >= limit,
        }
    }

    /// Hands out the next 1-based iteration id, or `None` once the budget
    /// for `slot` is spent.
    fn claim(&mut self, slot: usize) -> Option<u64> {
        if self.exhausted(slot) {
            return None;
        }
        self.claimed += 1;
        self.per_slot[slot] += 1;
        Some(self.claimed)
    }
}

#[derive(Debug)]
struct InFlight<I> {
    sample_id: u64,
    suite: Option<usize>,
    generator: Option<String>,
    data: Option<I>,
    started: Instant,
}

impl<I> InFlight<I> {
    fn granted(sample_id: u64) -> Self {
        Self {
            sample_id,
            suite: None,
            generator: None,
            data: None,
            started: Instant::now(),
        }
    }
}

struct Worker<I: Input> {
    pid: Pid,
    slot: usize,
    channel: SupervisorEnd,
    /// Cleared once the channel hits EOF or garbage; the process itself is
    /// still reaped through waitpid.
    open: bool,
    current: Option<InFlight<I>>,
    last: Option<InFlight<I>>,
    timed_out: Option<Duration>,
}

impl<I: Input> Worker<I> {
    fn new(pid: Pid, slot: usize, channel: SupervisorEnd) -> Self {
        Self {
            pid,
            slot,
            channel,
            open: true,
            current: None,
            last: None,
            timed_out: None,
        }
    }
}

/// Live workers. Dropping the pool kills and reaps whatever is still
/// running, so no exit path from `run` leaves children behind.
struct WorkerPool<I: Input> {
    workers: Vec<Worker<I>>,
}

impl<I: Input> WorkerPool<I> {
    fn new() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// `(index, fd)` for every worker whose channel is still readable.
    fn open_fds(&self) -> Vec<(usize, RawFd)> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.open)
            .map(|(idx, w)| (idx, w.channel.poll_fd()))
            .collect()
    }

    /// Removes and returns every worker that has terminated.
    fn reap_exited(&mut self) -> io::Result<Vec<(Worker<I>, WaitStatus)>> {
        let mut exited = Vec::new();
        let mut idx = 0;
        while idx < self.workers.len() {
            match sys::try_wait(self.workers[idx].pid)? {
                Some(status) => exited.push((self.workers.remove(idx), status)),
                None => idx += 1,
            }
        }
        Ok(exited)
    }

    /// In a freshly forked worker: close the inherited channels of its
    /// siblings without touching the sibling processes.
    fn release_in_child(&mut self) {
        self.workers.clear();
    }
}

impl<I: Input> Drop for WorkerPool<I> {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            if let Err(e) = sys::kill(worker.pid, libc::SIGKILL) {
                tracing::warn!(pid = worker.pid, error = %e, "failed to kill worker");
            }
            match sys::wait_blocking(worker.pid) {
                Ok(status) => tracing::debug!(pid = worker.pid, ?status, "reaped worker on teardown"),
                Err(e) => tracing::warn!(pid = worker.pid, error = %e, "failed to reap worker"),
            }
        }
    }
}

/// Drives a pool of forked worker processes through the fuzzing loop and
/// routes every failure to the configured [`Handler`].
pub struct Executor<I: Input> {
    suites: SuiteSet<I>,
    pool_size: usize,
    limit: i64,
    limit_scope: LimitScope,
    iteration_timeout: Option<Duration>,
    seed: Option<u64>,
    shutdown: ShutdownSignal,
    handler: Box<dyn Handler<I>>,
}

impl<I: Input> Executor<I> {
    /// Accepts a single [`TestSuite`] or a `Vec` of them.
    pub fn new(
        suites: impl Into<Vec<TestSuite<I>>>,
        options: ExecutorOptions<I>,
    ) -> Result<Self, ConfigError> {
        let suites = SuiteSet::new(suites.into())?;
        if options.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(options.pool_size));
        }
        if options.limit < UNBOUNDED_LIMIT {
            return Err(ConfigError::InvalidLimit(options.limit));
        }
        Ok(Self {
            suites,
            pool_size: options.pool_size,
            limit: options.limit,
            limit_scope: options.limit_scope,
            iteration_timeout: options.iteration_timeout,
            seed: options.seed,
            shutdown: options.shutdown,
            handler: options.handler,
        })
    }

    pub fn suites(&self) -> &[TestSuite<I>] {
        self.suites.as_slice()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn limit_scope(&self) -> LimitScope {
        self.limit_scope
    }

    pub fn iteration_timeout(&self) -> Option<Duration> {
        self.iteration_timeout
    }

    pub fn handler(&self) -> &dyn Handler<I> {
        self.handler.as_ref()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn into_handler(self) -> Box<dyn Handler<I>> {
        self.handler
    }

    /// Runs until the iteration budget is spent (or shutdown is requested)
    /// and every worker has exited.
    ///
    /// Faults and crashes in the fuzz target are reported to the handler and
    /// never returned from here. Only a failing handler or a supervisor-side
    /// OS error ends the run early.
    pub fn run(&mut self) -> Result<RunSummary, ExecutorError> {
        let mut pool = WorkerPool::new();
        let mut budget = Budget::new(self.limit, self.limit_scope, self.pool_size);
        let mut summary = RunSummary::default();
        let base_seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let poll_interval = self
            .iteration_timeout
            .map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));

        tracing::info!(
            pool_size = self.pool_size,
            limit = self.limit,
            suites = self.suites.len(),
            handler = self.handler.name(),
            "starting fuzz run"
        );

        for slot in 0..self.pool_size {
            if budget.exhausted(slot) {
                continue;
            }
            self.spawn_worker(&mut pool, slot, base_seed, &mut summary)?;
        }

        while !pool.is_empty() {
            let open = pool.open_fds();
            let fds: Vec<RawFd> = open.iter().map(|&(_, fd)| fd).collect();
            let ready = sys::poll_readable(&fds, poll_interval).map_err(ExecutorError::Supervisor)?;
            for (&(idx, _), is_ready) in open.iter().zip(ready) {
                if is_ready {
                    self.service(&mut pool.workers[idx], &mut budget, &mut summary, true)?;
                }
            }

            self.enforce_timeout(&mut pool)?;

            let exited = pool.reap_exited().map_err(ExecutorError::Supervisor)?;
            for (mut worker, status) in exited {
                self.drain(&mut worker, &mut budget, &mut summary)?;
                let slot = worker.slot;
                self.on_exit(worker, status, &mut summary)?;
                if !budget.exhausted(slot) && !self.shutdown.is_requested() {
                    self.spawn_worker(&mut pool, slot, base_seed, &mut summary)?;
                }
            }
        }

        tracing::info!(
            iterations = summary.iterations,
            faults = summary.faults,
            crashes = summary.crashes,
            workers = summary.workers_spawned,
            "fuzz run finished"
        );
        Ok(summary)
    }

    fn spawn_worker(
        &self,
        pool: &mut WorkerPool<I>,
        slot: usize,
        base_seed: u64,
        summary: &mut RunSummary,
    ) -> Result<(), ExecutorError> {
        let (supervisor_end, worker_end) = ipc::channel().map_err(ExecutorError::Spawn)?;
        let seed = base_seed.wrapping_add(summary.workers_spawned.wrapping_mul(SEED_STRIDE));

        // SAFETY: the child only runs the worker loop over state it inherited
        // and leaves through `_exit`; it never returns into this frame.
        match unsafe { sys::fork() }.map_err(ExecutorError::Spawn)? {
            Fork::Child => {
                drop(supervisor_end);
                pool.release_in_child();
                worker::run(&self.suites, worker_end, seed)
            }
            Fork::Parent(pid) => {
                drop(worker_end);
                summary.workers_spawned += 1;
                tracing::debug!(pid, slot, "spawned worker");
                pool.workers.push(Worker::new(pid, slot, supervisor_end));
                Ok(())
            }
        }
    }

    /// Handles one message from `worker`. Claims are ignored while draining
    /// a worker that is already dead, and from a worker that has been sent
    /// SIGKILL but not yet reaped.
    fn service(
        &mut self,
        worker: &mut Worker<I>,
        budget: &mut Budget,
        summary: &mut RunSummary,
        accept_claims: bool,
    ) -> Result<(), ExecutorError> {
        let message = match worker.channel.recv::<I>() {
            Ok(Some(message)) => message,
            Ok(None) => {
                worker.open = false;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(pid = worker.pid, error = %e, "dropping unreadable worker channel");
                worker.open = false;
                return Ok(());
            }
        };

        match message {
            WorkerMessage::Claim => {
                if !accept_claims || worker.timed_out.is_some() {
                    return Ok(());
                }
                let reply = if self.shutdown.is_requested() {
                    SupervisorMessage::Stop
                } else {
                    match budget.claim(worker.slot) {
                        Some(sample_id) => {
                            worker.current = Some(InFlight::granted(sample_id));
                            SupervisorMessage::Grant { sample_id }
                        }
                        None => SupervisorMessage::Stop,
                    }
                };
                if let Err(e) = worker.channel.send(&reply) {
                    tracing::debug!(pid = worker.pid, error = %e, "worker hung up before reply");
                    worker.open = false;
                }
            }
            WorkerMessage::Running {
                sample_id,
                suite,
                generator,
                data,
            } => match worker.current.as_mut() {
                Some(flight) if flight.sample_id == sample_id => {
                    flight.suite = Some(suite as usize);
                    flight.generator = Some(generator);
                    flight.data = data;
                }
                _ => tracing::warn!(pid = worker.pid, sample_id, "running report for unknown sample"),
            },
            WorkerMessage::Finished { sample_id, fault } => {
                let flight = match worker.current.take() {
                    Some(flight) if flight.sample_id == sample_id => flight,
                    other => {
                        tracing::warn!(pid = worker.pid, sample_id, "finish report for unknown sample");
                        worker.current = other;
                        return Ok(());
                    }
                };
                summary.iterations += 1;
                if let Some(fault) = fault {
                    summary.faults += 1;
                    let report = self.report_for(worker.pid, &flight, ExecutionStatus::Fault(fault));
                    worker.last = Some(flight);
                    self.dispatch(report)?;
                } else {
                    worker.last = Some(flight);
                }
            }
        }
        Ok(())
    }

    /// Processes whatever a dead worker managed to write before it died.
    fn drain(
        &mut self,
        worker: &mut Worker<I>,
        budget: &mut Budget,
        summary: &mut RunSummary,
    ) -> Result<(), ExecutorError> {
        while worker.open {
            let ready = sys::poll_readable(&[worker.channel.poll_fd()], Duration::ZERO)
                .map_err(ExecutorError::Supervisor)?;
            if !ready[0] {
                break;
            }
            self.service(worker, budget, summary, false)?;
        }
        Ok(())
    }

    fn enforce_timeout(&mut self, pool: &mut WorkerPool<I>) -> Result<(), ExecutorError> {
        let Some(timeout) = self.iteration_timeout else {
            return Ok(());
        };
        for worker in pool.workers.iter_mut() {
            if worker.timed_out.is_some() {
                continue;
            }
            let Some(flight) = &worker.current else {
                continue;
            };
            if flight.started.elapsed() > timeout {
                tracing::warn!(
                    pid = worker.pid,
                    sample_id = flight.sample_id,
                    ?timeout,
                    "iteration timed out, killing worker"
                );
                sys::kill(worker.pid, libc::SIGKILL).map_err(ExecutorError::Supervisor)?;
                worker.timed_out = Some(timeout);
            }
        }
        Ok(())
    }

    fn on_exit(
        &mut self,
        worker: Worker<I>,
        status: WaitStatus,
        summary: &mut RunSummary,
    ) -> Result<(), ExecutorError> {
        let pid = worker.pid;
        let exec_status = match worker.timed_out {
            Some(after) => ExecutionStatus::Timeout(after),
            None => ExecutionStatus::from(status),
        };

        match (worker.current, status) {
            (Some(flight), _) => {
                summary.iterations += 1;
                summary.crashes += 1;
                tracing::warn!(pid, sample_id = flight.sample_id, status = %exec_status, "worker died mid-iteration");
                let report = self.report_for(pid, &flight, exec_status);
                self.dispatch(report)?;
            }
            (None, _) if worker.timed_out.is_some() => {
                tracing::debug!(pid, "timed-out worker finished before the kill landed");
            }
            (None, WaitStatus::Signaled(signal)) => {
                summary.crashes += 1;
                tracing::warn!(pid, signal, "worker killed between iterations");
                let report = match &worker.last {
                    Some(last) => self.report_for(pid, last, exec_status),
                    None => FailureReport {
                        sample_id: 0,
                        suite: None,
                        generator: None,
                        data: None,
                        worker_pid: pid,
                        status: exec_status,
                    },
                };
                self.dispatch(report)?;
            }
            (None, WaitStatus::Exited(worker::EXIT_STOPPED)) => {
                tracing::debug!(pid, "worker stopped");
            }
            (None, WaitStatus::Exited(code)) => {
                tracing::warn!(pid, code, "worker exited unexpectedly between iterations");
            }
        }
        Ok(())
    }

    fn report_for(
        &self,
        pid: Pid,
        flight: &InFlight<I>,
        status: ExecutionStatus,
    ) -> FailureReport<I> {
        FailureReport {
            sample_id: flight.sample_id,
            suite: flight
                .suite
                .and_then(|idx| self.suites.get(idx))
                .map(|suite| suite.name().to_string()),
            generator: flight.generator.clone(),
            data: flight.data.clone(),
            worker_pid: pid,
            status,
        }
    }

    /// Hands a report to the handler on the supervisor's own path.
    fn dispatch(&mut self, report: FailureReport<I>) -> Result<(), ExecutorError> {
        tracing::info!(
            sample_id = report.sample_id,
            pid = report.worker_pid,
            status = %report.status,
            "failure detected"
        );
        let handler = self.handler.name();
        self.handler
            .handle(&report)
            .map_err(|source| ExecutorError::Handler { handler, source })
    }
}
