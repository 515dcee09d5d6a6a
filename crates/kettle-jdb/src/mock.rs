//! Scripted in-memory [`Backend`] for tests.
//!
//! Enabled for this crate's own tests and, through the `test-support` feature, for downstream
//! integration tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{Backend, BreakpointStatus, JdbError, LaunchArgs, Result, RunState, StackFrame};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Launch(LaunchArgs),
    StopAt { unit: String, line: u32 },
    ClearAt { unit: String, line: u32 },
    Continue,
    StepOver,
    StepInto,
    StepOut,
    Where,
    Terminate,
}

impl BackendCall {
    pub fn is_run_command(&self) -> bool {
        matches!(
            self,
            BackendCall::Continue | BackendCall::StepOver | BackendCall::StepInto | BackendCall::StepOut
        )
    }
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call: BackendCall,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
struct Script {
    run_states: VecDeque<RunState>,
    frames: Vec<StackFrame>,
    launch_failure: Option<String>,
    rejected_units: HashSet<String>,
    deferred_units: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    script: Mutex<Script>,
    records: Mutex<Vec<CallRecord>>,
    queue: tokio::sync::Mutex<()>,
    changed: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    hold_run_commands: AtomicBool,
    latency: Mutex<Option<Duration>>,
    launched: AtomicBool,
    terminated: CancellationToken,
}

/// A backend that answers from a script and records every call it receives.
///
/// Calls are recorded even after termination so tests can assert that nothing was sent to a
/// dead backend.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next run command. Once the queue is empty every run command
    /// reports [`RunState::Terminated`].
    pub fn push_run_state(&self, state: RunState) -> &Self {
        self.inner.script.lock().run_states.push_back(state);
        self
    }

    pub fn set_frames(&self, frames: Vec<StackFrame>) -> &Self {
        self.inner.script.lock().frames = frames;
        self
    }

    pub fn fail_launch(&self, message: impl Into<String>) -> &Self {
        self.inner.script.lock().launch_failure = Some(message.into());
        self
    }

    /// `stop_at` for this unit fails with a protocol error.
    pub fn reject_unit(&self, unit: impl Into<String>) -> &Self {
        self.inner.script.lock().rejected_units.insert(unit.into());
        self
    }

    /// `stop_at` for this unit reports [`BreakpointStatus::Deferred`].
    pub fn defer_unit(&self, unit: impl Into<String>) -> &Self {
        self.inner.script.lock().deferred_units.insert(unit.into());
        self
    }

    /// Run commands block until [`Backend::terminate`] and then report termination.
    pub fn hold_run_commands(&self) -> &Self {
        self.inner.hold_run_commands.store(true, Ordering::SeqCst);
        self
    }

    /// Every command takes at least this long.
    pub fn with_latency(&self, latency: Duration) -> &Self {
        *self.inner.latency.lock() = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.records.lock().iter().map(|r| r.call.clone()).collect()
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.inner.records.lock().clone()
    }

    /// Highest number of commands that were ever executing at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` calls have started.
    pub async fn wait_for_call_count(&self, count: usize) {
        loop {
            let notified = self.inner.changed.notified();
            if self.started_calls() >= count {
                return;
            }
            notified.await;
        }
    }

    fn started_calls(&self) -> usize {
        self.inner.records.lock().len() + self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for the command queue, then tracks the call until the returned guard drops.
    async fn begin(&self, call: BackendCall) -> InFlight<'_> {
        let queue = self.inner.queue.lock().await;
        let started = Instant::now();
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.inner.changed.notify_waiters();

        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        InFlight {
            inner: self.inner.as_ref(),
            call: Some(call),
            started,
            _queue: queue,
        }
    }

    async fn run(&self, call: BackendCall) -> Result<RunState> {
        let _call = self.begin(call).await;
        if self.inner.hold_run_commands.load(Ordering::SeqCst) {
            self.inner.terminated.cancelled().await;
        }
        if self.inner.terminated.is_cancelled() {
            return Ok(RunState::Terminated);
        }
        let state = self
            .inner
            .script
            .lock()
            .run_states
            .pop_front()
            .unwrap_or(RunState::Terminated);
        if state.is_terminated() {
            self.inner.terminated.cancel();
        }
        Ok(state)
    }
}

struct InFlight<'a> {
    inner: &'a Inner,
    call: Option<BackendCall>,
    started: Instant,
    _queue: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(call) = self.call.take() {
            self.inner.records.lock().push(CallRecord {
                call,
                started: self.started,
                finished: Instant::now(),
            });
        }
        self.inner.changed.notify_waiters();
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn launch(&self, args: &LaunchArgs) -> Result<()> {
        let _call = self.begin(BackendCall::Launch(args.clone())).await;
        if self.inner.terminated.is_cancelled() {
            return Err(JdbError::Terminated);
        }
        if self.inner.launched.swap(true, Ordering::SeqCst) {
            return Err(JdbError::AlreadyLaunched);
        }
        let failure = self.inner.script.lock().launch_failure.clone();
        match failure {
            Some(message) => {
                self.inner.terminated.cancel();
                Err(JdbError::Spawn(std::io::Error::other(message)))
            }
            None => Ok(()),
        }
    }

    async fn stop_at(&self, unit: &str, line: u32) -> Result<BreakpointStatus> {
        let _call = self
            .begin(BackendCall::StopAt {
                unit: unit.to_string(),
                line,
            })
            .await;
        if self.inner.terminated.is_cancelled() {
            return Err(JdbError::Terminated);
        }
        if !self.inner.launched.load(Ordering::SeqCst) {
            return Err(JdbError::NotLaunched);
        }
        let script = self.inner.script.lock();
        if script.rejected_units.contains(unit) {
            return Err(JdbError::Protocol(format!(
                "Unable to set breakpoint {unit}:{line} : No code at line {line} in {unit}"
            )));
        }
        if script.deferred_units.contains(unit) {
            Ok(BreakpointStatus::Deferred)
        } else {
            Ok(BreakpointStatus::Set)
        }
    }

    async fn clear_at(&self, unit: &str, line: u32) -> Result<()> {
        let _call = self
            .begin(BackendCall::ClearAt {
                unit: unit.to_string(),
                line,
            })
            .await;
        if self.inner.terminated.is_cancelled() {
            return Err(JdbError::Terminated);
        }
        if !self.inner.launched.load(Ordering::SeqCst) {
            return Err(JdbError::NotLaunched);
        }
        Ok(())
    }

    async fn cont(&self) -> Result<RunState> {
        self.run(BackendCall::Continue).await
    }

    async fn step_over(&self) -> Result<RunState> {
        self.run(BackendCall::StepOver).await
    }

    async fn step_into(&self) -> Result<RunState> {
        self.run(BackendCall::StepInto).await
    }

    async fn step_out(&self) -> Result<RunState> {
        self.run(BackendCall::StepOut).await
    }

    async fn where_(&self) -> Result<Vec<StackFrame>> {
        let _call = self.begin(BackendCall::Where).await;
        if self.inner.terminated.is_cancelled() {
            return Err(JdbError::Terminated);
        }
        Ok(self.inner.script.lock().frames.clone())
    }

    async fn terminate(&self) {
        // Recorded without queueing: termination must not wait behind a held command.
        self.inner.terminated.cancel();
        let now = Instant::now();
        self.inner.records.lock().push(CallRecord {
            call: BackendCall::Terminate,
            started: now,
            finished: now,
        });
        self.inner.changed.notify_waiters();
    }

    fn is_terminated(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }
}
