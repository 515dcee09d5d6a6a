//! Execution-control state machine for one debug session.
//!
//! Run state is only ever learned as the result of the control command that was just issued;
//! the backend is never polled.

use std::fmt;
use std::sync::Arc;

use kettle_jdb::{Backend, JdbError, LaunchArgs, RunState, StackFrame, StopLocation};
use parking_lot::Mutex;
use thiserror::Error;

use crate::breakpoints::BreakpointRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    NotLaunched,
    Launching,
    Running,
    Stopped,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Continue,
    StepOver,
    StepInto,
    StepOut,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("program is not launched")]
    NotLaunched,

    #[error("program is already launched")]
    AlreadyLaunched,

    #[error("program has terminated")]
    Terminated,

    #[error(transparent)]
    Backend(#[from] JdbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    Spawn,
    ApplyBreakpoints,
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchStage::Spawn => f.write_str("backend start"),
            LaunchStage::ApplyBreakpoints => f.write_str("breakpoint replay"),
        }
    }
}

#[derive(Debug, Error)]
#[error("launch failed during {stage}: {source}")]
pub struct LaunchFailure {
    pub stage: LaunchStage,
    #[source]
    pub source: ControlError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    Exception { class: String, caught: bool },
}

impl StopReason {
    /// The DAP `stopped` event reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Exception { .. } => "exception",
        }
    }
}

/// What the frontend should be told after a control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stopped {
        reason: StopReason,
        location: Option<StopLocation>,
    },
    Terminated,
    /// The command finished without a stop or exit. No event is due.
    Running,
}

pub struct ExecutionController {
    backend: Arc<dyn Backend>,
    registry: Arc<BreakpointRegistry>,
    state: Mutex<ControlState>,
    /// Held for the whole of a control command, so the state check and the backend command it
    /// guards are one step.
    commands: tokio::sync::Mutex<()>,
}

impl ExecutionController {
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<BreakpointRegistry>) -> Self {
        Self {
            backend,
            registry,
            state: Mutex::new(ControlState::NotLaunched),
            commands: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ControlState {
        *self.state.lock()
    }

    fn set_state(&self, next: ControlState) {
        let mut state = self.state.lock();
        // Terminated is final.
        if *state != ControlState::Terminated {
            tracing::debug!(target: "kettle.dap", from = ?*state, to = ?next, "control state");
            *state = next;
        }
    }

    /// Start the backend and replay buffered breakpoints.
    ///
    /// The first resume is deliberately not part of this: callers acknowledge the launch once
    /// this returns and then issue [`ControlCommand::Continue`] themselves.
    pub async fn launch(&self, args: &LaunchArgs) -> Result<(), LaunchFailure> {
        let _serial = self.commands.lock().await;
        {
            let mut state = self.state.lock();
            match *state {
                ControlState::NotLaunched => *state = ControlState::Launching,
                ControlState::Terminated => {
                    return Err(LaunchFailure {
                        stage: LaunchStage::Spawn,
                        source: ControlError::Terminated,
                    })
                }
                _ => {
                    return Err(LaunchFailure {
                        stage: LaunchStage::Spawn,
                        source: ControlError::AlreadyLaunched,
                    })
                }
            }
        }

        let fail = |stage: LaunchStage, source: ControlError| {
            tracing::error!(target: "kettle.dap", %stage, error = %source, "launch failed");
            LaunchFailure { stage, source }
        };

        self.backend
            .launch(args)
            .await
            .map_err(|err| fail(LaunchStage::Spawn, err.into()))?;

        let replayed = self
            .registry
            .apply_all()
            .await
            .map_err(|err| fail(LaunchStage::ApplyBreakpoints, err.into()))?;

        tracing::info!(
            target: "kettle.dap",
            entry_point = %args.entry_point,
            replayed,
            "program launched"
        );
        self.set_state(ControlState::Running);
        Ok(())
    }

    /// Issue one control command and interpret the run state it produced.
    pub async fn execute(&self, command: ControlCommand) -> Result<Outcome, ControlError> {
        let _serial = self.commands.lock().await;
        self.ensure_live()?;

        tracing::debug!(target: "kettle.dap", ?command, "control command");
        let state = match command {
            ControlCommand::Continue => self.backend.cont().await,
            ControlCommand::StepOver => self.backend.step_over().await,
            ControlCommand::StepInto => self.backend.step_into().await,
            ControlCommand::StepOut => self.backend.step_out().await,
        };
        let state = match state {
            Ok(state) => state,
            Err(JdbError::Terminated) => RunState::Terminated,
            Err(err) => {
                tracing::warn!(target: "kettle.dap", ?command, error = %err, "control command failed");
                return Err(err.into());
            }
        };

        let outcome = self.interpret(command, state);
        match &outcome {
            Outcome::Stopped { .. } => self.set_state(ControlState::Stopped),
            Outcome::Terminated => self.set_state(ControlState::Terminated),
            Outcome::Running => self.set_state(ControlState::Running),
        }
        Ok(outcome)
    }

    fn interpret(&self, command: ControlCommand, state: RunState) -> Outcome {
        match state {
            RunState::BreakpointHit { location } => Outcome::Stopped {
                reason: StopReason::Breakpoint,
                location,
            },
            RunState::StepCompleted { location } => Outcome::Stopped {
                reason: StopReason::Step,
                location,
            },
            RunState::CaughtException {
                exception,
                location,
            } => Outcome::Stopped {
                reason: StopReason::Exception {
                    class: exception,
                    caught: true,
                },
                location,
            },
            RunState::UncaughtException {
                exception,
                location,
            } => Outcome::Stopped {
                reason: StopReason::Exception {
                    class: exception,
                    caught: false,
                },
                location,
            },
            RunState::Terminated => Outcome::Terminated,
            RunState::Running => {
                tracing::warn!(
                    target: "kettle.dap",
                    ?command,
                    "control command finished without a stop or exit"
                );
                Outcome::Running
            }
        }
    }

    /// Current call stack, innermost frame first.
    pub async fn stack_trace(&self) -> Result<Vec<StackFrame>, ControlError> {
        self.ensure_live()?;
        match self.backend.where_().await {
            Ok(frames) => Ok(frames),
            Err(JdbError::Terminated) => Err(ControlError::Terminated),
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_live(&self) -> Result<(), ControlError> {
        if self.backend.is_terminated() {
            self.set_state(ControlState::Terminated);
        }
        match self.state() {
            ControlState::Running | ControlState::Stopped => Ok(()),
            ControlState::Terminated => Err(ControlError::Terminated),
            ControlState::NotLaunched | ControlState::Launching => Err(ControlError::NotLaunched),
        }
    }

    /// Kill the backend. Does not wait for an in-flight control command; that command settles
    /// on its own once the backend is gone.
    pub async fn terminate(&self) {
        self.set_state(ControlState::Terminated);
        self.backend.terminate().await;
    }
}
