//! Backend handle for the JDK command-line debugger (`jdb`).
//!
//! One [`JdbProcess`] owns one external `jdb` process. Commands are queued and executed strictly
//! one at a time, because the backend is a single serial text stream and concurrent commands
//! would interleave their output. Each command's future resolves only once the reply for that
//! command has been parsed.
//!
//! If the backend exits (or is terminated) while commands are outstanding, run commands settle
//! to [`RunState::Terminated`] and all other commands fail with [`JdbError::Terminated`].

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

pub mod parse;
mod process;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use process::JdbProcess;

/// Arguments used to start the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    /// Fully-qualified main class.
    pub entry_point: String,
    pub working_dir: PathBuf,
    /// Platform-joined class path handed to `-classpath`.
    pub classpath: String,
}

/// Where the target program stopped, as reported in a jdb event header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopLocation {
    pub thread: String,
    /// `pkg.Class.method`
    pub method: String,
    pub line: u32,
}

/// Backend status after a control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// The command was consumed without the program stopping or exiting.
    Running,
    BreakpointHit {
        location: Option<StopLocation>,
    },
    StepCompleted {
        location: Option<StopLocation>,
    },
    CaughtException {
        exception: String,
        location: Option<StopLocation>,
    },
    UncaughtException {
        exception: String,
        location: Option<StopLocation>,
    },
    Terminated,
}

impl RunState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, RunState::Terminated)
    }
}

/// Result of a `stop at` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointStatus {
    /// The class is loaded and the breakpoint is active.
    Set,
    /// The class is not loaded yet; jdb installs the breakpoint on class load.
    Deferred,
}

/// One entry of the `where` output. Index 0 is the innermost frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub index: usize,
    /// Declaring class, e.g. `com.example.Foo`.
    pub unit: String,
    pub member: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Error)]
pub enum JdbError {
    #[error("failed to start backend: {0}")]
    Spawn(#[source] io::Error),

    #[error("backend did not become ready before the launch timeout")]
    LaunchTimeout,

    #[error("backend exited before it became ready")]
    ExitedDuringLaunch,

    #[error("backend is not launched")]
    NotLaunched,

    #[error("backend is already launched")]
    AlreadyLaunched,

    #[error("backend has terminated")]
    Terminated,

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("backend command timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, JdbError>;

/// Asynchronous command interface of a debugger backend.
///
/// Implementations must serialize commands: at most one command is in flight at any time, and
/// callers queued behind it are served in arrival order.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn launch(&self, args: &LaunchArgs) -> Result<()>;

    async fn stop_at(&self, unit: &str, line: u32) -> Result<BreakpointStatus>;

    /// Remove the breakpoint at `unit:line`. Removing one that is not set succeeds.
    async fn clear_at(&self, unit: &str, line: u32) -> Result<()>;

    /// Resume the program. The first call after launch starts the VM.
    async fn cont(&self) -> Result<RunState>;

    async fn step_over(&self) -> Result<RunState>;

    async fn step_into(&self) -> Result<RunState>;

    async fn step_out(&self) -> Result<RunState>;

    async fn where_(&self) -> Result<Vec<StackFrame>>;

    /// Kill the backend and release its resources. In-flight commands settle.
    async fn terminate(&self);

    fn is_terminated(&self) -> bool;
}
