use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kettle_config::JdbConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::parse;
use crate::{Backend, BreakpointStatus, JdbError, LaunchArgs, Result, RunState, StackFrame};

enum Reply {
    Text(String),
    /// The backend went away before the reply was complete.
    Closed,
}

/// The stdin/stdout pair of a running backend. Guarded by an async mutex, which doubles as the
/// FIFO command queue.
struct Channel {
    stdin: ChildStdin,
    output: mpsc::UnboundedReceiver<String>,
    pending: String,
    /// jdb creates the VM suspended; the first resume must be `run`, later ones `cont`.
    vm_started: bool,
    /// Set when a command timed out before its reply completed; holds whether it was a run
    /// command, which decides what a complete late reply looks like.
    desynced: Option<bool>,
}

/// A `jdb` process driven over its standard streams.
pub struct JdbProcess {
    config: JdbConfig,
    channel: Mutex<Option<Channel>>,
    shutdown: CancellationToken,
    reaper: parking_lot::Mutex<Option<JoinHandle<()>>>,
    launched: AtomicBool,
}

impl JdbProcess {
    pub fn new(config: JdbConfig) -> Self {
        Self {
            config,
            channel: Mutex::new(None),
            shutdown: CancellationToken::new(),
            reaper: parking_lot::Mutex::new(None),
            launched: AtomicBool::new(false),
        }
    }

    /// A token that is cancelled when the backend goes away, either explicitly via
    /// [`Backend::terminate`] or because the process exited.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn spawn_child(&self, args: &LaunchArgs) -> Result<Child> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.extra_args)
            .arg("-classpath")
            .arg(&args.classpath)
            .arg(&args.entry_point)
            .current_dir(&args.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command.spawn().map_err(JdbError::Spawn)
    }

    async fn wait_until_ready(&self, channel: &mut Channel) -> Result<()> {
        let ready = async {
            loop {
                if parse::ends_with_prompt(&channel.pending) {
                    return Ok(());
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(JdbError::ExitedDuringLaunch),
                    chunk = channel.output.recv() => match chunk {
                        Some(chunk) => channel.pending.push_str(&chunk),
                        None => return Err(JdbError::ExitedDuringLaunch),
                    },
                }
            }
        };

        let result = tokio::time::timeout(self.config.launch_timeout(), ready)
            .await
            .unwrap_or(Err(JdbError::LaunchTimeout));
        tracing::debug!(
            target: "kettle.jdb",
            banner = %channel.pending.trim(),
            ok = result.is_ok(),
            "backend startup output"
        );
        channel.pending.clear();
        result
    }

    /// Read output until it completes a reply of the given kind.
    async fn collect(&self, channel: &mut Channel, runs: bool) -> Reply {
        loop {
            let complete = if runs {
                parse::run_reply_complete(&channel.pending)
            } else {
                parse::ends_with_prompt(&channel.pending)
            };
            if complete {
                return Reply::Text(std::mem::take(&mut channel.pending));
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Reply::Closed,
                chunk = channel.output.recv() => match chunk {
                    Some(chunk) => channel.pending.push_str(&chunk),
                    None => return Reply::Closed,
                },
            }
        }
    }

    async fn collect_bounded(&self, channel: &mut Channel, runs: bool) -> Result<Reply> {
        match self.config.command_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.collect(channel, runs))
                .await
                .map_err(|_| JdbError::Timeout),
            None => Ok(self.collect(channel, runs).await),
        }
    }

    /// Send one command and collect its complete reply.
    ///
    /// Holding the channel lock for the whole exchange is what serialises commands.
    async fn exchange(&self, request: Request<'_>) -> Result<Reply> {
        let mut guard = self.channel.lock().await;
        if self.shutdown.is_cancelled() {
            return Ok(Reply::Closed);
        }
        let Some(channel) = guard.as_mut() else {
            return Err(JdbError::NotLaunched);
        };

        // The reply to a timed-out command may still be on its way. It has to be read off the
        // stream before the next command, or it would be taken as that command's reply.
        if let Some(runs) = channel.desynced {
            match self.collect_bounded(channel, runs).await? {
                Reply::Closed => return Ok(Reply::Closed),
                Reply::Text(late) => {
                    tracing::debug!(
                        target: "kettle.jdb",
                        output = %late.trim_end(),
                        "discarding late reply to a timed-out command"
                    );
                    channel.desynced = None;
                }
            }
        }

        let text = request.text(channel.vm_started);
        if !channel.pending.trim().is_empty() {
            tracing::debug!(
                target: "kettle.jdb",
                output = %channel.pending.trim_end(),
                "discarding unsolicited backend output"
            );
        }
        channel.pending.clear();

        tracing::debug!(target: "kettle.jdb", command = %text, "sending backend command");
        channel.stdin.write_all(text.as_bytes()).await?;
        channel.stdin.write_all(b"\n").await?;
        channel.stdin.flush().await?;
        if matches!(request, Request::Resume) {
            channel.vm_started = true;
        }

        let runs = request.is_run();
        let reply = self.collect_bounded(channel, runs).await;
        if matches!(reply, Err(JdbError::Timeout)) {
            tracing::warn!(target: "kettle.jdb", command = %text, "backend command timed out");
            channel.desynced = Some(runs);
        }
        reply
    }

    async fn run_command(&self, request: Request<'_>) -> Result<RunState> {
        let reply = match self.exchange(request).await {
            Err(JdbError::Io(err)) if self.shutdown.is_cancelled() => {
                tracing::debug!(target: "kettle.jdb", error = %err, "write to exited backend");
                Reply::Closed
            }
            other => other?,
        };
        let state = match reply {
            Reply::Closed => RunState::Terminated,
            Reply::Text(text) => parse::parse_run_state(&text).map_err(|err| {
                tracing::warn!(target: "kettle.jdb", error = %err, "backend rejected run command");
                JdbError::Protocol(err)
            })?,
        };
        tracing::debug!(target: "kettle.jdb", ?state, "backend run state");
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    StopAt { unit: &'a str, line: u32 },
    ClearAt { unit: &'a str, line: u32 },
    Resume,
    StepOver,
    StepInto,
    StepOut,
    Where,
}

impl Request<'_> {
    fn text(self, vm_started: bool) -> String {
        match self {
            Request::StopAt { unit, line } => format!("stop at {unit}:{line}"),
            Request::ClearAt { unit, line } => format!("clear {unit}:{line}"),
            Request::Resume if vm_started => "cont".to_string(),
            Request::Resume => "run".to_string(),
            Request::StepOver => "next".to_string(),
            Request::StepInto => "step".to_string(),
            Request::StepOut => "step up".to_string(),
            Request::Where => "where".to_string(),
        }
    }

    /// Run commands finish with a run-state report rather than at the first prompt.
    fn is_run(self) -> bool {
        !matches!(
            self,
            Request::StopAt { .. } | Request::ClearAt { .. } | Request::Where
        )
    }
}

async fn read_loop(mut stdout: ChildStdout, tx: mpsc::UnboundedSender<String>) {
    let mut buf = vec![0u8; 8 * 1024];
    let mut carry = Vec::new();
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = parse::decode_utf8_chunk(&mut carry, &buf[..n]);
                if !text.is_empty() && tx.send(text).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(target: "kettle.jdb", error = %err, "failed to read backend output");
                break;
            }
        }
    }
}

/// Owns the child: reports an unexpected exit by cancelling `shutdown`, and kills the child
/// once `shutdown` is cancelled from elsewhere.
async fn reap(mut child: Child, shutdown: CancellationToken) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => tracing::info!(target: "kettle.jdb", %status, "backend exited"),
                Err(err) => tracing::warn!(target: "kettle.jdb", error = %err, "failed to wait for backend"),
            }
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            if let Err(err) = child.kill().await {
                tracing::warn!(target: "kettle.jdb", error = %err, "failed to kill backend");
            }
        }
    }
}

#[async_trait]
impl Backend for JdbProcess {
    async fn launch(&self, args: &LaunchArgs) -> Result<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(JdbError::AlreadyLaunched);
        }
        if self.shutdown.is_cancelled() {
            return Err(JdbError::Terminated);
        }

        tracing::info!(
            target: "kettle.jdb",
            command = %self.config.command,
            entry_point = %args.entry_point,
            working_dir = %args.working_dir.display(),
            "launching backend"
        );
        let mut child = self.spawn_child(args)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(JdbError::Spawn(std::io::Error::other(
                "backend stdio was not captured",
            )));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(stdout, tx));
        *self.reaper.lock() = Some(tokio::spawn(reap(child, self.shutdown.clone())));

        let mut channel = Channel {
            stdin,
            output: rx,
            pending: String::new(),
            vm_started: false,
            desynced: None,
        };
        if let Err(err) = self.wait_until_ready(&mut channel).await {
            tracing::error!(target: "kettle.jdb", error = %err, "backend failed to start");
            self.terminate().await;
            return Err(err);
        }

        *self.channel.lock().await = Some(channel);
        Ok(())
    }

    async fn stop_at(&self, unit: &str, line: u32) -> Result<BreakpointStatus> {
        match self.exchange(Request::StopAt { unit, line }).await? {
            Reply::Closed => Err(JdbError::Terminated),
            Reply::Text(text) => parse::parse_stop_at(&text).map_err(JdbError::Protocol),
        }
    }

    async fn clear_at(&self, unit: &str, line: u32) -> Result<()> {
        match self.exchange(Request::ClearAt { unit, line }).await? {
            Reply::Closed => Err(JdbError::Terminated),
            Reply::Text(text) => parse::parse_clear(&text).map_err(JdbError::Protocol),
        }
    }

    async fn cont(&self) -> Result<RunState> {
        self.run_command(Request::Resume).await
    }

    async fn step_over(&self) -> Result<RunState> {
        self.run_command(Request::StepOver).await
    }

    async fn step_into(&self) -> Result<RunState> {
        self.run_command(Request::StepInto).await
    }

    async fn step_out(&self) -> Result<RunState> {
        self.run_command(Request::StepOut).await
    }

    async fn where_(&self) -> Result<Vec<StackFrame>> {
        match self.exchange(Request::Where).await? {
            Reply::Closed => Err(JdbError::Terminated),
            Reply::Text(text) => parse::parse_where(&text).map_err(JdbError::Protocol),
        }
    }

    async fn terminate(&self) {
        self.shutdown.cancel();
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            if tokio::time::timeout(Duration::from_secs(5), reaper).await.is_err() {
                tracing::warn!(target: "kettle.jdb", "timed out waiting for backend to exit");
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
