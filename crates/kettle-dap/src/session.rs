//! Per-session request handling.
//!
//! Requests that never touch jdb are answered inline. Control requests (launch, continue,
//! stepping, stack traces) go through one FIFO lane so they reach the controller in the order
//! they were received; breakpoint requests are ordered by the registry's own queue. Neither path
//! makes the request loop wait for jdb.

use std::path::PathBuf;
use std::sync::Arc;

use kettle_jdb::{Backend, LaunchArgs, StackFrame};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::breakpoints::{BreakpointRegistry, BreakpointRequest};
use crate::controller::{ControlCommand, ControlError, ExecutionController, Outcome, StopReason};
use crate::dap_tokio::{make_event, make_response, Event, Request, Response};

/// The one thread modelled per session.
pub const THREAD_ID: i64 = 1;
pub const THREAD_NAME: &str = "thread 1";

pub const LOCAL_SCOPE_REF: i64 = 1;
pub const ARGUMENTS_SCOPE_REF: i64 = 2;

pub const DISCONNECTED_MESSAGE: &str = "session disconnected";

#[cfg(windows)]
const CLASSPATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const CLASSPATH_SEPARATOR: &str = ":";

#[derive(Debug)]
pub enum Outgoing {
    Response(Response),
    Event(Event),
}

/// Sending half of the frontend stream. Sequence numbers are stamped by the writer task so they
/// follow the order messages are actually written.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Outgoing>,
    closed: CancellationToken,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    pub fn respond(&self, request: &Request, success: bool, body: Option<Value>, message: Option<String>) {
        let response = make_response(0, request, success, body, message);
        let _ = self.tx.send(Outgoing::Response(response));
    }

    pub fn ok(&self, request: &Request, body: Option<Value>) {
        self.respond(request, true, body, None);
    }

    pub fn fail(&self, request: &Request, message: impl Into<String>) {
        self.respond(request, false, None, Some(message.into()));
    }

    /// Events are dropped once the session is closing.
    pub fn event(&self, event: &str, body: Option<Value>) {
        if self.closed.is_cancelled() {
            tracing::debug!(target: "kettle.dap", event, "suppressing event after disconnect");
            return;
        }
        let _ = self.tx.send(Outgoing::Event(make_event(0, event, body)));
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

enum ControlJob {
    Launch(LaunchArgs),
    Command(ControlCommand),
    StackTrace { start: usize, levels: Option<usize> },
}

pub struct Session {
    controller: Arc<ExecutionController>,
    registry: Arc<BreakpointRegistry>,
    out: Outbound,
    lane: Option<mpsc::UnboundedSender<(Request, ControlJob)>>,
    tasks: JoinSet<()>,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>, out: Outbound) -> Self {
        let registry = Arc::new(BreakpointRegistry::new(backend.clone()));
        let controller = Arc::new(ExecutionController::new(backend, registry.clone()));

        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        tasks.spawn(control_lane(
            controller.clone(),
            registry.clone(),
            out.clone(),
            lane_rx,
        ));

        Self {
            controller,
            registry,
            out,
            lane: Some(lane_tx),
            tasks,
        }
    }

    /// Handle one request. Returns `false` once the session has ended.
    pub async fn handle(&mut self, request: Request) -> bool {
        // Reap finished breakpoint tasks so the set does not grow with the session.
        while self.tasks.try_join_next().is_some() {}

        let command = request.command.clone();
        match command.as_str() {
            "initialize" => {
                let body = json!({
                    "supportsConfigurationDoneRequest": true,
                    "supportsEvaluateForHovers": true,
                    "supportsSetVariable": false,
                    "supportsStepBack": false,
                    "supportsConditionalBreakpoints": false,
                    "supportsTerminateRequest": false,
                });
                self.out.ok(&request, Some(body));
                self.out.event("initialized", None);
            }
            "launch" => match launch_args(&request.arguments) {
                Ok(args) => self.enqueue(request, ControlJob::Launch(args)),
                Err(message) => self.out.fail(&request, message),
            },
            "setBreakpoints" => self.set_breakpoints(request),
            "configurationDone" => self.out.ok(&request, None),
            "threads" => self.out.ok(
                &request,
                Some(json!({ "threads": [{ "id": THREAD_ID, "name": THREAD_NAME }] })),
            ),
            "continue" => self.enqueue(request, ControlJob::Command(ControlCommand::Continue)),
            "next" => self.enqueue(request, ControlJob::Command(ControlCommand::StepOver)),
            "stepIn" => self.enqueue(request, ControlJob::Command(ControlCommand::StepInto)),
            "stepOut" => self.enqueue(request, ControlJob::Command(ControlCommand::StepOut)),
            "stackTrace" => {
                let start = request
                    .arguments
                    .get("startFrame")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                let levels = request
                    .arguments
                    .get("levels")
                    .and_then(Value::as_u64)
                    .filter(|&n| n > 0)
                    .map(|n| n as usize);
                self.enqueue(request, ControlJob::StackTrace { start, levels })
            }
            "scopes" => self.out.ok(
                &request,
                Some(json!({
                    "scopes": [
                        { "name": "Local", "variablesReference": LOCAL_SCOPE_REF, "expensive": false },
                        { "name": "Arguments", "variablesReference": ARGUMENTS_SCOPE_REF, "expensive": false },
                    ]
                })),
            ),
            "variables" => self.out.ok(&request, Some(json!({ "variables": [] }))),
            "evaluate" => {
                let expression = request
                    .arguments
                    .get("expression")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let context = request
                    .arguments
                    .get("context")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let result = format!("evaluate(context: '{context}', '{expression}')");
                self.out
                    .ok(&request, Some(json!({ "result": result, "variablesReference": 0 })));
            }
            "infoRequest" | "info" => self.out.ok(
                &request,
                Some(json!({ "currentFile": "Foo.bar", "currentLine": 42 })),
            ),
            "disconnect" => {
                self.disconnect(&request).await;
                return false;
            }
            other => {
                tracing::debug!(target: "kettle.dap", command = other, "unsupported request");
                self.out
                    .fail(&request, format!("unsupported request {other}"));
            }
        }
        true
    }

    fn enqueue(&mut self, request: Request, job: ControlJob) {
        match &self.lane {
            Some(lane) => {
                if let Err(mpsc::error::SendError((request, _))) = lane.send((request, job)) {
                    self.out.fail(&request, DISCONNECTED_MESSAGE);
                }
            }
            None => self.out.fail(&request, DISCONNECTED_MESSAGE),
        }
    }

    fn set_breakpoints(&mut self, request: Request) {
        let source = request.arguments.get("source");
        let path = source
            .and_then(|s| s.get("path"))
            .or_else(|| source.and_then(|s| s.get("name")))
            .and_then(Value::as_str);
        let Some(path) = path else {
            self.out.fail(&request, "setBreakpoints.source.path is required");
            return;
        };

        let lines: Vec<u32> = match request.arguments.get("breakpoints").and_then(Value::as_array) {
            Some(breakpoints) => breakpoints
                .iter()
                .filter_map(|bp| bp.get("line").and_then(line_number))
                .collect(),
            // Older clients send a bare `lines` array.
            None => request
                .arguments
                .get("lines")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(line_number)
                        .collect()
                })
                .unwrap_or_default(),
        };

        // Submission order is fixed here, before anything is awaited.
        let resolution = self.registry.record_or_apply(BreakpointRequest {
            source: PathBuf::from(path),
            lines,
        });
        let out = self.out.clone();
        let source = json!({ "path": path });
        self.tasks.spawn(async move {
            let outcomes = resolution.wait().await;
            let breakpoints: Vec<Value> = outcomes
                .into_iter()
                .map(|outcome| {
                    let mut value = json!(outcome);
                    value["source"] = source.clone();
                    value
                })
                .collect();
            out.ok(&request, Some(json!({ "breakpoints": breakpoints })));
        });
    }

    /// Stop emitting events, kill jdb, acknowledge, then let in-flight requests settle.
    async fn disconnect(&mut self, request: &Request) {
        tracing::info!(target: "kettle.dap", "disconnect requested");
        self.out.close();
        self.controller.terminate().await;
        self.out.ok(request, None);
        self.drain().await;
    }

    /// End the session without a disconnect request, e.g. when the frontend stream closes.
    pub async fn shutdown(&mut self) {
        self.out.close();
        self.controller.terminate().await;
        self.drain().await;
    }

    async fn drain(&mut self) {
        self.lane = None;
        while self.tasks.join_next().await.is_some() {}
    }
}

async fn control_lane(
    controller: Arc<ExecutionController>,
    registry: Arc<BreakpointRegistry>,
    out: Outbound,
    mut jobs: mpsc::UnboundedReceiver<(Request, ControlJob)>,
) {
    while let Some((request, job)) = jobs.recv().await {
        if out.is_closed() {
            out.fail(&request, DISCONNECTED_MESSAGE);
            continue;
        }
        match job {
            ControlJob::Launch(args) => launch(&controller, &out, &request, &args).await,
            ControlJob::Command(command) => {
                let result = controller.execute(command).await;
                if out.is_closed() {
                    out.fail(&request, DISCONNECTED_MESSAGE);
                    continue;
                }
                match result {
                    Ok(outcome) => {
                        let body = (command == ControlCommand::Continue)
                            .then(|| json!({ "allThreadsContinued": true }));
                        out.ok(&request, body);
                        emit_outcome(&out, outcome);
                    }
                    Err(err) => out.fail(&request, err.to_string()),
                }
            }
            ControlJob::StackTrace { start, levels } => {
                let result = controller.stack_trace().await;
                match result {
                    Ok(frames) => {
                        let total = frames.len();
                        let frames: Vec<Value> = frames
                            .iter()
                            .skip(start)
                            .take(levels.unwrap_or(usize::MAX))
                            .map(|frame| frame_json(&registry, frame))
                            .collect();
                        out.ok(
                            &request,
                            Some(json!({ "stackFrames": frames, "totalFrames": total })),
                        );
                    }
                    Err(ControlError::Terminated) if out.is_closed() => {
                        out.fail(&request, DISCONNECTED_MESSAGE)
                    }
                    Err(err) => out.fail(&request, err.to_string()),
                }
            }
        }
    }
}

/// Launch, acknowledge, then start the program. The launch response does not wait for the
/// program's first stop.
async fn launch(controller: &ExecutionController, out: &Outbound, request: &Request, args: &LaunchArgs) {
    if let Err(failure) = controller.launch(args).await {
        out.fail(request, failure.to_string());
        return;
    }
    if out.is_closed() {
        out.fail(request, DISCONNECTED_MESSAGE);
        return;
    }
    out.ok(request, None);

    match controller.execute(ControlCommand::Continue).await {
        Ok(outcome) => emit_outcome(out, outcome),
        Err(err) => {
            tracing::warn!(target: "kettle.dap", error = %err, "initial run failed");
        }
    }
}

fn emit_outcome(out: &Outbound, outcome: Outcome) {
    match outcome {
        Outcome::Stopped { reason, location } => {
            let mut body = json!({
                "reason": reason.as_str(),
                "threadId": THREAD_ID,
                "allThreadsStopped": true,
            });
            if let StopReason::Exception { class, caught } = &reason {
                let kind = if *caught { "Caught" } else { "Uncaught" };
                body["description"] = json!(format!("{kind} exception {class}"));
                body["text"] = json!(class);
            }
            if let Some(location) = location {
                tracing::debug!(
                    target: "kettle.dap",
                    method = %location.method,
                    line = location.line,
                    reason = reason.as_str(),
                    "program stopped"
                );
            }
            out.event("stopped", Some(body));
        }
        Outcome::Terminated => out.event("terminated", None),
        Outcome::Running => {}
    }
}

fn frame_json(registry: &BreakpointRegistry, frame: &StackFrame) -> Value {
    let name = if frame.unit.is_empty() {
        frame.member.clone()
    } else {
        format!("{}.{}", frame.unit, frame.member)
    };
    let mut value = json!({
        "id": frame.index,
        "name": name,
        "line": frame.line.unwrap_or(0),
        "column": 0,
    });
    if let Some(file) = &frame.file {
        let mut source = json!({ "name": file });
        if let Some(path) = registry.source_path(file) {
            source["path"] = json!(path.display().to_string());
        }
        value["source"] = source;
    }
    value
}

/// A DAP line number that fits jdb's line range; anything else is dropped.
fn line_number(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|line| u32::try_from(line).ok())
}

/// Read `launch` arguments: `mainClass`, `classesDir` (working directory) and an optional
/// `classPath` given as a list or a single string.
fn launch_args(arguments: &Value) -> Result<LaunchArgs, String> {
    let entry_point = arguments
        .get("mainClass")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "launch.mainClass is required".to_string())?;
    let working_dir = arguments
        .get("classesDir")
        .and_then(Value::as_str)
        .unwrap_or(".");
    let classpath = match arguments.get("classPath") {
        Some(Value::String(path)) if !path.is_empty() => path.clone(),
        Some(Value::Array(entries)) if !entries.is_empty() => entries
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(CLASSPATH_SEPARATOR),
        _ => ".".to_string(),
    };

    Ok(LaunchArgs {
        entry_point: entry_point.to_string(),
        working_dir: PathBuf::from(working_dir),
        classpath,
    })
}
