//! Line breakpoints: buffering before launch, replay at launch, resolution against jdb.
//!
//! All configuration goes through one worker task per session so requests are handled strictly
//! in the order they were submitted, whether they end up buffered or applied immediately. The
//! submission itself is synchronous ([`BreakpointRegistry::record_or_apply`] enqueues before it
//! returns), which lets the request loop fix the order without awaiting anything.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use kettle_jdb::{Backend, BreakpointStatus, JdbError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::source;

pub const PENDING_MESSAGE: &str = "pending until launch";

/// One "set breakpoints for this source" request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub source: PathBuf,
    pub lines: Vec<u32>,
}

/// Result for a single requested line, shaped like a DAP `Breakpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakpointOutcome {
    pub verified: bool,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BreakpointOutcome {
    fn pending(line: u32) -> Self {
        Self {
            verified: false,
            line,
            message: Some(PENDING_MESSAGE.to_string()),
        }
    }

    fn failed(line: u32, message: impl Into<String>) -> Self {
        Self {
            verified: false,
            line,
            message: Some(message.into()),
        }
    }
}

/// What jdb currently holds for one source file.
#[derive(Debug, Default)]
struct Applied {
    unit: String,
    lines: BTreeMap<u32, BreakpointStatus>,
}

fn outcome_for(unit: &str, line: u32, status: BreakpointStatus) -> BreakpointOutcome {
    match status {
        BreakpointStatus::Set => BreakpointOutcome {
            verified: true,
            line,
            message: None,
        },
        BreakpointStatus::Deferred => BreakpointOutcome {
            verified: true,
            line,
            message: Some(format!("deferred until {unit} is loaded")),
        },
    }
}

/// Applies breakpoint requests to a running backend, tracking what each source currently has
/// set so a later request for the same source replaces the earlier one.
#[derive(Debug, Default)]
pub struct Resolver {
    applied: HashMap<PathBuf, Applied>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `request` against a running backend.
    ///
    /// The class name is derived from the file's current contents; an unreadable file falls
    /// back to its base name. Lines the source had before but no longer lists are cleared first,
    /// then new lines are applied one after another, each `stop at` completing before the next
    /// is sent. Lines that are already set are not sent again.
    pub async fn resolve(
        &mut self,
        backend: &dyn Backend,
        request: &BreakpointRequest,
    ) -> Vec<BreakpointOutcome> {
        let contents = match tokio::fs::read_to_string(&request.source).await {
            Ok(contents) => Some(contents),
            Err(err) => {
                tracing::debug!(
                    target: "kettle.dap",
                    source = %request.source.display(),
                    error = %err,
                    "could not read breakpoint source; using its base name"
                );
                None
            }
        };
        let unit = source::resolve_unit_name(&request.source, contents.as_deref());

        let mut previous = self.applied.remove(&request.source).unwrap_or_default();
        if previous.unit != unit {
            // The class moved (or this is the first request); nothing set so far still applies.
            clear_lines(backend, &previous.unit, previous.lines.keys().copied()).await;
            previous.lines.clear();
        } else {
            let dropped: Vec<u32> = previous
                .lines
                .keys()
                .copied()
                .filter(|line| !request.lines.contains(line))
                .collect();
            clear_lines(backend, &unit, dropped.iter().copied()).await;
            previous.lines.retain(|line, _| !dropped.contains(line));
        }

        let mut current = Applied {
            unit: unit.clone(),
            lines: BTreeMap::new(),
        };
        let mut outcomes = Vec::with_capacity(request.lines.len());
        for &line in &request.lines {
            let status = match previous.lines.get(&line) {
                Some(&status) => Ok(status),
                None => backend.stop_at(&unit, line).await,
            };
            let outcome = match status {
                Ok(status) => {
                    current.lines.insert(line, status);
                    outcome_for(&unit, line, status)
                }
                Err(err) => {
                    tracing::warn!(target: "kettle.dap", %unit, line, error = %err, "breakpoint rejected");
                    BreakpointOutcome::failed(line, err.to_string())
                }
            };
            outcomes.push(outcome);
        }

        if !current.lines.is_empty() {
            self.applied.insert(request.source.clone(), current);
        }
        outcomes
    }
}

async fn clear_lines(backend: &dyn Backend, unit: &str, lines: impl Iterator<Item = u32>) {
    for line in lines {
        if let Err(err) = backend.clear_at(unit, line).await {
            tracing::warn!(target: "kettle.dap", %unit, line, error = %err, "failed to clear breakpoint");
        }
    }
}

enum Job {
    Configure {
        request: BreakpointRequest,
        reply: oneshot::Sender<Vec<BreakpointOutcome>>,
    },
    ApplyAll {
        reply: oneshot::Sender<Result<usize, JdbError>>,
    },
}

/// Completion handle for a submitted configuration request.
pub struct Resolution {
    rx: oneshot::Receiver<Vec<BreakpointOutcome>>,
    lines: Vec<u32>,
}

impl Resolution {
    pub async fn wait(self) -> Vec<BreakpointOutcome> {
        match self.rx.await {
            Ok(outcomes) => outcomes,
            Err(_) => self
                .lines
                .into_iter()
                .map(|line| BreakpointOutcome::failed(line, "session closed"))
                .collect(),
        }
    }
}

/// Per-session breakpoint state.
pub struct BreakpointRegistry {
    jobs: mpsc::UnboundedSender<Job>,
    /// Client paths of configured sources keyed by file name, used to attach a `source` to
    /// stack frames reported by jdb (which only knows file names).
    sources: Arc<Mutex<HashMap<String, PathBuf>>>,
}

impl BreakpointRegistry {
    /// Must be called from within a tokio runtime; spawns the session's breakpoint worker.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(backend, rx));
        Self {
            jobs,
            sources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a configuration request. Before launch it is buffered and resolves to "pending"
    /// outcomes at once; afterwards it resolves once jdb has answered every line. Each request
    /// replaces the previous one for the same source.
    pub fn record_or_apply(&self, request: BreakpointRequest) -> Resolution {
        if let Some(name) = request.source.file_name() {
            self.sources
                .lock()
                .insert(name.to_string_lossy().into_owned(), request.source.clone());
        }

        let lines = request.lines.clone();
        let (reply, rx) = oneshot::channel();
        // A closed worker only happens once the session is torn down; `wait` reports it.
        let _ = self.jobs.send(Job::Configure { request, reply });
        Resolution { rx, lines }
    }

    /// Replay every buffered request in submission order and switch to applying new requests
    /// immediately. Returns how many requests were replayed.
    pub async fn apply_all(&self) -> Result<usize, JdbError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::ApplyAll { reply })
            .map_err(|_| JdbError::Terminated)?;
        rx.await.map_err(|_| JdbError::Terminated)?
    }

    pub fn source_path(&self, file_name: &str) -> Option<PathBuf> {
        self.sources.lock().get(file_name).cloned()
    }
}

async fn worker(backend: Arc<dyn Backend>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    let mut resolver = Resolver::new();
    let mut launched = false;
    let mut pending: Vec<BreakpointRequest> = Vec::new();

    while let Some(job) = jobs.recv().await {
        match job {
            Job::Configure { request, reply } => {
                let outcomes = if !launched {
                    tracing::debug!(
                        target: "kettle.dap",
                        source = %request.source.display(),
                        lines = ?request.lines,
                        "buffering breakpoints until launch"
                    );
                    let outcomes: Vec<_> =
                        request.lines.iter().copied().map(BreakpointOutcome::pending).collect();
                    pending.push(request);
                    outcomes
                } else if backend.is_terminated() {
                    request
                        .lines
                        .iter()
                        .map(|&line| BreakpointOutcome::failed(line, "session terminated"))
                        .collect()
                } else {
                    resolver.resolve(backend.as_ref(), &request).await
                };
                let _ = reply.send(outcomes);
            }
            Job::ApplyAll { reply } => {
                launched = true;
                let replayed = pending.len();
                for request in pending.drain(..) {
                    if backend.is_terminated() {
                        break;
                    }
                    let outcomes = resolver.resolve(backend.as_ref(), &request).await;
                    tracing::debug!(
                        target: "kettle.dap",
                        source = %request.source.display(),
                        ?outcomes,
                        "replayed buffered breakpoints"
                    );
                }
                let result = if backend.is_terminated() {
                    Err(JdbError::Terminated)
                } else {
                    Ok(replayed)
                };
                let _ = reply.send(result);
            }
        }
    }
}
