//! Language server loop: LSP over an [`lsp_server::Connection`], diagnostics from the analysis
//! server.
//!
//! Documents are synced in full. Every open or changed document is validated after the
//! configured quiet period, and a settings change (from the client or from a workspace
//! `.javaconfig` file) is pushed to the analysis server before all open documents are validated
//! again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use kettle_config::LintConfig;
use lsp_server::{Connection, ErrorCode, Message, Notification, Request, RequestId, Response};
use lsp_types::{
    DidChangeConfigurationParams, DidChangeTextDocumentParams, DidChangeWatchedFilesParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, FileChangeType, InitializeParams,
    InitializeResult, PublishDiagnosticsParams, ServerCapabilities, ServerInfo,
    TextDocumentSyncCapability, TextDocumentSyncKind, Uri,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::client::LintClient;
use crate::debounce::Debouncer;
use crate::protocol;
use crate::server::AnalysisServer;
use crate::{LintError, Result};

/// Workspace file holding the same settings as the client's `java` section.
pub const WORKSPACE_CONFIG_FILE: &str = ".javaconfig";

/// The `java` settings section, as sent by the client or stored in `.javaconfig`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavaSettings {
    #[serde(default)]
    pub class_path: Vec<PathBuf>,
    #[serde(default)]
    pub jdk: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsEnvelope {
    #[serde(default)]
    java: Option<JavaSettings>,
}

/// Serve one client until it sends `exit` or closes the connection.
///
/// Returns whether the client asked for `shutdown` before leaving.
pub async fn run(connection: Connection, config: LintConfig) -> Result<bool> {
    let Connection { sender, receiver } = connection;

    // The connection is blocking; hand its messages to the async loop from a plain thread.
    let (incoming_tx, mut incoming) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("kettle-lint-reader".to_string())
        .spawn(move || {
            for message in receiver {
                if incoming_tx.send(message).is_err() {
                    break;
                }
            }
        })?;

    let (publish_tx, mut published) = mpsc::unbounded_channel();
    let mut server = LanguageServer::new(config, sender, publish_tx);

    let clean = loop {
        tokio::select! {
            message = incoming.recv() => {
                let Some(message) = message else {
                    tracing::info!(target: "kettle.lint", "client connection closed");
                    break false;
                };
                if let Some(clean) = server.handle(message).await? {
                    break clean;
                }
            }
            Some(params) = published.recv() => server.publish(params)?,
        }
    };

    server.stop().await;
    Ok(clean)
}

struct LanguageServer {
    config: LintConfig,
    root: Option<PathBuf>,
    client: LintClient,
    analysis: Option<AnalysisServer>,
    debouncer: Debouncer,
    documents: HashMap<Uri, String>,
    sender: Sender<Message>,
    initialized: bool,
    shutdown_requested: bool,
}

impl LanguageServer {
    fn new(
        config: LintConfig,
        sender: Sender<Message>,
        publish: mpsc::UnboundedSender<PublishDiagnosticsParams>,
    ) -> Self {
        Self {
            client: LintClient::from_config(&config),
            debouncer: Debouncer::from_config(&config, publish),
            config,
            root: None,
            analysis: None,
            documents: HashMap::new(),
            sender,
            initialized: false,
            shutdown_requested: false,
        }
    }

    /// Returns `Some(clean)` once the loop should end.
    async fn handle(&mut self, message: Message) -> Result<Option<bool>> {
        match message {
            Message::Request(request) => self.request(request).await?,
            Message::Notification(notification) if notification.method == "exit" => {
                tracing::info!(target: "kettle.lint", "exit requested");
                return Ok(Some(self.shutdown_requested));
            }
            Message::Notification(notification) => self.notification(notification).await,
            Message::Response(response) => {
                tracing::debug!(target: "kettle.lint", id = ?response.id, "ignoring client response");
            }
        }
        Ok(None)
    }

    async fn request(&mut self, request: Request) -> Result<()> {
        let Request { id, method, params } = request;
        let response = match method.as_str() {
            "initialize" => match parse_params::<InitializeParams>(params) {
                Ok(params) => self.initialize(id, params).await,
                Err(message) => Response::new_err(id, ErrorCode::InvalidParams as i32, message),
            },
            _ if !self.initialized => Response::new_err(
                id,
                ErrorCode::ServerNotInitialized as i32,
                "server not initialized".to_string(),
            ),
            "shutdown" => {
                self.shutdown_requested = true;
                Response::new_ok(id, serde_json::Value::Null)
            }
            _ => Response::new_err(
                id,
                ErrorCode::MethodNotFound as i32,
                format!("unhandled method: {method}"),
            ),
        };
        self.send(Message::Response(response))
    }

    /// Start (or find) the analysis server and push the workspace settings to it.
    async fn initialize(&mut self, id: RequestId, params: InitializeParams) -> Response {
        self.root = workspace_root(&params);
        if let Some(settings) = self.root.as_deref().and_then(read_workspace_config) {
            self.merge_settings(settings);
        }

        if self.config.server_jar.is_some() {
            match AnalysisServer::spawn(&self.config).await {
                Ok(server) => self.analysis = Some(server),
                Err(err) => {
                    tracing::error!(target: "kettle.lint", error = %err, "analysis server failed to start");
                    return Response::new_err(
                        id,
                        ErrorCode::InternalError as i32,
                        err.to_string(),
                    );
                }
            }
        } else {
            tracing::info!(
                target: "kettle.lint",
                addr = %self.client.addr(),
                "no server jar configured; using a running analysis server"
            );
            self.push_settings().await;
        }

        self.initialized = true;
        let result = InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                ..ServerCapabilities::default()
            },
            server_info: Some(ServerInfo {
                name: "kettle-lint".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        };
        Response::new_ok(id, result)
    }

    async fn notification(&mut self, notification: Notification) {
        if !self.initialized {
            tracing::debug!(
                target: "kettle.lint",
                method = %notification.method,
                "dropping notification before initialize"
            );
            return;
        }
        let Notification { method, params } = notification;
        let handled = match method.as_str() {
            "textDocument/didOpen" => parse_params(params).map(|p| self.did_open(p)),
            "textDocument/didChange" => parse_params(params).map(|p| self.did_change(p)),
            "textDocument/didClose" => parse_params(params).map(|p| self.did_close(p)),
            "workspace/didChangeConfiguration" => match parse_params(params) {
                Ok(params) => {
                    self.did_change_configuration(params).await;
                    Ok(())
                }
                Err(err) => Err(err),
            },
            "workspace/didChangeWatchedFiles" => match parse_params(params) {
                Ok(params) => {
                    self.did_change_watched_files(params).await;
                    Ok(())
                }
                Err(err) => Err(err),
            },
            _ => Ok(()),
        };
        if let Err(err) = handled {
            tracing::warn!(target: "kettle.lint", %method, error = %err, "malformed notification");
        }
    }

    fn did_open(&mut self, params: DidOpenTextDocumentParams) {
        let document = params.text_document;
        self.documents.insert(document.uri.clone(), document.text.clone());
        self.debouncer.changed(document.uri, document.text);
    }

    fn did_change(&mut self, params: DidChangeTextDocumentParams) {
        // Full sync: the last change carries the whole document.
        let Some(change) = params.content_changes.into_iter().last() else {
            return;
        };
        let uri = params.text_document.uri;
        self.documents.insert(uri.clone(), change.text.clone());
        self.debouncer.changed(uri, change.text);
    }

    fn did_close(&mut self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        self.documents.remove(&uri);
        self.debouncer.forget(&uri);
        if let Err(err) = self.publish(PublishDiagnosticsParams {
            uri,
            diagnostics: Vec::new(),
            version: None,
        }) {
            tracing::debug!(target: "kettle.lint", error = %err, "could not clear diagnostics");
        }
    }

    async fn did_change_configuration(&mut self, params: DidChangeConfigurationParams) {
        let envelope: SettingsEnvelope = match serde_json::from_value(params.settings) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(target: "kettle.lint", error = %err, "unreadable settings");
                return;
            }
        };
        if let Some(settings) = envelope.java {
            self.apply_settings(settings).await;
        }
    }

    async fn did_change_watched_files(&mut self, params: DidChangeWatchedFilesParams) {
        let changed = params.changes.into_iter().find(|change| {
            change.typ != FileChangeType::DELETED
                && protocol::file_name_for_uri(change.uri.as_str()) == WORKSPACE_CONFIG_FILE
        });
        let Some(path) = changed.and_then(|change| protocol::path_for_uri(change.uri.as_str()))
        else {
            return;
        };
        match load_settings(&path) {
            Ok(settings) => self.apply_settings(settings).await,
            Err(err) => {
                tracing::warn!(
                    target: "kettle.lint",
                    path = %path.display(),
                    error = %err,
                    "failed to load workspace settings"
                );
            }
        }
    }

    async fn apply_settings(&mut self, settings: JavaSettings) {
        self.merge_settings(settings);
        self.push_settings().await;
        for (uri, text) in &self.documents {
            self.debouncer.changed(uri.clone(), text.clone());
        }
    }

    /// Class path entries are taken relative to the workspace root.
    fn merge_settings(&mut self, settings: JavaSettings) {
        self.config.classpath = settings
            .class_path
            .into_iter()
            .map(|entry| match &self.root {
                Some(root) if entry.is_relative() => root.join(entry),
                _ => entry,
            })
            .collect();
        if settings.jdk.is_some() {
            self.config.jdk = settings.jdk;
        }
    }

    async fn push_settings(&self) {
        if let Err(err) = self
            .client
            .configure(&self.config.classpath, self.config.jdk.as_deref())
            .await
        {
            tracing::warn!(target: "kettle.lint", error = %err, "failed to push lint settings");
        }
    }

    fn publish(&self, params: PublishDiagnosticsParams) -> Result<()> {
        self.send(Message::Notification(Notification::new(
            "textDocument/publishDiagnostics".to_string(),
            params,
        )))
    }

    fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message).map_err(|_| LintError::Disconnected)
    }

    /// Kill the analysis server if this session started one.
    async fn stop(self) {
        drop(self.debouncer);
        if let Some(analysis) = self.analysis {
            analysis.shutdown().await;
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> std::result::Result<T, String> {
    serde_json::from_value(params).map_err(|err| err.to_string())
}

#[allow(deprecated)]
fn workspace_root(params: &InitializeParams) -> Option<PathBuf> {
    let uri = params
        .workspace_folders
        .as_ref()
        .and_then(|folders| folders.first())
        .map(|folder| &folder.uri)
        .or(params.root_uri.as_ref());
    match uri {
        Some(uri) => protocol::path_for_uri(uri.as_str()),
        None => params.root_path.as_ref().map(PathBuf::from),
    }
}

fn read_workspace_config(root: &Path) -> Option<JavaSettings> {
    let path = root.join(WORKSPACE_CONFIG_FILE);
    if !path.is_file() {
        return None;
    }
    match load_settings(&path) {
        Ok(settings) => Some(settings),
        Err(err) => {
            tracing::warn!(
                target: "kettle.lint",
                path = %path.display(),
                error = %err,
                "failed to load workspace settings"
            );
            None
        }
    }
}

/// Read a `.javaconfig` file.
pub fn load_settings(path: &Path) -> Result<JavaSettings> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
