use std::path::Path;
use std::time::Duration;

use kettle_config::LintConfig;
use kettle_lint::lsp;
use lsp_server::{Connection, Message, Notification, Request, RequestId, Response};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::harness::{FakeAnalysisServer, WAIT};

/// The editor side of an in-memory LSP connection.
struct Editor {
    connection: Connection,
    next_id: i32,
    server: JoinHandle<kettle_lint::Result<bool>>,
}

impl Editor {
    fn start(config: LintConfig) -> Self {
        let (server, connection) = Connection::memory();
        let server = tokio::spawn(lsp::run(server, config));
        Self {
            connection,
            next_id: 1,
            server,
        }
    }

    async fn request(&mut self, method: &str, params: Value) -> Response {
        let id = RequestId::from(self.next_id);
        self.next_id += 1;
        self.connection
            .sender
            .send(Message::Request(Request {
                id: id.clone(),
                method: method.to_string(),
                params,
            }))
            .unwrap();
        loop {
            match self.next_message().await {
                Message::Response(response) if response.id == id => return response,
                _ => {}
            }
        }
    }

    fn notify(&self, method: &str, params: Value) {
        self.connection
            .sender
            .send(Message::Notification(Notification {
                method: method.to_string(),
                params,
            }))
            .unwrap();
    }

    async fn next_message(&self) -> Message {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(message) = self.connection.receiver.try_recv() {
                    return message;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for the language server")
    }

    async fn next_diagnostics(&self) -> Value {
        loop {
            if let Message::Notification(notification) = self.next_message().await {
                if notification.method == "textDocument/publishDiagnostics" {
                    return notification.params;
                }
            }
        }
    }

    async fn initialize(&mut self, root: &Path) -> Response {
        let response = self
            .request(
                "initialize",
                json!({
                    "processId": null,
                    "rootUri": file_uri(root),
                    "capabilities": {},
                }),
            )
            .await;
        self.notify("initialized", json!({}));
        response
    }

    /// Shut down cleanly and wait for the server loop to end.
    async fn finish(mut self) -> bool {
        let response = self.request("shutdown", Value::Null).await;
        assert!(response.error.is_none());
        self.notify("exit", Value::Null);
        tokio::time::timeout(WAIT, self.server)
            .await
            .expect("server loop did not end after exit")
            .unwrap()
            .unwrap()
    }
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn config_for(fake: &FakeAnalysisServer) -> LintConfig {
    LintConfig {
        port: fake.port(),
        debounce_ms: 10,
        ..LintConfig::default()
    }
}

fn open(editor: &Editor, uri: &str, text: &str) {
    editor.notify(
        "textDocument/didOpen",
        json!({
            "textDocument": { "uri": uri, "languageId": "java", "version": 1, "text": text },
        }),
    );
}

#[tokio::test]
async fn initialize_advertises_full_sync() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeAnalysisServer::start().await;
    let mut editor = Editor::start(config_for(&fake));

    let response = editor.initialize(root.path()).await;
    let result = response.result.unwrap();
    assert_eq!(result["capabilities"]["textDocumentSync"], 1);
    assert_eq!(result["serverInfo"]["name"], "kettle-lint");

    assert!(editor.finish().await);
    // Nothing was configured and no server process was started, so nothing was sent.
    assert!(fake.received().is_empty());
}

#[tokio::test]
async fn requests_before_initialize_are_refused() {
    let fake = FakeAnalysisServer::start().await;
    let mut editor = Editor::start(config_for(&fake));

    let response = editor.request("shutdown", Value::Null).await;
    assert_eq!(response.error.unwrap().code, -32002);
}

#[tokio::test]
async fn opened_and_changed_documents_publish_diagnostics() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeAnalysisServer::start().await;
    let mut editor = Editor::start(config_for(&fake));
    editor.initialize(root.path()).await;

    let uri = file_uri(&root.path().join("Foo.java"));
    open(&editor, &uri, "class Foo {\n  bad\n}");
    let published = editor.next_diagnostics().await;
    assert_eq!(published["uri"], uri.as_str());
    let diagnostics = published["diagnostics"].as_array().unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0]["range"]["start"]["line"], 1);
    assert_eq!(diagnostics[0]["range"]["start"]["character"], 2);
    assert_eq!(diagnostics[0]["source"], "java");

    editor.notify(
        "textDocument/didChange",
        json!({
            "textDocument": { "uri": uri, "version": 2 },
            "contentChanges": [{ "text": "class Foo {}" }],
        }),
    );
    let published = editor.next_diagnostics().await;
    assert_eq!(published["diagnostics"], json!([]));
    assert_eq!(
        fake.lint_requests().last().map(String::as_str),
        Some("LINT\tFoo.java\nclass Foo {}\nEND\n")
    );

    editor.notify(
        "textDocument/didClose",
        json!({ "textDocument": { "uri": uri } }),
    );
    let cleared = editor.next_diagnostics().await;
    assert_eq!(cleared["diagnostics"], json!([]));

    assert!(editor.finish().await);
}

#[tokio::test]
async fn configuration_change_pushes_settings_then_revalidates_open_documents() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeAnalysisServer::start().await;
    let mut editor = Editor::start(config_for(&fake));
    editor.initialize(root.path()).await;

    let uri = file_uri(&root.path().join("Foo.java"));
    open(&editor, &uri, "bad");
    editor.next_diagnostics().await;
    assert_eq!(fake.lint_requests().len(), 1);

    editor.notify(
        "workspace/didChangeConfiguration",
        json!({
            "settings": { "java": { "classPath": ["lib/a.jar"], "jdk": "/opt/jdk" } },
        }),
    );
    editor.next_diagnostics().await;

    // LINT, both settings, then the revalidation.
    fake.wait_for_commands(4).await;
    let received = fake.received();
    let classpath = format!("SET\tCLASSPATH\t{}\n", root.path().join("lib/a.jar").display());
    assert!(received.contains(&classpath), "{received:?}");
    assert!(received.contains(&"SET\tJDK\t/opt/jdk\n".to_string()), "{received:?}");
    assert_eq!(fake.lint_requests().len(), 2);

    assert!(editor.finish().await);
}

#[tokio::test]
async fn workspace_config_file_is_read_at_startup_and_on_change() {
    let root = tempfile::tempdir().unwrap();
    let config_file = root.path().join(".javaconfig");
    std::fs::write(&config_file, r#"{ "classPath": ["out"] }"#).unwrap();

    let fake = FakeAnalysisServer::start().await;
    let mut editor = Editor::start(config_for(&fake));
    editor.initialize(root.path()).await;
    fake.wait_for_commands(1).await;
    assert_eq!(
        fake.received(),
        vec![format!("SET\tCLASSPATH\t{}\n", root.path().join("out").display())]
    );

    std::fs::write(&config_file, r#"{ "classPath": ["/abs/lib.jar"], "jdk": "/opt/jdk" }"#)
        .unwrap();
    editor.notify(
        "workspace/didChangeWatchedFiles",
        json!({ "changes": [{ "uri": file_uri(&config_file), "type": 2 }] }),
    );
    fake.wait_for_commands(3).await;
    let mut pushed = fake.received().split_off(1);
    pushed.sort();
    assert_eq!(
        pushed,
        vec![
            "SET\tCLASSPATH\t/abs/lib.jar\n".to_string(),
            "SET\tJDK\t/opt/jdk\n".to_string(),
        ]
    );

    assert!(editor.finish().await);
}

#[tokio::test]
async fn exit_without_shutdown_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeAnalysisServer::start().await;
    let mut editor = Editor::start(config_for(&fake));
    editor.initialize(root.path()).await;

    editor.notify("exit", Value::Null);
    let clean = tokio::time::timeout(WAIT, editor.server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!clean);
}

#[cfg(unix)]
#[tokio::test]
async fn owned_analysis_server_is_started_on_initialize_and_killed_on_exit() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let java = dir.path().join("java");
    std::fs::write(&java, "#!/bin/sh\necho 'RUNNING'\nsleep 30\n").unwrap();
    std::fs::set_permissions(&java, std::fs::Permissions::from_mode(0o755)).unwrap();

    let fake = FakeAnalysisServer::start().await;
    let mut editor = Editor::start(LintConfig {
        java: java.display().to_string(),
        server_jar: Some(dir.path().join("analysis.jar")),
        ..config_for(&fake)
    });
    let response = editor.initialize(dir.path()).await;
    assert!(response.error.is_none());

    assert!(editor.finish().await);
    fake.wait_for_commands(1).await;
    assert_eq!(fake.received(), vec!["KILL".to_string()]);
}
