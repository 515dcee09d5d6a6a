use std::path::{Path, PathBuf};

use kettle_lint::protocol::CLASSPATH_SEPARATOR;
use lsp_types::{DiagnosticSeverity, Position};
use pretty_assertions::assert_eq;

use crate::harness::FakeAnalysisServer;

#[tokio::test]
async fn lint_sends_the_document_and_translates_findings() {
    let server = FakeAnalysisServer::start().await;
    let diagnostics = server
        .client()
        .lint("Foo.java", "class Foo {\n  int bad = 1;\n}")
        .await
        .unwrap();

    assert_eq!(
        server.lint_requests(),
        vec!["LINT\tFoo.java\nclass Foo {\n  int bad = 1;\n}\nEND\n".to_string()]
    );
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].range.start, Position { line: 1, character: 6 });
    assert_eq!(diagnostics[0].severity, Some(DiagnosticSeverity::ERROR));
    assert_eq!(diagnostics[0].source.as_deref(), Some("java"));
}

#[tokio::test]
async fn warnings_keep_their_severity() {
    let server = FakeAnalysisServer::start_with(|_, _| {
        r#"[{"line": 1, "position": 0, "message": "raw type", "type": "WARNING"}]"#.to_string()
    })
    .await;
    let diagnostics = server.client().lint("A.java", "").await.unwrap();
    assert_eq!(diagnostics[0].severity, Some(DiagnosticSeverity::WARNING));
}

#[tokio::test]
async fn configure_sends_only_what_is_set() {
    let server = FakeAnalysisServer::start().await;
    let client = server.client();

    client.configure(&[], None).await.unwrap();
    client
        .configure(
            &[PathBuf::from("/w/lib/a.jar"), PathBuf::from("/w/classes")],
            Some(Path::new("/opt/jdk")),
        )
        .await
        .unwrap();
    server.wait_for_commands(2).await;

    let mut received = server.received();
    received.sort();
    assert_eq!(
        received,
        vec![
            format!("SET\tCLASSPATH\t/w/lib/a.jar{CLASSPATH_SEPARATOR}/w/classes\n"),
            "SET\tJDK\t/opt/jdk\n".to_string(),
        ]
    );
}

#[tokio::test]
async fn kill_is_sent_without_a_newline() {
    let server = FakeAnalysisServer::start().await;
    server.client().kill().await.unwrap();
    server.wait_for_commands(1).await;
    assert_eq!(server.received(), vec!["KILL".to_string()]);
}

#[tokio::test]
async fn unreachable_server_is_an_io_error() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = kettle_lint::LintClient::new([127, 0, 0, 1].into(), port);
    let err = client.lint("A.java", "").await.unwrap_err();
    assert!(matches!(err, kettle_lint::LintError::Io(_)), "{err}");
}
