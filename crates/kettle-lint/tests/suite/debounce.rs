use std::time::Duration;

use kettle_lint::Debouncer;
use lsp_types::{PublishDiagnosticsParams, Uri};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use crate::harness::{FakeAnalysisServer, WAIT};

const DELAY: Duration = Duration::from_millis(50);

fn uri(text: &str) -> Uri {
    text.parse().unwrap()
}

async fn next_publish(rx: &mut mpsc::UnboundedReceiver<PublishDiagnosticsParams>) -> PublishDiagnosticsParams {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for diagnostics")
        .expect("publish channel closed")
}

#[tokio::test]
async fn burst_of_changes_validates_only_the_last_text() {
    let server = FakeAnalysisServer::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let debouncer = Debouncer::new(server.client(), DELAY, tx);
    let doc = uri("file:///w/src/Foo.java");

    debouncer.changed(doc.clone(), "bad".to_string());
    debouncer.changed(doc.clone(), "ok\nbad".to_string());
    debouncer.changed(doc.clone(), "ok\nok\n  bad".to_string());

    let published = next_publish(&mut rx).await;
    assert_eq!(published.uri, doc);
    assert_eq!(published.diagnostics.len(), 1);
    assert_eq!(published.diagnostics[0].range.start.line, 2);
    assert_eq!(published.diagnostics[0].range.start.character, 2);

    tokio::time::sleep(DELAY * 4).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(
        server.lint_requests(),
        vec!["LINT\tFoo.java\nok\nok\n  bad\nEND\n".to_string()]
    );
    assert_eq!(debouncer.pending(), 0);
}

#[tokio::test]
async fn documents_are_debounced_independently() {
    let server = FakeAnalysisServer::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let debouncer = Debouncer::new(server.client(), DELAY, tx);
    let a = uri("file:///w/A.java");
    let b = uri("file:///w/B.java");

    debouncer.changed(a.clone(), "bad".to_string());
    debouncer.changed(b.clone(), "fine".to_string());

    let mut published = vec![next_publish(&mut rx).await, next_publish(&mut rx).await];
    published.sort_by(|x, y| x.uri.as_str().cmp(y.uri.as_str()));

    assert_eq!(published[0].uri, a);
    assert_eq!(published[0].diagnostics.len(), 1);
    assert_eq!(published[1].uri, b);
    assert!(published[1].diagnostics.is_empty());
}

#[tokio::test]
async fn forgotten_document_is_not_validated() {
    let server = FakeAnalysisServer::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let debouncer = Debouncer::new(server.client(), DELAY, tx);
    let doc = uri("file:///w/Gone.java");

    debouncer.changed(doc.clone(), "bad".to_string());
    debouncer.forget(&doc);

    tokio::time::sleep(DELAY * 4).await;
    assert!(rx.try_recv().is_err());
    assert!(server.lint_requests().is_empty());
}

#[tokio::test]
async fn percent_encoded_uri_sends_decoded_file_name() {
    let server = FakeAnalysisServer::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let debouncer = Debouncer::new(server.client(), DELAY, tx);

    debouncer.changed(uri("file:///w/My%20Dir/Main.java"), String::new());
    next_publish(&mut rx).await;
    assert_eq!(server.lint_requests(), vec!["LINT\tMain.java\n\nEND\n".to_string()]);
}

#[tokio::test]
async fn failed_validation_publishes_nothing() {
    let server = FakeAnalysisServer::start_with(|_, _| "garbage".to_string()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let debouncer = Debouncer::new(server.client(), DELAY, tx);

    debouncer.changed(uri("file:///w/A.java"), "x".to_string());
    server.wait_for_commands(1).await;
    tokio::time::sleep(DELAY * 2).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn config_supplies_address_and_quiet_period() {
    let server = FakeAnalysisServer::start().await;
    let config = kettle_config::LintConfig {
        port: server.port(),
        debounce_ms: 10,
        ..kettle_config::LintConfig::default()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let debouncer = Debouncer::from_config(&config, tx);

    debouncer.changed(uri("file:///w/C.java"), "bad".to_string());
    let published = next_publish(&mut rx).await;
    assert_eq!(published.diagnostics.len(), 1);
}
