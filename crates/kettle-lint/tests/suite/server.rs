use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kettle_config::LintConfig;
use kettle_lint::{AnalysisServer, LintError, Readiness};
use pretty_assertions::assert_eq;

use crate::harness::FakeAnalysisServer;

const SERVING_JAVA: &str = r#"#!/bin/sh
printf '%s\n' "$@" > "$(dirname "$0")/args.txt"
echo 'Listening...'
echo 'RUNNING'
sleep 30
"#;

const PORT_TAKEN_JAVA: &str = "#!/bin/sh\necho 'PORT_USED'\n";
const CRASHING_JAVA: &str = "#!/bin/sh\necho 'Error: Unable to access jarfile'\nexit 1\n";
const SILENT_JAVA: &str = "#!/bin/sh\nsleep 30\n";

fn install_java(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("java");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(java: &Path, port: u16) -> LintConfig {
    LintConfig {
        java: java.display().to_string(),
        server_jar: Some(PathBuf::from("/opt/kettle/analysis.jar")),
        port,
        ..LintConfig::default()
    }
}

#[tokio::test]
async fn owned_server_is_started_and_killed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let java = install_java(dir.path(), SERVING_JAVA);
    let fake = FakeAnalysisServer::start().await;

    let server = AnalysisServer::spawn_with_timeout(&config(&java, fake.port()), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(server.readiness(), Readiness::Started);
    assert!(server.owns_process());

    let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
    let port = fake.port().to_string();
    assert_eq!(
        args.lines().collect::<Vec<_>>(),
        vec!["-jar", "/opt/kettle/analysis.jar", "--port", port.as_str()]
    );

    server.shutdown().await;
    fake.wait_for_commands(1).await;
    assert_eq!(fake.received(), vec!["KILL".to_string()]);
}

#[tokio::test]
async fn port_in_use_means_nothing_is_owned() {
    let dir = tempfile::tempdir().unwrap();
    let java = install_java(dir.path(), PORT_TAKEN_JAVA);
    let fake = FakeAnalysisServer::start().await;

    let server = AnalysisServer::spawn_with_timeout(&config(&java, fake.port()), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(server.readiness(), Readiness::AlreadyRunning);
    assert!(!server.owns_process());
    assert_eq!(server.client().addr().port(), fake.port());
}

#[tokio::test]
async fn configured_settings_are_pushed_once_ready() {
    let dir = tempfile::tempdir().unwrap();
    let java = install_java(dir.path(), PORT_TAKEN_JAVA);
    let fake = FakeAnalysisServer::start().await;
    let config = LintConfig {
        jdk: Some(PathBuf::from("/opt/jdk-21")),
        ..config(&java, fake.port())
    };

    AnalysisServer::spawn_with_timeout(&config, Duration::from_secs(5))
        .await
        .unwrap();
    fake.wait_for_commands(1).await;
    assert_eq!(fake.received(), vec!["SET\tJDK\t/opt/jdk-21\n".to_string()]);
}

#[tokio::test]
async fn exit_before_ready_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let java = install_java(dir.path(), CRASHING_JAVA);
    let err = AnalysisServer::spawn_with_timeout(&config(&java, 1), Duration::from_secs(5))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LintError::ExitedDuringStartup), "{err}");
}

#[tokio::test]
async fn silent_server_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let java = install_java(dir.path(), SILENT_JAVA);
    let err = AnalysisServer::spawn_with_timeout(&config(&java, 1), Duration::from_millis(200))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LintError::StartupTimeout(_)), "{err}");
}

#[tokio::test]
async fn missing_jar_or_java_fails_without_waiting() {
    let no_jar = LintConfig::default();
    assert!(matches!(
        AnalysisServer::spawn(&no_jar).await.err().unwrap(),
        LintError::NoServerJar
    ));

    let missing = config(Path::new("/definitely/not/java"), 1);
    assert!(matches!(
        AnalysisServer::spawn(&missing).await.err().unwrap(),
        LintError::Spawn(_)
    ));
}
