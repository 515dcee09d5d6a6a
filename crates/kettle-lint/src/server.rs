use std::process::Stdio;
use std::time::Duration;

use kettle_config::LintConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use crate::client::LintClient;
use crate::{LintError, Result};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The spawned process is serving.
    Started,
    /// Another instance already holds the port; the spawned process has nothing to do.
    AlreadyRunning,
}

/// The external analysis process, if this session started one.
pub struct AnalysisServer {
    child: Option<Child>,
    readiness: Readiness,
    client: LintClient,
}

impl AnalysisServer {
    /// Start `java -jar <server_jar> --port <port>` and wait for it to report readiness.
    pub async fn spawn(config: &LintConfig) -> Result<Self> {
        Self::spawn_with_timeout(config, STARTUP_TIMEOUT).await
    }

    pub async fn spawn_with_timeout(config: &LintConfig, timeout: Duration) -> Result<Self> {
        let jar = config.server_jar.as_ref().ok_or(LintError::NoServerJar)?;

        let mut child = Command::new(&config.java)
            .arg("-jar")
            .arg(jar)
            .arg("--port")
            .arg(config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(LintError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LintError::Spawn(std::io::Error::other("child stdout not captured")))?;
        let mut lines = BufReader::new(stdout).lines();

        let readiness = match tokio::time::timeout(timeout, wait_until_ready(&mut lines)).await {
            Ok(Ok(readiness)) => readiness,
            Ok(Err(err)) => {
                let _ = child.kill().await;
                return Err(err);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(LintError::StartupTimeout(timeout));
            }
        };

        let child = match readiness {
            Readiness::Started => {
                tracing::info!(target: "kettle.lint", port = config.port, "analysis server started");
                tokio::spawn(drain_stdout(lines));
                Some(child)
            }
            Readiness::AlreadyRunning => {
                tracing::info!(
                    target: "kettle.lint",
                    port = config.port,
                    "analysis server already running"
                );
                // Dropping the child kills the redundant helper; the serving instance is not ours.
                drop(lines);
                drop(child);
                None
            }
        };

        let client = LintClient::from_config(config);
        if let Err(err) = client.configure(&config.classpath, config.jdk.as_deref()).await {
            tracing::warn!(target: "kettle.lint", error = %err, "failed to push lint settings");
        }

        Ok(Self {
            child,
            readiness,
            client,
        })
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn owns_process(&self) -> bool {
        self.child.is_some()
    }

    pub fn client(&self) -> &LintClient {
        &self.client
    }

    /// Ask the server to exit and kill the process if it is ours.
    pub async fn shutdown(mut self) {
        if let Err(err) = self.client.kill().await {
            tracing::debug!(target: "kettle.lint", error = %err, "KILL not delivered");
        }
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                tracing::warn!(target: "kettle.lint", error = %err, "failed to kill analysis server");
            }
        }
    }
}

async fn wait_until_ready(
    lines: &mut tokio::io::Lines<BufReader<ChildStdout>>,
) -> Result<Readiness> {
    while let Some(line) = lines.next_line().await? {
        tracing::debug!(target: "kettle.lint", line = %line, "analysis server output");
        if line.contains("RUNNING") {
            return Ok(Readiness::Started);
        }
        if line.contains("PORT_USED") {
            return Ok(Readiness::AlreadyRunning);
        }
    }
    Err(LintError::ExitedDuringStartup)
}

async fn drain_stdout(mut lines: tokio::io::Lines<BufReader<ChildStdout>>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::trace!(target: "kettle.lint", line = %line, "analysis server output")
            }
            Ok(None) | Err(_) => break,
        }
    }
}
