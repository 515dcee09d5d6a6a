use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kettle_config::LintConfig;
use lsp_types::Diagnostic;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol;
use crate::{LintError, Result};

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to a running analysis server. Every command opens its own connection.
#[derive(Debug, Clone)]
pub struct LintClient {
    addr: SocketAddr,
    reply_timeout: Duration,
}

impl LintClient {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(host, port),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn from_config(config: &LintConfig) -> Self {
        Self::new(config.host, config.port)
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, command: &str) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(command.as_bytes()).await?;
        stream.flush().await?;
        Ok(stream)
    }

    /// Send a fire-and-forget command; the server gives no reply to these.
    async fn send_only(&self, command: &str) -> Result<()> {
        let mut stream = self.send(command).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Lint one document and return its diagnostics.
    pub async fn lint(&self, file_name: &str, text: &str) -> Result<Vec<Diagnostic>> {
        let mut stream = self.send(&protocol::lint_command(file_name, text)).await?;

        let reply = tokio::time::timeout(self.reply_timeout, read_reply(&mut stream))
            .await
            .map_err(|_| {
                LintError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "analysis server did not reply",
                ))
            })??;

        let records = protocol::parse_reply(&reply)?;
        tracing::debug!(
            target: "kettle.lint",
            file = file_name,
            findings = records.len(),
            "lint reply"
        );
        Ok(protocol::to_diagnostics(&records))
    }

    pub async fn set_classpath<P: AsRef<Path>>(&self, entries: &[P]) -> Result<()> {
        self.send_only(&protocol::set_classpath_command(entries)).await
    }

    pub async fn set_jdk(&self, path: &Path) -> Result<()> {
        self.send_only(&protocol::set_jdk_command(path)).await
    }

    /// Push the configured classpath and JDK. Empty settings are not sent.
    pub async fn configure(&self, classpath: &[PathBuf], jdk: Option<&Path>) -> Result<()> {
        if !classpath.is_empty() {
            self.set_classpath(classpath).await?;
        }
        if let Some(jdk) = jdk {
            self.set_jdk(jdk).await?;
        }
        Ok(())
    }

    /// Ask the server to exit.
    pub async fn kill(&self) -> Result<()> {
        self.send_only(protocol::KILL_COMMAND).await
    }
}

/// Read until the reply forms a complete JSON array, or until the server closes the connection.
async fn read_reply(stream: &mut TcpStream) -> Result<String> {
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&bytes);
        let trimmed = text.trim_end();
        if trimmed.ends_with(']') && protocol::parse_reply(trimmed).is_ok() {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
