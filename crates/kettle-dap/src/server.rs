use std::sync::Arc;

use kettle_config::KettleConfig;
use kettle_jdb::{Backend, JdbProcess};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::dap_tokio::{DapReader, DapWriter, Result};
use crate::session::{Outbound, Outgoing, Session};

/// Serve one debug session over stdio, backed by a `jdb` process.
pub async fn run_stdio(config: &KettleConfig) -> anyhow::Result<()> {
    let backend: Arc<dyn Backend> = Arc::new(JdbProcess::new(config.jdb.clone()));
    run(tokio::io::stdin(), tokio::io::stdout(), backend)
        .await
        .map_err(anyhow::Error::from)
}

/// Serve one debug session over an arbitrary byte stream pair.
///
/// Returns once the frontend disconnects or closes its stream; the backend is terminated and
/// every outstanding request has been answered by then.
pub async fn run<R, W>(reader: R, writer: W, backend: Arc<dyn Backend>) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();

    let writer_task = tokio::spawn(async move {
        let mut writer = DapWriter::new(writer);
        let mut seq: i64 = 1;
        while let Some(message) = out_rx.recv().await {
            let written = match message {
                Outgoing::Response(mut response) => {
                    response.seq = seq;
                    writer.write_response(&response).await
                }
                Outgoing::Event(mut event) => {
                    event.seq = seq;
                    writer.write_event(&event).await
                }
            };
            seq += 1;
            if let Err(err) = written {
                tracing::warn!(target: "kettle.dap", error = %err, "failed to write to frontend");
                break;
            }
        }
    });

    let mut session = Session::new(backend, Outbound::new(out_tx));
    let mut reader = DapReader::new(reader);

    let result = loop {
        let request = match reader.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::info!(target: "kettle.dap", "frontend closed the stream");
                session.shutdown().await;
                break Ok(());
            }
            Err(err) => {
                tracing::error!(target: "kettle.dap", error = %err, "unreadable frontend message");
                session.shutdown().await;
                break Err(err);
            }
        };
        if request.message_type != "request" {
            continue;
        }

        tracing::debug!(
            target: "kettle.dap",
            seq = request.seq,
            command = %request.command,
            "request"
        );
        if !session.handle(request).await {
            break Ok(());
        }
    };

    // Dropping the session releases the last outbound sender; the writer drains and stops.
    drop(session);
    let _ = writer_task.await;
    result
}
