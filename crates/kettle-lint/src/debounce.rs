use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kettle_config::LintConfig;
use lsp_types::{PublishDiagnosticsParams, Uri};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::LintClient;
use crate::protocol;

struct Pending {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Documents {
    next_generation: u64,
    pending: HashMap<Uri, Pending>,
}

/// Validates documents after a quiet period, independently per document.
///
/// A change to one document cancels only that document's pending validation; a validation whose
/// document changed again while it was in flight does not publish.
pub struct Debouncer {
    client: LintClient,
    delay: Duration,
    publish: mpsc::UnboundedSender<PublishDiagnosticsParams>,
    documents: Arc<Mutex<Documents>>,
    shutdown: CancellationToken,
}

impl Debouncer {
    pub fn new(
        client: LintClient,
        delay: Duration,
        publish: mpsc::UnboundedSender<PublishDiagnosticsParams>,
    ) -> Self {
        Self {
            client,
            delay,
            publish,
            documents: Arc::new(Mutex::new(Documents::default())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(
        config: &LintConfig,
        publish: mpsc::UnboundedSender<PublishDiagnosticsParams>,
    ) -> Self {
        Self::new(LintClient::from_config(config), config.debounce(), publish)
    }

    /// Record new contents for `uri`. Must be called from within a tokio runtime.
    pub fn changed(&self, uri: Uri, text: String) {
        let (generation, cancel) = {
            let mut documents = self.documents.lock();
            documents.next_generation += 1;
            let generation = documents.next_generation;
            let cancel = self.shutdown.child_token();
            let previous = documents.pending.insert(
                uri.clone(),
                Pending {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            (generation, cancel)
        };

        let client = self.client.clone();
        let delay = self.delay;
        let publish = self.publish.clone();
        let documents = self.documents.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let file_name = protocol::file_name_for_uri(uri.as_str());
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = client.lint(&file_name, &text) => result,
            };

            {
                let mut documents = documents.lock();
                if cancel.is_cancelled() {
                    return;
                }
                if documents
                    .pending
                    .get(&uri)
                    .is_some_and(|pending| pending.generation == generation)
                {
                    documents.pending.remove(&uri);
                }
            }

            match result {
                Ok(diagnostics) => {
                    let _ = publish.send(PublishDiagnosticsParams {
                        uri,
                        diagnostics,
                        version: None,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        target: "kettle.lint",
                        uri = uri.as_str(),
                        error = %err,
                        "validation failed"
                    );
                }
            }
        });
    }

    /// Drop any pending validation for `uri`.
    pub fn forget(&self, uri: &Uri) {
        if let Some(pending) = self.documents.lock().pending.remove(uri) {
            pending.cancel.cancel();
        }
    }

    pub fn pending(&self) -> usize {
        self.documents.lock().pending.len()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
