//! Lint diagnostics for Java sources, produced by an external analysis server.
//!
//! The analysis server speaks a small line-oriented protocol over TCP (one connection per
//! command). This crate owns that server process, talks the protocol, and turns its findings into
//! `lsp_types` diagnostics, debounced per document. [`lsp::run`] serves them to an editor over
//! LSP.

mod client;
mod debounce;
pub mod lsp;
pub mod protocol;
mod server;

use std::io;

use thiserror::Error;

pub use client::LintClient;
pub use debounce::Debouncer;
pub use server::{AnalysisServer, Readiness};

#[derive(Debug, Error)]
pub enum LintError {
    #[error("failed to start analysis server: {0}")]
    Spawn(#[source] io::Error),

    #[error("analysis server exited before it was ready")]
    ExitedDuringStartup,

    #[error("analysis server did not become ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("no analysis server jar configured")]
    NoServerJar,

    #[error("analysis server connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed analysis server reply: {0}")]
    Malformed(String),

    #[error("language client connection closed")]
    Disconnected,
}

impl From<serde_json::Error> for LintError {
    fn from(err: serde_json::Error) -> Self {
        // The serde message can quote source text from the reply; keep only the category and
        // position.
        LintError::Malformed(format!(
            "{:?} error at line {} column {}",
            err.classify(),
            err.line(),
            err.column()
        ))
    }
}

pub type Result<T, E = LintError> = std::result::Result<T, E>;
