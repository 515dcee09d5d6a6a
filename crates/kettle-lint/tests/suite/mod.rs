mod client;
mod debounce;
mod lsp;
#[cfg(unix)]
mod server;
