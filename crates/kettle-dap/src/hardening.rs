use std::panic;
use std::sync::Arc;

use kettle_config::{LogBuffer, LoggingConfig};

/// Initialize structured logging and route panics into it.
///
/// The panic hook records the panic (with its location) through `tracing` so it lands in the
/// configured log sinks; stdout is never touched because it carries the protocol. Debug builds
/// also keep the default hook so the panic stays visible on stderr.
pub fn init(logging: &LoggingConfig) -> Arc<LogBuffer> {
    let buffer = kettle_config::init_tracing(logging);

    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_default();
        tracing::error!(target: "kettle.dap", %location, "panic: {message}");

        if cfg!(debug_assertions) {
            previous(info);
        }
    }));

    buffer
}
