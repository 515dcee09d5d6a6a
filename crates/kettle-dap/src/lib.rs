//! Debug Adapter Protocol front end for the JDK command-line debugger.
//!
//! - [`dap_tokio`]: DAP message framing over tokio streams.
//! - [`breakpoints`]: breakpoint buffering before launch and resolution to jdb class names.
//! - [`controller`]: the execution-control state machine.
//! - [`session`] and [`server`]: request dispatch and the stdio server loop.

pub mod breakpoints;
pub mod controller;
pub mod dap_tokio;
pub mod hardening;
pub mod server;
pub mod session;
pub mod source;
