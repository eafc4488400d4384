//! echo-chamber: a concurrent TCP echo server.
//!
//! One reactor thread drives edge-triggered, one-shot readiness; a fixed
//! worker pool drains and echoes; a background supervisor evicts idle
//! connections. See the [`runtime`] module for the coordination contracts.

pub mod config;
pub mod logging;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use server::Server;
