//! Command implementations for the CLI
//!
//! - start: run the relay until signalled
//! - stop / reload: signal a running relay through its PID file
//! - test: validate configuration
//! - send: one tick now
//! - backlog: inspect or resend stored records

pub mod backlog;
pub mod reload;
pub mod send;
pub mod start;
pub mod stop;
