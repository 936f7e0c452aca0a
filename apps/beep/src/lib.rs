//! Runnable two-party session: HTTP signaling between two processes, the
//! square-wave source on Alice's side and a logging consumer on Bob's.

pub mod cli;
pub mod config;
pub mod consumer;
pub mod http;
pub mod session;
pub mod telemetry;
