//! inkgate library
//!
//! Control-plane API for inkBoard dashboards: a REST surface for one-shot
//! reads and action calls, and a WebSocket protocol for watching dashboard
//! state change.

pub mod config;
pub mod logging;
pub mod runtime;
pub mod server;
