//! Server module
//!
//! REST and WebSocket surfaces plus the coordinator that owns their lifecycle.

pub mod bind;
pub mod coordinator;
pub mod error;
pub mod rest;
pub mod ws;

// Re-export key types
pub use bind::{parse_bind_mode, resolve_bind_address, BindError, BindMode, DEFAULT_PORT};
pub use coordinator::{ApiCoordinator, ServerError, SessionHandle};
pub use error::ApiError;
