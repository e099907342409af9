//! Networking: configuration, handlers, worker connections, SSE and shutdown.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;
pub mod sse;

pub use config::*;
pub use connection::*;
pub use handlers::{AppState, CallbackEndpoints};
pub use module::NetworkModule;
pub use shutdown::*;
