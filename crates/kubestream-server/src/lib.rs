//! WebSocket log sessions for kubestream
//!
//! This crate owns the lifecycle of streaming sessions (the supervisor and
//! the bridge onto the client's WebSocket) and the HTTP surface around them.

pub mod bridge;
pub mod config;
pub mod error;
pub mod routes;
pub mod server;
pub mod session;
pub mod transport;

pub use bridge::Bridge;
pub use config::{ConfigError, ServerConfig, SessionTimings};
pub use error::{SessionError, TransportError};
pub use routes::router;
pub use server::run_server;
pub use session::{PreparedSession, SessionSupervisor, Termination};
pub use transport::WireMessage;
