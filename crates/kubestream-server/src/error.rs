use std::time::Duration;

use kubestream_k8s::CredentialError;
use kubestream_logs::{EngineError, FilterError};

/// Failures of the client connection. Always fatal to the session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("no client activity within {0:?}")]
    LivenessTimeout(Duration),
    #[error("connection closed by client")]
    Closed,
    #[error("websocket error: {0}")]
    Socket(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    InvalidFilterSyntax(#[from] FilterError),
    #[error("authentication failed: {0}")]
    AuthenticationFailure(#[from] CredentialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("log tailing failed: {0}")]
    Engine(#[from] EngineError),
}

impl SessionError {
    /// Whether the client is told about this failure with an error frame.
    /// Transport failures leave nothing to tell it on.
    pub fn notifies_client(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}
