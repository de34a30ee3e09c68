use std::sync::Arc;

use discovery_common::transport::TransportError;
use http::StatusCode;
use thiserror::Error;

/// Why a single call to the discovery server did not succeed.
#[derive(Error, Debug, Clone)]
pub enum RequestError {
    #[error(transparent)]
    Transport(Arc<TransportError>),
    #[error("discovery server rejected the request with {0}")]
    ClientRejected(StatusCode),
}

impl From<TransportError> for RequestError {
    fn from(error: TransportError) -> Self {
        RequestError::Transport(Arc::new(error))
    }
}

/// Enumeration of errors surfaced by the discovery client runtime.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error(
        "could not register with the discovery server after {attempts} attempts: {last_error}"
    )]
    RegistrationExhausted {
        attempts: u32,
        last_error: RequestError,
    },
    #[error("heartbeat failed: {0}")]
    HeartbeatFailure(RequestError),
    #[error("registry poll failed: {0}")]
    PollFailure(RequestError),
    #[error("the discovery client has already been started")]
    AlreadyStarted,
    #[error("the discovery client was stopped")]
    Stopped,
}
