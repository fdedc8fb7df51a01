use thiserror::Error;

/// Stable error taxonomy crossing the crate boundary.
///
/// Every mutating operation returns one of these instead of letting a bare
/// panic or opaque failure escape. Registry/query errors (`NotFound`,
/// `Unauthorized`) surface synchronously and are never retried internally;
/// transport failures during an established connection are absorbed by the
/// reconnection policy and never reach callers through this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("caller {caller} is not the owner of session {session}")]
    Unauthorized { caller: String, session: String },

    #[error("connection limit reached for session {session} (max {max})")]
    LimitExceeded { session: String, max: u32 },

    #[error("session {0} already has a connection active or in progress")]
    AlreadyConnecting(String),

    #[error("session {0} is not connected")]
    NotConnected(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl Error {
    /// Machine-readable kind for callers that route on error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Unauthorized { .. } => "unauthorized",
            Error::LimitExceeded { .. } => "limit_exceeded",
            Error::AlreadyConnecting(_) => "already_connecting",
            Error::NotConnected(_) => "not_connected",
            Error::Transport(_) => "transport",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
