use thiserror::Error;

use crate::protocol::Rank;

#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("A job is already running")]
    Busy,

    #[error("Timed out waiting for workers to bootstrap: {0}")]
    BootstrapTimeout(String),

    #[error("Handshake failure: {0}")]
    HandshakeFailure(String),

    #[error("Lost connection to rank {0}")]
    PeerLost(Rank),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Collective mismatch: {0}")]
    CollectiveMismatch(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Kernel error on rank {rank}: {reason}")]
    KernelError { rank: Rank, reason: String },

    #[error("No peer to communicate with in local mode")]
    NoPeer,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlotillaError {
    /// Worker process exit code for this error. 0 is reserved for normal
    /// completion and is never produced here.
    pub fn exit_code(&self) -> i32 {
        match self {
            FlotillaError::Cancelled => 2,
            FlotillaError::ProtocolViolation(_) => 10,
            FlotillaError::HandshakeFailure(_) => 20,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlotillaError>;
