//! Error types for the GNSS bridge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("system: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("config: {0}")]
    Config(String),

    #[error("lifecycle: {0}")]
    Lifecycle(String),

    #[error("{name}: not ready")]
    NotReady { name: String },
}

pub type Result<T> = std::result::Result<T, BridgeError>;
