use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("No session token; pass --token or set WARDEN_TOKEN")]
    MissingToken,

    #[error("Cannot determine daemon socket path: {0}")]
    SocketPath(String),

    #[error("Unexpected response from daemon")]
    UnexpectedResponse,

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] warden_protocol::errors::ClientError),
}

pub type Result<T> = std::result::Result<T, CliError>;
