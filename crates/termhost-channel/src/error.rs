use thiserror::Error;

/// Errors from channel operations and pending requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {0} not found")]
    UnknownChannel(String),
    #[error("port closed on channel {0}")]
    PortClosed(String),
    #[error("request {0} is already in flight")]
    DuplicateRequest(String),
    #[error("request {id} timed out after {after_ms}ms")]
    Timeout { id: String, after_ms: u64 },
    #[error("{0}")]
    Remote(String),
    #[error("channel manager shut down")]
    Shutdown,
}
