use thiserror::Error;

/// Errors a [`crate::Transport`] implementation can return, covering the
/// endpoint's host-facing operations; `WouldBlock` is not an error, it is
/// [`crate::AttachOutcome::WouldBlock`] / [`crate::DispatchOutcome::WouldBlock`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected to a guest")]
    NotConnected,
    #[error("transport has been closed")]
    Closed,
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
