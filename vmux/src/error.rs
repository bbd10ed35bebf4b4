use thiserror::Error;

/// Application-level error type, replacing the original's `die()` macro
/// (warn-and-throw) with explicit `Result` propagation.
#[derive(Debug, Error)]
pub enum VmuxError {
    #[error("guest transport closed")]
    TransportClosed,

    #[error("guest misbehavior: {0}")]
    GuestMisbehavior(String),

    #[error("no DMA region covers the requested range")]
    DmaTranslationFailure,

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("backend I/O error: {0}")]
    BackendIoError(#[from] std::io::Error),

    #[error("capability parse error: {0}")]
    CapabilityParseError(String),

    #[error("configuration inconsistency: {0}")]
    ConfigInconsistency(String),

    #[error("unimplemented capability: {0}")]
    UnimplementedCapability(String),

    #[error(transparent)]
    Transport(#[from] vmux_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, VmuxError>;
