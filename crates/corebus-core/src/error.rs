//! Error taxonomy shared by corebus backends and links.

/// Convenience alias used across the corebus crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by corebus operations.
///
/// Corrupted data arriving from the remote side is never reported through
/// this type to the application: the backend validates, logs, and drops the
/// offending message while the link keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No free blocks and the caller asked not to wait, or the request can
    /// never fit the channel.
    #[error("out of block memory")]
    NoMem,
    /// Timed out waiting for blocks to be released.
    #[error("timed out waiting for free blocks")]
    TimedOut,
    /// An argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The control link refused the operation or is not established.
    #[error("control link unavailable")]
    LinkDown,
    /// The operation is intentionally unimplemented.
    #[error("operation not supported")]
    NotSupported,
    /// An endpoint with the same name is already registered.
    #[error("endpoint name already registered")]
    AlreadyExists,
    /// The fixed-size endpoint table is full.
    #[error("endpoint table is full")]
    NoEndpointSlots,
    /// The binding worker thread could not be started.
    #[error("failed to start worker thread")]
    WorkerStart,
}
