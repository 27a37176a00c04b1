//! Error types shared by the replica engine and the session layer.

use thiserror::Error;

/// Errors surfaced by the engine, the wire protocol, and sessions.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame or message that cannot be understood: unparsable form,
    /// wrong arity, invalid Base64, or a reference a peer is not
    /// allowed to make. The server drops the offending connection; a
    /// client stops its session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The challenge response did not match.
    #[error("authentication failed")]
    AuthFailed,

    /// The 16-bit site space is exhausted; no more clients can join.
    #[error("used up client ids")]
    SitesExhausted,

    /// An operation referenced a buffer this replica does not hold.
    #[error("unknown buffer: {0}")]
    UnknownBuffer(String),

    /// A buffer with this name is already shared.
    #[error("buffer already shared: {0}")]
    BufferExists(String),

    /// The operation is only available on a server session.
    #[error("operation requires a server session")]
    NotServer,

    /// A session under this name is already registered.
    #[error("session already exists: {0}")]
    SessionExists(String),

    /// The session task is gone; no further commands can be delivered.
    #[error("session closed")]
    SessionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
