use std::io;

use thiserror::Error;

/// Errors surfaced by the framework API.
///
/// Transient I/O conditions (`EAGAIN`, `EINTR`) never reach protocol
/// code as failures: interrupted calls are retried internally and
/// would-block is reported through [`Error::Io`] with
/// `ErrorKind::WouldBlock` so read loops can drain cleanly.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection handle does not name a live connection: either it
    /// was closed, or its fd slot was recycled for a newer connection.
    #[error("closed connection")]
    Closed,

    /// The fd is beyond the connection table (fd limit reached at a
    /// lower bound than the table was sized for).
    #[error("connection table exhausted (fd {0})")]
    Capacity(i32),

    /// A listen/connect URL that could not be understood.
    #[error("invalid address `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A builder was consumed without a required callback.
    #[error("missing required callback: {0}")]
    Misuse(&'static str),

    /// The inter-worker bus could not stage a control envelope.
    #[error("cluster backlog overflow")]
    ClusterOverflow,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// `true` when the underlying condition is `EAGAIN`/`EWOULDBLOCK`.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
