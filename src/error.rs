//! Crate-wide error types.
//!
//! Each module that can fail in a way the coordinator must propagate defines
//! its own error enum; those convert into [`Error`] at the point where the
//! failure becomes fatal to the whole download, mirroring the taxonomy in the
//! design: local, absorbed anomalies (a bad block, an unknown message type)
//! are never turned into an `Error` at all, they're handled as plain control
//! flow instead.

use crate::PieceIndex;

/// Convenience alias for this crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("torrent descriptor is missing field: {0}")]
    InvalidDescriptor(&'static str),

    #[error("piece hash blob length ({0}) is not a multiple of 20")]
    InvalidHashBlobLength(usize),

    #[error("piece index {0} is out of range")]
    InvalidPieceIndex(PieceIndex),

    #[error("bencode decode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] crate::peer::codec::CodecError),
}
