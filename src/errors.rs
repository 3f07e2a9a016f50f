//! Error types for the object and pack codecs.
//!
//! `GitError` covers everything that can go wrong while parsing or producing raw Git data:
//! object bodies, pack streams, delta instructions and zlib payloads. Storage and protocol
//! layers wrap it in their own error enums.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for object parsing and pack encode/decode.
pub enum GitError {
    /// Invalid or unsupported git object type name.
    #[error("The `{0}` is not a valid git object type.")]
    InvalidObjectType(String),

    /// Malformed tree object.
    #[error("Not a valid git tree object: {0}")]
    InvalidTreeObject(String),

    /// Invalid tree entry (mode/name/hash).
    #[error("The `{0}` is not a valid git tree item.")]
    InvalidTreeItem(String),

    /// Invalid author/committer/tagger line.
    #[error("The `{0}` is not a valid git signature.")]
    InvalidSignature(String),

    /// Malformed commit object.
    #[error("Invalid Commit: {0}")]
    InvalidCommit(String),

    /// Malformed tag object.
    #[error("Not a valid git tag object: {0}")]
    InvalidTagObject(String),

    /// Malformed or unsupported pack file.
    #[error("The `{0}` is not a valid pack file.")]
    InvalidPackFile(String),

    /// Invalid pack header magic or version.
    #[error("The `{0}` is not a valid pack header.")]
    InvalidPackHeader(String),

    /// I/O error from underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Invalid SHA1 hash formatting or value.
    #[error("The {0} is not a valid Hash value ")]
    InvalidHashValue(String),

    /// Delta object reconstruction error.
    #[error("Delta Object Error Info:{0}")]
    DeltaObjectError(String),

    /// Base object of a delta is neither in the pack nor available elsewhere.
    #[error("Cannot find delta base object: {0}")]
    MissingDeltaBase(String),

    /// Failed to encode pack entries.
    #[error("Can't encode entries to pack: {0}")]
    PackEncodeError(String),
}
