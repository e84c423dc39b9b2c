use std::io;

use thiserror::Error;

/// Failures produced while ingesting a container, decoding its manifest or
/// reconstructing partition images.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed payload container: {0}")]
    MalformedContainer(String),
    #[error("Unsupported payload version: {0} (only version 2 is supported)")]
    UnsupportedVersion(u64),
    #[error("Malformed payload manifest: {0}")]
    MalformedManifest(String),
    #[error(
        "Unsupported manifest minor version {0}: delta payloads are not supported, please use a full payload"
    )]
    UnsupportedMinorVersion(u32),
    #[error("No entry ending with {0:?} found in archive")]
    EntryNotFound(String),
    #[error("Remote does not support byte range requests: {0}")]
    RangeNotSupported(String),
    #[error("Unsupported operation type: {0}")]
    UnsupportedOperation(String),
    #[error("Failed to decompress {codec} data")]
    DecodeError {
        codec: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Partition not found in payload: {0}")]
    PartitionNotFound(String),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("Decoded {actual} bytes, but destination extents cover {expected} bytes")]
    ExtentMismatch { expected: u64, actual: u64 },
    #[error("Expected sha256 {expected}, but have {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("Operation #{index} ({kind}) failed")]
    Operation {
        index: usize,
        kind: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Extraction was cancelled")]
    Cancelled,
    #[error("Zip error")]
    Zip(#[from] zip::result::ZipError),
    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Strip [`Error::Operation`] wrappers and return the underlying failure.
    pub fn root(&self) -> &Error {
        match self {
            Self::Operation { source, .. } => source.root(),
            e => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
