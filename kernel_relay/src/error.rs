//! Error type shared by every stage of the filter engine.

use std::io;

/// Everything that can go wrong between receiving compressed bytes and
/// returning filtered ones.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The input bytes are corrupt or not a recognizable image container.
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    /// The container (or requested output) is recognized but not handled.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// The filter id does not name an entry in the kernel catalog.
    #[error("unknown filter {0}")]
    UnknownFilter(i64),

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// A runtime fault (panic) recovered at the connection handler boundary.
    #[error("internal fault: {0}")]
    InternalFault(String),

    #[error("invalid pixel matrix: {0}")]
    InvalidMatrix(String),

    #[error("invalid kernel: {0}")]
    InvalidKernel(String),

    /// One frame of an animation failed; the whole animation is abandoned.
    #[error("frame {index}: {source}")]
    Frame {
        index: usize,
        #[source]
        source: Box<FilterError>,
    },

    /// Client side only: the server answered with an error message.
    #[error("server reported: {0}")]
    Remote(String),
}

impl FilterError {
    /// Wraps an I/O error with the path (or peer) it concerns.
    pub fn io_context(context: impl std::fmt::Display, err: io::Error) -> Self {
        FilterError::Io(io::Error::new(err.kind(), format!("{context}: {err}")))
    }

    /// Builds the `Io(InvalidData)` error used for malformed wire framing.
    pub fn malformed(message: impl Into<String>) -> Self {
        FilterError::Io(io::Error::new(io::ErrorKind::InvalidData, message.into()))
    }
}
