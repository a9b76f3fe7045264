use std::fmt;
use std::io;

/// Reusable conversion glue from `io::Error`, shared by every layer that
/// wraps a `std::net` socket or stream.
#[derive(Debug)]
pub struct IoFailure {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl From<io::Error> for IoFailure {
    #[inline]
    fn from(err: io::Error) -> Self {
        IoFailure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for IoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

impl std::error::Error for IoFailure {}
