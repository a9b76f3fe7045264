use knx_support::error::IoFailure;
use std::fmt;
use std::net::SocketAddrV4;

/// The engine's concrete error taxonomy: malformed frames, timeouts,
/// peer-reported failures, transport faults, illegal API use, and
/// cooperative cancellation.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed frame, truncated field, or bad header.
    Format(String),
    /// No ack/confirmation/connect-response/heartbeat-response within the
    /// allotted time.
    Timeout { what: &'static str },
    /// The peer reported a non-zero status.
    Remote { peer: SocketAddrV4, status: u8, status_text: String },
    /// Socket or stream I/O failure.
    Transport(IoFailure),
    /// The caller invoked an operation the current state forbids.
    IllegalState(&'static str),
    /// Cooperative cancellation observed mid-operation.
    Interrupted,
}

impl EngineError {
    pub(crate) fn format(message: impl Into<String>) -> EngineError {
        EngineError::Format(message.into())
    }

    pub(crate) fn format_io(err: std::io::Error) -> EngineError {
        EngineError::Format(err.to_string())
    }

    pub fn remote(peer: SocketAddrV4, status: u8) -> EngineError {
        EngineError::Remote {
            peer,
            status,
            status_text: crate::wire::status_text(status),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Format(msg) => write!(f, "malformed frame: {msg}"),
            EngineError::Timeout { what } => write!(f, "timed out waiting for {what}"),
            EngineError::Remote {
                peer,
                status,
                status_text,
            } => write!(f, "{peer} reported status 0x{status:02X} ({status_text})"),
            EngineError::Transport(io) => write!(f, "transport failure: {io}"),
            EngineError::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            EngineError::Interrupted => write!(f, "operation interrupted"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Transport(IoFailure::from(err))
    }
}
