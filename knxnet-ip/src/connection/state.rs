/// The connection's externally observable lifecycle state (§4.3).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    Closed,
    Connecting,
    Ok,
    WaitingAck,
    CemiConPending,
    AckError,
    UnknownError,
    Closing,
}
