//! Peer-reported status codes, surfaced verbatim in textual form per the
//! engine's error-handling design (§7: "user-visible failures carry a
//! message that includes ... the peer's textual status when available").

/// Returns the textual status associated with a status code. Unknown codes
/// still produce a readable message rather than panicking or failing.
pub fn status_text(status: u8) -> String {
    match status {
        0x00 => "E_NO_ERROR".to_string(),
        0x01 => "E_HOST_PROTOCOL_TYPE".to_string(),
        0x02 => "E_VERSION_NOT_SUPPORTED".to_string(),
        0x04 => "E_SEQUENCE_NUMBER".to_string(),
        0x21 => "E_CONNECTION_ID".to_string(),
        0x22 => "E_CONNECTION_TYPE".to_string(),
        0x23 => "E_CONNECTION_OPTION".to_string(),
        0x24 => "E_NO_MORE_CONNECTIONS".to_string(),
        0x25 => "E_NO_MORE_UNIQUE_CONNECTIONS".to_string(),
        0x26 => "E_DATA_CONNECTION".to_string(),
        0x27 => "E_KNX_CONNECTION".to_string(),
        0x28 => "E_TUNNELING_LAYER".to_string(),
        other => format!("unknown status 0x{other:02X}"),
    }
}
