pub mod error;
pub mod logging;

/// Protocol version this workspace speaks: KNXnet/IP 1.0.
pub const PROTOCOL_VERSION: u8 = 0x10;
