//! Encoding and decoding of KNXnet/IP 1.0 header and service-type frames.
//!
//! All multi-byte fields are big-endian. Unknown service types decode to an
//! opaque [`ServiceFrame::Unknown`] rather than failing; only structural
//! malformation (short buffer, bad structure length, mismatched total
//! length) is reported as [`EngineError::Format`].

mod cri_crd;
mod hpai;
mod service;
mod status;

pub use cri_crd::{Crd, Cri, KnxAddress};
pub use hpai::{HostProtocol, Hpai};
pub use service::{
    decode_service, encode_connect_request, encode_disconnect_request,
    encode_disconnect_response, encode_connectionstate_request, encode_service_ack,
    encode_service_request, ServiceFrame,
};
pub use status::status_text;

use crate::error::EngineError;
use crate::profile::ConnectionProfile;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use knx_support::PROTOCOL_VERSION;
use std::io::Cursor;

pub const HEADER_LEN: usize = 6;
pub const HEADER_STRUCTURE_LENGTH: u8 = 6;

pub const SVC_CONNECT_REQ: u16 = 0x0205;
pub const SVC_CONNECT_RES: u16 = 0x0206;
pub const SVC_CONNECTIONSTATE_REQ: u16 = 0x0207;
pub const SVC_CONNECTIONSTATE_RES: u16 = 0x0208;
pub const SVC_DISCONNECT_REQ: u16 = 0x0209;
pub const SVC_DISCONNECT_RES: u16 = 0x020A;

pub const SVC_TUNNELING_REQ: u16 = 0x0420;
pub const SVC_TUNNELING_ACK: u16 = 0x0421;
pub const SVC_DEVICE_CONFIGURATION_REQ: u16 = 0x0310;
pub const SVC_DEVICE_CONFIGURATION_ACK: u16 = 0x0311;

pub const NO_ERROR: u8 = 0x00;

/// The 6-octet common header prefixing every KNXnet/IP frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub structure_length: u8,
    pub protocol_version: u8,
    pub service_type: u16,
    pub total_length: u16,
}

impl Header {
    #[inline]
    pub fn version_matches(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }

    pub(crate) fn write<W: std::io::Write>(w: &mut W, service_type: u16, body_len: usize) -> std::io::Result<()> {
        let total = HEADER_LEN + body_len;
        w.write_u8(HEADER_STRUCTURE_LENGTH)?;
        w.write_u8(PROTOCOL_VERSION)?;
        w.write_u16::<BigEndian>(service_type)?;
        w.write_u16::<BigEndian>(total as u16)
    }
}

/// Decodes the common header, returning the header and a borrowed view of
/// the body that follows it. Fails with [`EngineError::Format`] only for
/// structural malformation; an unexpected protocol version is surfaced in
/// the returned header so the caller can decide whether to close.
pub fn decode(bytes: &[u8]) -> Result<(Header, &[u8]), EngineError> {
    if bytes.len() < HEADER_LEN {
        return Err(EngineError::format("frame shorter than the common header"));
    }

    let mut cursor = Cursor::new(bytes);
    let structure_length = cursor.read_u8().map_err(EngineError::format_io)?;
    let protocol_version = cursor.read_u8().map_err(EngineError::format_io)?;
    let service_type = cursor.read_u16::<BigEndian>().map_err(EngineError::format_io)?;
    let total_length = cursor.read_u16::<BigEndian>().map_err(EngineError::format_io)?;

    if structure_length != HEADER_STRUCTURE_LENGTH {
        return Err(EngineError::format(format!(
            "unexpected header structure length {structure_length}, expected {HEADER_STRUCTURE_LENGTH}"
        )));
    }

    if total_length as usize != bytes.len() {
        return Err(EngineError::format(format!(
            "declared total length {total_length} does not match received {} bytes",
            bytes.len()
        )));
    }

    let header = Header {
        structure_length,
        protocol_version,
        service_type,
        total_length,
    };

    Ok((header, &bytes[HEADER_LEN..]))
}

/// Convenience wrapper combining [`decode`] with [`decode_service`].
pub fn decode_frame<'a>(
    bytes: &'a [u8],
    profile: &ConnectionProfile,
) -> Result<ServiceFrame<'a>, EngineError> {
    let (header, body) = decode(bytes)?;
    Ok(decode_service(&header, body, profile))
}
