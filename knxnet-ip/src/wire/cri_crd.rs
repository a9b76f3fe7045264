use byteorder::ReadBytesExt;
use std::fmt;
use std::io::{Cursor, Write};

/// Connection-type octet tagging a CRI/CRD payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionType {
    DeviceManagement,
    Tunnel,
    Unknown(u8),
}

impl ConnectionType {
    #[inline]
    fn to_octet(self) -> u8 {
        match self {
            ConnectionType::DeviceManagement => 0x03,
            ConnectionType::Tunnel => 0x04,
            ConnectionType::Unknown(v) => v,
        }
    }

    #[inline]
    pub(crate) fn from_octet(v: u8) -> ConnectionType {
        match v {
            0x03 => ConnectionType::DeviceManagement,
            0x04 => ConnectionType::Tunnel,
            other => ConnectionType::Unknown(other),
        }
    }
}

/// Tunnel CRI link-layer octet: bus monitor, link layer or broadcast/raw. The
/// engine only ever requests link-layer tunneling.
pub const TUNNEL_LINKLAYER: u8 = 0x02;

/// Connect Request Information: the connection-type-specific parameters a
/// client attaches to a CONNECT_REQ.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Cri {
    pub connection_type: ConnectionType,
    pub payload: Vec<u8>,
}

impl Cri {
    /// A tunnel CRI requesting link-layer tunneling.
    pub fn tunnel() -> Cri {
        Cri {
            connection_type: ConnectionType::Tunnel,
            payload: vec![TUNNEL_LINKLAYER, 0x00],
        }
    }

    /// A device-management CRI; it carries no further parameters.
    pub fn device_management() -> Cri {
        Cri {
            connection_type: ConnectionType::DeviceManagement,
            payload: Vec::new(),
        }
    }

    pub(crate) fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let len = 2 + self.payload.len();
        w.write_all(&[len as u8, self.connection_type.to_octet()])?;
        w.write_all(&self.payload)
    }
}

/// Connect Response Data: the connection-type-specific result of a CONNECT_REQ.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Crd {
    pub connection_type: ConnectionType,
    pub payload: Vec<u8>,
}

impl Crd {
    pub(crate) fn read(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Crd> {
        let len = cursor.read_u8()? as usize;
        let connection_type = ConnectionType::from_octet(cursor.read_u8()?);

        let payload_len = len.saturating_sub(2);
        let mut payload = vec![0u8; payload_len];
        std::io::Read::read_exact(cursor, &mut payload)?;

        Ok(Crd {
            connection_type,
            payload,
        })
    }

    /// The individual KNX address assigned for the session, present when
    /// this CRD comes from a tunnel connect response.
    pub fn tunneling_address(&self) -> Option<KnxAddress> {
        if self.connection_type != ConnectionType::Tunnel || self.payload.len() < 2 {
            return None;
        }

        Some(KnxAddress::from_bytes(self.payload[0], self.payload[1]))
    }
}

/// An individual KNX address: area (4 bits), line (4 bits), device (8 bits).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KnxAddress {
    pub area: u8,
    pub line: u8,
    pub device: u8,
}

impl KnxAddress {
    #[inline]
    pub fn from_bytes(high: u8, low: u8) -> KnxAddress {
        KnxAddress {
            area: high >> 4,
            line: high & 0x0F,
            device: low,
        }
    }
}

impl fmt::Display for KnxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area, self.line, self.device)
    }
}
