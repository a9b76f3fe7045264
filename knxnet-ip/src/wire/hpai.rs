use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use std::net::Ipv4Addr;

pub const HPAI_LEN: u8 = 8;

/// Host protocol tag carried in an HPAI structure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HostProtocol {
    Ipv4Udp,
    Ipv4Tcp,
    Unknown(u8),
}

impl HostProtocol {
    #[inline]
    fn to_octet(self) -> u8 {
        match self {
            HostProtocol::Ipv4Udp => 0x01,
            HostProtocol::Ipv4Tcp => 0x02,
            HostProtocol::Unknown(v) => v,
        }
    }

    #[inline]
    fn from_octet(v: u8) -> HostProtocol {
        match v {
            0x01 => HostProtocol::Ipv4Udp,
            0x02 => HostProtocol::Ipv4Tcp,
            other => HostProtocol::Unknown(other),
        }
    }
}

/// Host Protocol Address Info: address/port descriptor exchanged during the
/// handshake. A TCP HPAI is "route-back": address and port are zero and the
/// peer is implied by the stream it arrived on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Hpai {
    pub protocol: HostProtocol,
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Hpai {
    #[inline]
    pub fn udp(addr: Ipv4Addr, port: u16) -> Hpai {
        Hpai {
            protocol: HostProtocol::Ipv4Udp,
            addr,
            port,
        }
    }

    /// The canonical TCP route-back HPAI: zeroed address and port.
    #[inline]
    pub fn route_back() -> Hpai {
        Hpai {
            protocol: HostProtocol::Ipv4Tcp,
            addr: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }

    #[inline]
    pub fn is_route_back(&self) -> bool {
        self.protocol == HostProtocol::Ipv4Tcp && self.addr.is_unspecified() && self.port == 0
    }

    pub(crate) fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(HPAI_LEN)?;
        w.write_u8(self.protocol.to_octet())?;
        w.write_all(&self.addr.octets())?;
        w.write_u16::<BigEndian>(self.port)
    }

    pub(crate) fn read(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Hpai> {
        let _len = cursor.read_u8()?;
        let protocol = HostProtocol::from_octet(cursor.read_u8()?);
        let mut octets = [0u8; 4];
        std::io::Read::read_exact(cursor, &mut octets)?;
        let port = cursor.read_u16::<BigEndian>()?;

        Ok(Hpai {
            protocol,
            addr: Ipv4Addr::from(octets),
            port,
        })
    }
}
