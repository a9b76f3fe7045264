//! Client-side KNXnet/IP connection engine: wire codec, transport, the
//! connection state machine, heartbeat monitoring and service dispatch.
//!
//! A [`Connection`] is created over a transport kind and a
//! [`ConnectionProfile`] (tunneling or device management), driven through
//! [`Connection::connect`], and used to exchange cEMI frames with
//! [`Connection::send`] and [`Connection::on_cemi`] until [`Connection::close`].

pub mod connection;
mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod profile;
pub mod transport;
pub mod wire;

pub use connection::{ConnState, ConnectParams, Connection};
pub use error::EngineError;
pub use profile::ConnectionProfile;
pub use transport::{StreamRegistry, TcpTransport, TransportKind, UdpTransport};
