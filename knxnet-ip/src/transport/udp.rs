use super::{FrameSink, Transport, TransportKind};
use crate::error::EngineError;
use crate::wire;
use log::{debug, warn};
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often the receiver wakes to check whether `cleanup` closed the
/// connection. `std::net::UdpSocket` has no explicit shutdown, so the
/// interruption contract in §9 ("closing a blocked I/O call is the mandated
/// interrupt mechanism") is realized with a short read timeout instead of a
/// real socket close; the file descriptor itself closes once every `Arc`
/// referencing this transport (the connection's and the receiver thread's)
/// has been dropped.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct UdpTransport {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpTransport {
    pub fn bind(local: SocketAddrV4) -> std::io::Result<Arc<UdpTransport>> {
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        if socket.local_addr()?.ip().is_loopback() {
            warn!("UDP transport bound to a loopback local address {local}; NAT traversal from a real peer will not work");
        }

        Ok(Arc::new(UdpTransport {
            socket,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddrV4> {
        match self.socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => unreachable!("bound with an IPv4 local address"),
        }
    }

    /// Spawns the receiver thread. Each inbound datagram must contain
    /// exactly one framed message (§4.2); anything else is dropped with a
    /// warning rather than treated as a fatal error.
    pub fn start_receiver(self: &Arc<Self>, on_frame: FrameSink) -> thread::JoinHandle<()> {
        let transport = Arc::clone(self);

        thread::spawn(move || {
            let mut buf = [0u8; 2048];

            loop {
                if transport.closed.load(Ordering::Acquire) {
                    debug!("receiver loop exiting: cleanup has closed this connection");
                    break;
                }

                match transport.socket.recv_from(&mut buf) {
                    Ok((len, SocketAddr::V4(src))) => match wire::decode(&buf[..len]) {
                        Ok((header, body)) => on_frame(header, body, *src.ip(), src.port()),
                        Err(err) => warn!("dropping malformed datagram from {src}: {err}"),
                    },
                    Ok((_, SocketAddr::V6(_))) => warn!("dropping unexpected IPv6 datagram"),
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(err) => {
                        warn!("receiver loop I/O error, exiting: {err}");
                        break;
                    }
                }
            }
        })
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn send(&self, bytes: &[u8], destination: Option<SocketAddrV4>) -> Result<(), EngineError> {
        let dest = destination
            .ok_or(EngineError::IllegalState("UDP send requires an explicit destination"))?;
        self.socket.send_to(bytes, dest)?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
