//! The connection state machine: channel lifecycle, sequence numbers,
//! retransmission, and the ack-vs-confirmation discipline (§4.3).

mod state;

pub use state::ConnState;

use crate::error::EngineError;
use crate::heartbeat::Heartbeat;
use crate::profile::ConnectionProfile;
use crate::transport::{StreamRegistry, TcpTransport, Transport, TransportKind, UdpTransport};
use crate::wire::{self, Cri, Header, Hpai, KnxAddress};
use log::{debug, warn};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long `connect` waits for a CONNECT_RES before giving up.
pub const CONNECT_REQ_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a send waits for the cEMI confirmation once the ack (or, on
/// TCP, the request itself) has gone out.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a locally initiated `close` waits for the disconnect response
/// before forcing CLOSED.
pub const DISCONNECT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

/// Caller-supplied parameters for [`Connection::connect`].
pub struct ConnectParams {
    /// Bind address for UDP; ignored for TCP.
    pub local_endpoint: SocketAddrV4,
    /// The peer's control endpoint. Must be resolved and non-multicast.
    pub server_control_endpoint: SocketAddrV4,
    /// Connect-request payload (connection type + parameters).
    pub cri: Cri,
    /// When true, rewrite the declared data endpoint from the source
    /// observed on the connect response.
    pub use_nat: bool,
    /// Required when this connection uses a TCP shared-stream transport;
    /// ignored for UDP.
    pub stream_registry: Option<Arc<dyn StreamRegistry>>,
}

pub(crate) struct Inner {
    pub(crate) state: ConnState,
    pub(crate) kind: TransportKind,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) receiver_handle: Option<JoinHandle<()>>,
    pub(crate) control_endpoint: SocketAddrV4,
    pub(crate) data_endpoint: SocketAddrV4,
    pub(crate) local_hpai: Hpai,
    pub(crate) use_nat: bool,
    pub(crate) channel_id: u8,
    pub(crate) out_seq: u8,
    pub(crate) in_seq: u8,
    pub(crate) last_delivered_seq: Option<u8>,
    pub(crate) last_status: Option<String>,
    pub(crate) tunneling_address: Option<KnxAddress>,
    pub(crate) pending_seq: Option<u8>,
    pub(crate) ack_status: Option<u8>,
    pub(crate) confirmed: bool,
    pub(crate) disconnect_status: Option<u8>,
    pub(crate) pending_connect_error: Option<EngineError>,
}

impl Inner {
    fn new(kind: TransportKind) -> Inner {
        Inner {
            state: ConnState::Closed,
            kind,
            transport: None,
            receiver_handle: None,
            control_endpoint: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            data_endpoint: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            local_hpai: Hpai::udp(Ipv4Addr::UNSPECIFIED, 0),
            use_nat: false,
            channel_id: 0,
            out_seq: 0,
            in_seq: 0,
            last_delivered_seq: None,
            last_status: None,
            tunneling_address: None,
            pending_seq: None,
            ack_status: None,
            confirmed: false,
            disconnect_status: None,
            pending_connect_error: None,
        }
    }
}

/// Everything the receiver, the heartbeat and the caller's own thread share
/// for one connection, guarded by a single logical mutex (§5).
pub(crate) struct StateShared {
    pub(crate) conn_id: u32,
    pub(crate) profile: ConnectionProfile,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) cond: Condvar,
    pub(crate) heartbeat: Mutex<Option<Heartbeat>>,
    pub(crate) on_cemi: Mutex<Option<Box<dyn Fn(&[u8]) + Send + Sync>>>,
    pub(crate) cleanup_started: AtomicBool,
    /// Cooperative cancellation flag for an in-flight `connect` (§5, §7
    /// INTERRUPTED). Reset at the start of every `connect` call and
    /// consulted by `establish`'s connect-response wait.
    pub(crate) interrupted: AtomicBool,
}

/// A client-side KNXnet/IP connection: owns the wire codec, the transport,
/// the state machine and the heartbeat monitor for one logical channel.
pub struct Connection {
    shared: Arc<StateShared>,
}

impl Connection {
    /// Creates a connection in CLOSED state over the given transport kind
    /// and connection profile (tunneling or device management).
    pub fn new(kind: TransportKind, profile: ConnectionProfile) -> Connection {
        let profile = if kind == TransportKind::Tcp {
            profile.without_ack()
        } else {
            profile
        };

        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        debug!("connection {conn_id} created ({kind:?})");

        Connection {
            shared: Arc::new(StateShared {
                conn_id,
                profile,
                inner: Mutex::new(Inner::new(kind)),
                cond: Condvar::new(),
                heartbeat: Mutex::new(None),
                on_cemi: Mutex::new(None),
                cleanup_started: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
            }),
        }
    }

    /// Registers the callback invoked for every application-level payload
    /// delivered via an inbound service request, after its ack has been
    /// sent (§4.5). Replaces any previously registered callback.
    pub fn on_cemi<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.shared.on_cemi.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn state(&self) -> ConnState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn channel_id(&self) -> u8 {
        self.shared.inner.lock().unwrap().channel_id
    }

    pub fn tunneling_address(&self) -> Option<KnxAddress> {
        self.shared.inner.lock().unwrap().tunneling_address
    }

    pub fn outbound_sequence(&self) -> u8 {
        self.shared.inner.lock().unwrap().out_seq
    }

    /// The peer's most recent non-zero status text, if any (§3: "last
    /// textual status").
    pub fn last_status(&self) -> Option<String> {
        self.shared.inner.lock().unwrap().last_status.clone()
    }

    /// Drives CLOSED → CONNECTING → OK (or CLOSED on failure); see §4.3.
    pub fn connect(&self, params: ConnectParams) -> Result<(), EngineError> {
        if params.server_control_endpoint.ip().is_multicast() {
            return Err(EngineError::IllegalState(
                "server control endpoint must not be a multicast address",
            ));
        }

        let kind = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != ConnState::Closed {
                return Err(EngineError::IllegalState("connect requires state CLOSED"));
            }
            inner.state = ConnState::Connecting;
            inner.use_nat = params.use_nat;
            inner.control_endpoint = params.server_control_endpoint;
            inner.kind
        };
        self.shared.interrupted.store(false, Ordering::Release);

        match self.establish(kind, &params) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.cleanup("connect failed");
                Err(err)
            }
        }
    }

    fn establish(&self, kind: TransportKind, params: &ConnectParams) -> Result<(), EngineError> {
        let sink_shared = Arc::clone(&self.shared);
        let on_frame = Arc::new(move |header: Header, body: &[u8], src_ip: Ipv4Addr, src_port: u16| {
            sink_shared.on_frame(header, body, src_ip, src_port);
        });

        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Udp => {
                let udp = UdpTransport::bind(params.local_endpoint)?;
                let bound = udp.local_addr()?;
                let handle = udp.start_receiver(on_frame);

                let local_hpai = if params.use_nat {
                    Hpai::udp(Ipv4Addr::UNSPECIFIED, 0)
                } else {
                    Hpai::udp(*bound.ip(), bound.port())
                };

                let mut inner = self.shared.inner.lock().unwrap();
                inner.local_hpai = local_hpai;
                inner.receiver_handle = Some(handle);
                drop(inner);

                udp
            }
            TransportKind::Tcp => {
                let registry = params
                    .stream_registry
                    .clone()
                    .ok_or(EngineError::IllegalState("TCP connection requires a stream_registry"))?;

                let mut inner = self.shared.inner.lock().unwrap();
                inner.local_hpai = Hpai::route_back();
                drop(inner);

                Arc::new(TcpTransport::new(registry, on_frame))
            }
        };

        let local_hpai = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.transport = Some(Arc::clone(&transport));
            inner.local_hpai
        };

        let bytes = wire::encode_connect_request(&params.cri, &local_hpai, &local_hpai);
        let destination = match kind {
            TransportKind::Udp => Some(params.server_control_endpoint),
            TransportKind::Tcp => None,
        };
        transport.send(&bytes, destination)?;

        let inner = self.shared.inner.lock().unwrap();
        let (mut inner, timeout_result) = self
            .shared
            .cond
            .wait_timeout_while(inner, CONNECT_REQ_TIMEOUT, |i| {
                i.state == ConnState::Connecting && !self.shared.interrupted.load(Ordering::Acquire)
            })
            .unwrap();

        if inner.state == ConnState::Connecting {
            if self.shared.interrupted.swap(false, Ordering::AcqRel) {
                return Err(EngineError::Interrupted);
            }
            if timeout_result.timed_out() {
                return Err(EngineError::Timeout { what: "connect response" });
            }
        }

        match inner.state {
            ConnState::Ok => {
                drop(inner);
                self.start_heartbeat();
                Ok(())
            }
            _ => Err(inner
                .pending_connect_error
                .take()
                .unwrap_or_else(|| EngineError::format("connect did not reach state OK"))),
        }
    }

    fn start_heartbeat(&self) {
        let weak_for_probe: Weak<StateShared> = Arc::downgrade(&self.shared);
        let weak_for_exhausted: Weak<StateShared> = Arc::downgrade(&self.shared);

        let send_probe = move || -> Result<(), EngineError> {
            match weak_for_probe.upgrade() {
                Some(shared) => shared.send_heartbeat_probe(),
                None => Err(EngineError::IllegalState("connection dropped")),
            }
        };

        let on_exhausted = move || {
            if let Some(shared) = weak_for_exhausted.upgrade() {
                shared.cleanup("no heartbeat response");
            }
        };

        *self.shared.heartbeat.lock().unwrap() = Some(Heartbeat::start(send_probe, on_exhausted));
    }

    /// Submits a framed service request carrying the current outbound
    /// sequence number. Rejected unless state = OK; at most one request may
    /// be in flight per connection (§4.3).
    pub fn send(&self, cemi: &[u8]) -> Result<(), EngineError> {
        let (seq, transport, destination, channel_id, expects_ack, peer) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != ConnState::Ok {
                return Err(EngineError::IllegalState("send requires state OK"));
            }

            let seq = inner.out_seq;
            let expects_ack = self.shared.profile.expects_ack && inner.kind == TransportKind::Udp;
            inner.pending_seq = Some(seq);
            inner.ack_status = None;
            inner.confirmed = false;
            inner.state = if expects_ack { ConnState::WaitingAck } else { ConnState::CemiConPending };

            let destination = match inner.kind {
                TransportKind::Udp => Some(inner.data_endpoint),
                TransportKind::Tcp => None,
            };

            (seq, inner.transport.clone(), destination, inner.channel_id, expects_ack, inner.control_endpoint)
        };

        let transport = transport.ok_or(EngineError::IllegalState("connection has no transport"))?;
        let bytes = wire::encode_service_request(self.shared.profile.service_request, channel_id, seq, cemi);

        if expects_ack {
            let mut ack_status = None;

            for attempt in 1..=self.shared.profile.max_send_attempts {
                if let Err(err) = transport.send(&bytes, destination) {
                    self.shared.cleanup("communication failure");
                    return Err(err);
                }

                match self.shared.wait_for_ack(self.shared.profile.response_timeout) {
                    Some(status) => {
                        ack_status = Some(status);
                        break;
                    }
                    None if attempt < self.shared.profile.max_send_attempts => {
                        debug!("ack timeout for seq {seq}, retransmitting (attempt {attempt})");
                        continue;
                    }
                    None => {}
                }
            }

            match ack_status {
                Some(status) if status == wire::NO_ERROR => {
                    self.shared.advance_to_cemi_con_pending();
                }
                Some(status) => {
                    self.shared.fail_send_with_ack_error();
                    return Err(EngineError::remote(peer, status));
                }
                None => {
                    self.shared.revert_to_ok();
                    return Err(EngineError::Timeout { what: "service ack" });
                }
            }
        } else if let Err(err) = transport.send(&bytes, destination) {
            self.shared.cleanup("communication failure");
            return Err(err);
        }

        if !self.shared.wait_for_confirmation(CONFIRMATION_TIMEOUT) {
            warn!("cEMI confirmation timeout for seq {seq}");
            self.shared.revert_to_ok();
            return Err(EngineError::Timeout { what: "cEMI confirmation" });
        }

        self.shared.revert_to_ok();
        Ok(())
    }

    /// Cooperatively cancels an in-flight `connect` call from another
    /// thread. Wakes the connect-response wait immediately (rather than
    /// letting it run out `CONNECT_REQ_TIMEOUT`); the waiting `connect`
    /// then performs full cleanup (stop receiver, close socket, reach
    /// CLOSED) before returning `EngineError::Interrupted` (§5, §7). A call
    /// with no connect in flight, or arriving after the handshake already
    /// settled, is a harmless no-op.
    pub fn cancel(&self) {
        self.shared.interrupted.store(true, Ordering::Release);
        self.shared.cond.notify_all();
    }

    /// Locally initiated close: sends a disconnect request and waits a
    /// bounded time for the response before forcing CLOSED.
    pub fn close(&self) {
        let (transport, control_endpoint, channel_id, local_hpai) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == ConnState::Closed {
                return;
            }
            inner.state = ConnState::Closing;
            inner.disconnect_status = None;
            self.shared.cond.notify_all();
            (inner.transport.clone(), inner.control_endpoint, inner.channel_id, inner.local_hpai)
        };

        if let Some(transport) = &transport {
            let bytes = wire::encode_disconnect_request(channel_id, &local_hpai);
            if let Err(err) = transport.send(&bytes, Some(control_endpoint)) {
                warn!("failed to send disconnect request: {err}");
            }
        }

        if self.shared.wait_for_disconnect_response(DISCONNECT_RESPONSE_TIMEOUT).is_none() {
            debug!("no disconnect response within {DISCONNECT_RESPONSE_TIMEOUT:?}; forcing CLOSED");
        }

        self.shared.cleanup("local close");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.cleanup("connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    struct MockTransport {
        sent: StdMutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl MockTransport {
        fn new() -> Arc<MockTransport> {
            Arc::new(MockTransport {
                sent: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Udp
        }

        fn send(&self, bytes: &[u8], _destination: Option<SocketAddrV4>) -> Result<(), EngineError> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    const PEER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 3671);

    fn fast_profile() -> ConnectionProfile {
        let mut profile = ConnectionProfile::tunnel();
        profile.response_timeout = Duration::from_millis(50);
        profile.max_send_attempts = 2;
        profile
    }

    /// A connection wired up as though `connect` already succeeded, without
    /// touching real sockets: state OK, channel 42, a mock transport.
    fn connected_fixture() -> (Connection, Arc<MockTransport>) {
        let conn = Connection::new(TransportKind::Udp, fast_profile());
        let transport = MockTransport::new();
        {
            let mut inner = conn.shared.inner.lock().unwrap();
            inner.state = ConnState::Ok;
            inner.channel_id = 42;
            inner.control_endpoint = PEER;
            inner.data_endpoint = PEER;
            inner.local_hpai = Hpai::udp(Ipv4Addr::new(192, 0, 2, 2), 50000);
            inner.transport = Some(Arc::clone(&transport) as Arc<dyn Transport>);
        }
        (conn, transport)
    }

    fn deliver(conn: &Connection, bytes: &[u8]) {
        let (header, body) = wire::decode(bytes).unwrap();
        conn.shared.on_frame(header, body, *PEER.ip(), PEER.port());
    }

    #[test]
    fn send_success_with_ack_and_confirmation() {
        let (conn, transport) = connected_fixture();
        let shared = Arc::clone(&conn.shared);

        let responder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let ack = wire::encode_service_ack(wire::SVC_TUNNELING_ACK, 42, 0, wire::NO_ERROR);
            let (header, body) = wire::decode(&ack).unwrap();
            shared.on_frame(header, body, *PEER.ip(), PEER.port());

            thread::sleep(Duration::from_millis(10));
            let confirmation = wire::encode_service_request(wire::SVC_TUNNELING_REQ, 42, 0, &[0x11, 0x00]);
            let (header, body) = wire::decode(&confirmation).unwrap();
            shared.on_frame(header, body, *PEER.ip(), PEER.port());
        });

        let result = conn.send(&[0x29, 0x00, 0xBC]);
        responder.join().unwrap();

        assert!(result.is_ok());
        assert_eq!(conn.state(), ConnState::Ok);
        assert_eq!(conn.outbound_sequence(), 1);
        assert_eq!(transport.sent_count(), 2);
    }

    #[test]
    fn send_retransmits_once_then_succeeds() {
        let (conn, _transport) = connected_fixture();
        let shared = Arc::clone(&conn.shared);

        let responder = thread::spawn(move || {
            // past the first attempt's 50ms response_timeout, within the second's
            thread::sleep(Duration::from_millis(70));
            let ack = wire::encode_service_ack(wire::SVC_TUNNELING_ACK, 42, 0, wire::NO_ERROR);
            let (header, body) = wire::decode(&ack).unwrap();
            shared.on_frame(header, body, *PEER.ip(), PEER.port());

            // give the sender time to transition WAITING_ACK -> CEMI_CON_PENDING
            // before the confirmation arrives
            thread::sleep(Duration::from_millis(10));
            let confirmation = wire::encode_service_request(wire::SVC_TUNNELING_REQ, 42, 0, &[0x11]);
            let (header, body) = wire::decode(&confirmation).unwrap();
            shared.on_frame(header, body, *PEER.ip(), PEER.port());
        });

        let result = conn.send(&[0x29, 0x00, 0xBC]);
        responder.join().unwrap();

        assert!(result.is_ok());
        assert_eq!(conn.outbound_sequence(), 1);
    }

    #[test]
    fn send_fails_on_ack_error_status_without_advancing_sequence() {
        let (conn, _transport) = connected_fixture();
        let shared = Arc::clone(&conn.shared);

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let ack = wire::encode_service_ack(wire::SVC_TUNNELING_ACK, 42, 0, 0x21);
            let (header, body) = wire::decode(&ack).unwrap();
            shared.on_frame(header, body, *PEER.ip(), PEER.port());
        });

        let result = conn.send(&[0x29, 0x00, 0xBC]);

        match result {
            Err(EngineError::Remote { status, .. }) => assert_eq!(status, 0x21),
            other => panic!("expected a remote error, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnState::Ok);
        assert_eq!(conn.outbound_sequence(), 0);
        assert_eq!(conn.last_status().as_deref(), Some("E_CONNECTION_ID"));
    }

    #[test]
    fn send_rejected_unless_state_is_ok() {
        let conn = Connection::new(TransportKind::Udp, fast_profile());
        let result = conn.send(&[0x29]);
        assert!(matches!(result, Err(EngineError::IllegalState(_))));
    }

    #[test]
    fn peer_disconnect_from_control_endpoint_closes_the_connection() {
        let (conn, transport) = connected_fixture();

        let bytes = wire::encode_disconnect_request(42, &Hpai::route_back());
        deliver(&conn, &bytes);

        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.channel_id(), 0);
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn peer_disconnect_from_unexpected_source_is_ignored() {
        let (conn, transport) = connected_fixture();

        let bytes = wire::encode_disconnect_request(42, &Hpai::route_back());
        let (header, body) = wire::decode(&bytes).unwrap();
        conn.shared.on_frame(header, body, Ipv4Addr::new(198, 51, 100, 9), 3671);

        assert_eq!(conn.state(), ConnState::Ok);
        assert_eq!(transport.sent_count(), 0);
    }

    #[test]
    fn duplicate_inbound_sequence_is_reacked_not_redelivered() {
        let (conn, transport) = connected_fixture();
        let delivered: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let delivered = Arc::clone(&delivered);
            conn.on_cemi(move |payload| delivered.lock().unwrap().push(payload.to_vec()));
        }

        let bytes = wire::encode_service_request(wire::SVC_TUNNELING_REQ, 42, 5, &[0xAA]);
        deliver(&conn, &bytes);
        deliver(&conn, &bytes);

        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert_eq!(transport.sent_count(), 2);
    }

    #[test]
    fn mismatched_channel_id_is_discarded() {
        let (conn, transport) = connected_fixture();

        let bytes = wire::encode_service_request(wire::SVC_TUNNELING_REQ, 7, 0, &[0xAA]);
        deliver(&conn, &bytes);

        assert_eq!(transport.sent_count(), 0);
    }

    /// Exercises the literal 3-second `CONFIRMATION_TIMEOUT` constant from
    /// §4.3; genuinely slow, left unmarked to match the rest of the suite.
    #[test]
    fn send_times_out_waiting_for_confirmation_and_reverts_to_ok() {
        let (conn, _transport) = connected_fixture();
        let shared = Arc::clone(&conn.shared);

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let ack = wire::encode_service_ack(wire::SVC_TUNNELING_ACK, 42, 0, wire::NO_ERROR);
            let (header, body) = wire::decode(&ack).unwrap();
            shared.on_frame(header, body, *PEER.ip(), PEER.port());
        });

        let result = conn.send(&[0x29, 0x00, 0xBC]);

        match result {
            Err(EngineError::Timeout { what }) => assert_eq!(what, "cEMI confirmation"),
            other => panic!("expected a confirmation timeout, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnState::Ok);
    }

    /// Encodes the bytes a KNXnet/IP server would send back for a CONNECT_RES
    /// carrying a tunnel CRD. There is no library encoder for this direction
    /// (the engine is client-only, per spec.md's Non-goals), so the hand-rolled
    /// "server" thread in the tests below builds the frame directly, the same
    /// way `MockTransport`/`MockRegistry` stand in for the teacher's own
    /// hand-written test doubles rather than a mocking crate.
    fn build_connect_response(channel_id: u8, status: u8, data_hpai: Hpai, addr_high: u8, addr_low: u8) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(channel_id);
        body.push(status);
        data_hpai.write(&mut body).unwrap();
        body.push(4); // CRD length: 2-octet header + 2-octet tunnel payload
        body.push(0x04); // connection type: TUNNEL_CONNECTION
        body.push(addr_high);
        body.push(addr_low);

        let mut out = Vec::new();
        Header::write(&mut out, wire::SVC_CONNECT_RES, body.len()).unwrap();
        out.extend_from_slice(&body);
        out
    }

    /// Scenario 1 from spec.md §8 ("Happy UDP connect/tunnel/disconnect"),
    /// driven end to end through `Connection::connect`/`send`/`close` against
    /// two real loopback UDP sockets rather than a mocked transport — the
    /// handshake itself (channel-ID extraction, data-endpoint handling,
    /// tunnel-CRD/tunneling-address extraction) only runs inside `establish`,
    /// which `connected_fixture`-based tests never exercise.
    #[test]
    fn connect_drives_a_real_udp_handshake_to_ok_then_tunnels_and_disconnects() {
        use std::net::{SocketAddr, UdpSocket as StdUdpSocket};

        let server_socket = StdUdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        server_socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let server_addr = match server_socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound with an IPv4 local address"),
        };

        let server = thread::spawn(move || {
            let mut buf = [0u8; 2048];

            let (len, client_addr) = server_socket.recv_from(&mut buf).expect("connect request");
            let client_addr = match client_addr {
                SocketAddr::V4(addr) => addr,
                SocketAddr::V6(_) => unreachable!("client bound with an IPv4 local address"),
            };
            let (header, _body) = wire::decode(&buf[..len]).expect("valid connect request header");
            assert_eq!(header.service_type, wire::SVC_CONNECT_REQ);

            // channel 42, tunnel CRD carrying address 1.1.5, data endpoint
            // pointed back at this same socket (spec.md §8 scenario 1).
            let data_hpai = Hpai::udp(*server_addr.ip(), server_addr.port());
            let response = build_connect_response(42, wire::NO_ERROR, data_hpai, 0x11, 0x05);
            server_socket.send_to(&response, client_addr).unwrap();

            let (len, client_addr) = server_socket.recv_from(&mut buf).expect("tunneling request");
            let (header, body) = wire::decode(&buf[..len]).expect("valid tunneling request header");
            assert_eq!(header.service_type, wire::SVC_TUNNELING_REQ);
            let profile = ConnectionProfile::tunnel();
            match wire::decode_service(&header, body, &profile) {
                wire::ServiceFrame::ServiceRequest { channel_id, sequence, .. } => {
                    assert_eq!(channel_id, 42);
                    assert_eq!(sequence, 0);
                }
                other => panic!("expected a service request, got {other:?}"),
            }

            let ack = wire::encode_service_ack(wire::SVC_TUNNELING_ACK, 42, 0, wire::NO_ERROR);
            server_socket.send_to(&ack, client_addr).unwrap();

            let confirmation = wire::encode_service_request(wire::SVC_TUNNELING_REQ, 42, 0, &[0x11, 0x00]);
            server_socket.send_to(&confirmation, client_addr).unwrap();

            // the confirmation is itself an inbound service request as far as
            // the client's dispatch is concerned, so the client acks it back
            // before the application-visible `send` call returns; consume
            // that ack here so it doesn't get mistaken for the next step.
            let (len, _client_addr) = server_socket.recv_from(&mut buf).expect("ack of the echoed confirmation");
            let (header, _body) = wire::decode(&buf[..len]).expect("valid ack header");
            assert_eq!(header.service_type, wire::SVC_TUNNELING_ACK);

            let (len, client_addr) = server_socket.recv_from(&mut buf).expect("disconnect request");
            let (header, _body) = wire::decode(&buf[..len]).expect("valid disconnect request header");
            assert_eq!(header.service_type, wire::SVC_DISCONNECT_REQ);

            let disconnect_res = wire::encode_disconnect_response(42, wire::NO_ERROR);
            server_socket.send_to(&disconnect_res, client_addr).unwrap();
        });

        let conn = Connection::new(TransportKind::Udp, ConnectionProfile::tunnel());
        let params = ConnectParams {
            local_endpoint: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            server_control_endpoint: server_addr,
            cri: Cri::tunnel(),
            use_nat: false,
            stream_registry: None,
        };

        conn.connect(params).expect("handshake reaches OK");
        assert_eq!(conn.state(), ConnState::Ok);
        assert_eq!(conn.channel_id(), 42);
        assert_eq!(conn.tunneling_address().map(|a| a.to_string()).as_deref(), Some("1.1.5"));

        conn.send(&[0x11, 0x00]).expect("tunneling send succeeds");
        assert_eq!(conn.outbound_sequence(), 1);

        conn.close();
        assert_eq!(conn.state(), ConnState::Closed);

        server.join().expect("server thread completes without panicking");
    }

    /// A connect response reporting a non-zero status must close the
    /// connection and surface a remote error, matching §4.3's "Connect
    /// response with non-zero status" outcome — exercised over a real socket
    /// since it lives inside `establish`.
    #[test]
    fn connect_fails_and_reaches_closed_when_peer_rejects_with_an_error_status() {
        use std::net::{SocketAddr, UdpSocket as StdUdpSocket};

        let server_socket = StdUdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        server_socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let server_addr = match server_socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound with an IPv4 local address"),
        };

        let server = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let (_len, client_addr) = server_socket.recv_from(&mut buf).expect("connect request");
            let client_addr = match client_addr {
                SocketAddr::V4(addr) => addr,
                SocketAddr::V6(_) => unreachable!("client bound with an IPv4 local address"),
            };

            let mut body = Vec::new();
            body.push(0u8); // channel 0: unassigned, peer rejected before assigning one
            body.push(0x24); // E_NO_MORE_CONNECTIONS
            let mut out = Vec::new();
            Header::write(&mut out, wire::SVC_CONNECT_RES, body.len()).unwrap();
            out.extend_from_slice(&body);
            server_socket.send_to(&out, client_addr).unwrap();
        });

        let conn = Connection::new(TransportKind::Udp, ConnectionProfile::tunnel());
        let params = ConnectParams {
            local_endpoint: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            server_control_endpoint: server_addr,
            cri: Cri::tunnel(),
            use_nat: false,
            stream_registry: None,
        };

        match conn.connect(params) {
            Err(EngineError::Remote { status, .. }) => assert_eq!(status, 0x24),
            other => panic!("expected a remote error, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.last_status().as_deref(), Some("E_NO_MORE_CONNECTIONS"));

        server.join().expect("server thread completes without panicking");
    }

    /// §5/§7: a thread interrupt during `connect` performs full cleanup
    /// before propagating `EngineError::Interrupted`, rather than running out
    /// the full `CONNECT_REQ_TIMEOUT`.
    #[test]
    fn cancel_interrupts_an_in_flight_connect_and_reaches_closed() {
        let conn = Arc::new(Connection::new(TransportKind::Udp, ConnectionProfile::tunnel()));
        let canceller = Arc::clone(&conn);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });

        // A bound but otherwise silent loopback socket: the connect request
        // lands somewhere with no listener replying, so the wait would
        // otherwise run for the full `CONNECT_REQ_TIMEOUT`.
        let silent_peer = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let silent_peer_addr = match silent_peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            std::net::SocketAddr::V6(_) => unreachable!("bound with an IPv4 local address"),
        };

        let params = ConnectParams {
            local_endpoint: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            server_control_endpoint: silent_peer_addr,
            cri: Cri::tunnel(),
            use_nat: false,
            stream_registry: None,
        };

        let started = std::time::Instant::now();
        let result = conn.connect(params);

        assert!(matches!(result, Err(EngineError::Interrupted)));
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(started.elapsed() < CONNECT_REQ_TIMEOUT, "cancel should wake the wait long before the connect timeout");
    }

    /// `cancel` outside of any in-flight `connect` is a harmless no-op.
    #[test]
    fn cancel_without_a_pending_connect_does_nothing() {
        let conn = Connection::new(TransportKind::Udp, ConnectionProfile::tunnel());
        conn.cancel();
        assert_eq!(conn.state(), ConnState::Closed);
    }
}
