//! Routes decoded service frames to the connection state machine, the
//! heartbeat monitor, or the application's cEMI callback (§4.5).
//!
//! Every handler here runs on the transport's receiver thread (or, for
//! TCP, whichever thread drives the shared stream's registry) and executes
//! under `StateShared::inner`'s lock for as long as it touches connection
//! state. Sends performed in response to an inbound frame (a service ack,
//! a disconnect response) happen after the lock is released.

use crate::connection::ConnState;
use crate::error::EngineError;
use crate::transport::TransportKind;
use crate::wire::{self, HostProtocol, ServiceFrame};
use log::{debug, warn};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::connection::StateShared;

impl StateShared {
    pub(crate) fn on_frame(&self, header: wire::Header, body: &[u8], src_ip: Ipv4Addr, src_port: u16) {
        if !header.version_matches() {
            warn!(
                "connection {}: peer protocol version 0x{:02X} does not match ours; closing",
                self.conn_id, header.protocol_version
            );
            self.cleanup("protocol version changed");
            return;
        }

        match wire::decode_service(&header, body, &self.profile) {
            ServiceFrame::ConnectRequest { .. } => {
                warn!("connection {}: dropping CONNECT_REQ, clients do not serve one", self.conn_id);
            }
            ServiceFrame::ConnectResponse { channel_id, status, data_hpai, crd } => {
                self.handle_connect_response(channel_id, status, data_hpai, crd, src_ip, src_port);
            }
            ServiceFrame::ConnectionStateRequest { .. } => {
                warn!("connection {}: dropping CONNECTIONSTATE_REQ, clients do not serve one", self.conn_id);
            }
            ServiceFrame::ConnectionStateResponse { channel_id, status } => {
                self.handle_connectionstate_response(channel_id, status);
            }
            ServiceFrame::DisconnectRequest { channel_id, .. } => {
                self.handle_disconnect_request(channel_id, src_ip, src_port);
            }
            ServiceFrame::DisconnectResponse { channel_id, status } => {
                self.handle_disconnect_response(channel_id, status);
            }
            ServiceFrame::ServiceAck { channel_id, sequence, status } => {
                self.handle_service_ack(channel_id, sequence, status);
            }
            ServiceFrame::ServiceRequest { channel_id, sequence, payload } => {
                self.handle_service_request(channel_id, sequence, payload);
            }
            ServiceFrame::Unknown { service_type } => {
                debug!("connection {}: unhandled service type 0x{service_type:04X}", self.conn_id);
            }
        }
    }

    fn handle_connect_response(
        &self,
        channel_id: u8,
        status: u8,
        data_hpai: Option<crate::wire::Hpai>,
        crd: Option<crate::wire::Crd>,
        src_ip: Ipv4Addr,
        src_port: u16,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnState::Connecting {
            debug!("connection {}: ignoring CONNECT_RES in state {:?}", self.conn_id, inner.state);
            return;
        }

        if status != wire::NO_ERROR {
            inner.last_status = Some(wire::status_text(status));
            inner.state = ConnState::AckError;
            inner.pending_connect_error = Some(EngineError::remote(inner.control_endpoint, status));
            drop(inner);
            self.cleanup("connect rejected by peer");
            return;
        }

        let (data_hpai, crd) = match (data_hpai, crd) {
            (Some(h), Some(c)) => (h, c),
            _ => {
                inner.state = ConnState::UnknownError;
                inner.pending_connect_error = Some(EngineError::format("NO_ERROR connect response missing data HPAI/CRD"));
                drop(inner);
                self.cleanup("malformed connect response");
                return;
            }
        };

        let expected_protocol = match inner.kind {
            TransportKind::Udp => HostProtocol::Ipv4Udp,
            TransportKind::Tcp => HostProtocol::Ipv4Tcp,
        };
        if data_hpai.protocol != expected_protocol {
            inner.pending_connect_error =
                Some(EngineError::format("connect response data endpoint transport kind does not match"));
            drop(inner);
            self.cleanup("connect response transport kind mismatch");
            return;
        }

        let data_endpoint = match inner.kind {
            TransportKind::Tcp => {
                if !data_hpai.is_route_back() {
                    inner.pending_connect_error =
                        Some(EngineError::IllegalState("TCP connect response data endpoint must be route-back"));
                    drop(inner);
                    self.cleanup("non-route-back data endpoint over TCP");
                    return;
                }
                inner.control_endpoint
            }
            TransportKind::Udp => {
                if inner.use_nat && (data_hpai.addr.is_unspecified() || data_hpai.port == 0) {
                    SocketAddrV4::new(src_ip, src_port)
                } else {
                    SocketAddrV4::new(data_hpai.addr, data_hpai.port)
                }
            }
        };

        inner.channel_id = channel_id;
        inner.data_endpoint = data_endpoint;
        inner.tunneling_address = crd.tunneling_address();
        inner.state = ConnState::Ok;

        let transport = inner.transport.clone();
        drop(inner);

        if let Some(transport) = transport {
            transport.on_channel_assigned(channel_id);
        }

        debug!("connection {}: established, channel {channel_id}", self.conn_id);
        self.cond.notify_all();
    }

    fn handle_connectionstate_response(&self, channel_id: u8, status: u8) {
        {
            let inner = self.inner.lock().unwrap();
            if channel_id != inner.channel_id {
                warn!(
                    "connection {}: discarding CONNECTIONSTATE_RES for channel {channel_id}, expected {}",
                    self.conn_id, inner.channel_id
                );
                return;
            }
        }

        if let Some(heartbeat) = self.heartbeat.lock().unwrap().as_ref() {
            heartbeat.on_response(status);
        }
    }

    fn handle_disconnect_request(&self, channel_id: u8, src_ip: Ipv4Addr, src_port: u16) {
        let (transport, control_endpoint) = {
            let inner = self.inner.lock().unwrap();
            let source = SocketAddrV4::new(src_ip, src_port);
            if channel_id != inner.channel_id || source != inner.control_endpoint {
                warn!(
                    "connection {}: discarding DISCONNECT_REQ from {source} for channel {channel_id}",
                    self.conn_id
                );
                return;
            }
            (inner.transport.clone(), inner.control_endpoint)
        };

        if let Some(transport) = transport {
            let bytes = wire::encode_disconnect_response(channel_id, wire::NO_ERROR);
            if let Err(err) = transport.send(&bytes, Some(control_endpoint)) {
                warn!("connection {}: failed to send disconnect response: {err}", self.conn_id);
            }
        }

        debug!("connection {}: closing, disconnect requested by peer", self.conn_id);
        self.cleanup("server request");
    }

    fn handle_disconnect_response(&self, channel_id: u8, status: u8) {
        let mut inner = self.inner.lock().unwrap();
        if channel_id != inner.channel_id {
            warn!(
                "connection {}: discarding DISCONNECT_RES for channel {channel_id}, expected {}",
                self.conn_id, inner.channel_id
            );
            return;
        }
        if inner.state != ConnState::Closing {
            debug!("connection {}: unexpected DISCONNECT_RES in state {:?}", self.conn_id, inner.state);
            return;
        }
        if status != wire::NO_ERROR {
            warn!("connection {}: peer disconnect response carried status 0x{status:02X}", self.conn_id);
        }
        inner.disconnect_status = Some(status);
        self.cond.notify_all();
    }

    fn handle_service_ack(&self, channel_id: u8, sequence: u8, status: u8) {
        let mut inner = self.inner.lock().unwrap();
        if channel_id != inner.channel_id {
            warn!(
                "connection {}: discarding service ack for channel {channel_id}, expected {}",
                self.conn_id, inner.channel_id
            );
            return;
        }
        if inner.state != ConnState::WaitingAck {
            debug!("connection {}: unexpected service ack in state {:?}", self.conn_id, inner.state);
            return;
        }
        if inner.pending_seq != Some(sequence) {
            warn!(
                "connection {}: service ack sequence {sequence} does not match pending {:?}",
                self.conn_id, inner.pending_seq
            );
            return;
        }
        if status != wire::NO_ERROR {
            inner.last_status = Some(wire::status_text(status));
        }
        inner.ack_status = Some(status);
        self.cond.notify_all();
    }

    fn handle_service_request(&self, channel_id: u8, sequence: u8, payload: &[u8]) {
        let (transport, destination, ack_bytes, is_duplicate, was_pending) = {
            let mut inner = self.inner.lock().unwrap();
            if channel_id != inner.channel_id {
                warn!(
                    "connection {}: discarding service request for channel {channel_id}, expected {}",
                    self.conn_id, inner.channel_id
                );
                return;
            }

            let is_duplicate = inner.last_delivered_seq == Some(sequence);
            if !is_duplicate {
                inner.last_delivered_seq = Some(sequence);
                inner.in_seq = sequence.wrapping_add(1);
            }

            let was_pending = inner.state == ConnState::CemiConPending;
            if was_pending {
                inner.confirmed = true;
            }

            let ack_bytes = wire::encode_service_ack(self.profile.service_ack, channel_id, sequence, wire::NO_ERROR);
            let destination = match inner.kind {
                TransportKind::Udp => Some(inner.data_endpoint),
                TransportKind::Tcp => None,
            };

            (inner.transport.clone(), destination, ack_bytes, is_duplicate, was_pending)
        };

        if was_pending {
            self.cond.notify_all();
        }

        if let Some(transport) = transport {
            if let Err(err) = transport.send(&ack_bytes, destination) {
                warn!("connection {}: failed to ack service request: {err}", self.conn_id);
            }
        }

        if is_duplicate {
            debug!("connection {}: re-acked duplicate sequence {sequence}, not redelivered", self.conn_id);
            return;
        }

        if let Some(callback) = self.on_cemi.lock().unwrap().as_ref() {
            callback(payload);
        }
    }

    pub(crate) fn send_heartbeat_probe(&self) -> Result<(), EngineError> {
        let (transport, channel_id, control_endpoint, local_hpai) = {
            let inner = self.inner.lock().unwrap();
            (inner.transport.clone(), inner.channel_id, inner.control_endpoint, inner.local_hpai)
        };

        let transport = transport.ok_or(EngineError::IllegalState("connection has no transport"))?;
        let bytes = wire::encode_connectionstate_request(channel_id, &local_hpai);
        transport.send(&bytes, Some(control_endpoint))
    }

    pub(crate) fn wait_for_ack(&self, timeout: Duration) -> Option<u8> {
        let inner = self.inner.lock().unwrap();
        let (mut inner, _) = self.cond.wait_timeout_while(inner, timeout, |i| i.ack_status.is_none()).unwrap();
        inner.ack_status.take()
    }

    pub(crate) fn wait_for_confirmation(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        let (mut inner, _) = self.cond.wait_timeout_while(inner, timeout, |i| !i.confirmed).unwrap();
        let confirmed = inner.confirmed;
        inner.confirmed = false;
        confirmed
    }

    pub(crate) fn wait_for_disconnect_response(&self, timeout: Duration) -> Option<u8> {
        let inner = self.inner.lock().unwrap();
        let (mut inner, _) = self.cond.wait_timeout_while(inner, timeout, |i| i.disconnect_status.is_none()).unwrap();
        inner.disconnect_status.take()
    }

    pub(crate) fn advance_to_cemi_con_pending(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.out_seq = inner.out_seq.wrapping_add(1);
        inner.state = ConnState::CemiConPending;
        inner.ack_status = None;
    }

    pub(crate) fn fail_send_with_ack_error(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ConnState::AckError;
        inner.pending_seq = None;
        inner.ack_status = None;
        inner.state = ConnState::Ok;
        self.cond.notify_all();
    }

    pub(crate) fn revert_to_ok(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ConnState::Ok;
        inner.pending_seq = None;
        inner.ack_status = None;
        inner.confirmed = false;
        self.cond.notify_all();
    }

    /// One-shot teardown: transitions to CLOSED, tears down the transport
    /// and the heartbeat, and wakes every waiter. Collapses concurrent
    /// callers to the first (§5).
    pub(crate) fn cleanup(&self, reason: &str) {
        if self.cleanup_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let (transport, receiver_handle) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ConnState::Closed;
            inner.channel_id = 0;
            inner.pending_seq = None;
            inner.ack_status = None;
            inner.confirmed = false;
            self.cond.notify_all();
            (inner.transport.take(), inner.receiver_handle.take())
        };

        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(handle) = receiver_handle {
            let _ = handle.join();
        }
        if let Some(mut heartbeat) = self.heartbeat.lock().unwrap().take() {
            heartbeat.quit();
        }

        debug!("connection {}: cleaned up ({reason})", self.conn_id);
    }
}
