use std::time::Duration;

/// Parameters that distinguish one concrete connection kind (tunneling,
/// device management) from another, per Design Note §9's "capability
/// composition" replacement for the source's subclass hierarchy: a single
/// state-machine engine parameterized by a small profile record rather than
/// an abstract base class with concrete subclasses.
#[derive(Debug, Copy, Clone)]
pub struct ConnectionProfile {
    /// Outbound service type identifier for this connection kind.
    pub service_request: u16,
    /// Expected ack service type (UDP only).
    pub service_ack: u16,
    /// Whether the peer is expected to acknowledge a send (false on TCP).
    pub expects_ack: bool,
    /// Retransmission ceiling for a single request.
    pub max_send_attempts: u8,
    /// Per-attempt ack timeout.
    pub response_timeout: Duration,
}

impl ConnectionProfile {
    /// Tunneling connection: the common case, carrying cEMI frames to/from
    /// the bus.
    pub fn tunnel() -> ConnectionProfile {
        ConnectionProfile {
            service_request: crate::wire::SVC_TUNNELING_REQ,
            service_ack: crate::wire::SVC_TUNNELING_ACK,
            expects_ack: true,
            max_send_attempts: 2,
            response_timeout: Duration::from_secs(1),
        }
    }

    /// Device-management connection: configuration and property access on
    /// the KNXnet/IP server itself rather than the bus.
    pub fn device_management() -> ConnectionProfile {
        ConnectionProfile {
            service_request: crate::wire::SVC_DEVICE_CONFIGURATION_REQ,
            service_ack: crate::wire::SVC_DEVICE_CONFIGURATION_ACK,
            expects_ack: true,
            max_send_attempts: 2,
            response_timeout: Duration::from_secs(1),
        }
    }

    /// Returns a copy of this profile with acks disabled, for use over a
    /// TCP-shared-stream transport where the peer never emits a service ack
    /// (§4.2: "service acks are not emitted by the peer over TCP").
    pub fn without_ack(mut self) -> ConnectionProfile {
        self.expects_ack = false;
        self
    }
}
