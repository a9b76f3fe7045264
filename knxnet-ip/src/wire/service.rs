use super::hpai::Hpai;
use super::{cri_crd::Crd, Cri, Header, NO_ERROR};
use crate::profile::ConnectionProfile;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const CONNECTION_HEADER_LEN: u8 = 4;

/// A decoded service-type body, keyed by the service type in the frame's
/// header. `Unknown` covers every service type this codec does not
/// recognize, including ones belonging to discovery, routing and the secure
/// session handshake; decoding never fails on them.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceFrame<'a> {
    ConnectRequest {
        cri: Cri,
        control_hpai: Hpai,
        data_hpai: Hpai,
    },
    ConnectResponse {
        channel_id: u8,
        status: u8,
        data_hpai: Option<Hpai>,
        crd: Option<Crd>,
    },
    ConnectionStateRequest {
        channel_id: u8,
        control_hpai: Hpai,
    },
    ConnectionStateResponse {
        channel_id: u8,
        status: u8,
    },
    DisconnectRequest {
        channel_id: u8,
        control_hpai: Hpai,
    },
    DisconnectResponse {
        channel_id: u8,
        status: u8,
    },
    ServiceAck {
        channel_id: u8,
        sequence: u8,
        status: u8,
    },
    ServiceRequest {
        channel_id: u8,
        sequence: u8,
        payload: &'a [u8],
    },
    Unknown {
        service_type: u16,
    },
}

fn write_header_and_body(service_type: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(super::HEADER_LEN + body.len());
    Header::write(&mut out, service_type, body.len()).expect("writing to a Vec never fails");
    out.extend_from_slice(body);
    out
}

pub fn encode_connect_request(cri: &Cri, control_hpai: &Hpai, data_hpai: &Hpai) -> Vec<u8> {
    let mut body = Vec::new();
    control_hpai.write(&mut body).unwrap();
    data_hpai.write(&mut body).unwrap();
    cri.write(&mut body).unwrap();
    write_header_and_body(super::SVC_CONNECT_REQ, &body)
}

pub fn encode_connectionstate_request(channel_id: u8, control_hpai: &Hpai) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u8(channel_id).unwrap();
    body.write_u8(0x00).unwrap();
    control_hpai.write(&mut body).unwrap();
    write_header_and_body(super::SVC_CONNECTIONSTATE_REQ, &body)
}

pub fn encode_disconnect_request(channel_id: u8, control_hpai: &Hpai) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u8(channel_id).unwrap();
    body.write_u8(0x00).unwrap();
    control_hpai.write(&mut body).unwrap();
    write_header_and_body(super::SVC_DISCONNECT_REQ, &body)
}

pub fn encode_disconnect_response(channel_id: u8, status: u8) -> Vec<u8> {
    let body = [channel_id, status];
    write_header_and_body(super::SVC_DISCONNECT_RES, &body)
}

/// Encodes an outbound tunneling or device-management service request
/// carrying a pre-assigned sequence number and an opaque (cEMI) payload.
pub fn encode_service_request(service_type: u16, channel_id: u8, sequence: u8, cemi: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + cemi.len());
    body.push(CONNECTION_HEADER_LEN);
    body.push(channel_id);
    body.push(sequence);
    body.push(0x00);
    body.extend_from_slice(cemi);
    write_header_and_body(service_type, &body)
}

/// Encodes a service ack for a received tunneling/device-management request.
pub fn encode_service_ack(service_type: u16, channel_id: u8, sequence: u8, status: u8) -> Vec<u8> {
    let body = [CONNECTION_HEADER_LEN, channel_id, sequence, status];
    write_header_and_body(service_type, &body)
}

fn read_connection_header(cursor: &mut Cursor<&[u8]>) -> std::io::Result<(u8, u8, u8)> {
    let _len = cursor.read_u8()?;
    let channel_id = cursor.read_u8()?;
    let sequence = cursor.read_u8()?;
    let last = cursor.read_u8()?;
    Ok((channel_id, sequence, last))
}

/// Decodes a service body given an already-decoded header, recognizing the
/// fixed connection-lifecycle service types plus the tunneling/device
/// management pair configured in `profile`.
pub fn decode_service<'a>(header: &Header, body: &'a [u8], profile: &ConnectionProfile) -> ServiceFrame<'a> {
    match decode_inner(header.service_type, body, profile) {
        Some(frame) => frame,
        None => ServiceFrame::Unknown {
            service_type: header.service_type,
        },
    }
}

fn decode_inner<'a>(service_type: u16, body: &'a [u8], profile: &ConnectionProfile) -> Option<ServiceFrame<'a>> {
    let mut cursor = Cursor::new(body);

    Some(match service_type {
        super::SVC_CONNECT_REQ => {
            let control_hpai = Hpai::read(&mut cursor).ok()?;
            let data_hpai = Hpai::read(&mut cursor).ok()?;
            let len = cursor.read_u8().ok()?;
            let connection_type = super::cri_crd::ConnectionType::from_octet(cursor.read_u8().ok()?);
            let mut payload = vec![0u8; (len as usize).saturating_sub(2)];
            std::io::Read::read_exact(&mut cursor, &mut payload).ok()?;
            ServiceFrame::ConnectRequest {
                cri: Cri {
                    connection_type,
                    payload,
                },
                control_hpai,
                data_hpai,
            }
        }
        super::SVC_CONNECT_RES => {
            let channel_id = cursor.read_u8().ok()?;
            let status = cursor.read_u8().ok()?;

            if status != NO_ERROR {
                return Some(ServiceFrame::ConnectResponse {
                    channel_id,
                    status,
                    data_hpai: None,
                    crd: None,
                });
            }

            let data_hpai = Hpai::read(&mut cursor).ok()?;
            let crd = Crd::read(&mut cursor).ok()?;

            ServiceFrame::ConnectResponse {
                channel_id,
                status,
                data_hpai: Some(data_hpai),
                crd: Some(crd),
            }
        }
        super::SVC_CONNECTIONSTATE_REQ => {
            let channel_id = cursor.read_u8().ok()?;
            let _reserved = cursor.read_u8().ok()?;
            let control_hpai = Hpai::read(&mut cursor).ok()?;
            ServiceFrame::ConnectionStateRequest {
                channel_id,
                control_hpai,
            }
        }
        super::SVC_CONNECTIONSTATE_RES => {
            let channel_id = cursor.read_u8().ok()?;
            let status = cursor.read_u8().ok()?;
            ServiceFrame::ConnectionStateResponse { channel_id, status }
        }
        super::SVC_DISCONNECT_REQ => {
            let channel_id = cursor.read_u8().ok()?;
            let _reserved = cursor.read_u8().ok()?;
            let control_hpai = Hpai::read(&mut cursor).ok()?;
            ServiceFrame::DisconnectRequest {
                channel_id,
                control_hpai,
            }
        }
        super::SVC_DISCONNECT_RES => {
            let channel_id = cursor.read_u8().ok()?;
            let status = cursor.read_u8().ok()?;
            ServiceFrame::DisconnectResponse { channel_id, status }
        }
        svc if svc == profile.service_ack => {
            let (channel_id, sequence, status) = read_connection_header(&mut cursor).ok()?;
            ServiceFrame::ServiceAck {
                channel_id,
                sequence,
                status,
            }
        }
        svc if svc == profile.service_request => {
            let (channel_id, sequence, _reserved) = read_connection_header(&mut cursor).ok()?;
            let consumed = cursor.position() as usize;
            ServiceFrame::ServiceRequest {
                channel_id,
                sequence,
                payload: &body[consumed..],
            }
        }
        _ => return None,
    })
}
