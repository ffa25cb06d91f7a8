//! Typed MQTT packets.

use bytes::Bytes;

/// Delivery guarantee of a PUBLISH.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged with PUBACK.
    AtLeastOnce = 1,
}

/// Last-will message carried in CONNECT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Will {
    /// Will topic.
    pub topic: String,
    /// Will payload.
    pub payload: Bytes,
    /// Will QoS.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

/// CONNECT variable header and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    /// `MQTT` (3.1.1) or `MQIsdp` (3.1).
    pub protocol_name: String,
    /// 4 for 3.1.1, 3 for 3.1.
    pub protocol_level: u8,
    /// Clean-session flag.
    pub clean_session: bool,
    /// Keep-alive in seconds; 0 disables it.
    pub keep_alive: u16,
    /// Client identifier.
    pub client_id: String,
    /// Optional last will.
    pub will: Option<Will>,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<Bytes>,
}

impl Connect {
    /// A 3.1.1 CONNECT with only a client id and keep-alive.
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            protocol_name: "MQTT".to_owned(),
            protocol_level: 4,
            clean_session: true,
            keep_alive,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }
}

/// CONNACK return code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    Accepted = 0,
    /// Protocol level not supported.
    UnacceptableProtocol = 1,
    /// Client id rejected.
    IdentifierRejected = 2,
    /// Server unavailable.
    ServerUnavailable = 3,
    /// Bad user name or password.
    BadCredentials = 4,
    /// Not authorized.
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub(crate) fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocol,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            _ => return None,
        })
    }
}

/// CONNACK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnAck {
    /// Session-present flag.
    pub session_present: bool,
    /// Return code.
    pub code: ConnectReturnCode,
}

impl ConnAck {
    /// Successful handshake acknowledgement.
    pub fn accepted() -> Self {
        Self {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        }
    }
}

/// PUBLISH.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publish {
    /// Redelivery flag.
    pub dup: bool,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Topic name.
    pub topic: String,
    /// Present iff `qos` is above [`QoS::AtMostOnce`].
    pub packet_id: Option<u16>,
    /// Message body.
    pub payload: Bytes,
}

impl Publish {
    /// A QoS 0 publish.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }
}

/// A decoded MQTT control packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// Client handshake.
    Connect(Connect),
    /// Handshake reply.
    ConnAck(ConnAck),
    /// Application message.
    Publish(Publish),
    /// QoS 1 acknowledgement.
    PubAck(u16),
    /// Keep-alive probe.
    PingReq,
    /// Keep-alive reply.
    PingResp,
    /// Clean disconnect.
    Disconnect,
}

impl Packet {
    /// Control packet name, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnAck(_) => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck(_) => "PUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}
