//! `tokio_util` codec for the supported MQTT packets.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, Will};
use crate::errors::WireError;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

/// Largest value the four-byte remaining-length field can carry.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Frames [`Packet`]s. Inbound frames whose remaining length exceeds
/// `max_packet_size` are rejected; outbound frames are bounded only by what
/// the remaining-length field can carry.
#[derive(Clone, Copy, Debug)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    /// Codec with the given frame limit.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let Some((remaining, len_bytes)) = read_remaining_length(&src[1..])? else {
            return Ok(None);
        };
        if remaining > self.max_packet_size {
            return Err(WireError::PacketTooLarge {
                size: remaining,
                max: self.max_packet_size,
            });
        }

        let total = 1 + len_bytes + remaining;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let header = src[0];
        let mut body = src.split_to(total).freeze();
        body.advance(1 + len_bytes);
        decode_packet(header, body).map(Some)
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = WireError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), WireError> {
        let mut body = BytesMut::new();
        let header = match &packet {
            Packet::Connect(connect) => {
                encode_connect(connect, &mut body)?;
                CONNECT << 4
            }
            Packet::ConnAck(ack) => {
                body.put_u8(u8::from(ack.session_present));
                body.put_u8(ack.code as u8);
                CONNACK << 4
            }
            Packet::Publish(publish) => {
                put_string(&mut body, &publish.topic, "PUBLISH")?;
                if publish.qos != QoS::AtMostOnce {
                    let id = publish.packet_id.ok_or(WireError::Malformed {
                        packet: "PUBLISH",
                        reason: "QoS 1 without packet id",
                    })?;
                    body.put_u16(id);
                }
                body.extend_from_slice(&publish.payload);
                (PUBLISH << 4)
                    | (u8::from(publish.dup) << 3)
                    | ((publish.qos as u8) << 1)
                    | u8::from(publish.retain)
            }
            Packet::PubAck(id) => {
                body.put_u16(*id);
                PUBACK << 4
            }
            Packet::PingReq => PINGREQ << 4,
            Packet::PingResp => PINGRESP << 4,
            Packet::Disconnect => DISCONNECT << 4,
        };

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(WireError::PacketTooLarge {
                size: body.len(),
                max: MAX_REMAINING_LENGTH,
            });
        }
        dst.reserve(5 + body.len());
        dst.put_u8(header);
        write_remaining_length(body.len(), dst);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Decode the variable-length remaining-length field.
///
/// Returns the value and how many bytes it occupied, or `None` if more
/// bytes are needed.
fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    let mut value = 0usize;
    for (i, byte) in buf.iter().take(4).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        Err(WireError::MalformedLength)
    } else {
        Ok(None)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn write_remaining_length(mut len: usize, dst: &mut BytesMut) {
    loop {
        let mut byte = (len & 0x7F) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn decode_packet(header: u8, mut body: Bytes) -> Result<Packet, WireError> {
    let flags = header & 0x0F;
    match header >> 4 {
        CONNECT => decode_connect(&mut body).map(Packet::Connect),
        CONNACK => {
            need(&body, 2, "CONNACK")?;
            let session_present = body.get_u8() & 0x01 != 0;
            let code = ConnectReturnCode::from_u8(body.get_u8()).ok_or(WireError::Malformed {
                packet: "CONNACK",
                reason: "unknown return code",
            })?;
            Ok(Packet::ConnAck(ConnAck {
                session_present,
                code,
            }))
        }
        PUBLISH => decode_publish(flags, body).map(Packet::Publish),
        PUBACK => {
            need(&body, 2, "PUBACK")?;
            Ok(Packet::PubAck(body.get_u16()))
        }
        PINGREQ => Ok(Packet::PingReq),
        PINGRESP => Ok(Packet::PingResp),
        DISCONNECT => Ok(Packet::Disconnect),
        other => Err(WireError::Unsupported(other)),
    }
}

fn decode_connect(buf: &mut Bytes) -> Result<Connect, WireError> {
    const P: &str = "CONNECT";
    let protocol_name = read_string(buf, P)?;
    need(buf, 4, P)?;
    let protocol_level = buf.get_u8();
    let flags = buf.get_u8();
    let keep_alive = buf.get_u16();
    if flags & 0x01 != 0 {
        return Err(WireError::Malformed {
            packet: P,
            reason: "reserved flag set",
        });
    }

    let client_id = read_string(buf, P)?;
    let will = if flags & 0x04 != 0 {
        let topic = read_string(buf, P)?;
        let payload = read_binary(buf, P)?;
        Some(Will {
            topic,
            payload,
            qos: qos_from_bits((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(read_string(buf, P)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_binary(buf, P)?)
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_publish(flags: u8, mut body: Bytes) -> Result<Publish, WireError> {
    let qos = qos_from_bits((flags >> 1) & 0x03)?;
    let topic = read_string(&mut body, "PUBLISH")?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        need(&body, 2, "PUBLISH")?;
        Some(body.get_u16())
    };
    Ok(Publish {
        dup: flags & 0x08 != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: body,
    })
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), WireError> {
    const P: &str = "CONNECT";
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }

    put_string(body, &connect.protocol_name, P)?;
    body.put_u8(connect.protocol_level);
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    put_string(body, &connect.client_id, P)?;
    if let Some(will) = &connect.will {
        put_string(body, &will.topic, P)?;
        put_binary(body, &will.payload, P)?;
    }
    if let Some(username) = &connect.username {
        put_string(body, username, P)?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, password, P)?;
    }
    Ok(())
}

fn qos_from_bits(bits: u8) -> Result<QoS, WireError> {
    match bits {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Err(WireError::UnsupportedQos(2)),
        _ => Err(WireError::Malformed {
            packet: "PUBLISH",
            reason: "invalid QoS bits",
        }),
    }
}

fn need(buf: &Bytes, n: usize, packet: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::Malformed {
            packet,
            reason: "truncated",
        });
    }
    Ok(())
}

fn read_binary(buf: &mut Bytes, packet: &'static str) -> Result<Bytes, WireError> {
    need(buf, 2, packet)?;
    let len = usize::from(buf.get_u16());
    need(buf, len, packet)?;
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes, packet: &'static str) -> Result<String, WireError> {
    let raw = read_binary(buf, packet)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed {
        packet,
        reason: "invalid utf-8",
    })
}

fn put_binary(dst: &mut BytesMut, data: &[u8], packet: &'static str) -> Result<(), WireError> {
    let len = u16::try_from(data.len()).map_err(|_| WireError::Malformed {
        packet,
        reason: "field longer than 65535 bytes",
    })?;
    dst.put_u16(len);
    dst.extend_from_slice(data);
    Ok(())
}

fn put_string(dst: &mut BytesMut, s: &str, packet: &'static str) -> Result<(), WireError> {
    put_binary(dst, s.as_bytes(), packet)
}
