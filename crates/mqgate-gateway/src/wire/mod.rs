//! MQTT 3.1.1 subset: CONNECT, CONNACK, PUBLISH (QoS 0/1), PUBACK,
//! PINGREQ, PINGRESP, DISCONNECT.

mod codec;
mod packet;

pub use codec::MqttCodec;
pub use packet::{ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, Will};
