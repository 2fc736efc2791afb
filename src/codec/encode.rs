//! MQTT Packet Encoder
//!
//! Encodes the client-side packet subset for both v3.1.1 and v5.0. The
//! server-side packets (CONNACK, SUBACK, PINGRESP) are encoded too so a
//! scripted peer can be driven from tests.

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int, PROPERTY_USER};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, PacketAck, ProtocolVersion, Publish, QoS, SubAck,
    Subscribe,
};

/// MQTT Packet Encoder
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => self.encode_ack(0x40, p, buf),
            Packet::PubRec(p) => self.encode_ack(0x50, p, buf),
            // PUBREL carries the mandatory 0010 flags
            Packet::PubRel(p) => self.encode_ack(0x62, p, buf),
            Packet::PubComp(p) => self.encode_ack(0x70, p, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                // Zero remaining length is a normal disconnect in both versions
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let is_v5 = packet.protocol_version == ProtocolVersion::V5;

        // Protocol name (2 + 4) + level + flags + keep alive
        let mut remaining_length = 10;
        if is_v5 {
            remaining_length += 1; // empty property block
        }
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, "MQTT")?;
        buf.put_u8(packet.protocol_version as u8);

        let mut connect_flags: u8 = 0;
        if packet.clean_start {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        if is_v5 {
            buf.put_u8(0x00);
        }

        write_string(buf, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = if self.is_v5() { 3 } else { 2 };

        buf.put_u8(0x20);
        write_variable_int(buf, remaining_length)?;
        buf.put_u8(u8::from(packet.session_present));
        buf.put_u8(packet.reason_code);
        if self.is_v5() {
            buf.put_u8(0x00);
        }
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let is_v5 = self.is_v5();

        let props_len: usize = if is_v5 {
            packet
                .user_properties
                .iter()
                .map(|(k, v)| 1 + 2 + k.len() + 2 + v.len())
                .sum()
        } else {
            0
        };

        let mut remaining_length = 2 + packet.topic.len();
        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }
        if is_v5 {
            remaining_length += variable_int_len(props_len as u32) + props_len;
        }
        remaining_length += packet.payload.len();

        let mut first_byte = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup {
            first_byte |= 0x08;
        }
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            let packet_id = packet.packet_id.ok_or(EncodeError::MissingPacketId)?;
            buf.put_u16(packet_id);
        }

        if is_v5 {
            write_variable_int(buf, props_len as u32)?;
            for (key, value) in &packet.user_properties {
                buf.put_u8(PROPERTY_USER);
                write_string(buf, key)?;
                write_string(buf, value)?;
            }
        }

        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn encode_ack(
        &self,
        first_byte: u8,
        packet: &PacketAck,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(first_byte);
        // v5.0 allows omitting the reason code when it is Success
        if self.is_v5() && packet.reason_code != 0 {
            buf.put_u8(0x04);
            buf.put_u16(packet.packet_id);
            buf.put_u8(packet.reason_code);
            buf.put_u8(0x00);
        } else {
            buf.put_u8(0x02);
            buf.put_u16(packet.packet_id);
        }
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2;
        if self.is_v5() {
            remaining_length += 1;
        }
        for (filter, _) in &packet.filters {
            remaining_length += 2 + filter.len() + 1;
        }

        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            buf.put_u8(0x00);
        }
        for (filter, qos) in &packet.filters {
            write_string(buf, filter)?;
            buf.put_u8(*qos as u8);
        }
        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.return_codes.len();
        if self.is_v5() {
            remaining_length += 1;
        }

        buf.put_u8(0x90);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            buf.put_u8(0x00);
        }
        buf.put_slice(&packet.return_codes);
        Ok(())
    }
}
