//! MQTT Packet Decoder
//!
//! Decodes the client-side packet subset for both v3.1.1 and v5.0.

use bytes::Bytes;

use super::{
    read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH, PROPERTY_USER,
};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PacketAck, ProtocolVersion, Publish, QoS, SubAck,
    Subscribe,
};

/// MQTT Packet Decoder
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: ProtocolVersion,
}

impl Decoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: version,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), or `None` while the frame is incomplete
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => Packet::Connect(Box::new(self.decode_connect(body)?)),
            2 => Packet::ConnAck(self.decode_connack(body)?),
            3 => Packet::Publish(self.decode_publish(flags, body)?),
            4 => Packet::PubAck(self.decode_ack(body)?),
            5 => Packet::PubRec(self.decode_ack(body)?),
            6 => Packet::PubRel(self.decode_ack(body)?),
            7 => Packet::PubComp(self.decode_ack(body)?),
            8 => Packet::Subscribe(self.decode_subscribe(body)?),
            9 => Packet::SubAck(self.decode_suback(body)?),
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => Packet::Disconnect,
            other => return Err(DecodeError::InvalidPacketType(other)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&self, body: &[u8]) -> Result<Connect, DecodeError> {
        let mut pos = 0;

        let (name, len) = read_string(body)?;
        if name != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }
        pos += len;

        let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        let protocol_version =
            ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        pos += 1;

        let flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if flags & 0x04 != 0 {
            return Err(DecodeError::MalformedPacket("will messages are not supported"));
        }

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        if protocol_version == ProtocolVersion::V5 {
            let (_, len) = decode_properties(&body[pos..])?;
            pos += len;
        }

        let (client_id, len) = read_string(&body[pos..])?;
        pos += len;

        let username = if flags & 0x80 != 0 {
            let (username, len) = read_string(&body[pos..])?;
            pos += len;
            Some(username.to_string())
        } else {
            None
        };

        let password = if flags & 0x40 != 0 {
            let (password, _) = read_binary(&body[pos..])?;
            Some(Bytes::copy_from_slice(password))
        } else {
            None
        };

        Ok(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_start: flags & 0x02 != 0,
            keep_alive,
            username,
            password,
        })
    }

    fn decode_connack(&self, body: &[u8]) -> Result<ConnAck, DecodeError> {
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        Ok(ConnAck {
            session_present: body[0] & 0x01 != 0,
            reason_code: body[1],
        })
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Publish, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        let mut pos = 0;
        let (topic, len) = read_string(body)?;
        pos += len;

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        let user_properties = if self.is_v5() {
            let (props, len) = decode_properties(&body[pos..])?;
            pos += len;
            props
        } else {
            Vec::new()
        };

        Ok(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
            user_properties,
        })
    }

    fn decode_ack(&self, body: &[u8]) -> Result<PacketAck, DecodeError> {
        let packet_id = read_u16(body)?;
        // v5.0 omits the reason code when it is Success
        let reason_code = if self.is_v5() {
            body.get(2).copied().unwrap_or(0)
        } else {
            0
        };
        Ok(PacketAck {
            packet_id,
            reason_code,
        })
    }

    fn decode_subscribe(&self, body: &[u8]) -> Result<Subscribe, DecodeError> {
        let packet_id = read_u16(body)?;
        let mut pos = 2;
        if self.is_v5() {
            let (_, len) = decode_properties(&body[pos..])?;
            pos += len;
        }

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;
            let options = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            let qos_bits = options & 0x03;
            let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
            filters.push((filter.to_string(), qos));
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
        }

        Ok(Subscribe { packet_id, filters })
    }

    fn decode_suback(&self, body: &[u8]) -> Result<SubAck, DecodeError> {
        let packet_id = read_u16(body)?;
        let mut pos = 2;
        if self.is_v5() {
            let (_, len) = decode_properties(&body[pos..])?;
            pos += len;
        }
        Ok(SubAck {
            packet_id,
            return_codes: body[pos..].to_vec(),
        })
    }
}

/// Decode a v5.0 property block, keeping user properties and skipping the rest.
/// Returns (user_properties, bytes_consumed)
fn decode_properties(buf: &[u8]) -> Result<(Vec<(String, String)>, usize), DecodeError> {
    let (props_len, len_bytes) = read_variable_int(buf)?;
    let end = len_bytes + props_len as usize;
    if buf.len() < end {
        return Err(DecodeError::InsufficientData);
    }

    let mut user_properties = Vec::new();
    let mut pos = len_bytes;
    while pos < end {
        let id = buf[pos];
        pos += 1;
        let rest = &buf[pos..end];
        pos += match id {
            PROPERTY_USER => {
                let (key, key_len) = read_string(rest)?;
                let (value, value_len) = read_string(&rest[key_len..])?;
                user_properties.push((key.to_string(), value.to_string()));
                key_len + value_len
            }
            // Byte
            0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => 1,
            // Two Byte Integer
            0x13 | 0x21 | 0x22 | 0x23 => 2,
            // Four Byte Integer
            0x02 | 0x11 | 0x18 | 0x27 => 4,
            // Variable Byte Integer
            0x0B => read_variable_int(rest)?.1,
            // UTF-8 string or binary data
            0x03 | 0x08 | 0x09 | 0x12 | 0x15 | 0x16 | 0x1A | 0x1C | 0x1F => read_binary(rest)?.1,
            other => return Err(DecodeError::InvalidPropertyId(other)),
        };
        if pos > end {
            return Err(DecodeError::MalformedPacket("property overruns block"));
        }
    }

    Ok((user_properties, end))
}
