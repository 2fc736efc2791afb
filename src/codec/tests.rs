//! Codec tests for the client-side packet subset

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PacketAck, ProtocolVersion, Publish, QoS, SubAck,
    Subscribe,
};

fn encode_packet(packet: &Packet, version: ProtocolVersion) -> BytesMut {
    let encoder = Encoder::new(version);
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8], version: ProtocolVersion) -> Result<Packet, DecodeError> {
    match Decoder::new(version).decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

#[test]
fn test_connect_with_credentials_v5() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: "bridge-sink".to_string(),
        clean_start: false,
        keep_alive: 30,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
    }));

    let encoded = encode_packet(&packet, ProtocolVersion::V5);
    // CONNECT, remaining length, then "MQTT" with level 5
    assert_eq!(encoded[0], 0x10);
    assert_eq!(&encoded[2..8], b"\x00\x04MQTT");
    assert_eq!(encoded[8], 5);
    // username + password flags, clean start cleared
    assert_eq!(encoded[9], 0xC0);

    assert_eq!(decode_packet(&encoded, ProtocolVersion::V5).unwrap(), packet);
}

#[test]
fn test_connect_v311_has_no_property_block() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: "c".to_string(),
        ..Default::default()
    }));

    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    // 10 byte variable header + 3 byte client id
    assert_eq!(encoded[1], 13);
    assert_eq!(decode_packet(&encoded, ProtocolVersion::V311).unwrap(), packet);
}

#[test]
fn test_connack_reason_code() {
    let refused = Packet::ConnAck(ConnAck {
        session_present: false,
        reason_code: 0x87,
    });
    let encoded = encode_packet(&refused, ProtocolVersion::V5);
    assert_eq!(&encoded[..], &[0x20, 0x03, 0x00, 0x87, 0x00]);
    assert_eq!(decode_packet(&encoded, ProtocolVersion::V5).unwrap(), refused);
}

#[test]
fn test_publish_v5_user_properties_survive() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "logs/app".to_string(),
        packet_id: Some(7),
        payload: Bytes::from_static(b"{\"level\":\"ERROR\"}"),
        user_properties: vec![
            ("trace-id".to_string(), "abc".to_string()),
            ("env".to_string(), "prod".to_string()),
        ],
        ..Default::default()
    });

    let encoded = encode_packet(&packet, ProtocolVersion::V5);
    assert_eq!(encoded[0], 0x32);
    assert_eq!(decode_packet(&encoded, ProtocolVersion::V5).unwrap(), packet);
}

#[test]
fn test_publish_v311_drops_user_properties() {
    let packet = Publish {
        qos: QoS::AtMostOnce,
        retain: true,
        topic: "out/x".to_string(),
        payload: Bytes::from_static(b"hi"),
        user_properties: vec![("k".to_string(), "v".to_string())],
        ..Default::default()
    };

    let encoded = encode_packet(&Packet::Publish(packet.clone()), ProtocolVersion::V311);
    assert_eq!(&encoded[..], b"\x31\x09\x00\x05out/xhi");

    let decoded = decode_packet(&encoded, ProtocolVersion::V311).unwrap();
    let expected = Publish {
        user_properties: Vec::new(),
        ..packet
    };
    assert_eq!(decoded, Packet::Publish(expected));
}

#[test]
fn test_publish_qos1_without_packet_id_fails() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "t".to_string(),
        ..Default::default()
    });
    let mut buf = BytesMut::new();
    let err = Encoder::new(ProtocolVersion::V5)
        .encode(&packet, &mut buf)
        .unwrap_err();
    assert_eq!(err, crate::protocol::EncodeError::MissingPacketId);
}

#[test]
fn test_publish_skips_other_v5_properties() {
    // topic "t", packet id 1, properties: message expiry (0x02, u32),
    // content type (0x03, string), user property (0x26), then payload "p"
    let mut body = vec![0x00, 0x01, b't', 0x00, 0x01];
    let props: Vec<u8> = [
        &[0x02, 0, 0, 0, 60][..],
        &[0x03, 0x00, 0x04][..],
        b"json",
        &[0x26, 0x00, 0x01, b'a', 0x00, 0x01, b'b'][..],
    ]
    .concat();
    body.push(props.len() as u8);
    body.extend_from_slice(&props);
    body.push(b'p');

    let mut frame = vec![0x32, body.len() as u8];
    frame.extend_from_slice(&body);

    match decode_packet(&frame, ProtocolVersion::V5).unwrap() {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "t");
            assert_eq!(publish.packet_id, Some(1));
            assert_eq!(publish.payload, Bytes::from_static(b"p"));
            assert_eq!(
                publish.user_properties,
                vec![("a".to_string(), "b".to_string())]
            );
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_unknown_property_is_rejected() {
    let frame = [0x30, 0x05, 0x00, 0x01, b't', 0x01, 0x7F];
    assert_eq!(
        decode_packet(&frame, ProtocolVersion::V5),
        Err(DecodeError::InvalidPropertyId(0x7F))
    );
}

#[test]
fn test_pubrel_fixed_header_flags() {
    let encoded = encode_packet(&Packet::PubRel(PacketAck::new(9)), ProtocolVersion::V311);
    assert_eq!(&encoded[..], &[0x62, 0x02, 0x00, 0x09]);
}

#[test]
fn test_v5_ack_reason_code() {
    let ack = Packet::PubAck(PacketAck {
        packet_id: 3,
        reason_code: 0x87,
    });
    let encoded = encode_packet(&ack, ProtocolVersion::V5);
    assert_eq!(&encoded[..], &[0x40, 0x04, 0x00, 0x03, 0x87, 0x00]);
    assert_eq!(decode_packet(&encoded, ProtocolVersion::V5).unwrap(), ack);

    // Short form means success
    let short = [0x40, 0x02, 0x00, 0x03];
    assert_eq!(
        decode_packet(&short, ProtocolVersion::V5).unwrap(),
        Packet::PubAck(PacketAck::new(3))
    );
}

#[test]
fn test_subscribe_and_suback() {
    let subscribe = Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![
            ("$share/bridge/logs/#".to_string(), QoS::AtLeastOnce),
            ("metrics/+".to_string(), QoS::AtMostOnce),
        ],
    });
    for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
        let encoded = encode_packet(&subscribe, version);
        assert_eq!(encoded[0], 0x82);
        assert_eq!(decode_packet(&encoded, version).unwrap(), subscribe);
    }

    let suback = Packet::SubAck(SubAck {
        packet_id: 1,
        return_codes: vec![0x01, 0x80],
    });
    let encoded = encode_packet(&suback, ProtocolVersion::V5);
    assert_eq!(decode_packet(&encoded, ProtocolVersion::V5).unwrap(), suback);
}

#[test]
fn test_partial_frame_returns_none() {
    let packet = Packet::Publish(Publish {
        topic: "partial".to_string(),
        payload: Bytes::from(vec![0u8; 300]),
        ..Default::default()
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoder = Decoder::new(ProtocolVersion::V311);

    // Two-byte remaining length split across reads
    assert_eq!(decoder.decode(&encoded[..2]).unwrap(), None);
    assert_eq!(decoder.decode(&encoded[..encoded.len() - 1]).unwrap(), None);
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn test_two_frames_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingResp, ProtocolVersion::V5);
    buf.extend_from_slice(&encode_packet(
        &Packet::PubComp(PacketAck::new(4)),
        ProtocolVersion::V5,
    ));

    let decoder = Decoder::new(ProtocolVersion::V5);
    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    let (second, _) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubComp(PacketAck::new(4)));
}

#[test]
fn test_oversized_packet_rejected() {
    let packet = Packet::Publish(Publish {
        topic: "big".to_string(),
        payload: Bytes::from(vec![0u8; 64]),
        ..Default::default()
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    let decoder = Decoder::new(ProtocolVersion::V311).with_max_packet_size(16);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

mod proptest_tests {
    use crate::codec::{read_variable_int, write_variable_int};
    use bytes::BytesMut;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_variable_int_roundtrip(value in 0u32..268_435_455u32) {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap();
            prop_assert_eq!(value, decoded);
            prop_assert_eq!(written, consumed);
        }
    }
}
