// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! MQTT 3.1.1 wire format

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MqttError;
use crate::packet::{
    Ack, ConnAck, Connect, ConnectReturnCode, OrderId, Packet, PacketType, Publish, Qos, SubAck,
    Subscribe, SubscribeReturnCode, Subscription, Unsubscribe, Will,
};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(MAX_REMAINING_LENGTH + 5)
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = MqttError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, MqttError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let mut remaining_length = 0usize;
        let mut multiplier = 1usize;
        let mut header_length = 1;
        loop {
            if header_length > 4 {
                return Err(MqttError::Malformed(
                    "remaining length exceeds four bytes".into(),
                ));
            }
            let Some(&byte) = src.get(header_length) else {
                return Ok(None);
            };
            remaining_length += usize::from(byte & 0x7F) * multiplier;
            multiplier *= 128;
            header_length += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }

        let frame_length = header_length + remaining_length;
        if frame_length > self.max_packet_size {
            return Err(MqttError::Malformed(format!(
                "packet of {frame_length} bytes exceeds limit of {}",
                self.max_packet_size
            )));
        }
        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_length).freeze();
        let first = frame.get_u8();
        frame.advance(header_length - 1);
        decode_packet(first, frame).map(Some)
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = MqttError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), MqttError> {
        let mut body = BytesMut::new();
        let first = encode_body(&packet, &mut body)?;

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(MqttError::Malformed(format!(
                "remaining length {} is not encodable",
                body.len()
            )));
        }

        dst.reserve(body.len() + 5);
        dst.put_u8(first);
        let mut length = body.len();
        loop {
            let mut byte = (length % 128) as u8;
            length /= 128;
            if length > 0 {
                byte |= 0x80;
            }
            dst.put_u8(byte);
            if length == 0 {
                break;
            }
        }
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn malformed(what: &str) -> MqttError {
    MqttError::Malformed(what.to_string())
}

fn read_u8(buf: &mut Bytes) -> Result<u8, MqttError> {
    if buf.remaining() < 1 {
        return Err(malformed("unexpected end of packet"));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16, MqttError> {
    if buf.remaining() < 2 {
        return Err(malformed("unexpected end of packet"));
    }
    Ok(buf.get_u16())
}

fn read_binary(buf: &mut Bytes) -> Result<Bytes, MqttError> {
    let length = usize::from(read_u16(buf)?);
    if buf.remaining() < length {
        return Err(malformed("length prefix past end of packet"));
    }
    Ok(buf.split_to(length))
}

fn read_string(buf: &mut Bytes) -> Result<String, MqttError> {
    let raw = read_binary(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| malformed("string is not valid UTF-8"))
}

fn put_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), MqttError> {
    let length = u16::try_from(data.len()).map_err(|_| malformed("field longer than 65535 bytes"))?;
    buf.put_u16(length);
    buf.put_slice(data);
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), MqttError> {
    put_binary(buf, value.as_bytes())
}

fn expect_flags(packet_type: PacketType, flags: u8, expected: u8) -> Result<(), MqttError> {
    if flags != expected {
        return Err(MqttError::Malformed(format!(
            "{packet_type:?} with invalid fixed header flags {flags:#06b}"
        )));
    }
    Ok(())
}

fn decode_packet(first: u8, mut body: Bytes) -> Result<Packet, MqttError> {
    let packet_type = PacketType::from_u8(first >> 4)
        .ok_or_else(|| MqttError::Malformed(format!("unknown packet type {}", first >> 4)))?;
    let flags = first & 0x0F;

    let packet = match packet_type {
        PacketType::Connect => {
            expect_flags(packet_type, flags, 0)?;
            Packet::Connect(decode_connect(&mut body)?)
        }
        PacketType::ConnAck => {
            expect_flags(packet_type, flags, 0)?;
            let acknowledge = read_u8(&mut body)?;
            let return_code = ConnectReturnCode::try_from(read_u8(&mut body)?)?;
            Packet::ConnAck(ConnAck {
                session_present: acknowledge & 0x01 != 0,
                return_code,
            })
        }
        PacketType::Publish => {
            let qos = Qos::try_from((flags >> 1) & 0x03)?;
            let topic = read_string(&mut body)?;
            let packet_id = match qos {
                Qos::AtMostOnce => None,
                _ => Some(read_u16(&mut body)?),
            };
            Packet::Publish(Publish {
                topic,
                qos,
                retain: flags & 0x01 != 0,
                dup: flags & 0x08 != 0,
                packet_id,
                payload: body.split_to(body.remaining()),
                order_id: OrderId::nil(),
            })
        }
        PacketType::PubAck => {
            expect_flags(packet_type, flags, 0)?;
            Packet::PubAck(Ack::new(read_u16(&mut body)?))
        }
        PacketType::PubRec => {
            expect_flags(packet_type, flags, 0)?;
            Packet::PubRec(Ack::new(read_u16(&mut body)?))
        }
        PacketType::PubRel => {
            expect_flags(packet_type, flags, 0b0010)?;
            Packet::PubRel(Ack::new(read_u16(&mut body)?))
        }
        PacketType::PubComp => {
            expect_flags(packet_type, flags, 0)?;
            Packet::PubComp(Ack::new(read_u16(&mut body)?))
        }
        PacketType::Subscribe => {
            expect_flags(packet_type, flags, 0b0010)?;
            let packet_id = read_u16(&mut body)?;
            let mut subscriptions = Vec::new();
            while body.has_remaining() {
                let topic_filter = read_string(&mut body)?;
                let options = read_u8(&mut body)?;
                if options & 0xFC != 0 {
                    return Err(malformed("reserved bits set in requested QoS"));
                }
                subscriptions.push(Subscription {
                    topic_filter,
                    qos: Qos::try_from(options)?,
                });
            }
            if subscriptions.is_empty() {
                return Err(malformed("SUBSCRIBE without topic filters"));
            }
            Packet::Subscribe(Subscribe {
                packet_id,
                subscriptions,
            })
        }
        PacketType::SubAck => {
            expect_flags(packet_type, flags, 0)?;
            let packet_id = read_u16(&mut body)?;
            let mut return_codes = Vec::new();
            while body.has_remaining() {
                let code = match body.get_u8() {
                    0x00 => SubscribeReturnCode::MaximumQos0,
                    0x01 => SubscribeReturnCode::MaximumQos1,
                    0x02 => SubscribeReturnCode::MaximumQos2,
                    0x80 => SubscribeReturnCode::Failure,
                    other => {
                        return Err(MqttError::Malformed(format!(
                            "invalid SUBACK return code {other:#04x}"
                        )))
                    }
                };
                return_codes.push(code);
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            expect_flags(packet_type, flags, 0b0010)?;
            let packet_id = read_u16(&mut body)?;
            let mut topic_filters = Vec::new();
            while body.has_remaining() {
                topic_filters.push(read_string(&mut body)?);
            }
            if topic_filters.is_empty() {
                return Err(malformed("UNSUBSCRIBE without topic filters"));
            }
            Packet::Unsubscribe(Unsubscribe {
                packet_id,
                topic_filters,
            })
        }
        PacketType::UnsubAck => {
            expect_flags(packet_type, flags, 0)?;
            Packet::UnsubAck(read_u16(&mut body)?)
        }
        PacketType::PingReq => {
            expect_flags(packet_type, flags, 0)?;
            Packet::PingReq
        }
        PacketType::PingResp => {
            expect_flags(packet_type, flags, 0)?;
            Packet::PingResp
        }
        PacketType::Disconnect => {
            expect_flags(packet_type, flags, 0)?;
            Packet::Disconnect
        }
    };

    if body.has_remaining() {
        return Err(MqttError::Malformed(format!(
            "{} trailing bytes after {packet_type:?}",
            body.remaining()
        )));
    }
    Ok(packet)
}

fn decode_connect(body: &mut Bytes) -> Result<Connect, MqttError> {
    let protocol_name = read_string(body)?;
    let level = read_u8(body)?;
    if protocol_name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(MqttError::Protocol(format!(
            "unsupported protocol '{protocol_name}' level {level}"
        )));
    }

    let flags = read_u8(body)?;
    if flags & 0x01 != 0 {
        return Err(malformed("reserved CONNECT flag set"));
    }
    let keep_alive = read_u16(body)?;
    let client_id = read_string(body)?;

    let will = if flags & 0x04 != 0 {
        let qos = Qos::try_from((flags >> 3) & 0x03)?;
        let topic = read_string(body)?;
        let payload = read_binary(body)?;
        Some(Will {
            topic,
            qos,
            retain: flags & 0x20 != 0,
            payload,
        })
    } else {
        if flags & 0x38 != 0 {
            return Err(malformed("will QoS or retain set without will flag"));
        }
        None
    };

    let user_name = if flags & 0x80 != 0 {
        Some(read_string(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_binary(body)?)
    } else {
        None
    };

    Ok(Connect {
        client_id,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        user_name,
        password,
        will,
    })
}

/// Write the variable header and payload of `packet` into `body`, returning
/// the first byte of the fixed header
fn encode_body(packet: &Packet, body: &mut BytesMut) -> Result<u8, MqttError> {
    let type_bits = (packet.packet_type() as u8) << 4;
    let first = match packet {
        Packet::Connect(connect) => {
            put_string(body, PROTOCOL_NAME)?;
            body.put_u8(PROTOCOL_LEVEL);

            let mut flags = 0u8;
            if connect.clean_session {
                flags |= 0x02;
            }
            if let Some(will) = &connect.will {
                flags |= 0x04 | (will.qos.as_u8() << 3);
                if will.retain {
                    flags |= 0x20;
                }
            }
            if connect.password.is_some() {
                flags |= 0x40;
            }
            if connect.user_name.is_some() {
                flags |= 0x80;
            }
            body.put_u8(flags);
            body.put_u16(connect.keep_alive);
            put_string(body, &connect.client_id)?;
            if let Some(will) = &connect.will {
                put_string(body, &will.topic)?;
                put_binary(body, &will.payload)?;
            }
            if let Some(user_name) = &connect.user_name {
                put_string(body, user_name)?;
            }
            if let Some(password) = &connect.password {
                put_binary(body, password)?;
            }
            type_bits
        }
        Packet::ConnAck(connack) => {
            body.put_u8(u8::from(connack.session_present));
            body.put_u8(connack.return_code as u8);
            type_bits
        }
        Packet::Publish(publish) => {
            put_string(body, &publish.topic)?;
            match (publish.qos, publish.packet_id) {
                (Qos::AtMostOnce, _) => {}
                (_, Some(packet_id)) => body.put_u16(packet_id),
                (_, None) => return Err(malformed("QoS>0 PUBLISH without packet identifier")),
            }
            body.put_slice(&publish.payload);
            type_bits
                | (u8::from(publish.dup) << 3)
                | (publish.qos.as_u8() << 1)
                | u8::from(publish.retain)
        }
        Packet::PubAck(ack) | Packet::PubRec(ack) | Packet::PubComp(ack) => {
            body.put_u16(ack.packet_id);
            type_bits
        }
        Packet::PubRel(ack) => {
            body.put_u16(ack.packet_id);
            type_bits | 0b0010
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            for subscription in &subscribe.subscriptions {
                put_string(body, &subscription.topic_filter)?;
                body.put_u8(subscription.qos.as_u8());
            }
            type_bits | 0b0010
        }
        Packet::SubAck(suback) => {
            body.put_u16(suback.packet_id);
            for code in &suback.return_codes {
                body.put_u8(*code as u8);
            }
            type_bits
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            for topic_filter in &unsubscribe.topic_filters {
                put_string(body, topic_filter)?;
            }
            type_bits | 0b0010
        }
        Packet::UnsubAck(packet_id) => {
            body.put_u16(*packet_id);
            type_bits
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => type_bits,
    };
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Option<Packet>, MqttError> {
        let mut buf = BytesMut::from(bytes);
        MqttCodec::default().decode(&mut buf)
    }

    #[test]
    fn decodes_connect_with_will_and_credentials() {
        let bytes = [
            0x10, 0x1B, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, // protocol
            0xEE, // user, password, will retain, will QoS 1, will, clean
            0x00, 0x3C, // keep alive 60
            0x00, 0x01, b'c', // client id
            0x00, 0x01, b'w', // will topic
            0x00, 0x02, b'b', b'y', // will payload
            0x00, 0x01, b'u', // user name
            0x00, 0x02, b'p', b'w', // password
        ];
        let Some(Packet::Connect(connect)) = decode_all(&bytes).expect("decode") else {
            panic!("expected CONNECT");
        };
        assert_eq!(connect.client_id, "c");
        assert!(connect.clean_session);
        assert_eq!(connect.keep_alive, 60);
        assert_eq!(connect.user_name.as_deref(), Some("u"));
        assert_eq!(connect.password.as_deref(), Some(&b"pw"[..]));
        let will = connect.will.expect("will");
        assert_eq!(will.topic, "w");
        assert_eq!(will.qos, Qos::AtLeastOnce);
        assert!(will.retain);
        assert_eq!(&will.payload[..], b"by");
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(&[0x40, 0x02, 0x00][..]);
        assert_eq!(codec.decode(&mut buf).expect("decode"), None);

        buf.put_u8(0x07);
        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(Packet::PubAck(Ack::new(7)))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn encodes_qos1_publish() {
        let publish = Publish::new("a/b", Qos::AtLeastOnce, "hi")
            .with_packet_id(10)
            .with_retain(true);
        let mut buf = BytesMut::new();
        MqttCodec::default()
            .encode(Packet::Publish(publish), &mut buf)
            .expect("encode");
        assert_eq!(
            &buf[..],
            &[0x33, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x0A, b'h', b'i']
        );
    }

    #[test]
    fn long_remaining_length_uses_continuation_bytes() {
        let payload = vec![0u8; 200];
        let publish = Publish::new("t", Qos::AtMostOnce, payload.clone());
        let mut buf = BytesMut::new();
        let mut codec = MqttCodec::default();
        codec.encode(Packet::Publish(publish), &mut buf).expect("encode");
        // 3 bytes of topic + 200 of payload = 203 = 0xCB 0x01
        assert_eq!(&buf[..3], &[0x30, 0xCB, 0x01]);

        let Some(Packet::Publish(decoded)) = codec.decode(&mut buf).expect("decode") else {
            panic!("expected PUBLISH");
        };
        assert_eq!(decoded.payload.len(), 200);
        assert_eq!(decoded.packet_id, None);
    }

    #[test]
    fn rejects_invalid_flags_and_qos() {
        // PUBREL must carry flags 0b0010
        assert!(matches!(
            decode_all(&[0x60, 0x02, 0x00, 0x01]),
            Err(MqttError::Malformed(_))
        ));
        // PUBLISH with QoS 3
        assert!(matches!(
            decode_all(&[0x36, 0x03, 0x00, 0x01, b't']),
            Err(MqttError::Malformed(_))
        ));
        // Five byte remaining length
        assert!(matches!(
            decode_all(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(MqttError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_packets_are_refused() {
        let mut codec = MqttCodec::new(8);
        let mut buf = BytesMut::from(&[0x30, 0x10][..]);
        assert!(matches!(codec.decode(&mut buf), Err(MqttError::Malformed(_))));
    }
}
