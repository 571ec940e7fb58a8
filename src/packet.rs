//! # MQTT Packet Structures and Serialization
//!
//! The MQTT 3.1.1 control packets a shadow session exchanges with the broker,
//! and the traits for encoding and decoding them to and from a byte buffer.
//! Decoders expect `buf` to hold exactly one complete packet, as delimited by
//! [`util::frame_length`](crate::util::frame_length).

use crate::error::{ConnectReasonCode, MqttError, ProtocolError};
use crate::transport::ErrorPlaceHolder;
use crate::util::{self, encode_with_header, read_u16, read_utf8_string, write_utf8_string};
use heapless::Vec;

type CodecResult<T> = Result<T, MqttError<ErrorPlaceHolder>>;

/// Maximum number of topic filters carried by a single SUBSCRIBE.
pub const MAX_FILTERS_PER_SUBSCRIBE: usize = 8;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError<ErrorPlaceHolder>;

    fn try_from(value: u8) -> CodecResult<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
        }
    }
}

/// A trait for packets that can be encoded into a byte buffer.
pub trait EncodePacket {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize>;
}

/// A trait for packets that can be decoded from a byte buffer.
pub trait DecodePacket<'a>: Sized {
    fn decode(buf: &'a [u8]) -> CodecResult<Self>;
}

/// An enumeration of all MQTT control packets a session handles.
#[derive(Debug)]
pub enum MqttPacket<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// Decodes one complete packet.
pub fn decode(buf: &[u8]) -> CodecResult<Option<MqttPacket<'_>>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let packet_type = first >> 4;
    let packet = match packet_type {
        1 => MqttPacket::Connect(Connect::decode(buf)?),
        2 => MqttPacket::ConnAck(ConnAck::decode(buf)?),
        3 => MqttPacket::Publish(Publish::decode(buf)?),
        4 => MqttPacket::PubAck(PubAck::decode(buf)?),
        8 => MqttPacket::Subscribe(Subscribe::decode(buf)?),
        9 => MqttPacket::SubAck(SubAck::decode(buf)?),
        12 => MqttPacket::PingReq,
        13 => MqttPacket::PingResp,
        14 => MqttPacket::Disconnect,
        _ => {
            return Err(MqttError::Protocol(ProtocolError::InvalidPacketType(
                packet_type,
            )));
        }
    };

    Ok(Some(packet))
}

/// Skips the fixed header, returning the cursor at the variable header and the end of the packet.
fn body_bounds(buf: &[u8]) -> CodecResult<(usize, usize)> {
    let mut cursor = 1;
    let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
    let end = cursor + remaining_len;
    if end > buf.len() {
        return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
    }
    Ok((cursor, end))
}

fn byte_at(buf: &[u8], cursor: usize) -> CodecResult<u8> {
    buf.get(cursor)
        .copied()
        .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))
}

// --- CONNECT Packet ---
#[derive(Debug)]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
        }
    }
}

impl EncodePacket for Connect<'_> {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        encode_with_header(buf, 0x10, |body| {
            let mut cursor = write_utf8_string(body, "MQTT")?;
            let fixed = body
                .get_mut(cursor..cursor + 4)
                .ok_or(MqttError::BufferTooSmall)?;
            // Protocol level 4 is MQTT 3.1.1.
            fixed[0] = 4;
            fixed[1] = if self.clean_session { 0x02 } else { 0x00 };
            fixed[2..4].copy_from_slice(&self.keep_alive.to_be_bytes());
            cursor += 4;
            cursor += write_utf8_string(&mut body[cursor..], self.client_id)?;
            Ok(cursor)
        })
    }
}

impl<'a> DecodePacket<'a> for Connect<'a> {
    fn decode(buf: &'a [u8]) -> CodecResult<Self> {
        let (mut cursor, _) = body_bounds(buf)?;
        let protocol = read_utf8_string(&mut cursor, buf)?;
        let level = byte_at(buf, cursor)?;
        if protocol != "MQTT" || level != 4 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        cursor += 1;
        let connect_flags = byte_at(buf, cursor)?;
        cursor += 1;
        let keep_alive = read_u16(&mut cursor, buf)?;
        let client_id = read_utf8_string(&mut cursor, buf)?;
        Ok(Self {
            clean_session: (connect_flags & 0x02) != 0,
            keep_alive,
            client_id,
        })
    }
}

// --- CONNACK Packet ---
#[derive(Debug)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReasonCode,
}

impl<'a> DecodePacket<'a> for ConnAck {
    fn decode(buf: &'a [u8]) -> CodecResult<Self> {
        let (cursor, end) = body_bounds(buf)?;
        if end - cursor != 2 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        Ok(Self {
            session_present: (buf[cursor] & 0x01) != 0,
            return_code: ConnectReasonCode::from(buf[cursor + 1]),
        })
    }
}

impl EncodePacket for ConnAck {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        let code = match self.return_code {
            ConnectReasonCode::Success => 0,
            ConnectReasonCode::UnacceptableProtocolVersion => 1,
            ConnectReasonCode::IdentifierRejected => 2,
            ConnectReasonCode::ServerUnavailable => 3,
            ConnectReasonCode::BadUserNameOrPassword => 4,
            ConnectReasonCode::NotAuthorized => 5,
            ConnectReasonCode::Other(code) => code,
        };
        let out = buf.get_mut(0..4).ok_or(MqttError::BufferTooSmall)?;
        out.copy_from_slice(&[0x20, 0x02, self.session_present as u8, code]);
        Ok(4)
    }
}

// --- PUBLISH Packet ---
#[derive(Debug)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub payload: &'a [u8],
    pub packet_id: Option<u16>,
}

impl<'a> Publish<'a> {
    pub fn new(topic: &'a str, payload: &'a [u8], qos: QoS, packet_id: Option<u16>) -> Self {
        Self {
            topic,
            qos,
            retain: false,
            payload,
            packet_id,
        }
    }
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(buf: &'a [u8]) -> CodecResult<Self> {
        let flags = byte_at(buf, 0)? & 0x0F;
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let (mut cursor, end) = body_bounds(buf)?;

        let topic = read_utf8_string(&mut cursor, buf)?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(read_u16(&mut cursor, buf)?)
        } else {
            None
        };
        if cursor > end {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }

        Ok(Publish {
            topic,
            qos,
            retain: (flags & 0x01) != 0,
            payload: &buf[cursor..end],
            packet_id,
        })
    }
}

impl EncodePacket for Publish<'_> {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        let header = 0x30 | ((self.qos as u8) << 1) | self.retain as u8;
        encode_with_header(buf, header, |body| {
            let mut cursor = write_utf8_string(body, self.topic)?;

            if self.qos != QoS::AtMostOnce {
                let id = self
                    .packet_id
                    .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
                body.get_mut(cursor..cursor + 2)
                    .ok_or(MqttError::BufferTooSmall)?
                    .copy_from_slice(&id.to_be_bytes());
                cursor += 2;
            }

            body.get_mut(cursor..cursor + self.payload.len())
                .ok_or(MqttError::BufferTooSmall)?
                .copy_from_slice(self.payload);
            Ok(cursor + self.payload.len())
        })
    }
}

// --- PUBACK Packet ---
#[derive(Debug, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
}

impl<'a> DecodePacket<'a> for PubAck {
    fn decode(buf: &'a [u8]) -> CodecResult<Self> {
        let (mut cursor, _) = body_bounds(buf)?;
        Ok(PubAck {
            packet_id: read_u16(&mut cursor, buf)?,
        })
    }
}

impl EncodePacket for PubAck {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        let out = buf.get_mut(0..4).ok_or(MqttError::BufferTooSmall)?;
        let [hi, lo] = self.packet_id.to_be_bytes();
        out.copy_from_slice(&[0x40, 0x02, hi, lo]);
        Ok(4)
    }
}

// --- SUBSCRIBE Packet ---
#[derive(Debug)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub topics: Vec<(&'a str, QoS), MAX_FILTERS_PER_SUBSCRIBE>,
}

impl<'a> Subscribe<'a> {
    /// Creates a new Subscribe packet with a single topic.
    pub fn new(packet_id: u16, topic: &'a str, qos: QoS) -> Self {
        let mut topics = Vec::new();
        let _ = topics.push((topic, qos));
        Self { packet_id, topics }
    }
}

impl<'a> DecodePacket<'a> for Subscribe<'a> {
    fn decode(buf: &'a [u8]) -> CodecResult<Self> {
        let (mut cursor, end) = body_bounds(buf)?;
        let packet_id = read_u16(&mut cursor, buf)?;

        let mut topics = Vec::new();
        while cursor < end {
            let topic = read_utf8_string(&mut cursor, buf)?;
            let qos = QoS::try_from(byte_at(buf, cursor)?)?;
            cursor += 1;
            topics
                .push((topic, qos))
                .map_err(|_| MqttError::Protocol(ProtocolError::TooManySubscriptions))?;
        }

        Ok(Subscribe { packet_id, topics })
    }
}

impl EncodePacket for Subscribe<'_> {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        // SUBSCRIBE carries the reserved flag bits 0b0010.
        encode_with_header(buf, 0x82, |body| {
            body.get_mut(0..2)
                .ok_or(MqttError::BufferTooSmall)?
                .copy_from_slice(&self.packet_id.to_be_bytes());
            let mut cursor = 2;

            for (topic, qos) in &self.topics {
                cursor += write_utf8_string(&mut body[cursor..], topic)?;
                *body.get_mut(cursor).ok_or(MqttError::BufferTooSmall)? = *qos as u8;
                cursor += 1;
            }
            Ok(cursor)
        })
    }
}

// --- SUBACK Packet ---

/// SUBACK return code signalling that the broker refused a topic filter.
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<u8, MAX_FILTERS_PER_SUBSCRIBE>,
}

impl SubAck {
    /// Whether the broker granted each of the `requested` filters.
    pub fn all_granted(&self, requested: usize) -> bool {
        requested > 0
            && self.return_codes.len() == requested
            && self.return_codes.iter().all(|&c| c != SUBACK_FAILURE)
    }
}

impl<'a> DecodePacket<'a> for SubAck {
    fn decode(buf: &'a [u8]) -> CodecResult<Self> {
        let (mut cursor, end) = body_bounds(buf)?;
        let packet_id = read_u16(&mut cursor, buf)?;

        let mut return_codes = Vec::new();
        while cursor < end {
            return_codes
                .push(buf[cursor])
                .map_err(|_| MqttError::Protocol(ProtocolError::MalformedPacket))?;
            cursor += 1;
        }

        Ok(SubAck {
            packet_id,
            return_codes,
        })
    }
}

impl EncodePacket for SubAck {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        encode_with_header(buf, 0x90, |body| {
            let len = 2 + self.return_codes.len();
            let out = body.get_mut(0..len).ok_or(MqttError::BufferTooSmall)?;
            out[0..2].copy_from_slice(&self.packet_id.to_be_bytes());
            out[2..].copy_from_slice(&self.return_codes);
            Ok(len)
        })
    }
}

/// Encodes one of the two-byte packets that carry no body.
fn encode_empty(buf: &mut [u8], header: u8) -> CodecResult<usize> {
    let out = buf.get_mut(0..2).ok_or(MqttError::BufferTooSmall)?;
    out.copy_from_slice(&[header, 0x00]);
    Ok(2)
}

// --- PINGREQ Packet ---
#[derive(Debug)]
pub struct PingReq;

impl EncodePacket for PingReq {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        encode_empty(buf, 0xC0)
    }
}

// --- PINGRESP Packet ---
#[derive(Debug)]
pub struct PingResp;

impl EncodePacket for PingResp {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        encode_empty(buf, 0xD0)
    }
}

// --- DISCONNECT Packet ---
#[derive(Debug)]
pub struct Disconnect;

impl EncodePacket for Disconnect {
    fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        encode_empty(buf, 0xE0)
    }
}
