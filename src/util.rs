//! # MQTT Serialization Utilities
//!
//! Helpers for reading and writing MQTT-specific data types from and to byte
//! buffers: variable-byte integers, length-prefixed strings and packet framing.

use crate::error::{MqttError, ProtocolError};
use crate::transport::ErrorPlaceHolder;

/// Largest value a four-byte variable-byte integer can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Reads a variable-byte integer from the buffer, advancing the cursor.
///
/// This is the encoding MQTT uses for the remaining length of every packet.
pub fn read_variable_byte_integer(
    cursor: &mut usize,
    buf: &[u8],
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    let mut multiplier = 1;
    let mut value = 0;
    let mut i = 0;
    loop {
        let encoded_byte = buf
            .get(*cursor + i)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            break;
        }
        multiplier *= 128;
        i += 1;
        if i >= 4 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
    }
    *cursor += i + 1;
    Ok(value)
}

/// Writes a variable-byte integer at the start of `buf`, returning the byte count.
pub fn write_variable_byte_integer(
    buf: &mut [u8],
    mut val: usize,
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    if val > MAX_REMAINING_LENGTH {
        return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
    }
    let mut i = 0;
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        *buf.get_mut(i).ok_or(MqttError::BufferTooSmall)? = encoded_byte;
        i += 1;
        if val == 0 {
            break;
        }
    }
    Ok(i)
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
pub fn read_utf8_string<'a>(
    cursor: &mut usize,
    buf: &'a [u8],
) -> Result<&'a str, MqttError<ErrorPlaceHolder>> {
    let len = read_u16(cursor, buf)? as usize;
    let s = core::str::from_utf8(
        buf.get(*cursor..*cursor + len)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?,
    )
    .map_err(|_| MqttError::Protocol(ProtocolError::InvalidUtf8String))?;
    *cursor += len;
    Ok(s)
}

/// Writes a UTF-8 encoded string (prefixed with a 2-byte length) to the buffer.
pub fn write_utf8_string(buf: &mut [u8], s: &str) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    let len = s.len();
    if len > u16::MAX as usize {
        return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
    }

    let required_space = 2 + len;
    let slice = buf
        .get_mut(0..required_space)
        .ok_or(MqttError::BufferTooSmall)?;

    slice[0..2].copy_from_slice(&(len as u16).to_be_bytes());
    slice[2..].copy_from_slice(s.as_bytes());
    Ok(required_space)
}

/// Reads a big-endian `u16`, advancing the cursor.
pub fn read_u16(cursor: &mut usize, buf: &[u8]) -> Result<u16, MqttError<ErrorPlaceHolder>> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Returns the total length of the first packet in `buf` once it has fully arrived.
///
/// `Ok(None)` means more bytes are needed, either for the fixed header or the body.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, MqttError<ErrorPlaceHolder>> {
    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    for i in 0..4 {
        let Some(byte) = buf.get(1 + i) else {
            return Ok(None);
        };
        remaining += (byte & 127) as usize * multiplier;
        if byte & 128 == 0 {
            let total = 1 + (i + 1) + remaining;
            return Ok((buf.len() >= total).then_some(total));
        }
        multiplier *= 128;
    }
    Err(MqttError::Protocol(ProtocolError::MalformedPacket))
}

/// Encodes a packet body behind its fixed header.
///
/// `body` writes the variable header and payload into the slice it is given and
/// returns the number of bytes written. The body is written after a 5-byte gap
/// and moved down once the remaining length is known.
pub fn encode_with_header(
    buf: &mut [u8],
    header: u8,
    body: impl FnOnce(&mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>>,
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    const GAP: usize = 5;
    if buf.len() < GAP {
        return Err(MqttError::BufferTooSmall);
    }
    let remaining_len = body(&mut buf[GAP..])?;
    buf[0] = header;
    let len_bytes = write_variable_byte_integer(&mut buf[1..GAP], remaining_len)?;
    let header_len = 1 + len_bytes;
    buf.copy_within(GAP..GAP + remaining_len, header_len);
    Ok(header_len + remaining_len)
}
