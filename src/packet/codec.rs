//! Wire-level helpers: remaining-length varint, length-prefixed fields and
//! frame detection on a partially filled read buffer.

use super::error::{MqttError, MqttResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest value the four-byte remaining-length encoding can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Read a remaining-length varint.
pub fn read_remaining_length(buf: &mut impl Buf) -> MqttResult<u32> {
    let mut value: u32 = 0;
    let mut shift: u32 = 0;

    loop {
        if !buf.has_remaining() {
            return Err(MqttError::IncompletePacket);
        }

        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u32) << shift;

        if (byte & 0x80) == 0 {
            break;
        }

        shift += 7;
        if shift > 21 {
            return Err(MqttError::MalformedRemainingLength);
        }
    }

    Ok(value)
}

/// Write a remaining-length varint.
pub fn write_remaining_length(buf: &mut BytesMut, value: usize) -> MqttResult<()> {
    if value > MAX_REMAINING_LENGTH {
        return Err(MqttError::PacketTooLarge {
            size: value,
            max: MAX_REMAINING_LENGTH,
        });
    }

    let mut value = value as u32;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
    Ok(())
}

/// Number of bytes the varint for `value` occupies.
pub fn remaining_length_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Locate the next complete frame at the start of `buf`.
///
/// Returns `Ok(None)` while the fixed header or body is still partial,
/// otherwise the header length and the remaining length.
pub fn peek_frame(buf: &[u8], max_packet_size: usize) -> MqttResult<Option<(usize, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let mut remaining_length: usize = 0;
    let mut multiplier: usize = 1;
    let mut i = 1;

    loop {
        if i >= buf.len() {
            return Ok(None);
        }
        if i > 4 {
            return Err(MqttError::MalformedRemainingLength);
        }

        let byte = buf[i];
        remaining_length += ((byte & 0x7F) as usize) * multiplier;
        multiplier *= 128;
        i += 1;

        if (byte & 0x80) == 0 {
            break;
        }
    }

    if remaining_length > max_packet_size {
        return Err(MqttError::PacketTooLarge {
            size: remaining_length,
            max: max_packet_size,
        });
    }

    if buf.len() < i + remaining_length {
        return Ok(None);
    }

    Ok(Some((i, remaining_length)))
}

/// Read a UTF-8 string.
pub fn read_string(buf: &mut impl Buf) -> MqttResult<String> {
    let bytes = read_binary(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| MqttError::InvalidUtf8(e.to_string()))
}

/// Write a UTF-8 string.
pub fn write_string(buf: &mut BytesMut, s: &str) -> MqttResult<()> {
    write_binary(buf, s.as_bytes())
}

/// Read length-prefixed binary data.
pub fn read_binary(buf: &mut impl Buf) -> MqttResult<Bytes> {
    if buf.remaining() < 2 {
        return Err(MqttError::IncompletePacket);
    }

    let len = buf.get_u16() as usize;

    if buf.remaining() < len {
        return Err(MqttError::IncompletePacket);
    }

    Ok(buf.copy_to_bytes(len))
}

/// Write length-prefixed binary data.
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> MqttResult<()> {
    let len = u16::try_from(data.len()).map_err(|_| MqttError::StringTooLong(data.len()))?;
    buf.put_u16(len);
    buf.extend_from_slice(data);
    Ok(())
}

/// Read a big-endian message id.
pub fn read_u16(buf: &mut impl Buf) -> MqttResult<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::IncompletePacket);
    }
    Ok(buf.get_u16())
}
