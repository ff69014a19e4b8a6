//! Value encoding and decoding
//!
//! Converts between raw cell bytes and externally observable values. Cells
//! are 1-byte unsigned (percentages, modes), 2-byte signed little-endian
//! (temperatures in tenths or hundredths), 4-byte unsigned little-endian
//! (operating-hour and burner-start counters) or a single boolean byte.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Raw byte interpretation of a datapoint cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    /// 1-byte unsigned
    U8,
    /// 2-byte signed, little-endian
    I16,
    /// 4-byte unsigned, little-endian
    U32,
    /// 1-byte boolean, non-zero is true
    Bool,
}

impl ValueKind {
    /// Byte width of a cell of this kind.
    pub fn width(&self) -> usize {
        match self {
            ValueKind::U8 | ValueKind::Bool => 1,
            ValueKind::I16 => 2,
            ValueKind::U32 => 4,
        }
    }
}

/// An observed datapoint value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Scalar numeric value, already divided by the datapoint's ratio
    Scalar(f64),
    /// Boolean value
    Bool(bool),
}

impl Value {
    /// Get as scalar, returning None if not a scalar
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as bool, returning None if not a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Decode raw cell bytes into a value. Returns None when `bytes` is shorter
/// than the kind's width.
pub fn decode(kind: ValueKind, div_ratio: f64, bytes: &[u8]) -> Option<Value> {
    if bytes.len() < kind.width() {
        return None;
    }
    let raw = match kind {
        ValueKind::U8 => bytes[0] as f64,
        ValueKind::I16 => LittleEndian::read_i16(bytes) as f64,
        ValueKind::U32 => LittleEndian::read_u32(bytes) as f64,
        ValueKind::Bool => return Some(Value::Bool(bytes[0] != 0)),
    };
    Some(Value::Scalar(raw / div_ratio))
}

/// Encode a value into raw cell bytes, rounding half away from zero into the
/// cell's fixed-point grid. Returns the number of bytes written, or None when
/// the value does not fit the kind or the buffer is too short.
pub fn encode(kind: ValueKind, div_ratio: f64, value: &Value, out: &mut [u8]) -> Option<usize> {
    let width = kind.width();
    if out.len() < width {
        return None;
    }
    match (kind, value) {
        (ValueKind::Bool, Value::Bool(b)) => {
            out[0] = u8::from(*b);
        }
        (ValueKind::Bool, Value::Scalar(_)) => return None,
        (_, Value::Bool(_)) => return None,
        (_, Value::Scalar(v)) => {
            let scaled = (v * div_ratio).round();
            match kind {
                ValueKind::U8 => {
                    if !(0.0..=u8::MAX as f64).contains(&scaled) {
                        return None;
                    }
                    out[0] = scaled as u8;
                }
                ValueKind::I16 => {
                    if !(i16::MIN as f64..=i16::MAX as f64).contains(&scaled) {
                        return None;
                    }
                    LittleEndian::write_i16(out, scaled as i16);
                }
                ValueKind::U32 => {
                    if !(0.0..=u32::MAX as f64).contains(&scaled) {
                        return None;
                    }
                    LittleEndian::write_u32(out, scaled as u32);
                }
                ValueKind::Bool => unreachable!(),
            }
        }
    }
    Some(width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_u8_roundtrip() {
        let mut buf = [0u8; 1];
        encode(ValueKind::U8, 2.0, &Value::Scalar(50.0), &mut buf).unwrap();
        assert_eq!(buf, [100]);
        assert_eq!(decode(ValueKind::U8, 2.0, &buf), Some(Value::Scalar(50.0)));
    }

    #[test]
    fn test_i16_negative_temperature() {
        let mut buf = [0u8; 2];
        encode(ValueKind::I16, 10.0, &Value::Scalar(-12.5), &mut buf).unwrap();
        // -125 little-endian
        assert_eq!(buf, (-125i16).to_le_bytes());
        assert_eq!(
            decode(ValueKind::I16, 10.0, &buf),
            Some(Value::Scalar(-12.5))
        );
    }

    #[test]
    fn test_u32_counter() {
        let mut buf = [0u8; 4];
        encode(ValueKind::U32, 1.0, &Value::Scalar(123_456.0), &mut buf).unwrap();
        assert_eq!(buf, 123_456u32.to_le_bytes());
        assert_eq!(
            decode(ValueKind::U32, 1.0, &buf),
            Some(Value::Scalar(123_456.0))
        );
    }

    #[test]
    fn test_bool() {
        let mut buf = [0u8; 1];
        encode(ValueKind::Bool, 1.0, &Value::Bool(true), &mut buf).unwrap();
        assert_eq!(buf, [1]);
        assert_eq!(decode(ValueKind::Bool, 1.0, &[0]), Some(Value::Bool(false)));
        assert_eq!(decode(ValueKind::Bool, 1.0, &[2]), Some(Value::Bool(true)));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut buf = [0u8; 1];
        assert!(encode(ValueKind::U8, 1.0, &Value::Scalar(300.0), &mut buf).is_none());
        assert!(encode(ValueKind::U8, 1.0, &Value::Scalar(-1.0), &mut buf).is_none());
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert_eq!(decode(ValueKind::I16, 1.0, &[0x01]), None);
        let mut buf = [0u8; 1];
        assert!(encode(ValueKind::I16, 1.0, &Value::Scalar(1.0), &mut buf).is_none());
    }
}
