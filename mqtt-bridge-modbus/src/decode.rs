//! Numeric decoding of 16-bit register values.
//!
//! Word order differs between devices, so every 32-bit helper names its
//! order explicitly. `low_first` means the first register holds bits 0..16.

use crate::config::{DataType, RegisterConfig};

pub fn u32_low_first(low: u16, high: u16) -> u32 {
    u32::from(low) | u32::from(high) << 16
}

pub fn u32_high_first(high: u16, low: u16) -> u32 {
    u32_low_first(low, high)
}

pub fn i32_low_first(low: u16, high: u16) -> i32 {
    u32_low_first(low, high) as i32
}

pub fn i32_high_first(high: u16, low: u16) -> i32 {
    u32_high_first(high, low) as i32
}

/// IEEE-754 single precision, first register is the high half.
pub fn f32_high_first(high: u16, low: u16) -> f32 {
    f32::from_bits(u32_high_first(high, low))
}

/// IEEE-754 single precision, first register is the low half.
pub fn f32_low_first(low: u16, high: u16) -> f32 {
    f32::from_bits(u32_low_first(low, high))
}

/// Decode the first value of `data` as `data_type`. `None` if too few
/// registers were supplied.
pub fn decode_value(data: &[u16], data_type: DataType) -> Option<f64> {
    let value = match (data_type, data) {
        (DataType::U16, [v, ..]) => f64::from(*v),
        (DataType::I16, [v, ..]) => f64::from(*v as i16),
        (DataType::U32, [hi, lo, ..]) => f64::from(u32_high_first(*hi, *lo)),
        (DataType::I32, [hi, lo, ..]) => f64::from(i32_high_first(*hi, *lo)),
        (DataType::F32, [hi, lo, ..]) => f64::from(f32_high_first(*hi, *lo)),
        (DataType::U32Le, [lo, hi, ..]) => f64::from(u32_low_first(*lo, *hi)),
        (DataType::I32Le, [lo, hi, ..]) => f64::from(i32_low_first(*lo, *hi)),
        (DataType::F32Le, [lo, hi, ..]) => f64::from(f32_low_first(*lo, *hi)),
        _ => return None,
    };
    Some(value)
}

/// Decode and apply the register's scale and offset.
pub fn decode_scaled(data: &[u16], register: &RegisterConfig) -> Option<f64> {
    decode_value(data, register.data_type).map(|raw| raw * register.scale + register.offset)
}

/// Invert scale and offset and encode a 16-bit register value.
pub fn encode_u16(value: f64, register: &RegisterConfig) -> Option<u16> {
    if register.scale == 0.0 {
        return None;
    }
    let raw = ((value - register.offset) / register.scale).round();
    match register.data_type {
        DataType::I16 if (f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&raw) => {
            Some(raw as i16 as u16)
        }
        DataType::U16 if (0.0..=f64::from(u16::MAX)).contains(&raw) => Some(raw as u16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterType;

    fn holding(data_type: DataType, scale: f64, offset: f64) -> RegisterConfig {
        RegisterConfig {
            register_type: RegisterType::Holding,
            address: 0,
            name: None,
            data_type,
            scale,
            offset,
            writable: true,
        }
    }

    #[test]
    fn test_word_order() {
        assert_eq!(u32_low_first(0x5678, 0x1234), 0x1234_5678);
        assert_eq!(u32_high_first(0x1234, 0x5678), 0x1234_5678);
        assert_eq!(i32_low_first(0xFFFE, 0xFFFF), -2);
        assert_eq!(i32_high_first(0xFFFF, 0xFFFE), -2);
    }

    #[test]
    fn test_decode_f32() {
        // 123.456 = 0x42F6E979
        let value = decode_value(&[0x42F6, 0xE979], DataType::F32).unwrap();
        assert!((value - 123.456).abs() < 0.001);

        let value = decode_value(&[0xE979, 0x42F6], DataType::F32Le).unwrap();
        assert!((value - 123.456).abs() < 0.001);
        assert!((f32_low_first(0xE979, 0x42F6) - 123.456).abs() < 0.001);
    }

    #[test]
    fn test_decode_signed_16() {
        assert_eq!(decode_value(&[0xFF38], DataType::I16), Some(-200.0));
        assert_eq!(decode_value(&[0xFF38], DataType::U16), Some(65336.0));
    }

    #[test]
    fn test_decode_short_input() {
        assert_eq!(decode_value(&[1], DataType::U32), None);
        assert_eq!(decode_value(&[], DataType::U16), None);
    }

    #[test]
    fn test_decode_with_scale_offset() {
        // 1000 * 0.1 - 50 = 50
        let register = holding(DataType::U16, 0.1, -50.0);
        assert_eq!(decode_scaled(&[1000], &register), Some(50.0));
    }

    #[test]
    fn test_encode_inverts_scale() {
        let register = holding(DataType::U16, 0.1, -50.0);
        assert_eq!(encode_u16(50.0, &register), Some(1000));
        assert_eq!(encode_u16(-100.0, &register), None);

        let signed = holding(DataType::I16, 1.0, 0.0);
        assert_eq!(encode_u16(-2.0, &signed), Some(0xFFFE));
        assert_eq!(encode_u16(1.0, &holding(DataType::U32, 1.0, 0.0)), None);
    }
}
