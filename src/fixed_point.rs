//! Sign-magnitude fixed-point encodings used in telemetry payloads.
//!
//! Two 4-byte layouts are used on the ground link:
//!
//! | Layout   | Integer bits | Fraction bits | Range              | Step        |
//! |----------|--------------|---------------|--------------------|-------------|
//! | Standard | 15           | 16            | ±32767.99998       | 1 / 65536   |
//! | Compact  | 7            | 24            | ±127.99999994      | 1 / 16777216 |
//!
//! In both layouts the sign is the most significant bit of the first byte and
//! every multi-byte field is big-endian.
//!
//! ## Out-of-range values
//!
//! [`encode_standard`] and [`encode_compact`] reject magnitudes the layout
//! cannot hold with [`FixedPointError::ValueOutOfRange`]. The `_saturating`
//! variants clamp to the largest representable magnitude instead (NaN encodes
//! as zero); telemetry builders use those so a bad sensor reading never drops
//! a heartbeat. Masking the integer part to the layout's width would wrap such
//! values instead; clamping keeps the sign and the ordering.

use libm::{fabs, floor, round};
use thiserror::Error;

/// Errors returned by the fixed-point encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum FixedPointError {
    /// The value is NaN, infinite, or its magnitude exceeds the layout's range.
    #[error("value out of range for the fixed-point layout")]
    ValueOutOfRange,
}

const STANDARD_INT_MAX: u32 = 0x7fff;
const STANDARD_SCALE: f64 = 65_536.0;
const COMPACT_INT_MAX: u32 = 0x7f;
const COMPACT_SCALE: f64 = 16_777_216.0;

/// Largest magnitude representable in the standard layout.
pub const STANDARD_MAX: f64 = STANDARD_INT_MAX as f64 + (STANDARD_SCALE - 1.0) / STANDARD_SCALE;

/// Largest magnitude representable in the compact layout.
pub const COMPACT_MAX: f64 = COMPACT_INT_MAX as f64 + (COMPACT_SCALE - 1.0) / COMPACT_SCALE;

/// Quantization step of the standard layout.
pub const STANDARD_STEP: f64 = 1.0 / STANDARD_SCALE;

/// Quantization step of the compact layout.
pub const COMPACT_STEP: f64 = 1.0 / COMPACT_SCALE;

/// Splits `value` into `(negative, integer, fraction)` for a layout.
///
/// A fraction that rounds up to a whole unit carries into the integer part.
fn split(value: f64, int_max: u32, scale: f64) -> Result<(bool, u32, u32), FixedPointError> {
    if !value.is_finite() {
        return Err(FixedPointError::ValueOutOfRange);
    }
    let negative = value < 0.0;
    let magnitude = fabs(value);
    let mut int_part = floor(magnitude);
    let mut frac_part = round((magnitude - int_part) * scale);
    if frac_part >= scale {
        int_part += 1.0;
        frac_part = 0.0;
    }
    if int_part > int_max as f64 {
        return Err(FixedPointError::ValueOutOfRange);
    }
    Ok((negative, int_part as u32, frac_part as u32))
}

/// Like [`split`], but clamps instead of failing.
fn split_saturating(value: f64, int_max: u32, scale: f64) -> (bool, u32, u32) {
    if value.is_nan() {
        return (false, 0, 0);
    }
    split(value, int_max, scale).unwrap_or_else(|_| {
        warn!("fixed-point value {} out of range, clamping", value);
        (value < 0.0, int_max, scale as u32 - 1)
    })
}

fn pack_standard((negative, int_part, frac_part): (bool, u32, u32)) -> [u8; 4] {
    let int_field = (int_part as u16) | if negative { 0x8000 } else { 0 };
    let [i0, i1] = int_field.to_be_bytes();
    let [f0, f1] = (frac_part as u16).to_be_bytes();
    [i0, i1, f0, f1]
}

fn pack_compact((negative, int_part, frac_part): (bool, u32, u32)) -> [u8; 4] {
    let int_field = (int_part as u8 & 0x7f) | if negative { 0x80 } else { 0 };
    let [_, f0, f1, f2] = frac_part.to_be_bytes();
    [int_field, f0, f1, f2]
}

/// Encodes `value` in the standard layout (2 integer bytes, 2 fraction bytes).
///
/// # Errors
/// [`FixedPointError::ValueOutOfRange`] if `|value|` does not fit in 15 integer bits
/// after rounding, or if `value` is not finite.
pub fn encode_standard(value: f64) -> Result<[u8; 4], FixedPointError> {
    split(value, STANDARD_INT_MAX, STANDARD_SCALE).map(pack_standard)
}

/// Encodes `value` in the standard layout, clamping to [`STANDARD_MAX`].
pub fn encode_standard_saturating(value: f64) -> [u8; 4] {
    pack_standard(split_saturating(value, STANDARD_INT_MAX, STANDARD_SCALE))
}

/// Decodes a standard-layout value.
pub fn decode_standard(bytes: [u8; 4]) -> f64 {
    let int_part = u16::from_be_bytes([bytes[0] & 0x7f, bytes[1]]);
    let frac_part = u16::from_be_bytes([bytes[2], bytes[3]]);
    let magnitude = int_part as f64 + frac_part as f64 / STANDARD_SCALE;
    if bytes[0] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Encodes `value` in the compact, high-precision layout (1 integer byte, 3 fraction bytes).
///
/// # Errors
/// [`FixedPointError::ValueOutOfRange`] if `|value|` does not fit in 7 integer bits
/// after rounding, or if `value` is not finite.
pub fn encode_compact(value: f64) -> Result<[u8; 4], FixedPointError> {
    split(value, COMPACT_INT_MAX, COMPACT_SCALE).map(pack_compact)
}

/// Encodes `value` in the compact layout, clamping to [`COMPACT_MAX`].
pub fn encode_compact_saturating(value: f64) -> [u8; 4] {
    pack_compact(split_saturating(value, COMPACT_INT_MAX, COMPACT_SCALE))
}

/// Decodes a compact-layout value.
pub fn decode_compact(bytes: [u8; 4]) -> f64 {
    let int_part = (bytes[0] & 0x7f) as f64;
    let frac_part = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]);
    let magnitude = int_part + frac_part as f64 / COMPACT_SCALE;
    if bytes[0] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_known_bytes() {
        assert_eq!(encode_standard(1.5).unwrap(), [0x00, 0x01, 0x80, 0x00]);
        assert_eq!(encode_standard(-2.25).unwrap(), [0x80, 0x02, 0x40, 0x00]);
        assert_eq!(encode_standard(0.0).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn test_compact_known_bytes() {
        assert_eq!(encode_compact(-0.5).unwrap(), [0x80, 0x80, 0x00, 0x00]);
        assert_eq!(encode_compact(1.0).unwrap(), [0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_standard_round_trip_within_step() {
        for value in [0.0001, -0.9981, 12.345, -1024.0625, 2000.1, 32767.5, -32767.9] {
            let bytes = encode_standard(value).unwrap();
            let decoded = decode_standard(bytes);
            assert!((decoded - value).abs() <= STANDARD_STEP, "{value} -> {decoded}");
            assert_eq!(bytes[0] & 0x80 != 0, value < 0.0);
        }
    }

    #[test]
    fn test_compact_round_trip_within_step() {
        for value in [1.0, 0.9981, -0.9891, -127.5, 64.000_000_1, 127.999_999] {
            let bytes = encode_compact(value).unwrap();
            let decoded = decode_compact(bytes);
            assert!((decoded - value).abs() <= COMPACT_STEP, "{value} -> {decoded}");
            assert_eq!(bytes[0] & 0x80 != 0, value < 0.0);
        }
    }

    #[test]
    fn test_fraction_rounding_carries_into_integer() {
        // 0.99999999 * 65536 rounds to 65536, which must become 1.0 rather than wrap.
        let bytes = encode_standard(0.999_999_99).unwrap();
        assert_eq!(bytes, [0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        assert_eq!(encode_compact(-128.5), Err(FixedPointError::ValueOutOfRange));
        assert_eq!(encode_compact(128.0), Err(FixedPointError::ValueOutOfRange));
        assert_eq!(encode_standard(40_000.0), Err(FixedPointError::ValueOutOfRange));
        assert_eq!(encode_standard(f64::NAN), Err(FixedPointError::ValueOutOfRange));
        assert_eq!(encode_standard(f64::INFINITY), Err(FixedPointError::ValueOutOfRange));
    }

    #[test]
    fn test_saturating_clamps_with_sign() {
        // Masking the integer part to 7 bits would have sent -0.5 here.
        let decoded = decode_compact(encode_compact_saturating(-128.5));
        assert!((decoded + COMPACT_MAX).abs() <= COMPACT_STEP);

        let decoded = decode_standard(encode_standard_saturating(1.0e9));
        assert!((decoded - STANDARD_MAX).abs() <= STANDARD_STEP);

        assert_eq!(encode_standard_saturating(f64::NAN), [0, 0, 0, 0]);
        assert_eq!(encode_compact_saturating(3.25), encode_compact(3.25).unwrap());
    }
}
