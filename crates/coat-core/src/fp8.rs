// FP8 — 8-bit floating point formats
//
// Two formats are used for narrow storage:
//
//   E4M3 (1 sign + 4 exponent + 3 mantissa, bias 7)
//     - largest finite value 448, smallest subnormal 2^-9 ≈ 0.00195
//     - no infinities; 0x7F / 0xFF encode NaN
//     - higher precision, smaller range: first moments, activations
//
//   E5M2 (1 sign + 5 exponent + 2 mantissa, bias 15)
//     - largest finite value 57344, smallest subnormal 2^-16 ≈ 1.5e-5
//     - IEEE-like: exponent 11111 encodes Inf (mantissa 0) or NaN
//     - lower precision, larger range
//
// ENCODING:
//
//   Both formats share one codec parameterised by (exponent bias, mantissa
//   bits, largest finite code). Rounding is round-to-nearest-even and
//   out-of-range magnitudes saturate to the largest finite value (the
//   "satfinite" behaviour of hardware casts) so a scaled group can never
//   produce Inf or NaN from finite input.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::{Error, Result};

/// A narrow 8-bit floating-point encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fp8Format {
    /// 4 exponent / 3 mantissa bits: narrow-high-precision.
    E4M3,
    /// 5 exponent / 2 mantissa bits: narrow-high-range.
    E5M2,
}

impl Fp8Format {
    /// Largest finite magnitude.
    pub const fn max_value(self) -> f64 {
        match self {
            Fp8Format::E4M3 => 448.0,
            Fp8Format::E5M2 => 57344.0,
        }
    }

    /// Lower end of the format's range: the smallest positive magnitude it
    /// can hold (2^-9 for E4M3, 2^-16 for E5M2, i.e. the subnormal floor).
    ///
    /// Together with [`max_value`](Self::max_value) this defines the dynamic
    /// range that range expansion aims for.
    pub const fn min_normal(self) -> f64 {
        match self {
            Fp8Format::E4M3 => 0.001953125,
            Fp8Format::E5M2 => 1.52587890625e-5,
        }
    }

    /// `max_value / min_normal`.
    pub fn dynamic_range(self) -> f64 {
        self.max_value() / self.min_normal()
    }

    /// Number of explicit mantissa bits.
    pub const fn mantissa_bits(self) -> u32 {
        match self {
            Fp8Format::E4M3 => 3,
            Fp8Format::E5M2 => 2,
        }
    }

    /// Exponent bias.
    pub const fn bias(self) -> i32 {
        match self {
            Fp8Format::E4M3 => 7,
            Fp8Format::E5M2 => 15,
        }
    }

    /// Worst-case relative rounding error for a normal value: half an ulp,
    /// `2^-(mantissa_bits + 1)`.
    pub fn relative_resolution(self) -> f64 {
        0.5f64.powi(self.mantissa_bits() as i32 + 1)
    }

    /// The tensor dtype with this encoding.
    pub fn dtype(self) -> DType {
        match self {
            Fp8Format::E4M3 => DType::F8E4M3,
            Fp8Format::E5M2 => DType::F8E5M2,
        }
    }

    const fn max_code(self) -> u8 {
        match self {
            Fp8Format::E4M3 => 0x7E,
            Fp8Format::E5M2 => 0x7B,
        }
    }

    /// Encode an f32 into this format's bit pattern.
    ///
    /// Round-to-nearest-even; magnitudes at or above the largest finite
    /// value (including infinities) saturate to it; NaN stays NaN.
    pub fn encode(self, x: f32) -> u8 {
        let sign: u8 = if x.is_sign_negative() { 0x80 } else { 0x00 };
        if x.is_nan() {
            return 0x7F | sign;
        }
        let a = x.abs();
        if a as f64 >= self.max_value() {
            return self.max_code() | sign;
        }

        let m = self.mantissa_bits() as i32;
        let bias = self.bias();
        let min_exp = 1 - bias;

        // Unbiased binary exponent of `a`, floored at the subnormal exponent.
        // f32 subnormals sit far below every FP8 subnormal and land on zero.
        let raw = ((a.to_bits() >> 23) & 0xFF) as i32;
        let e = if raw == 0 {
            min_exp
        } else {
            (raw - 127).max(min_exp)
        };

        let quantum = 2f32.powi(e - m);
        let q = (a / quantum).round_ties_even() as u32;
        if q == 0 {
            return sign;
        }

        let implicit = 1u32 << m;
        let (exp_field, mant) = if q < implicit {
            (0u32, q)
        } else if q >= implicit << 1 {
            ((e + 1 + bias) as u32, 0)
        } else {
            ((e + bias) as u32, q - implicit)
        };

        let code = ((exp_field << m) | mant).min(self.max_code() as u32) as u8;
        code | sign
    }

    /// Decode a bit pattern of this format into f32. Exact.
    pub fn decode(self, code: u8) -> f32 {
        let sign = if code & 0x80 != 0 { -1.0f32 } else { 1.0 };
        let bits = code & 0x7F;
        let m = self.mantissa_bits();
        let exp_field = (bits >> m) as i32;
        let mant = (bits & ((1u8 << m) - 1)) as i32;

        match self {
            Fp8Format::E4M3 if bits == 0x7F => return f32::NAN,
            Fp8Format::E5M2 if exp_field == 0x1F => {
                return if mant == 0 {
                    sign * f32::INFINITY
                } else {
                    f32::NAN
                };
            }
            _ => {}
        }

        let m = m as i32;
        let magnitude = if exp_field == 0 {
            mant as f32 * 2f32.powi(1 - self.bias() - m)
        } else {
            ((1 << m) + mant) as f32 * 2f32.powi(exp_field - self.bias() - m)
        };
        sign * magnitude
    }

    /// Round an f32 to the nearest value this format can represent.
    pub fn round(self, x: f32) -> f32 {
        self.decode(self.encode(x))
    }
}

impl fmt::Display for Fp8Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fp8Format::E4M3 => write!(f, "e4m3"),
            Fp8Format::E5M2 => write!(f, "e5m2"),
        }
    }
}

impl FromStr for Fp8Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "e4m3" | "e4m3fn" => Ok(Fp8Format::E4M3),
            "e5m2" => Ok(Fp8Format::E5M2),
            other => Err(Error::invalid(format!(
                "unknown FP8 format '{other}', expected 'e4m3' or 'e5m2'"
            ))),
        }
    }
}

/// 8-bit float with 4 exponent and 3 mantissa bits.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct F8E4M3(pub u8);

impl F8E4M3 {
    pub const ZERO: Self = Self(0x00);
    pub const ONE: Self = Self(0x38);
    /// Largest finite value, 448.
    pub const MAX: Self = Self(0x7E);
    pub const NAN: Self = Self(0x7F);

    #[inline]
    pub fn from_f32(x: f32) -> Self {
        Self(Fp8Format::E4M3.encode(x))
    }

    #[inline]
    pub fn to_f32(self) -> f32 {
        Fp8Format::E4M3.decode(self.0)
    }

    #[inline]
    pub fn from_f64(x: f64) -> Self {
        Self::from_f32(x as f32)
    }

    #[inline]
    pub fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }

    #[inline]
    pub const fn to_bits(self) -> u8 {
        self.0
    }

    pub fn is_nan(self) -> bool {
        (self.0 & 0x7F) == 0x7F
    }
}

impl fmt::Debug for F8E4M3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F8E4M3({})", self.to_f32())
    }
}

/// 8-bit float with 5 exponent and 2 mantissa bits.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct F8E5M2(pub u8);

impl F8E5M2 {
    pub const ZERO: Self = Self(0x00);
    pub const ONE: Self = Self(0x3C);
    /// Largest finite value, 57344.
    pub const MAX: Self = Self(0x7B);
    pub const INFINITY: Self = Self(0x7C);
    pub const NAN: Self = Self(0x7F);

    #[inline]
    pub fn from_f32(x: f32) -> Self {
        Self(Fp8Format::E5M2.encode(x))
    }

    #[inline]
    pub fn to_f32(self) -> f32 {
        Fp8Format::E5M2.decode(self.0)
    }

    #[inline]
    pub fn from_f64(x: f64) -> Self {
        Self::from_f32(x as f32)
    }

    #[inline]
    pub fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }

    #[inline]
    pub const fn to_bits(self) -> u8 {
        self.0
    }

    pub fn is_nan(self) -> bool {
        let exp = (self.0 >> 2) & 0x1F;
        exp == 0x1F && (self.0 & 0x03) != 0
    }
}

impl fmt::Debug for F8E5M2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F8E5M2({})", self.to_f32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e4m3_special_values() {
        assert_eq!(F8E4M3::ONE.to_f32(), 1.0);
        assert_eq!(F8E4M3::MAX.to_f32(), 448.0);
        assert!(F8E4M3::NAN.to_f32().is_nan());
        assert_eq!(F8E4M3::from_f32(0.0), F8E4M3::ZERO);
        assert_eq!(F8E4M3::from_f32(1.0), F8E4M3::ONE);
        assert_eq!(F8E4M3::from_f32(-1.0).to_bits(), 0xB8);
    }

    #[test]
    fn test_e5m2_special_values() {
        assert_eq!(F8E5M2::ONE.to_f32(), 1.0);
        assert_eq!(F8E5M2::MAX.to_f32(), 57344.0);
        assert_eq!(F8E5M2::INFINITY.to_f32(), f32::INFINITY);
        assert!(F8E5M2::NAN.is_nan());
        assert_eq!(F8E5M2::from_f32(1.0), F8E5M2::ONE);
    }

    #[test]
    fn test_saturation() {
        assert_eq!(F8E4M3::from_f32(1e6), F8E4M3::MAX);
        assert_eq!(F8E4M3::from_f32(f32::INFINITY), F8E4M3::MAX);
        assert_eq!(F8E4M3::from_f32(-1e6).to_f32(), -448.0);
        assert_eq!(F8E5M2::from_f32(1e9), F8E5M2::MAX);
        // Just below max still rounds into range, never to NaN/Inf
        assert_eq!(Fp8Format::E4M3.round(447.0), 448.0);
        assert_eq!(Fp8Format::E5M2.round(57000.0), 57344.0);
    }

    #[test]
    fn test_subnormals() {
        let e4 = Fp8Format::E4M3;
        assert_eq!(e4.round(0.001953125), 0.001953125);
        assert_eq!(e4.encode(0.001953125), 0x01);
        // Below half the smallest subnormal flushes to zero
        assert_eq!(e4.round(0.0009), 0.0);
        let e5 = Fp8Format::E5M2;
        assert_eq!(e5.round(1.52587890625e-5), 1.52587890625e-5);
        assert_eq!(e5.encode(1.52587890625e-5), 0x01);
    }

    #[test]
    fn test_round_to_nearest_even() {
        let e4 = Fp8Format::E4M3;
        // Between 1.0 and 1.125 the tie 1.0625 rounds to the even mantissa (1.0)
        assert_eq!(e4.round(1.0625), 1.0);
        // The tie 1.1875 between 1.125 and 1.25 rounds to 1.25 (even)
        assert_eq!(e4.round(1.1875), 1.25);
        assert_eq!(e4.round(1.07), 1.125);
        // Carry into the next binade
        assert_eq!(e4.round(1.97), 2.0);
    }

    #[test]
    fn test_every_finite_code_roundtrips() {
        for format in [Fp8Format::E4M3, Fp8Format::E5M2] {
            for code in 0u8..=255 {
                let v = format.decode(code);
                if !v.is_finite() {
                    continue;
                }
                let back = format.encode(v);
                // +0 / -0 both decode to zero and keep their sign
                assert_eq!(
                    format.decode(back).to_bits(),
                    v.to_bits(),
                    "{format}: code {code:#04x} decoded to {v}"
                );
            }
        }
    }

    #[test]
    fn test_relative_error_bound_for_normals() {
        let e4 = Fp8Format::E4M3;
        let mut x = 0.02f32;
        while x < 440.0 {
            let r = e4.round(x);
            assert!(((r - x) / x).abs() as f64 <= e4.relative_resolution() + 1e-9);
            x *= 1.013;
        }
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("e4m3".parse::<Fp8Format>().unwrap(), Fp8Format::E4M3);
        assert_eq!("E5M2".parse::<Fp8Format>().unwrap(), Fp8Format::E5M2);
        assert!(matches!(
            "int8".parse::<Fp8Format>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_format_constants() {
        assert_eq!(Fp8Format::E4M3.relative_resolution(), 0.0625);
        assert_eq!(Fp8Format::E5M2.relative_resolution(), 0.125);
        assert!((Fp8Format::E4M3.dynamic_range() - 229376.0).abs() < 1e-6);
    }
}
