//! The wire representation of PostgreSQL `numeric`.
//!
//! Variable-length base-10000 digits with an explicit weight and display
//! scale. This crate keeps the wire form as the value type; there is no
//! arbitrary-precision decimal bridge.

use std::fmt;

use crate::error::{Error, Result};

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericSign {
    Positive,
    Negative,
    NaN,
}

/// A `numeric` value in PostgreSQL's base-10000 wire form.
///
/// `digits` are the base-10000 digits, most significant first. `weight` is
/// the power of 10000 of the first digit. `scale` is the number of decimal
/// fraction digits to display. Zero is represented by an empty digit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNumeric {
    pub sign: NumericSign,
    pub weight: i16,
    pub scale: u16,
    pub digits: Vec<i16>,
}

impl PgNumeric {
    pub const NAN: PgNumeric = PgNumeric {
        sign: NumericSign::NaN,
        weight: 0,
        scale: 0,
        digits: Vec::new(),
    };

    pub fn zero() -> PgNumeric {
        PgNumeric {
            sign: NumericSign::Positive,
            weight: 0,
            scale: 0,
            digits: Vec::new(),
        }
    }

    pub fn is_nan(&self) -> bool {
        self.sign == NumericSign::NaN
    }

    /// Decode the binary wire form.
    pub fn decode(buf: &[u8]) -> Result<PgNumeric> {
        if buf.len() < 8 {
            return Err(Error::Fault("numeric value too short".into()));
        }
        let ndigits = i16::from_be_bytes([buf[0], buf[1]]);
        let weight = i16::from_be_bytes([buf[2], buf[3]]);
        let sign_bits = u16::from_be_bytes([buf[4], buf[5]]);
        let scale = u16::from_be_bytes([buf[6], buf[7]]);
        let sign = match sign_bits {
            SIGN_POSITIVE => NumericSign::Positive,
            SIGN_NEGATIVE => NumericSign::Negative,
            SIGN_NAN => NumericSign::NaN,
            other => {
                return Err(Error::Fault(format!(
                    "invalid numeric sign bits: {other:#06x}"
                )))
            }
        };
        let want = 8 + ndigits.max(0) as usize * 2;
        if buf.len() < want {
            return Err(Error::Fault("numeric digits truncated".into()));
        }
        let mut digits = Vec::with_capacity(ndigits.max(0) as usize);
        for i in 0..ndigits.max(0) as usize {
            let off = 8 + i * 2;
            let d = i16::from_be_bytes([buf[off], buf[off + 1]]);
            if !(0..10000).contains(&d) {
                return Err(Error::Fault(format!("numeric digit out of range: {d}")));
            }
            digits.push(d);
        }
        Ok(PgNumeric {
            sign,
            weight,
            scale,
            digits,
        })
    }

    /// Encode to the binary wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.digits.len() * 2);
        out.extend_from_slice(&(self.digits.len() as i16).to_be_bytes());
        out.extend_from_slice(&self.weight.to_be_bytes());
        let sign = match self.sign {
            NumericSign::Positive => SIGN_POSITIVE,
            NumericSign::Negative => SIGN_NEGATIVE,
            NumericSign::NaN => SIGN_NAN,
        };
        out.extend_from_slice(&sign.to_be_bytes());
        out.extend_from_slice(&self.scale.to_be_bytes());
        for d in &self.digits {
            out.extend_from_slice(&d.to_be_bytes());
        }
        out
    }

    /// Parse the text form (`-12.345`, `NaN`). Used when a server sends
    /// numeric columns in text format.
    pub fn parse_text(s: &str) -> Result<PgNumeric> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("nan") {
            return Ok(PgNumeric::NAN);
        }
        let (sign, rest) = match s.strip_prefix('-') {
            Some(rest) => (NumericSign::Negative, rest),
            None => (NumericSign::Positive, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = match rest.split_once('.') {
            Some((i, f)) => (i, f),
            None => (rest, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(Error::Incorrect(format!("invalid numeric literal: {s}")));
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(Error::Incorrect(format!("invalid numeric literal: {s}")));
        }

        // Align the decimal digits on base-10000 groups around the point.
        let int_digits: Vec<u8> = int_part.bytes().map(|b| b - b'0').collect();
        let frac_digits: Vec<u8> = frac_part.bytes().map(|b| b - b'0').collect();
        let scale = frac_digits.len() as u16;

        let int_groups = int_digits.len().div_ceil(4);
        let mut all = vec![0u8; int_groups * 4 - int_digits.len()];
        all.extend_from_slice(&int_digits);
        all.extend_from_slice(&frac_digits);
        while all.len() % 4 != 0 {
            all.push(0);
        }

        let mut digits: Vec<i16> = all
            .chunks(4)
            .map(|c| {
                c.iter()
                    .fold(0i16, |acc, d| acc * 10 + i16::from(*d))
            })
            .collect();

        let mut weight = int_groups as i16 - 1;
        // Strip leading and trailing zero groups.
        while digits.first() == Some(&0) {
            digits.remove(0);
            weight -= 1;
        }
        while digits.last() == Some(&0) {
            digits.pop();
        }
        if digits.is_empty() {
            return Ok(PgNumeric {
                sign: NumericSign::Positive,
                weight: 0,
                scale,
                digits,
            });
        }
        Ok(PgNumeric {
            sign,
            weight,
            scale,
            digits,
        })
    }
}

impl fmt::Display for PgNumeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nan() {
            return write!(f, "NaN");
        }
        if self.digits.is_empty() {
            write!(f, "0")?;
            if self.scale > 0 {
                write!(f, ".{:0<width$}", "", width = self.scale as usize)?;
            }
            return Ok(());
        }
        if self.sign == NumericSign::Negative {
            write!(f, "-")?;
        }
        // Digit i holds the base-10000 group of exponent `weight - i`.
        let weight = i64::from(self.weight);
        let group = |g: i64| -> i16 {
            let idx = weight - g;
            if idx >= 0 {
                self.digits.get(idx as usize).copied().unwrap_or(0)
            } else {
                0
            }
        };
        let mut text = String::new();
        if weight < 0 {
            text.push('0');
        } else {
            for g in (0..=weight).rev() {
                let d = group(g);
                if g == weight {
                    text.push_str(&d.to_string());
                } else {
                    text.push_str(&format!("{d:04}"));
                }
            }
        }
        if self.scale > 0 {
            let mut frac = String::new();
            let mut g = -1i64;
            while frac.len() < self.scale as usize {
                frac.push_str(&format!("{:04}", group(g)));
                g -= 1;
            }
            frac.truncate(self.scale as usize);
            text.push('.');
            text.push_str(&frac);
        }
        write!(f, "{text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_round_trip() {
        let n = PgNumeric {
            sign: NumericSign::Negative,
            weight: 1,
            scale: 3,
            digits: vec![12, 3450],
        };
        assert_eq!(PgNumeric::decode(&n.encode()).unwrap(), n);
    }

    #[test]
    fn zero_has_no_digits() {
        let z = PgNumeric::zero();
        let bytes = z.encode();
        assert_eq!(&bytes[0..2], &0i16.to_be_bytes());
        assert_eq!(PgNumeric::decode(&bytes).unwrap(), z);
    }

    #[test]
    fn nan_round_trip() {
        let bytes = PgNumeric::NAN.encode();
        assert!(PgNumeric::decode(&bytes).unwrap().is_nan());
    }

    #[test]
    fn parse_text_simple() {
        let n = PgNumeric::parse_text("12.345").unwrap();
        assert_eq!(n.sign, NumericSign::Positive);
        assert_eq!(n.scale, 3);
        assert_eq!(n.weight, 0);
        assert_eq!(n.digits, vec![12, 3450]);
    }

    #[test]
    fn parse_text_negative_and_nan() {
        let n = PgNumeric::parse_text("-7").unwrap();
        assert_eq!(n.sign, NumericSign::Negative);
        assert_eq!(n.digits, vec![7]);
        assert!(PgNumeric::parse_text("NaN").unwrap().is_nan());
        assert!(PgNumeric::parse_text("abc").is_err());
    }

    #[test]
    fn parse_text_zero() {
        let n = PgNumeric::parse_text("0.00").unwrap();
        assert!(n.digits.is_empty());
        assert_eq!(n.scale, 2);
    }

    #[test]
    fn display_round_trips_text() {
        for s in ["12.345", "-7", "0.0001", "10000", "0.00", "123456789.5"] {
            let n = PgNumeric::parse_text(s).unwrap();
            assert_eq!(n.to_string(), *s, "via {n:?}");
        }
        assert_eq!(PgNumeric::NAN.to_string(), "NaN");
    }

    #[test]
    fn rejects_bad_sign_bits() {
        let mut bytes = PgNumeric::zero().encode();
        bytes[4] = 0x12;
        assert!(PgNumeric::decode(&bytes).is_err());
    }
}
