//! Write-ahead log positions.
//!
//! Replication acknowledgements, slot bookkeeping, and the `pg_lsn` data
//! type all carry a log sequence number: a 64-bit byte address into the
//! WAL. On the wire it travels as a plain big-endian integer; everywhere
//! humans see it, PostgreSQL splits it into a WAL segment number and a
//! byte offset within that segment, rendered as two uppercase hex halves
//! joined by a slash (`16/B374D848`).

use std::fmt;
use std::str::FromStr;

/// A position in the write-ahead log.
///
/// Ordering follows WAL order, so positions compare and sort the way
/// replication progress does.
///
/// ```
/// use pgcdc::lsn::Lsn;
///
/// let lsn: Lsn = "16/B374D848".parse().unwrap();
/// assert_eq!(lsn, Lsn::from_parts(0x16, 0xB374D848));
/// assert_eq!(lsn.segment(), 0x16);
/// assert_eq!(lsn.offset(), 0xB374D848);
/// assert_eq!(lsn.to_string(), "16/B374D848");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Position zero. Starting replication here means "from the oldest
    /// data the slot retains".
    pub const ZERO: Lsn = Lsn(0);

    /// Assemble a position from a segment number and an offset within it.
    pub const fn from_parts(segment: u32, offset: u32) -> Lsn {
        Lsn(((segment as u64) << 32) | offset as u64)
    }

    /// WAL segment number: the high 32 bits.
    pub const fn segment(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Byte offset within the segment: the low 32 bits.
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The raw 64-bit value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_u64(value: u64) -> Self {
        Lsn(value)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.segment(), self.offset())
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

/// Error returned when a string is not a valid textual LSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidLsn {
    input: String,
    reason: &'static str,
}

impl InvalidLsn {
    fn new(input: &str, reason: &'static str) -> InvalidLsn {
        InvalidLsn {
            input: input.to_string(),
            reason,
        }
    }
}

impl fmt::Display for InvalidLsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid LSN {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for InvalidLsn {}

impl FromStr for Lsn {
    type Err = InvalidLsn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((segment, offset)) = s.split_once('/') else {
            return Err(InvalidLsn::new(s, "missing '/' separator"));
        };
        Ok(Lsn::from_parts(
            parse_half(s, segment)?,
            parse_half(s, offset)?,
        ))
    }
}

fn parse_half(input: &str, half: &str) -> Result<u32, InvalidLsn> {
    if half.is_empty() || half.len() > 8 {
        return Err(InvalidLsn::new(input, "each half is 1 to 8 hex digits"));
    }
    u32::from_str_radix(half, 16).map_err(|_| InvalidLsn::new(input, "not a hex number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for s in ["0/0", "16/B374D848", "FFFFFFFF/FFFFFFFF", "1/0", "0/1"] {
            let lsn: Lsn = s.parse().unwrap();
            assert_eq!(lsn.to_string(), s);
        }
    }

    #[test]
    fn hex_form_invertible_over_raw_values() {
        for n in [
            0u64,
            1,
            0xFFFF_FFFF,
            0x1_0000_0000,
            0x16_B374_D848,
            u64::MAX,
        ] {
            let lsn = Lsn(n);
            assert_eq!(lsn.to_string().parse::<Lsn>().unwrap(), lsn);
        }
    }

    #[test]
    fn parts_split_the_raw_value() {
        let lsn = Lsn::from_parts(0xDEAD, 0xBEEF_0001);
        assert_eq!(lsn.as_u64(), 0xDEAD_BEEF_0001);
        assert_eq!(lsn.segment(), 0xDEAD);
        assert_eq!(lsn.offset(), 0xBEEF_0001);
    }

    #[test]
    fn halves_print_without_leading_zeros() {
        assert_eq!(Lsn::from_parts(1, 0xA0).to_string(), "1/A0");
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["deadbeef", "/0", "0/", "x/0", "0/x", "123456789/0", "0/123456789"] {
            assert!(bad.parse::<Lsn>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn invalid_lsn_names_the_input() {
        let err = "nope".parse::<Lsn>().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn ordering_follows_wal_order() {
        assert!(Lsn::from_parts(1, 0) > Lsn::from_parts(0, 0xFFFF_FFFF));
        assert!(Lsn::from_parts(2, 5) > Lsn::from_parts(2, 4));
    }
}
