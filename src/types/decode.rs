//! Binary and text decoding of column bytes into [`Value`]s.
//!
//! Dispatch is by OID. Record, range and array bodies recurse through the
//! [`DecoderRegistry`] so that elements of runtime-installed user types
//! decode the same way top-level columns do.

use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::protocol::buffer::Reader;
use crate::types::encode::{pg_date_epoch, pg_timestamp_epoch};
use crate::types::geometric::{Circle, Line, LineSegment, PgBox, PgPath, Point, Polygon};
use crate::types::numeric::PgNumeric;
use crate::types::registry::DecoderRegistry;
use crate::types::{
    oid, ArrayValue, Inet, Interval, Lexeme, RangeBound, RangeValue, TsVector, Value,
};

/// Whether a built-in binary decoder exists for this OID.
pub(crate) fn is_builtin(type_oid: u32) -> bool {
    matches!(
        type_oid,
        oid::BOOL
            | oid::BYTEA
            | oid::CHAR
            | oid::NAME
            | oid::INT8
            | oid::INT2
            | oid::INT4
            | oid::TEXT
            | oid::OID
            | oid::XID
            | oid::JSON
            | oid::RECORD
            | oid::VOID
            | oid::POINT
            | oid::LSEG
            | oid::PATH
            | oid::BOX
            | oid::POLYGON
            | oid::LINE
            | oid::FLOAT4
            | oid::FLOAT8
            | oid::CIRCLE
            | oid::MONEY
            | oid::INET
            | oid::BPCHAR
            | oid::VARCHAR
            | oid::DATE
            | oid::TIME
            | oid::TIMESTAMP
            | oid::TIMESTAMPTZ
            | oid::INTERVAL
            | oid::TIMETZ
            | oid::NUMERIC
            | oid::UUID
            | oid::PG_LSN
            | oid::TSVECTOR
            | oid::JSONB
            | oid::INT4RANGE
            | oid::NUMRANGE
            | oid::TSRANGE
            | oid::TSTZRANGE
            | oid::DATERANGE
            | oid::INT8RANGE
    ) || oid::element_oid(type_oid).is_some()
}

fn read_point(r: &mut Reader<'_>) -> Result<Point> {
    Ok(Point {
        x: r.f64()?,
        y: r.f64()?,
    })
}

fn naive_time_from_micros(micros: i64) -> Result<NaiveTime> {
    if micros < 0 {
        return Err(Error::Fault(format!("negative time of day: {micros}")));
    }
    let secs = (micros / 1_000_000) as u32;
    let nanos = ((micros % 1_000_000) * 1000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
        .ok_or_else(|| Error::Fault(format!("time of day out of range: {micros}")))
}

fn date_from_days(days: i32) -> Result<NaiveDate> {
    if days == i32::MAX {
        return Ok(NaiveDate::MAX);
    }
    if days == i32::MIN {
        return Ok(NaiveDate::MIN);
    }
    pg_date_epoch()
        .checked_add_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| Error::Incorrect(format!("date out of representable range: {days}")))
}

fn timestamp_from_micros(micros: i64) -> Result<NaiveDateTime> {
    if micros == i64::MAX {
        return Ok(NaiveDateTime::MAX);
    }
    if micros == i64::MIN {
        return Ok(NaiveDateTime::MIN);
    }
    pg_timestamp_epoch()
        .checked_add_signed(Duration::microseconds(micros))
        .ok_or_else(|| Error::Incorrect(format!("timestamp out of representable range: {micros}")))
}

/// Decode a binary-format column body.
pub(crate) fn decode_binary(
    registry: &DecoderRegistry,
    type_oid: u32,
    buf: &[u8],
) -> Result<Value> {
    let mut r = Reader::new(buf);
    let value = match type_oid {
        oid::BOOL => Value::Bool(r.u8()? != 0),
        oid::BYTEA => Value::Bytes(Bytes::copy_from_slice(buf)),
        oid::CHAR => Value::Char(r.u8()? as i8),
        oid::NAME => Value::Name(String::from_utf8_lossy(buf).into_owned()),
        oid::INT2 => Value::Int2(r.i16()?),
        oid::INT4 => Value::Int4(r.i32()?),
        oid::INT8 => Value::Int8(r.i64()?),
        oid::OID => Value::Oid(r.u32()?),
        oid::XID => Value::Xid(r.u32()?),
        oid::FLOAT4 => Value::Float4(r.f32()?),
        oid::FLOAT8 => Value::Float8(r.f64()?),
        oid::TEXT | oid::BPCHAR | oid::VARCHAR => {
            Value::Text(String::from_utf8_lossy(buf).into_owned())
        }
        // `void` results (e.g. pg_drop_replication_slot) carry no payload.
        oid::VOID => Value::Null,
        oid::JSON => Value::Json(
            serde_json::from_slice(buf)
                .map_err(|e| Error::Fault(format!("malformed json value: {e}")))?,
        ),
        oid::JSONB => {
            let version = r.u8()?;
            if version != 1 {
                return Err(Error::Fault(format!("unknown jsonb version: {version}")));
            }
            Value::Json(
                serde_json::from_slice(r.rest())
                    .map_err(|e| Error::Fault(format!("malformed jsonb value: {e}")))?,
            )
        }
        oid::RECORD => {
            let ncols = r.i32()?;
            let mut fields = Vec::with_capacity(ncols.max(0) as usize);
            for _ in 0..ncols {
                let field_oid = r.u32()?;
                let len = r.i32()?;
                let value = if len < 0 {
                    Value::Null
                } else {
                    registry.decode_binary(field_oid, r.bytes(len as usize)?)?
                };
                fields.push((field_oid, value));
            }
            Value::Record(fields)
        }
        oid::POINT => Value::Point(read_point(&mut r)?),
        oid::LSEG => Value::LineSegment(LineSegment {
            start: read_point(&mut r)?,
            end: read_point(&mut r)?,
        }),
        oid::PATH => {
            let closed = r.u8()? != 0;
            let n = r.i32()?;
            let mut points = Vec::with_capacity(n.max(0) as usize);
            for _ in 0..n {
                points.push(read_point(&mut r)?);
            }
            Value::Path(PgPath { closed, points })
        }
        oid::BOX => Value::Box(PgBox {
            upper_right: read_point(&mut r)?,
            lower_left: read_point(&mut r)?,
        }),
        oid::POLYGON => {
            let n = r.i32()?;
            let mut points = Vec::with_capacity(n.max(0) as usize);
            for _ in 0..n {
                points.push(read_point(&mut r)?);
            }
            Value::Polygon(Polygon { points })
        }
        oid::LINE => Value::Line(Line {
            a: r.f64()?,
            b: r.f64()?,
            c: r.f64()?,
        }),
        oid::CIRCLE => Value::Circle(Circle {
            center: read_point(&mut r)?,
            radius: r.f64()?,
        }),
        oid::MONEY => Value::Money(r.i64()?),
        oid::INET => {
            let family = r.u8()?;
            let netmask = r.u8()?;
            let cidr = r.u8()? != 0;
            let nb = r.u8()? as usize;
            let addr = match (family, nb) {
                (2, 4) => {
                    let b = r.bytes(4)?;
                    std::net::IpAddr::from([b[0], b[1], b[2], b[3]])
                }
                (3, 16) => {
                    let b = r.bytes(16)?;
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(b);
                    std::net::IpAddr::from(octets)
                }
                (family, nb) => {
                    return Err(Error::Fault(format!(
                        "invalid inet family/length: {family}/{nb}"
                    )))
                }
            };
            Value::Inet(Inet {
                addr,
                netmask,
                cidr,
            })
        }
        oid::DATE => Value::Date(date_from_days(r.i32()?)?),
        oid::TIME => Value::Time(naive_time_from_micros(r.i64()?)?),
        oid::TIMETZ => {
            let time = naive_time_from_micros(r.i64()?)?;
            // Wire offset is seconds west of UTC; expose ISO seconds east.
            let offset_secs = -r.i32()?;
            Value::TimeTz { time, offset_secs }
        }
        oid::TIMESTAMP => Value::Timestamp(timestamp_from_micros(r.i64()?)?),
        oid::TIMESTAMPTZ => {
            let micros = r.i64()?;
            let ts = if micros == i64::MAX {
                DateTime::<Utc>::MAX_UTC
            } else if micros == i64::MIN {
                DateTime::<Utc>::MIN_UTC
            } else {
                Utc.from_utc_datetime(&timestamp_from_micros(micros)?)
            };
            Value::TimestampTz(ts)
        }
        oid::INTERVAL => Value::Interval(Interval {
            micros: r.i64()?,
            days: r.i32()?,
            months: r.i32()?,
        }),
        oid::NUMERIC => Value::Numeric(PgNumeric::decode(buf)?),
        oid::UUID => {
            let b = r.bytes(16)?;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(b);
            Value::Uuid(uuid::Uuid::from_bytes(bytes))
        }
        oid::PG_LSN => {
            let segment = r.u32()?;
            let offset = r.u32()?;
            Value::Lsn(Lsn::from_parts(segment, offset))
        }
        oid::TSVECTOR => {
            let n = r.i32()?;
            let mut lexemes = Vec::with_capacity(n.max(0) as usize);
            for _ in 0..n {
                let word = r.cstr()?;
                let npos = r.u16()?;
                let mut positions = Vec::with_capacity(npos as usize);
                for _ in 0..npos {
                    let raw = r.u16()?;
                    positions.push((raw & 0x3FFF, (raw >> 14) as u8));
                }
                lexemes.push(Lexeme { word, positions });
            }
            Value::TsVector(TsVector { lexemes })
        }
        oid::INT4RANGE
        | oid::NUMRANGE
        | oid::TSRANGE
        | oid::TSTZRANGE
        | oid::DATERANGE
        | oid::INT8RANGE => decode_range(registry, type_oid, &mut r)?,
        _ => {
            if oid::element_oid(type_oid).is_some() {
                decode_array(registry, &mut r)?
            } else {
                return Err(Error::UnknownDataType(type_oid));
            }
        }
    };
    Ok(value)
}

const RANGE_EMPTY: u8 = 0x01;
const RANGE_LB_INC: u8 = 0x02;
const RANGE_UB_INC: u8 = 0x04;
const RANGE_LB_INF: u8 = 0x08;
const RANGE_UB_INF: u8 = 0x10;

fn decode_range(
    registry: &DecoderRegistry,
    range_oid: u32,
    r: &mut Reader<'_>,
) -> Result<Value> {
    let element = oid::range_element_oid(range_oid)
        .ok_or(Error::UnknownDataType(range_oid))?;
    let flags = r.u8()?;
    if flags & RANGE_EMPTY != 0 {
        return Ok(Value::Range(Box::new(RangeValue::empty(range_oid))));
    }
    let mut read_bound = |inclusive: bool| -> Result<RangeBound> {
        let len = r.i32()?;
        if len < 0 {
            return Err(Error::Fault("NULL range bound on the wire".into()));
        }
        let value = registry.decode_binary(element, r.bytes(len as usize)?)?;
        Ok(RangeBound { value, inclusive })
    };
    let lower = if flags & RANGE_LB_INF != 0 {
        None
    } else {
        Some(read_bound(flags & RANGE_LB_INC != 0)?)
    };
    let upper = if flags & RANGE_UB_INF != 0 {
        None
    } else {
        Some(read_bound(flags & RANGE_UB_INC != 0)?)
    };
    Ok(Value::Range(Box::new(RangeValue {
        range_oid,
        empty: false,
        lower,
        upper,
    })))
}

fn decode_array(registry: &DecoderRegistry, r: &mut Reader<'_>) -> Result<Value> {
    let ndim = r.i32()?;
    let _has_nulls = r.i32()?;
    // The header's element OID is authoritative; user types keep their own.
    let element_oid = r.u32()?;
    let mut dims = Vec::with_capacity(ndim.max(0) as usize);
    let mut count: i64 = if ndim > 0 { 1 } else { 0 };
    for _ in 0..ndim {
        let len = r.i32()?;
        let lower = r.i32()?;
        count = count.saturating_mul(i64::from(len.max(0)));
        dims.push((len, lower));
    }
    let mut values = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let len = r.i32()?;
        if len < 0 {
            values.push(Value::Null);
        } else {
            values.push(registry.decode_binary(element_oid, r.bytes(len as usize)?)?);
        }
    }
    Ok(Value::Array(ArrayValue {
        element_oid,
        dims,
        values,
    }))
}

/// Decode a text-format column body for the common scalar set. OIDs with
/// no text parser fall back to `Value::Text`; unknown OIDs surface
/// `UnknownDataType` so a decoder can be installed and the decode retried.
pub(crate) fn decode_text(_registry: &DecoderRegistry, type_oid: u32, s: &str) -> Result<Value> {
    let value = match type_oid {
        oid::BOOL => match s {
            "t" | "true" => Value::Bool(true),
            "f" | "false" => Value::Bool(false),
            other => return Err(Error::Fault(format!("invalid bool literal: {other}"))),
        },
        oid::INT2 => Value::Int2(parse_num(s)?),
        oid::INT4 => Value::Int4(parse_num(s)?),
        oid::INT8 => Value::Int8(parse_num(s)?),
        oid::OID => Value::Oid(parse_num(s)?),
        oid::XID => Value::Xid(parse_num(s)?),
        oid::FLOAT4 => Value::Float4(parse_num(s)?),
        oid::FLOAT8 => Value::Float8(parse_num(s)?),
        oid::TEXT | oid::BPCHAR | oid::VARCHAR => Value::Text(s.to_string()),
        oid::VOID => Value::Null,
        oid::NAME => Value::Name(s.to_string()),
        oid::CHAR => Value::Char(s.as_bytes().first().map(|b| *b as i8).unwrap_or(0)),
        oid::BYTEA => {
            let hex = s
                .strip_prefix("\\x")
                .ok_or_else(|| Error::Fault(format!("unsupported bytea literal: {s}")))?;
            let mut out = Vec::with_capacity(hex.len() / 2);
            let bytes = hex.as_bytes();
            if bytes.len() % 2 != 0 {
                return Err(Error::Fault("odd-length bytea hex literal".into()));
            }
            for pair in bytes.chunks(2) {
                let hi = hex_digit(pair[0])?;
                let lo = hex_digit(pair[1])?;
                out.push((hi << 4) | lo);
            }
            Value::Bytes(Bytes::from(out))
        }
        oid::JSON | oid::JSONB => Value::Json(
            serde_json::from_str(s)
                .map_err(|e| Error::Fault(format!("malformed json literal: {e}")))?,
        ),
        oid::NUMERIC => Value::Numeric(PgNumeric::parse_text(s)?),
        oid::UUID => Value::Uuid(
            s.parse()
                .map_err(|e| Error::Fault(format!("invalid uuid literal: {e}")))?,
        ),
        oid::PG_LSN => Value::Lsn(
            s.parse()
                .map_err(|e| Error::Fault(format!("invalid lsn literal: {e}")))?,
        ),
        oid::DATE => match s {
            "infinity" => Value::Date(NaiveDate::MAX),
            "-infinity" => Value::Date(NaiveDate::MIN),
            _ => Value::Date(
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| Error::Fault(format!("invalid date literal {s:?}: {e}")))?,
            ),
        },
        oid::TIME => Value::Time(
            NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .map_err(|e| Error::Fault(format!("invalid time literal {s:?}: {e}")))?,
        ),
        oid::TIMESTAMP => match s {
            "infinity" => Value::Timestamp(NaiveDateTime::MAX),
            "-infinity" => Value::Timestamp(NaiveDateTime::MIN),
            _ => Value::Timestamp(
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .map_err(|e| Error::Fault(format!("invalid timestamp literal {s:?}: {e}")))?,
            ),
        },
        oid::TIMESTAMPTZ => match s {
            "infinity" => Value::TimestampTz(DateTime::<Utc>::MAX_UTC),
            "-infinity" => Value::TimestampTz(DateTime::<Utc>::MIN_UTC),
            _ => Value::TimestampTz(
                DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map_err(|e| {
                        Error::Fault(format!("invalid timestamptz literal {s:?}: {e}"))
                    })?
                    .with_timezone(&Utc),
            ),
        },
        oid::INET => {
            let (addr_str, mask_str) = match s.split_once('/') {
                Some((a, m)) => (a, Some(m)),
                None => (s, None),
            };
            let addr: std::net::IpAddr = addr_str
                .parse()
                .map_err(|e| Error::Fault(format!("invalid inet literal {s:?}: {e}")))?;
            let full = if addr.is_ipv4() { 32 } else { 128 };
            let netmask = match mask_str {
                Some(m) => m
                    .parse()
                    .map_err(|e| Error::Fault(format!("invalid netmask in {s:?}: {e}")))?,
                None => full,
            };
            Value::Inet(Inet {
                addr,
                netmask,
                cidr: false,
            })
        }
        other if is_builtin(other) => Value::Text(s.to_string()),
        other => return Err(Error::UnknownDataType(other)),
    };
    Ok(value)
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        other => Err(Error::Fault(format!("invalid hex digit: {other:#x}"))),
    }
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e| Error::Fault(format!("invalid numeric literal {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encode::encode_binary;

    fn registry() -> DecoderRegistry {
        DecoderRegistry::new()
    }

    fn round_trip(v: Value) {
        let reg = registry();
        let oid = v.builtin_oid();
        let body = encode_binary(&v).unwrap().unwrap();
        let back = reg.decode_binary(oid, &body).unwrap();
        assert_eq!(back, v, "oid {oid}");
    }

    #[test]
    fn scalar_round_trips() {
        round_trip(Value::Bool(true));
        round_trip(Value::Char(-3));
        round_trip(Value::Int2(-2));
        round_trip(Value::Int4(123_456));
        round_trip(Value::Int8(-9_876_543_210));
        round_trip(Value::Oid(42));
        round_trip(Value::Xid(7));
        round_trip(Value::Float4(1.5));
        round_trip(Value::Float8(-2.25));
        round_trip(Value::Text("héllo".into()));
        round_trip(Value::Name("pg_catalog".into()));
        round_trip(Value::Bytes(Bytes::from_static(b"\x00\x01\x02")));
        round_trip(Value::Money(123_45));
        round_trip(Value::Uuid(uuid::Uuid::from_bytes([7; 16])));
        round_trip(Value::Lsn(Lsn(0x16_B374_D848)));
    }

    #[test]
    fn float8_special_values() {
        round_trip(Value::Float8(f64::INFINITY));
        round_trip(Value::Float8(f64::NEG_INFINITY));
        let reg = registry();
        let body = encode_binary(&Value::Float8(f64::NAN)).unwrap().unwrap();
        match reg.decode_binary(oid::FLOAT8, &body).unwrap() {
            Value::Float8(f) => assert!(f.is_nan()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn temporal_round_trips() {
        round_trip(Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));
        round_trip(Value::Time(
            NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap(),
        ));
        round_trip(Value::Timestamp(
            NaiveDate::from_ymd_opt(1999, 12, 31)
                .unwrap()
                .and_hms_opt(12, 30, 45)
                .unwrap(),
        ));
        round_trip(Value::TimestampTz(
            Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 1).unwrap(),
        ));
        round_trip(Value::TimeTz {
            time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            offset_secs: -14_400,
        });
        round_trip(Value::Interval(Interval {
            micros: 5_000_000,
            days: 2,
            months: 13,
        }));
    }

    #[test]
    fn infinite_timestamps_round_trip() {
        round_trip(Value::TimestampTz(DateTime::<Utc>::MAX_UTC));
        round_trip(Value::TimestampTz(DateTime::<Utc>::MIN_UTC));
        round_trip(Value::Timestamp(NaiveDateTime::MAX));
        round_trip(Value::Timestamp(NaiveDateTime::MIN));
    }

    #[test]
    fn geometric_round_trips() {
        round_trip(Value::Point(Point { x: 1.0, y: -2.0 }));
        round_trip(Value::LineSegment(LineSegment {
            start: Point { x: 0.0, y: 0.0 },
            end: Point { x: 1.0, y: 1.0 },
        }));
        round_trip(Value::Box(PgBox {
            upper_right: Point { x: 2.0, y: 2.0 },
            lower_left: Point { x: 0.0, y: 0.0 },
        }));
        round_trip(Value::Path(PgPath {
            closed: true,
            points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 3.5, y: 4.5 }],
        }));
        round_trip(Value::Polygon(Polygon {
            points: vec![
                Point { x: 0.0, y: 0.0 },
                Point { x: 1.0, y: 0.0 },
                Point { x: 0.5, y: 1.0 },
            ],
        }));
        round_trip(Value::Line(Line {
            a: 1.0,
            b: -1.0,
            c: 0.5,
        }));
        round_trip(Value::Circle(Circle {
            center: Point { x: 1.0, y: 1.0 },
            radius: 2.5,
        }));
    }

    #[test]
    fn inet_round_trips() {
        round_trip(Value::Inet(Inet {
            addr: "192.168.1.7".parse().unwrap(),
            netmask: 24,
            cidr: false,
        }));
        round_trip(Value::Inet(Inet {
            addr: "::1".parse().unwrap(),
            netmask: 128,
            cidr: true,
        }));
    }

    #[test]
    fn numeric_and_json_round_trips() {
        round_trip(Value::Numeric(PgNumeric::parse_text("-12345.6789").unwrap()));
        round_trip(Value::Json(serde_json::json!({"a": [1, 2, 3]})));
    }

    #[test]
    fn jsonb_requires_version_byte() {
        let reg = registry();
        let mut body = vec![1u8];
        body.extend_from_slice(b"{\"k\":true}");
        match reg.decode_binary(oid::JSONB, &body).unwrap() {
            Value::Json(v) => assert_eq!(v["k"], serde_json::json!(true)),
            other => panic!("wrong variant: {other:?}"),
        }
        assert!(reg.decode_binary(oid::JSONB, b"\x02{}").is_err());
    }

    #[test]
    fn tsvector_round_trips() {
        round_trip(Value::TsVector(TsVector {
            lexemes: vec![
                Lexeme {
                    word: "quick".into(),
                    positions: vec![(1, 0), (7, 2)],
                },
                Lexeme {
                    word: "fox".into(),
                    positions: vec![],
                },
            ],
        }));
    }

    #[test]
    fn range_round_trips() {
        round_trip(Value::Range(Box::new(RangeValue::empty(oid::INT4RANGE))));
        round_trip(Value::Range(Box::new(RangeValue {
            range_oid: oid::INT8RANGE,
            empty: false,
            lower: Some(RangeBound {
                value: Value::Int8(10),
                inclusive: true,
            }),
            upper: None,
        })));
        round_trip(Value::Range(Box::new(RangeValue {
            range_oid: oid::TSTZRANGE,
            empty: false,
            lower: None,
            upper: Some(RangeBound {
                value: Value::TimestampTz(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                inclusive: false,
            }),
        })));
    }

    #[test]
    fn array_round_trips() {
        round_trip(Value::Array(ArrayValue::from_values(
            oid::INT4,
            vec![Value::Int4(1), Value::Null, Value::Int4(3)],
        )));
        round_trip(Value::Array(ArrayValue::from_values(oid::TEXT, vec![])));
        round_trip(Value::Array(ArrayValue {
            element_oid: oid::INT2,
            dims: vec![(2, 1), (2, 1)],
            values: vec![
                Value::Int2(1),
                Value::Int2(2),
                Value::Int2(3),
                Value::Int2(4),
            ],
        }));
    }

    #[test]
    fn record_decodes_nested_fields() {
        let reg = registry();
        let mut body = Vec::new();
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(&oid::INT4.to_be_bytes());
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(&7i32.to_be_bytes());
        body.extend_from_slice(&oid::TEXT.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());

        match reg.decode_binary(oid::RECORD, &body).unwrap() {
            Value::Record(fields) => {
                assert_eq!(fields[0], (oid::INT4, Value::Int4(7)));
                assert_eq!(fields[1], (oid::TEXT, Value::Null));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_oid_is_recoverable() {
        let reg = registry();
        match reg.decode_binary(99999, b"x").unwrap_err() {
            Error::UnknownDataType(99999) => {}
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn text_decoding_common_scalars() {
        let reg = registry();
        assert_eq!(
            reg.decode_text(oid::BOOL, "t").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            reg.decode_text(oid::INT4, "-17").unwrap(),
            Value::Int4(-17)
        );
        assert_eq!(
            reg.decode_text(oid::FLOAT8, "Infinity").unwrap(),
            Value::Float8(f64::INFINITY)
        );
        assert_eq!(
            reg.decode_text(oid::BYTEA, "\\x0aff").unwrap(),
            Value::Bytes(Bytes::from_static(&[0x0A, 0xFF]))
        );
        assert_eq!(
            reg.decode_text(oid::DATE, "2024-02-29").unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(
            reg.decode_text(oid::TIMESTAMPTZ, "infinity").unwrap(),
            Value::TimestampTz(DateTime::<Utc>::MAX_UTC)
        );
        assert_eq!(
            reg.decode_text(oid::PG_LSN, "16/B374D848").unwrap(),
            Value::Lsn(Lsn(0x16_B374_D848))
        );
    }

    #[test]
    fn text_decoding_falls_back_for_exotic_builtins() {
        let reg = registry();
        assert_eq!(
            reg.decode_text(oid::INTERVAL, "1 day").unwrap(),
            Value::Text("1 day".into())
        );
    }
}
