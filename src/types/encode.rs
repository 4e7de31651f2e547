//! Binary encoding of [`Value`]s into parameter bytes.
//!
//! `encode_binary` maps a value to its wire body. SQL NULL is not encoded
//! here: the bind layer writes length -1 with no body for `Value::Null`.

use bytes::BufMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::{Error, Result};
use crate::types::geometric::Point;
use crate::types::{oid, ArrayValue, RangeValue, Value};

pub(crate) fn pg_date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("valid constant date")
}

pub(crate) fn pg_timestamp_epoch() -> NaiveDateTime {
    pg_date_epoch().and_hms_opt(0, 0, 0).expect("valid constant time")
}

fn put_point(out: &mut Vec<u8>, p: &Point) {
    out.put_f64(p.x);
    out.put_f64(p.y);
}

fn time_micros(t: &NaiveTime) -> i64 {
    t.signed_duration_since(NaiveTime::MIN)
        .num_microseconds()
        .unwrap_or(0)
}

/// Encode a value to its binary wire body. Returns `None` for SQL NULL.
pub fn encode_binary(value: &Value) -> Result<Option<Vec<u8>>> {
    let mut out = Vec::new();
    match value {
        Value::Null => return Ok(None),
        Value::UnchangedToast => {
            return Err(Error::Incorrect(
                "an unchanged TOAST sentinel cannot be sent as a parameter".into(),
            ))
        }
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Bytes(b) => out.extend_from_slice(b),
        Value::Char(c) => out.push(*c as u8),
        Value::Name(s) | Value::Text(s) => out.extend_from_slice(s.as_bytes()),
        Value::Int2(v) => out.put_i16(*v),
        Value::Int4(v) => out.put_i32(*v),
        Value::Int8(v) | Value::Money(v) => out.put_i64(*v),
        Value::Oid(v) | Value::Xid(v) => out.put_u32(*v),
        Value::Float4(v) => out.put_u32(v.to_bits()),
        Value::Float8(v) => out.put_u64(v.to_bits()),
        Value::Json(v) => {
            out.extend_from_slice(
                serde_json::to_string(v)
                    .map_err(|e| Error::Incorrect(format!("unencodable json: {e}")))?
                    .as_bytes(),
            );
        }
        Value::Record(_) => {
            return Err(Error::Unsupported(
                "anonymous record parameters cannot be encoded".into(),
            ))
        }
        Value::Point(p) => put_point(&mut out, p),
        Value::LineSegment(l) => {
            put_point(&mut out, &l.start);
            put_point(&mut out, &l.end);
        }
        Value::Path(p) => {
            out.push(u8::from(p.closed));
            out.put_i32(p.points.len() as i32);
            for pt in &p.points {
                put_point(&mut out, pt);
            }
        }
        Value::Box(b) => {
            put_point(&mut out, &b.upper_right);
            put_point(&mut out, &b.lower_left);
        }
        Value::Polygon(p) => {
            out.put_i32(p.points.len() as i32);
            for pt in &p.points {
                put_point(&mut out, pt);
            }
        }
        Value::Line(l) => {
            out.put_f64(l.a);
            out.put_f64(l.b);
            out.put_f64(l.c);
        }
        Value::Circle(c) => {
            put_point(&mut out, &c.center);
            out.put_f64(c.radius);
        }
        Value::Inet(inet) => {
            match inet.addr {
                std::net::IpAddr::V4(v4) => {
                    out.push(2); // PGSQL_AF_INET
                    out.push(inet.netmask);
                    out.push(u8::from(inet.cidr));
                    out.push(4);
                    out.extend_from_slice(&v4.octets());
                }
                std::net::IpAddr::V6(v6) => {
                    out.push(3); // PGSQL_AF_INET + 1
                    out.push(inet.netmask);
                    out.push(u8::from(inet.cidr));
                    out.push(16);
                    out.extend_from_slice(&v6.octets());
                }
            }
        }
        Value::Date(d) => {
            let days = if *d == NaiveDate::MAX {
                i32::MAX
            } else if *d == NaiveDate::MIN {
                i32::MIN
            } else {
                (*d - pg_date_epoch()).num_days() as i32
            };
            out.put_i32(days);
        }
        Value::Time(t) => out.put_i64(time_micros(t)),
        Value::Timestamp(ts) => {
            let micros = if *ts == NaiveDateTime::MAX {
                i64::MAX
            } else if *ts == NaiveDateTime::MIN {
                i64::MIN
            } else {
                (*ts - pg_timestamp_epoch())
                    .num_microseconds()
                    .ok_or_else(|| Error::Incorrect("timestamp out of range".into()))?
            };
            out.put_i64(micros);
        }
        Value::TimestampTz(ts) => {
            let micros = if *ts == DateTime::<Utc>::MAX_UTC {
                i64::MAX
            } else if *ts == DateTime::<Utc>::MIN_UTC {
                i64::MIN
            } else {
                (ts.naive_utc() - pg_timestamp_epoch())
                    .num_microseconds()
                    .ok_or_else(|| Error::Incorrect("timestamptz out of range".into()))?
            };
            out.put_i64(micros);
        }
        Value::TimeTz { time, offset_secs } => {
            out.put_i64(time_micros(time));
            // The wire stores seconds west of UTC; the value holds ISO
            // seconds east.
            out.put_i32(-offset_secs);
        }
        Value::Interval(iv) => {
            out.put_i64(iv.micros);
            out.put_i32(iv.days);
            out.put_i32(iv.months);
        }
        Value::Numeric(n) => out = n.encode(),
        Value::Uuid(u) => out.extend_from_slice(u.as_bytes()),
        Value::Lsn(lsn) => {
            out.put_u32(lsn.segment());
            out.put_u32(lsn.offset());
        }
        Value::TsVector(tv) => {
            out.put_i32(tv.lexemes.len() as i32);
            for lex in &tv.lexemes {
                out.extend_from_slice(lex.word.as_bytes());
                out.push(0);
                out.put_u16(lex.positions.len() as u16);
                for (pos, weight) in &lex.positions {
                    out.put_u16((u16::from(*weight) << 14) | (pos & 0x3FFF));
                }
            }
        }
        Value::Range(r) => encode_range(&mut out, r)?,
        Value::Array(a) => encode_array(&mut out, a)?,
    }
    Ok(Some(out))
}

const RANGE_EMPTY: u8 = 0x01;
const RANGE_LB_INC: u8 = 0x02;
const RANGE_UB_INC: u8 = 0x04;
const RANGE_LB_INF: u8 = 0x08;
const RANGE_UB_INF: u8 = 0x10;

fn encode_range(out: &mut Vec<u8>, r: &RangeValue) -> Result<()> {
    let mut flags = 0u8;
    if r.empty {
        flags |= RANGE_EMPTY;
    } else {
        match &r.lower {
            Some(b) if b.inclusive => flags |= RANGE_LB_INC,
            Some(_) => {}
            None => flags |= RANGE_LB_INF,
        }
        match &r.upper {
            Some(b) if b.inclusive => flags |= RANGE_UB_INC,
            Some(_) => {}
            None => flags |= RANGE_UB_INF,
        }
    }
    out.push(flags);
    if r.empty {
        return Ok(());
    }
    for bound in [&r.lower, &r.upper].into_iter().flatten() {
        let body = encode_binary(&bound.value)?.ok_or_else(|| {
            Error::Incorrect("a range bound cannot be SQL NULL".into())
        })?;
        out.put_i32(body.len() as i32);
        out.extend_from_slice(&body);
    }
    Ok(())
}

fn encode_array(out: &mut Vec<u8>, a: &ArrayValue) -> Result<()> {
    let expected: i64 = a.dims.iter().map(|(len, _)| i64::from(*len)).product();
    if !a.dims.is_empty() && expected != a.values.len() as i64 {
        return Err(Error::Incorrect(format!(
            "array dimensions describe {expected} elements, got {}",
            a.values.len()
        )));
    }
    if a.dims.is_empty() && !a.values.is_empty() {
        return Err(Error::Incorrect(
            "non-empty array must carry dimensions".into(),
        ));
    }
    let has_nulls = a.values.iter().any(Value::is_null);
    out.put_i32(a.dims.len() as i32);
    out.put_i32(i32::from(has_nulls));
    out.put_u32(a.element_oid);
    for (len, lower) in &a.dims {
        out.put_i32(*len);
        out.put_i32(*lower);
    }
    for v in &a.values {
        match encode_binary(v)? {
            Some(body) => {
                out.put_i32(body.len() as i32);
                out.extend_from_slice(&body);
            }
            None => out.put_i32(-1),
        }
    }
    Ok(())
}

/// The OID a value binds with: the caller override wins, then the built-in
/// table; unknown values bind as OID 0 and the server infers the type.
pub(crate) fn parameter_oid(value: &Value, override_oid: Option<u32>) -> u32 {
    override_oid.unwrap_or_else(|| value.builtin_oid())
}
