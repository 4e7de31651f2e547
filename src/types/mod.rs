//! Binary codec for PostgreSQL data types.
//!
//! [`Value`] is the tagged variant covering every supported type. Encoding
//! is a single match over the variant ([`encode_binary`]); decoding
//! dispatches on the column OID through a [`DecoderRegistry`], which can
//! learn user types at runtime from `pg_type` metadata.

pub mod geometric;
pub mod numeric;
pub mod oid;
pub mod registry;

mod decode;
mod encode;

use std::net::IpAddr;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

pub use encode::encode_binary;
pub(crate) use encode::parameter_oid;
pub use geometric::{Circle, Line, LineSegment, PgBox, PgPath, Point, Polygon};
pub use numeric::{NumericSign, PgNumeric};
pub use registry::{DecoderRegistry, TypeKind};

use crate::lsn::Lsn;

/// A network address with netmask, as in `inet`/`cidr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inet {
    pub addr: IpAddr,
    pub netmask: u8,
    /// True for `cidr` values.
    pub cidr: bool,
}

/// An `interval`: microseconds within a day, days, and months kept apart
/// the way PostgreSQL stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub micros: i64,
    pub days: i32,
    pub months: i32,
}

impl Interval {
    pub fn is_zero(&self) -> bool {
        self.micros == 0 && self.days == 0 && self.months == 0
    }
}

/// One lexeme of a `tsvector` with its positions and weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lexeme {
    pub word: String,
    /// `(position, weight)`; weight 0..=3 maps to D..A.
    pub positions: Vec<(u16, u8)>,
}

/// A `tsvector` value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TsVector {
    pub lexemes: Vec<Lexeme>,
}

/// One bound of a range value. `None` at the range level means infinite.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub value: Value,
    pub inclusive: bool,
}

/// A range value over one of the built-in range types.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeValue {
    /// The range type's OID (e.g. `int4range`), not the element OID.
    pub range_oid: u32,
    pub empty: bool,
    pub lower: Option<RangeBound>,
    pub upper: Option<RangeBound>,
}

impl RangeValue {
    pub fn empty(range_oid: u32) -> RangeValue {
        RangeValue {
            range_oid,
            empty: true,
            lower: None,
            upper: None,
        }
    }
}

/// An array value. `dims` pairs each dimension's length with its lower
/// bound; `values` is the flattened element list in row-major order, with
/// `Value::Null` for NULL elements.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub element_oid: u32,
    pub dims: Vec<(i32, i32)>,
    pub values: Vec<Value>,
}

impl ArrayValue {
    /// A one-dimensional array with the conventional lower bound of 1.
    pub fn from_values(element_oid: u32, values: Vec<Value>) -> ArrayValue {
        let dims = if values.is_empty() {
            Vec::new()
        } else {
            vec![(values.len() as i32, 1)]
        };
        ArrayValue {
            element_oid,
            dims,
            values,
        }
    }
}

/// One field of a `record` value: the field's type OID and its value.
pub type RecordField = (u32, Value);

/// A decoded or encodable PostgreSQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// TOASTed-but-unchanged column in a pgoutput tuple. Never encodable.
    UnchangedToast,
    Bool(bool),
    Bytes(Bytes),
    /// The single-byte `"char"` type.
    Char(i8),
    Name(String),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(u32),
    Xid(u32),
    Float4(f32),
    Float8(f64),
    Text(String),
    Json(serde_json::Value),
    Record(Vec<RecordField>),
    Point(Point),
    LineSegment(LineSegment),
    Path(PgPath),
    Box(PgBox),
    Polygon(Polygon),
    Line(Line),
    Circle(Circle),
    /// `money` in cents.
    Money(i64),
    Inet(Inet),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    /// Time of day plus a UTC offset in seconds east (ISO convention; the
    /// wire carries the offset sign-inverted).
    TimeTz { time: NaiveTime, offset_secs: i32 },
    Interval(Interval),
    Numeric(PgNumeric),
    Uuid(uuid::Uuid),
    Lsn(Lsn),
    TsVector(TsVector),
    Range(Box<RangeValue>),
    Array(ArrayValue),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The built-in parameter OID for this value's variant; 0 (unknown,
    /// server chooses) when there is none.
    pub fn builtin_oid(&self) -> u32 {
        match self {
            Value::Null | Value::UnchangedToast => 0,
            Value::Bool(_) => oid::BOOL,
            Value::Bytes(_) => oid::BYTEA,
            Value::Char(_) => oid::CHAR,
            Value::Name(_) => oid::NAME,
            Value::Int2(_) => oid::INT2,
            Value::Int4(_) => oid::INT4,
            Value::Int8(_) => oid::INT8,
            Value::Oid(_) => oid::OID,
            Value::Xid(_) => oid::XID,
            Value::Float4(_) => oid::FLOAT4,
            Value::Float8(_) => oid::FLOAT8,
            Value::Text(_) => oid::TEXT,
            Value::Json(_) => oid::JSON,
            Value::Record(_) => oid::RECORD,
            Value::Point(_) => oid::POINT,
            Value::LineSegment(_) => oid::LSEG,
            Value::Path(_) => oid::PATH,
            Value::Box(_) => oid::BOX,
            Value::Polygon(_) => oid::POLYGON,
            Value::Line(_) => oid::LINE,
            Value::Circle(_) => oid::CIRCLE,
            Value::Money(_) => oid::MONEY,
            Value::Inet(_) => oid::INET,
            Value::Date(_) => oid::DATE,
            Value::Time(_) => oid::TIME,
            Value::Timestamp(_) => oid::TIMESTAMP,
            Value::TimestampTz(_) => oid::TIMESTAMPTZ,
            Value::TimeTz { .. } => oid::TIMETZ,
            Value::Interval(_) => oid::INTERVAL,
            Value::Numeric(_) => oid::NUMERIC,
            Value::Uuid(_) => oid::UUID,
            Value::Lsn(_) => oid::PG_LSN,
            Value::TsVector(_) => oid::TSVECTOR,
            Value::Range(r) => r.range_oid,
            Value::Array(a) => oid::array_oid(a.element_oid).unwrap_or(0),
        }
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int2(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int4(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int8(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float4(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float8(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
