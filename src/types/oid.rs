//! Built-in type OIDs and the scalar/array pairing table.

pub const BOOL: u32 = 16;
pub const BYTEA: u32 = 17;
pub const CHAR: u32 = 18;
pub const NAME: u32 = 19;
pub const INT8: u32 = 20;
pub const INT2: u32 = 21;
pub const INT4: u32 = 23;
pub const TEXT: u32 = 25;
pub const OID: u32 = 26;
pub const XID: u32 = 28;
pub const JSON: u32 = 114;
pub const POINT: u32 = 600;
pub const LSEG: u32 = 601;
pub const PATH: u32 = 602;
pub const BOX: u32 = 603;
pub const POLYGON: u32 = 604;
pub const LINE: u32 = 628;
pub const FLOAT4: u32 = 700;
pub const FLOAT8: u32 = 701;
pub const CIRCLE: u32 = 718;
pub const MONEY: u32 = 790;
pub const INET: u32 = 869;
pub const BPCHAR: u32 = 1042;
pub const VARCHAR: u32 = 1043;
pub const DATE: u32 = 1082;
pub const TIME: u32 = 1083;
pub const TIMESTAMP: u32 = 1114;
pub const TIMESTAMPTZ: u32 = 1184;
pub const INTERVAL: u32 = 1186;
pub const TIMETZ: u32 = 1266;
pub const NUMERIC: u32 = 1700;
pub const RECORD: u32 = 2249;
pub const VOID: u32 = 2278;
pub const UUID: u32 = 2950;
pub const PG_LSN: u32 = 3220;
pub const TSVECTOR: u32 = 3614;
pub const JSONB: u32 = 3802;
pub const INT4RANGE: u32 = 3904;
pub const NUMRANGE: u32 = 3906;
pub const TSRANGE: u32 = 3908;
pub const TSTZRANGE: u32 = 3910;
pub const DATERANGE: u32 = 3912;
pub const INT8RANGE: u32 = 3926;

/// `(scalar, array)` OID pairs for every built-in element type.
pub const ARRAY_PAIRS: &[(u32, u32)] = &[
    (BOOL, 1000),
    (BYTEA, 1001),
    (CHAR, 1002),
    (NAME, 1003),
    (INT8, 1016),
    (INT2, 1005),
    (INT4, 1007),
    (TEXT, 1009),
    (OID, 1028),
    (XID, 1011),
    (JSON, 199),
    (POINT, 1017),
    (LSEG, 1018),
    (PATH, 1019),
    (BOX, 1020),
    (POLYGON, 1027),
    (LINE, 629),
    (FLOAT4, 1021),
    (FLOAT8, 1022),
    (CIRCLE, 719),
    (MONEY, 791),
    (INET, 1041),
    (BPCHAR, 1014),
    (VARCHAR, 1015),
    (DATE, 1182),
    (TIME, 1183),
    (TIMESTAMP, 1115),
    (TIMESTAMPTZ, 1185),
    (INTERVAL, 1187),
    (TIMETZ, 1270),
    (NUMERIC, 1231),
    (RECORD, 2287),
    (UUID, 2951),
    (PG_LSN, 3221),
    (TSVECTOR, 3643),
    (JSONB, 3807),
    (INT4RANGE, 3905),
    (NUMRANGE, 3907),
    (TSRANGE, 3909),
    (TSTZRANGE, 3911),
    (DATERANGE, 3913),
    (INT8RANGE, 3927),
];

/// Array OID for a built-in element type, if one is paired.
pub fn array_oid(element: u32) -> Option<u32> {
    ARRAY_PAIRS
        .iter()
        .find(|(e, _)| *e == element)
        .map(|(_, a)| *a)
}

/// Element OID for a built-in array type, if one is paired.
pub fn element_oid(array: u32) -> Option<u32> {
    ARRAY_PAIRS
        .iter()
        .find(|(_, a)| *a == array)
        .map(|(e, _)| *e)
}

/// Element OID of a built-in range type.
pub fn range_element_oid(range: u32) -> Option<u32> {
    Some(match range {
        INT4RANGE => INT4,
        NUMRANGE => NUMERIC,
        TSRANGE => TIMESTAMP,
        TSTZRANGE => TIMESTAMPTZ,
        DATERANGE => DATE,
        INT8RANGE => INT8,
        _ => return None,
    })
}
