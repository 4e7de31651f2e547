//! Frontend (client -> server) message encoders.
//!
//! Each `put_*` function appends one complete frame to the buffer: tag byte,
//! i32 length placeholder, body, then the placeholder patched with the true
//! length. Several frames can be batched into one buffer and written with a
//! single flush, which is how the pipelined extended-query path works.

use bytes::{BufMut, BytesMut};

/// Protocol 3.0 version number sent in the startup message.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Magic code of the SSLRequest pseudo-message.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Binary format code for parameters and result columns.
pub const FORMAT_BINARY: i16 = 1;

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Append a tagged frame whose body is produced by `body`.
fn with_frame(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let base = buf.len();
    buf.put_i32(0); // length placeholder
    body(buf);
    let len = (buf.len() - base) as i32;
    buf[base..base + 4].copy_from_slice(&len.to_be_bytes());
}

/// The 8-byte SSLRequest message (untagged, sent before anything else).
pub fn ssl_request() -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&8i32.to_be_bytes());
    out[4..8].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    out
}

/// The startup message (untagged): protocol version plus `key\0value\0`
/// pairs, terminated by an empty key.
pub fn startup(params: &[(&str, &str)]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(PROTOCOL_VERSION);
    for (k, v) in params {
        put_cstr(&mut buf, k);
        put_cstr(&mut buf, v);
    }
    buf.put_u8(0);

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf
}

pub fn put_query(buf: &mut BytesMut, sql: &str) {
    with_frame(buf, b'Q', |b| put_cstr(b, sql));
}

pub fn put_parse(buf: &mut BytesMut, statement: &str, sql: &str, param_oids: &[u32]) {
    with_frame(buf, b'P', |b| {
        put_cstr(b, statement);
        put_cstr(b, sql);
        b.put_i16(param_oids.len() as i16);
        for oid in param_oids {
            b.put_u32(*oid);
        }
    });
}

pub fn put_describe_statement(buf: &mut BytesMut, name: &str) {
    with_frame(buf, b'D', |b| {
        b.put_u8(b'S');
        put_cstr(b, name);
    });
}

/// Bind with all parameters and all result columns in binary format.
/// A `None` parameter is SQL NULL (length -1, no body).
pub fn put_bind(buf: &mut BytesMut, portal: &str, statement: &str, params: &[Option<Vec<u8>>]) {
    with_frame(buf, b'B', |b| {
        put_cstr(b, portal);
        put_cstr(b, statement);
        b.put_i16(1);
        b.put_i16(FORMAT_BINARY);
        b.put_i16(params.len() as i16);
        for p in params {
            match p {
                Some(bytes) => {
                    b.put_i32(bytes.len() as i32);
                    b.extend_from_slice(bytes);
                }
                None => b.put_i32(-1),
            }
        }
        b.put_i16(1);
        b.put_i16(FORMAT_BINARY);
    });
}

pub fn put_execute(buf: &mut BytesMut, portal: &str, max_rows: i32) {
    with_frame(buf, b'E', |b| {
        put_cstr(b, portal);
        b.put_i32(max_rows);
    });
}

pub fn put_sync(buf: &mut BytesMut) {
    with_frame(buf, b'S', |_| {});
}

pub fn put_flush(buf: &mut BytesMut) {
    with_frame(buf, b'H', |_| {});
}

pub fn put_close_statement(buf: &mut BytesMut, name: &str) {
    with_frame(buf, b'C', |b| {
        b.put_u8(b'S');
        put_cstr(b, name);
    });
}

/// PasswordMessage carrying an opaque SASL or password payload.
pub fn put_password(buf: &mut BytesMut, payload: &[u8]) {
    with_frame(buf, b'p', |b| b.extend_from_slice(payload));
}

/// SASLInitialResponse: mechanism name, then the length-prefixed
/// client-first-message. Sent in a PasswordMessage frame.
pub fn put_sasl_initial_response(buf: &mut BytesMut, mechanism: &str, client_first: &[u8]) {
    with_frame(buf, b'p', |b| {
        put_cstr(b, mechanism);
        b.put_i32(client_first.len() as i32);
        b.extend_from_slice(client_first);
    });
}

/// SASLResponse: the raw client-final-message.
pub fn put_sasl_response(buf: &mut BytesMut, client_final: &[u8]) {
    put_password(buf, client_final);
}

pub fn put_copy_data(buf: &mut BytesMut, payload: &[u8]) {
    with_frame(buf, b'd', |b| b.extend_from_slice(payload));
}

pub fn put_copy_done(buf: &mut BytesMut) {
    with_frame(buf, b'c', |_| {});
}

pub fn put_copy_fail(buf: &mut BytesMut, message: &str) {
    with_frame(buf, b'f', |b| put_cstr(b, message));
}

pub fn put_terminate(buf: &mut BytesMut) {
    with_frame(buf, b'X', |_| {});
}
