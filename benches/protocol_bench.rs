//! Benchmarks for the protocol and codec hot paths.
//!
//! Run with: `cargo bench --bench protocol_bench`

use bytes::{BufMut, Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pgcdc::config::StreamingMode;
use pgcdc::error::ServerError;
use pgcdc::lsn::Lsn;
use pgcdc::protocol::pgoutput::{DecodeContext, PgOutputMessage};
use pgcdc::protocol::replication::{encode_standby_status_update, parse_copy_data};
use pgcdc::types::{encode_binary, DecoderRegistry, Value};

/// Generate a realistic WAL data payload
fn make_waldata_payload(data_size: usize) -> Bytes {
    let mut v = Vec::with_capacity(1 + 24 + data_size);
    v.push(b'w');
    v.extend_from_slice(&0x0123456789ABCDEFu64.to_be_bytes()); // wal_start
    v.extend_from_slice(&0xFEDCBA9876543210u64.to_be_bytes()); // wal_end
    v.extend_from_slice(&1234567890i64.to_be_bytes()); // server_time
    v.extend_from_slice(&vec![0x42u8; data_size]); // payload
    Bytes::from(v)
}

/// Generate a KeepAlive payload
fn make_keepalive_payload() -> Bytes {
    let mut v = Vec::with_capacity(18);
    v.push(b'k');
    v.extend_from_slice(&100i64.to_be_bytes());
    v.extend_from_slice(&200i64.to_be_bytes());
    v.push(1);
    Bytes::from(v)
}

/// Generate a realistic error response payload
fn make_error_payload() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"SERROR\0");
    payload.extend_from_slice(b"VFATAL\0");
    payload.extend_from_slice(b"C42P01\0");
    payload.extend_from_slice(b"Mrelation \"users\" does not exist\0");
    payload.extend_from_slice(b"Dtable was dropped in a previous migration\0");
    payload.extend_from_slice(b"Hcheck your migration scripts\0");
    payload.extend_from_slice(b"Fparse_relation.c\0");
    payload.extend_from_slice(b"L1234\0");
    payload.extend_from_slice(b"Rparseropen\0");
    payload.push(0);
    payload
}

/// A pgoutput Insert with one int and one short text column.
fn make_insert_message() -> Bytes {
    let mut b = BytesMut::new();
    b.put_u8(b'I');
    b.put_u32(16385);
    b.put_u8(b'N');
    b.put_i16(2);
    b.put_u8(b'b');
    b.put_i32(4);
    b.put_i32(42);
    b.put_u8(b'b');
    b.put_i32(5);
    b.extend_from_slice(b"hello");
    b.freeze()
}

fn bench_parse_waldata(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_waldata");

    for size in [64, 256, 1024, 4096, 16384] {
        let payload = make_waldata_payload(size);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| parse_copy_data(black_box(payload)));
        });
    }

    group.finish();
}

fn bench_parse_keepalive(c: &mut Criterion) {
    let payload = make_keepalive_payload();

    c.bench_function("parse_keepalive", |b| {
        b.iter(|| parse_copy_data(black_box(&payload)));
    });
}

fn bench_encode_status_update(c: &mut Criterion) {
    c.bench_function("encode_standby_status_update", |b| {
        b.iter(|| {
            let lsn = black_box(Lsn(0x123456789ABCDEF0));
            encode_standby_status_update(lsn, lsn, lsn, black_box(1234567890), black_box(false))
        });
    });
}

fn bench_server_error_parse(c: &mut Criterion) {
    let payload = make_error_payload();

    c.bench_function("ServerError::parse", |b| {
        b.iter(|| ServerError::parse(black_box(&payload)));
    });
}

fn bench_pgoutput_insert(c: &mut Criterion) {
    let section = make_insert_message();
    let ctx = DecodeContext {
        in_streamed_tx: false,
        streaming: StreamingMode::Off,
        protocol_version: 2,
    };

    c.bench_function("pgoutput_parse_insert", |b| {
        b.iter(|| PgOutputMessage::parse(black_box(&section), black_box(&ctx)));
    });
}

fn bench_codec_int4_round_trip(c: &mut Criterion) {
    let registry = DecoderRegistry::new();
    let body = encode_binary(&Value::Int4(12345)).expect("encodable").expect("non-null");

    c.bench_function("codec_decode_int4", |b| {
        b.iter(|| registry.decode_binary(black_box(23), black_box(&body)));
    });
}

criterion_group!(
    benches,
    bench_parse_waldata,
    bench_parse_keepalive,
    bench_encode_status_update,
    bench_server_error_parse,
    bench_pgoutput_insert,
    bench_codec_int4_round_trip,
);
criterion_main!(benches);
