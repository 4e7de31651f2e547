//! Replication-mode `CopyData` payloads.
//!
//! Once `START_REPLICATION` succeeds the connection is in CopyBoth mode:
//! the server wraps WAL sections and keepalives in CopyData, the client
//! answers with `StandbyStatusUpdate` CopyData carrying its LSN progress.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::protocol::buffer::Reader;

/// Microseconds between the Unix epoch and 2000-01-01T00:00:00Z, the
/// PostgreSQL timestamp epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800 * 1_000_000;

/// Current wall-clock time in microseconds since the PostgreSQL epoch.
pub fn pg_epoch_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let unix_micros = (now.as_secs() as i64) * 1_000_000 + i64::from(now.subsec_micros());
    unix_micros - PG_EPOCH_MICROS
}

/// Convert a PostgreSQL-epoch microsecond timestamp to Unix microseconds.
#[inline]
pub fn pg_to_unix_micros(pg_micros: i64) -> i64 {
    pg_micros + PG_EPOCH_MICROS
}

/// Server-to-client payloads inside replication CopyData.
#[derive(Debug, Clone)]
pub enum ReplicationCopyData {
    /// `'w'`: a section of WAL output from the logical decoding plugin.
    WalData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time_micros: i64,
        section: Bytes,
    },
    /// `'k'`: heartbeat; `reply_asap` asks for an immediate status update.
    PrimaryKeepAlive {
        wal_end: Lsn,
        server_time_micros: i64,
        reply_asap: bool,
    },
}

/// Parse one replication CopyData payload.
pub fn parse_copy_data(payload: &Bytes) -> Result<ReplicationCopyData> {
    if payload.is_empty() {
        return Err(Error::Fault("empty CopyData payload".into()));
    }
    let mut r = Reader::new(payload);
    let kind = r.u8()?;
    match kind {
        b'w' => {
            let wal_start = Lsn(r.u64()?);
            let wal_end = Lsn(r.u64()?);
            let server_time_micros = r.i64()?;
            let section = r.rest_bytes();
            Ok(ReplicationCopyData::WalData {
                wal_start,
                wal_end,
                server_time_micros,
                section,
            })
        }
        b'k' => {
            let wal_end = Lsn(r.u64()?);
            let server_time_micros = r.i64()?;
            let reply_asap = r.u8()? == 1;
            Ok(ReplicationCopyData::PrimaryKeepAlive {
                wal_end,
                server_time_micros,
                reply_asap,
            })
        }
        _ => Err(Error::Fault(format!(
            "unknown replication CopyData kind: {kind:#x}"
        ))),
    }
}

/// Encode a `StandbyStatusUpdate` ('r') payload.
///
/// This crate always reports written = flushed = applied: an LSN is only
/// acknowledged after the handler completed for its transaction, at which
/// point all three are true.
pub fn encode_standby_status_update(
    written: Lsn,
    flushed: Lsn,
    applied: Lsn,
    client_time_micros: i64,
    reply_asap: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 * 4 + 1);
    out.push(b'r');
    out.extend_from_slice(&written.0.to_be_bytes());
    out.extend_from_slice(&flushed.0.to_be_bytes());
    out.extend_from_slice(&applied.0.to_be_bytes());
    out.extend_from_slice(&client_time_micros.to_be_bytes());
    out.push(u8::from(reply_asap));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_waldata() {
        let mut v = Vec::new();
        v.push(b'w');
        v.extend_from_slice(&1u64.to_be_bytes());
        v.extend_from_slice(&2u64.to_be_bytes());
        v.extend_from_slice(&3i64.to_be_bytes());
        v.extend_from_slice(b"abc");
        let msg = parse_copy_data(&Bytes::from(v)).unwrap();
        match msg {
            ReplicationCopyData::WalData {
                wal_start,
                wal_end,
                server_time_micros,
                section,
            } => {
                assert_eq!(wal_start.0, 1);
                assert_eq!(wal_end.0, 2);
                assert_eq!(server_time_micros, 3);
                assert_eq!(&section[..], b"abc");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_keepalive_reply_flag() {
        let mut v = Vec::new();
        v.push(b'k');
        v.extend_from_slice(&7u64.to_be_bytes());
        v.extend_from_slice(&9i64.to_be_bytes());
        v.push(1);
        match parse_copy_data(&Bytes::from(v)).unwrap() {
            ReplicationCopyData::PrimaryKeepAlive {
                wal_end,
                reply_asap,
                ..
            } => {
                assert_eq!(wal_end.0, 7);
                assert!(reply_asap);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn truncated_keepalive_is_a_fault() {
        let v = vec![b'k', 0, 0];
        assert!(parse_copy_data(&Bytes::from(v)).unwrap_err().is_fault());
    }

    #[test]
    fn encode_status_update_layout() {
        let p = encode_standby_status_update(Lsn(42), Lsn(42), Lsn(42), 7, true);
        assert_eq!(p.len(), 1 + 8 * 4 + 1);
        assert_eq!(p[0], b'r');
        assert_eq!(p[p.len() - 1], 1);
        assert_eq!(&p[1..9], &42u64.to_be_bytes());
        assert_eq!(&p[9..17], &42u64.to_be_bytes());
    }

    #[test]
    fn pg_epoch_round_trip() {
        let pg = 1_000_000i64;
        assert_eq!(pg_to_unix_micros(pg) - PG_EPOCH_MICROS, pg);
    }
}
