//! Replication state machine: relation cache, tuple decoding, event
//! enrichment, and acknowledgement bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::client::sql::{Row, SqlClient};
use crate::config::{KeyFn, StreamingMode};
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::protocol::pgoutput::{
    DecodeContext, OldTupleKind, PgOutputMessage, RelationColumn, ReplicaIdentity, TupleData,
    TupleValue,
};
use crate::protocol::replication::pg_to_unix_micros;
use crate::types::Value;

/// Cached schema of one published relation, refreshed on every `Relation`
/// message. Truncation does not invalidate an entry.
#[derive(Debug, Clone)]
pub struct RelationCacheEntry {
    pub schema: String,
    pub table: String,
    pub columns: Vec<RelationColumn>,
    /// Row keys (via `key_fn`) of the replica-identity columns.
    pub key_columns: Vec<String>,
    pub replica_identity: ReplicaIdentity,
}

/// A `{schema, table}` pair, used for truncate targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

/// One enriched change delivered to the handler.
#[derive(Debug, Clone)]
pub enum Change {
    Begin {
        final_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        commit_lsn: Lsn,
        tx_end_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
    },
    Origin {
        origin_lsn: Lsn,
        name: String,
    },
    Relation {
        oid: u32,
        schema: String,
        table: String,
        columns: Vec<RelationColumn>,
        key_columns: Vec<String>,
        replica_identity: ReplicaIdentity,
    },
    Type {
        oid: u32,
        schema: String,
        name: String,
    },
    Insert {
        relation_oid: u32,
        schema: String,
        table: String,
        new_row: Row,
    },
    Update {
        relation_oid: u32,
        schema: String,
        table: String,
        keys: Vec<String>,
        replica_identity: ReplicaIdentity,
        old_row: Option<Row>,
        new_row: Row,
    },
    Delete {
        relation_oid: u32,
        schema: String,
        table: String,
        keys: Vec<String>,
        old_row: Row,
    },
    Truncate {
        targets: Vec<TableRef>,
        cascade: bool,
        restart_identity: bool,
    },
    Message {
        transactional: bool,
        lsn: Lsn,
        prefix: String,
        content: Bytes,
    },
    StreamStart {
        xid: u32,
        first_segment: bool,
    },
    StreamStop,
    StreamCommit {
        xid: u32,
        commit_lsn: Lsn,
        tx_end_lsn: Lsn,
        commit_timestamp: DateTime<Utc>,
    },
    StreamAbort {
        xid: u32,
        subtransaction_xid: u32,
        abort_lsn: Option<Lsn>,
    },
}

/// The event passed to the change handler. `ack` is present exactly on the
/// terminal messages that close a transaction (`Commit`, `StreamCommit`,
/// `StreamAbort` with an abort LSN).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub change: Change,
    /// Transaction id, when the message carried one.
    pub xid: Option<u32>,
    /// WAL position of the enclosing XLogData section.
    pub lsn: Lsn,
    pub ack: Option<AckHandle>,
}

/// Shared LSN bookkeeping between acks, the flusher, and keepalives.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    unflushed: Mutex<Option<Lsn>>,
    flushed: AtomicU64,
}

impl Progress {
    /// Raise the unflushed position; never lowers it.
    pub fn raise_unflushed(&self, lsn: Lsn) {
        let mut guard = self.unflushed.lock().expect("progress lock poisoned");
        let current = guard.unwrap_or(Lsn::ZERO);
        if lsn > current {
            *guard = Some(lsn);
        }
    }

    /// The position the next status update should report:
    /// unflushed if pending, else the last flushed.
    pub fn flush_target(&self) -> Lsn {
        let guard = self.unflushed.lock().expect("progress lock poisoned");
        guard.unwrap_or(self.flushed())
    }

    /// Record a successful `StandbyStatusUpdate` write of `lsn`.
    pub fn commit_flush(&self, lsn: Lsn) {
        let mut guard = self.unflushed.lock().expect("progress lock poisoned");
        if guard.is_some_and(|u| u <= lsn) {
            *guard = None;
        }
        // flushed-lsn is monotonically non-decreasing
        self.flushed.fetch_max(lsn.0, Ordering::AcqRel);
    }

    pub fn flushed(&self) -> Lsn {
        Lsn(self.flushed.load(Ordering::Acquire))
    }
}

/// Calling `ack()` marks the transaction ending at `lsn` as durably
/// processed; the flusher reports it on the next status update.
#[derive(Clone)]
pub struct AckHandle {
    progress: Arc<Progress>,
    lsn: Lsn,
}

impl AckHandle {
    pub(crate) fn new(progress: Arc<Progress>, lsn: Lsn) -> AckHandle {
        AckHandle { progress, lsn }
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn ack(&self) {
        self.progress.raise_unflushed(self.lsn);
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle").field("lsn", &self.lsn).finish()
    }
}

fn pg_timestamp(micros: i64) -> DateTime<Utc> {
    match DateTime::<Utc>::from_timestamp_micros(pg_to_unix_micros(micros)) {
        Some(ts) => ts,
        None => DateTime::<Utc>::MAX_UTC,
    }
}

/// Drives §4.6's replication state machine over parsed pgoutput messages.
pub(crate) struct StateMachine {
    relations: HashMap<u32, RelationCacheEntry>,
    in_streamed_tx: bool,
    streaming: StreamingMode,
    protocol_version: u8,
    key_fn: KeyFn,
    aux: SqlClient,
    progress: Arc<Progress>,
}

impl StateMachine {
    pub fn new(
        streaming: StreamingMode,
        protocol_version: u8,
        key_fn: KeyFn,
        aux: SqlClient,
        progress: Arc<Progress>,
    ) -> StateMachine {
        StateMachine {
            relations: HashMap::new(),
            in_streamed_tx: false,
            streaming,
            protocol_version,
            key_fn,
            aux,
            progress,
        }
    }

    fn decode_context(&self) -> DecodeContext {
        DecodeContext {
            in_streamed_tx: self.in_streamed_tx,
            streaming: self.streaming,
            protocol_version: self.protocol_version,
        }
    }

    fn relation(&self, oid: u32) -> Result<&RelationCacheEntry> {
        self.relations.get(&oid).ok_or_else(|| {
            Error::Fault(format!(
                "data message for relation {oid} before its Relation message"
            ))
        })
    }

    /// Decode one WAL section and produce the enriched event to deliver.
    pub async fn handle(&mut self, wal_start: Lsn, section: &Bytes) -> Result<ChangeEvent> {
        let msg = PgOutputMessage::parse(section, &self.decode_context())?;
        let mut ack = None;
        let mut xid_out = None;

        let change = match msg {
            PgOutputMessage::Begin {
                final_lsn,
                commit_timestamp,
                xid,
            } => {
                xid_out = Some(xid);
                Change::Begin {
                    final_lsn,
                    commit_timestamp: pg_timestamp(commit_timestamp),
                    xid,
                }
            }
            PgOutputMessage::Commit {
                commit_lsn,
                tx_end_lsn,
                commit_timestamp,
                ..
            } => {
                ack = Some(AckHandle::new(self.progress.clone(), tx_end_lsn));
                Change::Commit {
                    commit_lsn,
                    tx_end_lsn,
                    commit_timestamp: pg_timestamp(commit_timestamp),
                }
            }
            PgOutputMessage::Origin { origin_lsn, name } => Change::Origin { origin_lsn, name },
            PgOutputMessage::Relation {
                xid,
                oid,
                namespace,
                name,
                replica_identity,
                columns,
            } => {
                xid_out = xid;
                let key_columns: Vec<String> = columns
                    .iter()
                    .filter(|c| c.is_key())
                    .map(|c| (self.key_fn)(oid, &c.name))
                    .collect();
                let entry = RelationCacheEntry {
                    schema: namespace.clone(),
                    table: name.clone(),
                    columns: columns.clone(),
                    key_columns: key_columns.clone(),
                    replica_identity,
                };
                debug!(oid, table = %format!("{namespace}.{name}"), "relation cached");
                self.relations.insert(oid, entry);
                Change::Relation {
                    oid,
                    schema: namespace,
                    table: name,
                    columns,
                    key_columns,
                    replica_identity,
                }
            }
            PgOutputMessage::Type {
                xid,
                oid,
                namespace,
                name,
            } => {
                xid_out = xid;
                // Make the type decodable before any tuple references it.
                match self.aux.install_type(oid).await {
                    Ok(()) => {}
                    Err(Error::UnknownDataType(_)) => {
                        warn!(oid, %name, "type has no usable pg_type entry; leaving unknown")
                    }
                    Err(e) => return Err(e),
                }
                Change::Type {
                    oid,
                    schema: namespace,
                    name,
                }
            }
            PgOutputMessage::Insert {
                xid,
                relation_oid,
                new,
            } => {
                xid_out = xid;
                let entry = self.relation(relation_oid)?.clone();
                let new_row = self.decode_tuple(relation_oid, &entry, &new).await?;
                Change::Insert {
                    relation_oid,
                    schema: entry.schema,
                    table: entry.table,
                    new_row,
                }
            }
            PgOutputMessage::Update {
                xid,
                relation_oid,
                old,
                new,
            } => {
                xid_out = xid;
                let entry = self.relation(relation_oid)?.clone();
                let old_row = match &old {
                    Some((_, tuple)) => {
                        Some(self.decode_tuple(relation_oid, &entry, tuple).await?)
                    }
                    None => None,
                };
                let new_row = self.decode_tuple(relation_oid, &entry, &new).await?;
                Change::Update {
                    relation_oid,
                    schema: entry.schema,
                    table: entry.table,
                    keys: entry.key_columns,
                    replica_identity: match old {
                        Some((OldTupleKind::Full, _)) => ReplicaIdentity::Full,
                        _ => entry.replica_identity,
                    },
                    old_row,
                    new_row,
                }
            }
            PgOutputMessage::Delete {
                xid,
                relation_oid,
                old,
                ..
            } => {
                xid_out = xid;
                let entry = self.relation(relation_oid)?.clone();
                let old_row = self.decode_tuple(relation_oid, &entry, &old).await?;
                Change::Delete {
                    relation_oid,
                    schema: entry.schema,
                    table: entry.table,
                    keys: entry.key_columns,
                    old_row,
                }
            }
            PgOutputMessage::Truncate {
                xid,
                relation_oids,
                cascade,
                restart_identity,
            } => {
                xid_out = xid;
                let mut targets = Vec::with_capacity(relation_oids.len());
                for oid in relation_oids {
                    let entry = self.relation(oid)?;
                    targets.push(TableRef {
                        schema: entry.schema.clone(),
                        table: entry.table.clone(),
                    });
                }
                Change::Truncate {
                    targets,
                    cascade,
                    restart_identity,
                }
            }
            PgOutputMessage::Message {
                xid,
                transactional,
                lsn,
                prefix,
                content,
            } => {
                xid_out = xid;
                Change::Message {
                    transactional,
                    lsn,
                    prefix,
                    content,
                }
            }
            PgOutputMessage::StreamStart { xid, first_segment } => {
                self.in_streamed_tx = true;
                xid_out = Some(xid);
                Change::StreamStart { xid, first_segment }
            }
            PgOutputMessage::StreamStop => {
                self.in_streamed_tx = false;
                Change::StreamStop
            }
            PgOutputMessage::StreamCommit {
                xid,
                commit_lsn,
                tx_end_lsn,
                commit_timestamp,
                ..
            } => {
                self.in_streamed_tx = false;
                xid_out = Some(xid);
                ack = Some(AckHandle::new(self.progress.clone(), tx_end_lsn));
                Change::StreamCommit {
                    xid,
                    commit_lsn,
                    tx_end_lsn,
                    commit_timestamp: pg_timestamp(commit_timestamp),
                }
            }
            PgOutputMessage::StreamAbort {
                xid,
                subtransaction_xid,
                abort_lsn,
                ..
            } => {
                self.in_streamed_tx = false;
                xid_out = Some(xid);
                if let Some(lsn) = abort_lsn {
                    ack = Some(AckHandle::new(self.progress.clone(), lsn));
                }
                Change::StreamAbort {
                    xid,
                    subtransaction_xid,
                    abort_lsn,
                }
            }
        };

        Ok(ChangeEvent {
            change,
            xid: xid_out,
            lsn: wal_start,
            ack,
        })
    }

    /// Decode a tuple image into a row. NULL columns are omitted; unchanged
    /// TOAST values keep their sentinel. Unknown OIDs get a decoder
    /// installed through the aux client, then one retry.
    async fn decode_tuple(
        &self,
        relation_oid: u32,
        entry: &RelationCacheEntry,
        tuple: &TupleData,
    ) -> Result<Row> {
        if tuple.columns.len() > entry.columns.len() {
            return Err(Error::Fault(format!(
                "tuple has {} columns, relation {}.{} has {}",
                tuple.columns.len(),
                entry.schema,
                entry.table,
                entry.columns.len()
            )));
        }
        let mut row = Row::with_capacity(tuple.columns.len());
        for (idx, cell) in tuple.columns.iter().enumerate() {
            let col = &entry.columns[idx];
            let value = match cell {
                TupleValue::Null => continue,
                TupleValue::UnchangedToast => Value::UnchangedToast,
                TupleValue::Binary(bytes) => {
                    self.decode_with_install(col.type_oid, || {
                        self.registry().decode_binary(col.type_oid, bytes)
                    })
                    .await?
                }
                TupleValue::Text(bytes) => {
                    let s = std::str::from_utf8(bytes)
                        .map_err(|e| Error::Fault(format!("non-UTF8 text column: {e}")))?;
                    self.decode_with_install(col.type_oid, || {
                        self.registry().decode_text(col.type_oid, s)
                    })
                    .await?
                }
            };
            let key = (self.key_fn)(relation_oid, &col.name);
            row.insert(key, value);
        }
        Ok(row)
    }

    fn registry(&self) -> &crate::types::DecoderRegistry {
        self.aux.registry()
    }

    async fn decode_with_install(
        &self,
        type_oid: u32,
        decode: impl Fn() -> Result<Value>,
    ) -> Result<Value> {
        match decode() {
            Err(Error::UnknownDataType(oid)) => {
                self.aux.install_type(oid).await?;
                // Exactly one retry; a second failure propagates.
                decode()
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_ack_is_monotonic() {
        let p = Progress::default();
        p.raise_unflushed(Lsn(10));
        p.raise_unflushed(Lsn(5));
        assert_eq!(p.flush_target(), Lsn(10));
    }

    #[test]
    fn flush_commits_and_clears() {
        let p = Progress::default();
        p.raise_unflushed(Lsn(10));
        let target = p.flush_target();
        p.commit_flush(target);
        assert_eq!(p.flushed(), Lsn(10));
        // nothing unflushed: the next target repeats the flushed position
        assert_eq!(p.flush_target(), Lsn(10));
    }

    #[test]
    fn late_ack_survives_concurrent_flush() {
        let p = Progress::default();
        p.raise_unflushed(Lsn(10));
        let target = p.flush_target();
        // An ack lands between the write and the bookkeeping.
        p.raise_unflushed(Lsn(20));
        p.commit_flush(target);
        assert_eq!(p.flushed(), Lsn(10));
        assert_eq!(p.flush_target(), Lsn(20));
    }

    #[test]
    fn flushed_never_regresses() {
        let p = Progress::default();
        p.commit_flush(Lsn(30));
        p.commit_flush(Lsn(20));
        assert_eq!(p.flushed(), Lsn(30));
    }

    #[test]
    fn ack_handle_raises_unflushed() {
        let p = Arc::new(Progress::default());
        let ack = AckHandle::new(p.clone(), Lsn(42));
        assert_eq!(ack.lsn(), Lsn(42));
        ack.ack();
        assert_eq!(p.flush_target(), Lsn(42));
    }

    #[test]
    fn pg_timestamps_convert_to_utc() {
        // 2000-01-01T00:00:01Z in PostgreSQL epoch micros
        let ts = pg_timestamp(1_000_000);
        assert_eq!(ts.timestamp(), 946_684_801);
    }
}
