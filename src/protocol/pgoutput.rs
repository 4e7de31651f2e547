//! pgoutput logical-decoding message parser.
//!
//! Protocol versions 2, 3 and 4 are supported. Parsing is context
//! dependent: while a streamed transaction is open, data messages carry an
//! explicit XID prefix, and in version 4 with parallel streaming a
//! `StreamAbort` carries a trailing abort LSN and timestamp. The caller
//! passes that state in via [`DecodeContext`].
//!
//! Two-phase commit messages are recognized and rejected as unsupported.

use bytes::Bytes;

use crate::config::StreamingMode;
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::protocol::buffer::Reader;

/// Read-only session state the parser needs.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    /// True between `StreamStart` and the matching
    /// `StreamStop`/`StreamCommit`/`StreamAbort`.
    pub in_streamed_tx: bool,
    pub streaming: StreamingMode,
    pub protocol_version: u8,
}

/// How a table identifies rows in old-tuple images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    /// Primary key columns.
    Default,
    Nothing,
    /// All columns.
    Full,
    /// Columns of a designated unique index.
    Index,
}

impl ReplicaIdentity {
    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            b'd' => ReplicaIdentity::Default,
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            other => {
                return Err(Error::Fault(format!(
                    "unknown replica identity byte: {other:#x}"
                )))
            }
        })
    }
}

/// One column of a `Relation` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    /// Bit 0: the column is part of the replica identity.
    #[inline]
    pub fn is_key(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// One column value inside a tuple image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// TOASTed value that did not change; the server does not resend it.
    UnchangedToast,
    Text(Bytes),
    Binary(Bytes),
}

/// A row image as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleData {
    pub columns: Vec<TupleValue>,
}

/// Which image an Update/Delete old-tuple carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldTupleKind {
    /// 'K': replica-identity key columns only.
    Key,
    /// 'O': the full old row (REPLICA IDENTITY FULL).
    Full,
}

/// Decoded pgoutput message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgOutputMessage {
    Begin {
        final_lsn: Lsn,
        commit_timestamp: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        tx_end_lsn: Lsn,
        commit_timestamp: i64,
    },
    Origin {
        origin_lsn: Lsn,
        name: String,
    },
    Relation {
        xid: Option<u32>,
        oid: u32,
        namespace: String,
        name: String,
        replica_identity: ReplicaIdentity,
        columns: Vec<RelationColumn>,
    },
    Type {
        xid: Option<u32>,
        oid: u32,
        namespace: String,
        name: String,
    },
    Insert {
        xid: Option<u32>,
        relation_oid: u32,
        new: TupleData,
    },
    Update {
        xid: Option<u32>,
        relation_oid: u32,
        old: Option<(OldTupleKind, TupleData)>,
        new: TupleData,
    },
    Delete {
        xid: Option<u32>,
        relation_oid: u32,
        old_kind: OldTupleKind,
        old: TupleData,
    },
    Truncate {
        xid: Option<u32>,
        relation_oids: Vec<u32>,
        cascade: bool,
        restart_identity: bool,
    },
    Message {
        xid: Option<u32>,
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
        flags: u8,
        commit_lsn: Lsn,
        tx_end_lsn: Lsn,
        commit_timestamp: i64,
    },
    StreamAbort {
        xid: u32,
        subtransaction_xid: u32,
        abort_lsn: Option<Lsn>,
        abort_timestamp: Option<i64>,
    },
}

impl PgOutputMessage {
    /// Parse one pgoutput message from a WAL data section.
    pub fn parse(section: &Bytes, ctx: &DecodeContext) -> Result<PgOutputMessage> {
        let mut r = Reader::new(section);
        let tag = r.u8()?;

        // Inside an open streamed transaction, data messages are prefixed
        // with the transaction's XID.
        let streamed_xid = |r: &mut Reader<'_>| -> Result<Option<u32>> {
            if ctx.in_streamed_tx {
                Ok(Some(r.u32()?))
            } else {
                Ok(None)
            }
        };

        let msg = match tag {
            b'B' => PgOutputMessage::Begin {
                final_lsn: Lsn(r.u64()?),
                commit_timestamp: r.i64()?,
                xid: r.u32()?,
            },
            b'C' => PgOutputMessage::Commit {
                flags: r.u8()?,
                commit_lsn: Lsn(r.u64()?),
                tx_end_lsn: Lsn(r.u64()?),
                commit_timestamp: r.i64()?,
            },
            b'O' => PgOutputMessage::Origin {
                origin_lsn: Lsn(r.u64()?),
                name: r.cstr()?,
            },
            b'R' => {
                let xid = streamed_xid(&mut r)?;
                let oid = r.u32()?;
                let namespace = r.cstr()?;
                let name = r.cstr()?;
                let replica_identity = ReplicaIdentity::from_byte(r.u8()?)?;
                let ncols = r.i16()?;
                let mut columns = Vec::with_capacity(ncols.max(0) as usize);
                for _ in 0..ncols {
                    columns.push(RelationColumn {
                        flags: r.u8()?,
                        name: r.cstr()?,
                        type_oid: r.u32()?,
                        type_modifier: r.i32()?,
                    });
                }
                PgOutputMessage::Relation {
                    xid,
                    oid,
                    namespace,
                    name,
                    replica_identity,
                    columns,
                }
            }
            b'Y' => PgOutputMessage::Type {
                xid: streamed_xid(&mut r)?,
                oid: r.u32()?,
                namespace: r.cstr()?,
                name: r.cstr()?,
            },
            b'I' => {
                let xid = streamed_xid(&mut r)?;
                let relation_oid = r.u32()?;
                expect_tuple_marker(&mut r, b'N')?;
                PgOutputMessage::Insert {
                    xid,
                    relation_oid,
                    new: parse_tuple(&mut r)?,
                }
            }
            b'U' => {
                let xid = streamed_xid(&mut r)?;
                let relation_oid = r.u32()?;
                let mut old = None;
                let mut marker = r.u8()?;
                match marker {
                    b'K' => {
                        old = Some((OldTupleKind::Key, parse_tuple(&mut r)?));
                        marker = r.u8()?;
                    }
                    b'O' => {
                        old = Some((OldTupleKind::Full, parse_tuple(&mut r)?));
                        marker = r.u8()?;
                    }
                    _ => {}
                }
                if marker != b'N' {
                    return Err(Error::Fault(format!(
                        "unexpected tuple marker in Update: {marker:#x}"
                    )));
                }
                PgOutputMessage::Update {
                    xid,
                    relation_oid,
                    old,
                    new: parse_tuple(&mut r)?,
                }
            }
            b'D' => {
                let xid = streamed_xid(&mut r)?;
                let relation_oid = r.u32()?;
                let old_kind = match r.u8()? {
                    b'K' => OldTupleKind::Key,
                    b'O' => OldTupleKind::Full,
                    other => {
                        return Err(Error::Fault(format!(
                            "unexpected tuple marker in Delete: {other:#x}"
                        )))
                    }
                };
                PgOutputMessage::Delete {
                    xid,
                    relation_oid,
                    old_kind,
                    old: parse_tuple(&mut r)?,
                }
            }
            b'T' => {
                let xid = streamed_xid(&mut r)?;
                let nrels = r.i32()?;
                let options = r.u8()?;
                let mut relation_oids = Vec::with_capacity(nrels.max(0) as usize);
                for _ in 0..nrels {
                    relation_oids.push(r.u32()?);
                }
                PgOutputMessage::Truncate {
                    xid,
                    relation_oids,
                    cascade: options & 0x01 != 0,
                    restart_identity: options & 0x02 != 0,
                }
            }
            b'M' => {
                let xid = streamed_xid(&mut r)?;
                let flags = r.u8()?;
                let lsn = Lsn(r.u64()?);
                let prefix = r.cstr()?;
                let len = r.i32()?;
                let content = Bytes::copy_from_slice(r.bytes(len.max(0) as usize)?);
                PgOutputMessage::Message {
                    xid,
                    transactional: flags & 0x01 != 0,
                    lsn,
                    prefix,
                    content,
                }
            }
            b'S' => PgOutputMessage::StreamStart {
                xid: r.u32()?,
                first_segment: r.u8()? == 1,
            },
            b'E' => PgOutputMessage::StreamStop,
            b'c' => PgOutputMessage::StreamCommit {
                xid: r.u32()?,
                flags: r.u8()?,
                commit_lsn: Lsn(r.u64()?),
                tx_end_lsn: Lsn(r.u64()?),
                commit_timestamp: r.i64()?,
            },
            b'A' => {
                let xid = r.u32()?;
                let subtransaction_xid = r.u32()?;
                // The trailers exist only for version 4 parallel streaming.
                let (abort_lsn, abort_timestamp) = if ctx.protocol_version == 4
                    && ctx.streaming == StreamingMode::Parallel
                {
                    (Some(Lsn(r.u64()?)), Some(r.i64()?))
                } else {
                    (None, None)
                };
                PgOutputMessage::StreamAbort {
                    xid,
                    subtransaction_xid,
                    abort_lsn,
                    abort_timestamp,
                }
            }
            b'b' | b'P' | b'K' | b'r' | b'p' => {
                return Err(Error::Unsupported(format!(
                    "two-phase pgoutput message {:?} is not supported",
                    tag as char
                )))
            }
            other => {
                return Err(Error::Fault(format!(
                    "unknown pgoutput message tag: {:?}",
                    other as char
                )))
            }
        };
        Ok(msg)
    }
}

fn expect_tuple_marker(r: &mut Reader<'_>, want: u8) -> Result<()> {
    let got = r.u8()?;
    if got != want {
        return Err(Error::Fault(format!(
            "unexpected tuple marker: {got:#x} (wanted {want:#x})"
        )));
    }
    Ok(())
}

fn parse_tuple(r: &mut Reader<'_>) -> Result<TupleData> {
    let n = r.i16()?;
    let mut columns = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        let kind = r.u8()?;
        let value = match kind {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::UnchangedToast,
            b't' => {
                let len = r.i32()?;
                TupleValue::Text(Bytes::copy_from_slice(r.bytes(len.max(0) as usize)?))
            }
            b'b' => {
                let len = r.i32()?;
                TupleValue::Binary(Bytes::copy_from_slice(r.bytes(len.max(0) as usize)?))
            }
            other => {
                return Err(Error::Fault(format!(
                    "unknown tuple column kind: {other:#x}"
                )))
            }
        };
        columns.push(value);
    }
    Ok(TupleData { columns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn ctx() -> DecodeContext {
        DecodeContext {
            in_streamed_tx: false,
            streaming: StreamingMode::Off,
            protocol_version: 2,
        }
    }

    fn parse(bytes: BytesMut, ctx: &DecodeContext) -> PgOutputMessage {
        PgOutputMessage::parse(&bytes.freeze(), ctx).unwrap()
    }

    #[test]
    fn begin_message() {
        let mut b = BytesMut::new();
        b.put_u8(b'B');
        b.put_u64(0x16_0000_0010);
        b.put_i64(700_000_000);
        b.put_u32(1234);
        match parse(b, &ctx()) {
            PgOutputMessage::Begin {
                final_lsn,
                commit_timestamp,
                xid,
            } => {
                assert_eq!(final_lsn, Lsn(0x16_0000_0010));
                assert_eq!(commit_timestamp, 700_000_000);
                assert_eq!(xid, 1234);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn relation_with_key_column() {
        let mut b = BytesMut::new();
        b.put_u8(b'R');
        b.put_u32(16385);
        b.extend_from_slice(b"public\0");
        b.extend_from_slice(b"t\0");
        b.put_u8(b'd');
        b.put_i16(2);
        b.put_u8(1); // key
        b.extend_from_slice(b"id\0");
        b.put_u32(23);
        b.put_i32(-1);
        b.put_u8(0);
        b.extend_from_slice(b"v\0");
        b.put_u32(25);
        b.put_i32(-1);

        match parse(b, &ctx()) {
            PgOutputMessage::Relation {
                xid,
                oid,
                namespace,
                name,
                replica_identity,
                columns,
            } => {
                assert_eq!(xid, None);
                assert_eq!(oid, 16385);
                assert_eq!(namespace, "public");
                assert_eq!(name, "t");
                assert_eq!(replica_identity, ReplicaIdentity::Default);
                assert_eq!(columns.len(), 2);
                assert!(columns[0].is_key());
                assert!(!columns[1].is_key());
                assert_eq!(columns[1].type_oid, 25);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn insert_tuple_kinds() {
        let mut b = BytesMut::new();
        b.put_u8(b'I');
        b.put_u32(16385);
        b.put_u8(b'N');
        b.put_i16(3);
        b.put_u8(b'n');
        b.put_u8(b'u');
        b.put_u8(b'b');
        b.put_i32(4);
        b.put_i32(7);

        match parse(b, &ctx()) {
            PgOutputMessage::Insert { new, .. } => {
                assert_eq!(new.columns[0], TupleValue::Null);
                assert_eq!(new.columns[1], TupleValue::UnchangedToast);
                match &new.columns[2] {
                    TupleValue::Binary(bytes) => assert_eq!(&bytes[..], &7i32.to_be_bytes()),
                    other => panic!("wrong column: {other:?}"),
                }
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn update_with_full_old_row() {
        let mut b = BytesMut::new();
        b.put_u8(b'U');
        b.put_u32(16385);
        b.put_u8(b'O');
        b.put_i16(1);
        b.put_u8(b't');
        b.put_i32(1);
        b.extend_from_slice(b"1");
        b.put_u8(b'N');
        b.put_i16(1);
        b.put_u8(b't');
        b.put_i32(1);
        b.extend_from_slice(b"2");

        match parse(b, &ctx()) {
            PgOutputMessage::Update { old, new, .. } => {
                let (kind, old) = old.unwrap();
                assert_eq!(kind, OldTupleKind::Full);
                assert_eq!(old.columns[0], TupleValue::Text(Bytes::from_static(b"1")));
                assert_eq!(new.columns[0], TupleValue::Text(Bytes::from_static(b"2")));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn streamed_insert_carries_xid() {
        let mut b = BytesMut::new();
        b.put_u8(b'I');
        b.put_u32(999); // xid prefix
        b.put_u32(16385);
        b.put_u8(b'N');
        b.put_i16(0);

        let ctx = DecodeContext {
            in_streamed_tx: true,
            streaming: StreamingMode::On,
            protocol_version: 2,
        };
        match parse(b, &ctx) {
            PgOutputMessage::Insert {
                xid, relation_oid, ..
            } => {
                assert_eq!(xid, Some(999));
                assert_eq!(relation_oid, 16385);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn stream_abort_trailers_only_v4_parallel() {
        let mut base = BytesMut::new();
        base.put_u8(b'A');
        base.put_u32(5);
        base.put_u32(6);

        // v2: no trailers
        match parse(base.clone(), &ctx()) {
            PgOutputMessage::StreamAbort {
                abort_lsn,
                abort_timestamp,
                ..
            } => {
                assert_eq!(abort_lsn, None);
                assert_eq!(abort_timestamp, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }

        // v4 parallel: trailers present
        base.put_u64(0x10);
        base.put_i64(42);
        let ctx4 = DecodeContext {
            in_streamed_tx: false,
            streaming: StreamingMode::Parallel,
            protocol_version: 4,
        };
        match parse(base, &ctx4) {
            PgOutputMessage::StreamAbort {
                xid,
                subtransaction_xid,
                abort_lsn,
                abort_timestamp,
            } => {
                assert_eq!(xid, 5);
                assert_eq!(subtransaction_xid, 6);
                assert_eq!(abort_lsn, Some(Lsn(0x10)));
                assert_eq!(abort_timestamp, Some(42));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn logical_message_content() {
        let mut b = BytesMut::new();
        b.put_u8(b'M');
        b.put_u8(1); // transactional
        b.put_u64(0x20);
        b.extend_from_slice(b"prefix\0");
        b.put_i32(13);
        b.extend_from_slice(b"Hello, world!");

        match parse(b, &ctx()) {
            PgOutputMessage::Message {
                transactional,
                lsn,
                prefix,
                content,
                ..
            } => {
                assert!(transactional);
                assert_eq!(lsn, Lsn(0x20));
                assert_eq!(prefix, "prefix");
                assert_eq!(&content[..], b"Hello, world!");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn truncate_options() {
        let mut b = BytesMut::new();
        b.put_u8(b'T');
        b.put_i32(2);
        b.put_u8(0x03);
        b.put_u32(100);
        b.put_u32(200);

        match parse(b, &ctx()) {
            PgOutputMessage::Truncate {
                relation_oids,
                cascade,
                restart_identity,
                ..
            } => {
                assert_eq!(relation_oids, vec![100, 200]);
                assert!(cascade);
                assert!(restart_identity);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn two_phase_messages_are_unsupported() {
        for tag in [b'b', b'P', b'K', b'r', b'p'] {
            let mut b = BytesMut::new();
            b.put_u8(tag);
            let err = PgOutputMessage::parse(&b.freeze(), &ctx()).unwrap_err();
            assert!(matches!(err, Error::Unsupported(_)), "tag {tag}");
        }
    }
}
