//! Backend (server -> client) message decoding.
//!
//! Maps raw [`Frame`](super::framing::Frame)s onto tagged message records.
//! The translation is pure and stateless; replication `CopyData` payloads
//! are handed back opaque and decoded by
//! [`replication`](super::replication) / [`pgoutput`](super::pgoutput),
//! which need session state the frame layer does not have.

use bytes::Bytes;

use crate::error::{Error, Result, ServerError};
use crate::protocol::buffer::Reader;
use crate::protocol::framing::Frame;

/// Backend transaction status byte of `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    InTransaction,
    Failed,
}

/// One column of a `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDef {
    pub name: String,
    pub table_oid: u32,
    pub attnum: i16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_modifier: i32,
    /// 0 = text, 1 = binary.
    pub format: i16,
}

/// Authentication request variants the server may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password,
    Kerberos,
    Gss,
    Sspi,
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    Other(i32),
}

/// Decoded backend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TxStatus),
    RowDescription(Vec<AttributeDef>),
    /// Column values in wire form; `None` is SQL NULL.
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    ParameterDescription(Vec<u32>),
    NoData,
    PortalSuspended,
    Error(ServerError),
    Notice(ServerError),
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    CopyData(Bytes),
    CopyDone,
    Notification {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode a frame into a tagged message. Unknown tags are rejected.
    pub fn decode(frame: &Frame) -> Result<BackendMessage> {
        let mut r = Reader::new(&frame.payload);
        let msg = match frame.tag {
            b'R' => BackendMessage::Authentication(decode_auth_request(&mut r)?),
            b'S' => BackendMessage::ParameterStatus {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: r.i32()?,
                secret_key: r.i32()?,
            },
            b'Z' => BackendMessage::ReadyForQuery(match r.u8()? {
                b'I' => TxStatus::Idle,
                b'T' => TxStatus::InTransaction,
                b'E' => TxStatus::Failed,
                other => {
                    return Err(Error::Fault(format!(
                        "unknown transaction status byte: {other:#x}"
                    )))
                }
            }),
            b'T' => BackendMessage::RowDescription(decode_row_description(&mut r)?),
            b'D' => BackendMessage::DataRow(decode_data_row(&mut r)?),
            b'C' => BackendMessage::CommandComplete(r.cstr()?),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b't' => {
                let n = r.i16()?;
                let mut oids = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n {
                    oids.push(r.u32()?);
                }
                BackendMessage::ParameterDescription(oids)
            }
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b'E' => BackendMessage::Error(ServerError::parse(&frame.payload)),
            b'N' => BackendMessage::Notice(ServerError::parse(&frame.payload)),
            b'G' => BackendMessage::CopyInResponse,
            b'H' => BackendMessage::CopyOutResponse,
            b'W' => BackendMessage::CopyBothResponse,
            b'd' => BackendMessage::CopyData(frame.payload.clone()),
            b'c' => BackendMessage::CopyDone,
            b'A' => BackendMessage::Notification {
                process_id: r.i32()?,
                channel: r.cstr()?,
                payload: r.cstr()?,
            },
            other => {
                return Err(Error::Unsupported(format!(
                    "unknown backend message tag: {:?}",
                    other as char
                )))
            }
        };
        Ok(msg)
    }
}

fn decode_auth_request(r: &mut Reader<'_>) -> Result<AuthRequest> {
    let code = r.i32()?;
    Ok(match code {
        0 => AuthRequest::Ok,
        2 => AuthRequest::Kerberos,
        3 => AuthRequest::CleartextPassword,
        5 => AuthRequest::Md5Password,
        7 => AuthRequest::Gss,
        9 => AuthRequest::Sspi,
        10 => {
            // cstring list terminated by an empty cstring
            let mut mechanisms = Vec::new();
            while !r.is_empty() {
                let m = r.cstr()?;
                if m.is_empty() {
                    break;
                }
                mechanisms.push(m);
            }
            AuthRequest::Sasl { mechanisms }
        }
        11 => AuthRequest::SaslContinue {
            data: r.rest_bytes(),
        },
        12 => AuthRequest::SaslFinal {
            data: r.rest_bytes(),
        },
        other => AuthRequest::Other(other),
    })
}

fn decode_row_description(r: &mut Reader<'_>) -> Result<Vec<AttributeDef>> {
    let n = r.i16()?;
    let mut attrs = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        attrs.push(AttributeDef {
            name: r.cstr()?,
            table_oid: r.u32()?,
            attnum: r.i16()?,
            type_oid: r.u32()?,
            type_len: r.i16()?,
            type_modifier: r.i32()?,
            format: r.i16()?,
        });
    }
    Ok(attrs)
}

fn decode_data_row(r: &mut Reader<'_>) -> Result<Vec<Option<Bytes>>> {
    let n = r.i16()?;
    let mut cols = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        let len = r.i32()?;
        if len < 0 {
            cols.push(None);
        } else {
            cols.push(Some(Bytes::copy_from_slice(r.bytes(len as usize)?)));
        }
    }
    Ok(cols)
}

/// A parsed `CommandComplete` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag {
    pub command: String,
    pub rows: Option<u64>,
}

impl CommandTag {
    /// Split `INSERT 0 5`, `UPDATE 3`, `SELECT 1`, ... into command + row
    /// count. Tags without a count keep the whole string as the command.
    pub fn parse(tag: &str) -> CommandTag {
        let mut parts = tag.split(' ');
        let command = parts.next().unwrap_or_default();
        match command {
            "INSERT" => {
                // INSERT <oid> <rows>
                let _oid = parts.next();
                let rows = parts.next().and_then(|n| n.parse().ok());
                CommandTag {
                    command: command.into(),
                    rows,
                }
            }
            "UPDATE" | "DELETE" | "MERGE" | "SELECT" | "MOVE" | "FETCH" | "COPY" => {
                let rows = parts.next().and_then(|n| n.parse().ok());
                CommandTag {
                    command: command.into(),
                    rows,
                }
            }
            _ => CommandTag {
                command: tag.into(),
                rows: None,
            },
        }
    }
}
