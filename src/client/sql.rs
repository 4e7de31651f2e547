//! Synchronous SQL client over a single connection.
//!
//! Two query modes share the connection behind one async mutex: the simple
//! query protocol ([`SqlClient::sq`]) and the extended, pipelined protocol
//! ([`SqlClient::eq`]). The lock is held for the whole request/response
//! exchange so the wire state machine is never interleaved.
//!
//! Any failure while consuming responses, other than a clean server
//! `ErrorResponse`, leaves the stream position unknown. The client then
//! closes the connection and surfaces a protocol-desynchronization fault;
//! later calls fail with "Disconnected from server".

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::client::connection::Connection;
use crate::client::session;
use crate::config::{ConnectConfig, KeyFn, OidFn, ReplicationMode};
use crate::error::{Error, Result, ServerError};
use crate::lsn::Lsn;
use crate::protocol::backend::{AttributeDef, BackendMessage, CommandTag};
use crate::protocol::frontend;
use crate::types::registry::TypeKind;
use crate::types::{encode_binary, parameter_oid, DecoderRegistry, Value};

/// One extended-protocol query: SQL text plus bound parameters.
#[derive(Debug, Clone)]
pub struct Query {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Query {
        Query {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Query {
        self.params.push(value.into());
        self
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Query {
        Query::new(sql)
    }
}

/// A decoded row: column key (via the session `key_fn`) to value.
/// NULL columns are omitted from the mapping.
pub type Row = HashMap<String, Value>;

/// The result of one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<AttributeDef>,
    /// Row key per column, parallel to `columns`.
    pub keys: Vec<String>,
    pub rows: Vec<Row>,
    pub command: Option<CommandTag>,
    /// CopyOut payload, when the statement produced one.
    pub copy_data: Vec<Bytes>,
    /// ParameterStatus messages observed during the exchange.
    pub parameters: Vec<(String, String)>,
}

impl QueryResult {
    /// Value of `column` in row `idx`, resolved through the key mapping.
    pub fn value(&self, idx: usize, column: &str) -> Option<&Value> {
        let pos = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(idx)?.get(&self.keys[pos])
    }

    /// The single value of a one-row, one-column result.
    pub fn single_value(&self) -> Option<&Value> {
        if self.rows.len() == 1 && self.keys.len() == 1 {
            self.rows[0].get(&self.keys[0])
        } else {
            None
        }
    }
}

/// Description of a freshly created replication slot.
#[derive(Debug, Clone)]
pub struct CreatedSlot {
    pub slot_name: String,
    pub consistent_point: Lsn,
    pub snapshot_name: Option<String>,
    pub output_plugin: Option<String>,
}

struct Shared {
    conn: Mutex<Connection>,
    registry: Arc<DecoderRegistry>,
    key_fn: KeyFn,
    oid_fn: Option<OidFn>,
    replication: ReplicationMode,
}

/// A thread-safe SQL client. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct SqlClient {
    shared: Arc<Shared>,
}

impl SqlClient {
    /// Connect and run the startup handshake.
    pub async fn connect(cfg: ConnectConfig) -> Result<SqlClient> {
        Self::connect_shared(cfg, Arc::new(DecoderRegistry::new())).await
    }

    /// Connect with a caller-provided decoder registry (shared with a
    /// subscriber, so type installs benefit both).
    pub(crate) async fn connect_shared(
        cfg: ConnectConfig,
        registry: Arc<DecoderRegistry>,
    ) -> Result<SqlClient> {
        let mut conn = Connection::open(&cfg.host, cfg.port, &cfg.tls).await?;
        session::startup(&mut conn, &cfg).await?;
        Ok(SqlClient {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                registry,
                key_fn: cfg.key_fn.clone(),
                oid_fn: cfg.oid_fn.clone(),
                replication: cfg.replication,
            }),
        })
    }

    pub(crate) fn registry(&self) -> &Arc<DecoderRegistry> {
        &self.shared.registry
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.conn.lock().await.is_closed()
    }

    /// Close the connection (best-effort Terminate). Idempotent.
    pub async fn close(&self) {
        self.shared.conn.lock().await.close().await;
    }

    /// Backend parameters collected from ParameterStatus messages.
    pub async fn backend_parameters(&self) -> HashMap<String, String> {
        self.shared.conn.lock().await.parameters.clone()
    }

    /// Run a simple-protocol query string (may contain several statements;
    /// one result per statement).
    pub async fn sq(&self, sql: &str) -> Result<Vec<QueryResult>> {
        let raw = {
            let mut conn = self.shared.conn.lock().await;
            let mut buf = BytesMut::with_capacity(sql.len() + 16);
            frontend::put_query(&mut buf, sql);
            if let Err(e) = conn.send(&buf).await {
                conn.mark_closed();
                return Err(e);
            }
            match consume_exchange(&mut conn).await {
                Ok(raw) => raw,
                Err(e) => return Err(desynchronize(&mut conn, e).await),
            }
        };
        let results = self.finish_exchange(raw, false).await;
        self.close_on_fault(results).await
    }

    /// Run one extended-protocol query and return its single result.
    pub async fn eq_one(&self, query: Query) -> Result<QueryResult> {
        let mut results = self.eq(vec![query]).await?;
        results
            .pop()
            .ok_or_else(|| Error::Fault("exchange produced no result".into()))
    }

    /// Run a pipeline of extended-protocol queries: all Parse/Bind/Execute
    /// frames are sent before a single Sync. An error aborts the rest of
    /// the pipeline server-side and fails the whole call.
    pub async fn eq(&self, queries: Vec<Query>) -> Result<Vec<QueryResult>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        // Encode every parameter before touching the wire: an unencodable
        // value must not leave a half-sent pipeline behind.
        let mut buf = BytesMut::new();
        for q in &queries {
            let mut oids = Vec::with_capacity(q.params.len());
            let mut bodies = Vec::with_capacity(q.params.len());
            for v in &q.params {
                let override_oid = self.shared.oid_fn.as_ref().and_then(|f| f(v));
                oids.push(parameter_oid(v, override_oid));
                bodies.push(encode_binary(v)?);
            }
            frontend::put_parse(&mut buf, "", &q.sql, &oids);
            frontend::put_describe_statement(&mut buf, "");
            frontend::put_bind(&mut buf, "", "", &bodies);
            frontend::put_execute(&mut buf, "", 0);
        }
        frontend::put_sync(&mut buf);

        let raw = {
            let mut conn = self.shared.conn.lock().await;
            if let Err(e) = conn.send(&buf).await {
                conn.mark_closed();
                return Err(e);
            }
            match consume_exchange(&mut conn).await {
                Ok(raw) => raw,
                Err(e) => return Err(desynchronize(&mut conn, e).await),
            }
        };
        // Bind requested binary result columns; the RowDescription from
        // Describe predates Bind and still reports text.
        let results = self.finish_exchange(raw, true).await;
        self.close_on_fault(results).await
    }

    /// Enforce the fault policy on work done after the exchange: a decode
    /// or interpretation fault condemns the connection just like a fault
    /// on the wire, even though the stream position is formally known.
    async fn close_on_fault<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::Fault(_)) = &result {
            self.shared.conn.lock().await.mark_closed();
        }
        result
    }

    /// Create a logical replication slot for the pgoutput plugin.
    ///
    /// On a replication-mode session this issues the walsender
    /// `CREATE_REPLICATION_SLOT` command; otherwise it goes through
    /// `pg_create_logical_replication_slot`.
    pub async fn create_slot(&self, name: &str, temporary: bool) -> Result<CreatedSlot> {
        if self.shared.replication == ReplicationMode::Database {
            let temp = if temporary { " TEMPORARY" } else { "" };
            let sql =
                format!("CREATE_REPLICATION_SLOT {}{temp} LOGICAL pgoutput", quote_ident(name));
            let results = self.sq(&sql).await?;
            let parsed = results
                .first()
                .ok_or_else(|| Error::Fault("CREATE_REPLICATION_SLOT returned nothing".into()))
                .and_then(parse_created_slot);
            return self.close_on_fault(parsed).await;
        }

        let result = self
            .eq_one(
                Query::new(
                    "SELECT slot_name, lsn FROM pg_create_logical_replication_slot($1, 'pgoutput', $2)",
                )
                .bind(name)
                .bind(temporary),
            )
            .await?;
        let parsed = created_slot_from_function_row(name, &result);
        self.close_on_fault(parsed).await
    }

    /// Drop a replication slot.
    pub async fn drop_slot(&self, name: &str) -> Result<()> {
        if self.shared.replication == ReplicationMode::Database {
            self.sq(&format!("DROP_REPLICATION_SLOT {}", quote_ident(name)))
                .await?;
        } else {
            self.eq_one(
                Query::new("SELECT pg_drop_replication_slot($1)").bind(name),
            )
            .await?;
        }
        info!(slot = name, "replication slot dropped");
        Ok(())
    }

    /// Emit a logical decoding message (`pg_logical_emit_message`).
    /// Returns the message's LSN.
    pub async fn emit_message(
        &self,
        prefix: &str,
        content: &[u8],
        transactional: bool,
        flush: bool,
    ) -> Result<Lsn> {
        let content = Value::Bytes(Bytes::copy_from_slice(content));
        let result = if flush {
            self.eq_one(
                Query::new("SELECT pg_logical_emit_message($1, $2, $3, $4)")
                    .bind(transactional)
                    .bind(prefix)
                    .bind(content)
                    .bind(true),
            )
            .await?
        } else {
            self.eq_one(
                Query::new("SELECT pg_logical_emit_message($1, $2, $3)")
                    .bind(transactional)
                    .bind(prefix)
                    .bind(content),
            )
            .await?
        };
        let lsn = match result.single_value() {
            Some(Value::Lsn(lsn)) => Ok(*lsn),
            other => Err(Error::Fault(format!(
                "unexpected pg_logical_emit_message result: {other:?}"
            ))),
        };
        self.close_on_fault(lsn).await
    }

    /// Install a decoder for `type_oid` from its `pg_type` row, then
    /// retries by the caller go through the updated registry.
    pub(crate) fn install_type(
        &self,
        type_oid: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let result = self
                .eq_one(
                    Query::new(
                        "SELECT typtype, typbasetype FROM pg_type WHERE oid = $1 LIMIT 1",
                    )
                    .bind(Value::Oid(type_oid)),
                )
                .await?;
            if result.rows.is_empty() {
                return Err(Error::UnknownDataType(type_oid));
            }
            let kind = self.close_on_fault(type_kind_from_row(&result)).await?;
            debug!(oid = type_oid, ?kind, "installing decoder for user type");
            self.shared.registry.install_from_kind(type_oid, kind)
        })
    }

    /// Decode raw rows, surface the buffered server error, and apply the
    /// install-and-retry-once policy for unknown OIDs.
    async fn finish_exchange(
        &self,
        raw: RawExchange,
        binary_rows: bool,
    ) -> Result<Vec<QueryResult>> {
        if let Some(e) = raw.server_error {
            return Err(Error::Server(e));
        }
        if raw.copy_in_rejected {
            return Err(Error::Unsupported(
                "CopyIn is not supported by this client".into(),
            ));
        }
        let mut out = Vec::with_capacity(raw.results.len());
        for r in raw.results {
            out.push(self.decode_result(r, binary_rows).await?);
        }
        Ok(out)
    }

    async fn decode_result(&self, raw: RawResult, binary_rows: bool) -> Result<QueryResult> {
        let keys: Vec<String> = raw
            .columns
            .iter()
            .map(|c| (self.shared.key_fn)(c.table_oid, &c.name))
            .collect();
        let mut rows = Vec::with_capacity(raw.rows.len());
        for raw_row in &raw.rows {
            let mut row = Row::with_capacity(raw_row.len());
            for (idx, cell) in raw_row.iter().enumerate() {
                let Some(bytes) = cell else {
                    continue; // NULL columns are omitted from the mapping
                };
                let attr = raw.columns.get(idx).ok_or_else(|| {
                    Error::Fault("DataRow wider than RowDescription".into())
                })?;
                let value = match self.decode_cell(attr, bytes, binary_rows) {
                    Err(Error::UnknownDataType(oid)) => {
                        self.install_type(oid).await?;
                        // Exactly one retry; a second failure propagates.
                        self.decode_cell(attr, bytes, binary_rows)?
                    }
                    other => other?,
                };
                row.insert(keys[idx].clone(), value);
            }
            rows.push(row);
        }
        Ok(QueryResult {
            columns: raw.columns,
            keys,
            rows,
            command: raw.command,
            copy_data: raw.copy_data,
            parameters: raw.parameters,
        })
    }

    fn decode_cell(&self, attr: &AttributeDef, bytes: &Bytes, binary: bool) -> Result<Value> {
        if binary || attr.format == 1 {
            self.shared.registry.decode_binary(attr.type_oid, bytes)
        } else {
            let s = std::str::from_utf8(bytes)
                .map_err(|e| Error::Fault(format!("non-UTF8 text column: {e}")))?;
            self.shared.registry.decode_text(attr.type_oid, s)
        }
    }
}

impl std::fmt::Debug for SqlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlClient").finish_non_exhaustive()
    }
}

/// Run `body`, mapping a duplicate-object server error (SQLSTATE 42710) to
/// `Ok(None)`. Scoped helper for idempotent slot/publication setup.
pub async fn ignoring_duplicates<T, F>(body: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    match body.await {
        Ok(v) => Ok(Some(v)),
        Err(Error::Server(e)) if e.is_duplicate_object() => {
            debug!(code = %e.code, "ignoring duplicate object");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Close the connection and wrap the failure as a desynchronization fault.
/// Clean server errors never reach this path.
async fn desynchronize(conn: &mut Connection, cause: Error) -> Error {
    conn.mark_closed();
    Error::Fault(format!("protocol desynchronization: {cause}"))
}

#[derive(Default)]
struct RawResult {
    columns: Vec<AttributeDef>,
    rows: Vec<Vec<Option<Bytes>>>,
    command: Option<CommandTag>,
    copy_data: Vec<Bytes>,
    parameters: Vec<(String, String)>,
}

struct RawExchange {
    results: Vec<RawResult>,
    server_error: Option<ServerError>,
    copy_in_rejected: bool,
}

/// Consume one exchange up to ReadyForQuery, buffering a server error.
///
/// State machine per statement:
/// awaiting -> (RowDescription) -> rows -> (CommandComplete |
/// PortalSuspended | EmptyQueryResponse) -> done; ErrorResponse from any
/// state buffers the error until ReadyForQuery terminates the exchange.
async fn consume_exchange(conn: &mut Connection) -> Result<RawExchange> {
    let mut results = Vec::new();
    let mut current = RawResult::default();
    let mut server_error: Option<ServerError> = None;
    let mut copy_in_rejected = false;

    loop {
        match conn.read_message().await? {
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::ParameterDescription(_)
            | BackendMessage::NoData => {}
            BackendMessage::RowDescription(attrs) => current.columns = attrs,
            BackendMessage::DataRow(cols) => current.rows.push(cols),
            BackendMessage::CommandComplete(tag) => {
                current.command = Some(CommandTag::parse(&tag));
                results.push(std::mem::take(&mut current));
            }
            BackendMessage::PortalSuspended | BackendMessage::EmptyQueryResponse => {
                results.push(std::mem::take(&mut current));
            }
            BackendMessage::CopyOutResponse => trace!("consuming CopyOut stream"),
            BackendMessage::CopyData(data) => current.copy_data.push(data),
            BackendMessage::CopyDone => {}
            BackendMessage::CopyInResponse => {
                // Tell the server we have nothing; the failure surfaces at
                // the end of the exchange. The pending Sync (extended) or
                // the statement end (simple) still terminates normally.
                let mut buf = BytesMut::with_capacity(5);
                frontend::put_copy_done(&mut buf);
                conn.send(&buf).await?;
                copy_in_rejected = true;
            }
            BackendMessage::Notice(n) => info!(notice = %n, "server notice"),
            BackendMessage::ParameterStatus { name, value } => {
                conn.parameters.insert(name.clone(), value.clone());
                current.parameters.push((name, value));
            }
            BackendMessage::Notification { channel, .. } => {
                trace!(channel, "ignoring notification")
            }
            BackendMessage::Error(e) => {
                // Partial state for the failed statement is discarded.
                current = RawResult::default();
                if server_error.is_none() {
                    server_error = Some(e);
                }
            }
            BackendMessage::ReadyForQuery(_) => break,
            other @ (BackendMessage::Authentication(_)
            | BackendMessage::BackendKeyData { .. }
            | BackendMessage::CopyBothResponse) => {
                return Err(Error::Fault(format!(
                    "unexpected message in query exchange: {other:?}"
                )))
            }
        }
    }

    Ok(RawExchange {
        results,
        server_error,
        copy_in_rejected,
    })
}

fn parse_created_slot(result: &QueryResult) -> Result<CreatedSlot> {
    let text_at = |name: &str| -> Option<String> {
        match result.value(0, name) {
            Some(Value::Text(s) | Value::Name(s)) => Some(s.clone()),
            _ => None,
        }
    };
    let slot_name = text_at("slot_name")
        .ok_or_else(|| Error::Fault("slot creation result missing slot_name".into()))?;
    let consistent_point = match result.value(0, "consistent_point") {
        Some(Value::Lsn(lsn)) => *lsn,
        Some(Value::Text(s)) => s
            .parse()
            .map_err(|e| Error::Fault(format!("bad consistent_point from server: {e}")))?,
        other => {
            return Err(Error::Fault(format!(
                "unexpected consistent_point: {other:?}"
            )))
        }
    };
    Ok(CreatedSlot {
        slot_name,
        consistent_point,
        snapshot_name: text_at("snapshot_name"),
        output_plugin: text_at("output_plugin"),
    })
}

/// Interpret a `pg_create_logical_replication_slot` result row.
fn created_slot_from_function_row(name: &str, result: &QueryResult) -> Result<CreatedSlot> {
    let slot_name = match result.value(0, "slot_name") {
        Some(Value::Text(s) | Value::Name(s)) => s.clone(),
        _ => name.to_string(),
    };
    let consistent_point = match result.value(0, "lsn") {
        Some(Value::Lsn(lsn)) => *lsn,
        Some(Value::Text(s)) => s
            .parse()
            .map_err(|e| Error::Fault(format!("bad slot LSN from server: {e}")))?,
        other => {
            return Err(Error::Fault(format!(
                "unexpected slot creation result: {other:?}"
            )))
        }
    };
    Ok(CreatedSlot {
        slot_name,
        consistent_point,
        snapshot_name: None,
        output_plugin: Some("pgoutput".into()),
    })
}

/// Interpret a `pg_type` row into the decoder kind to install.
fn type_kind_from_row(result: &QueryResult) -> Result<TypeKind> {
    let typtype = match result.value(0, "typtype") {
        Some(Value::Char(c)) => *c,
        Some(Value::Text(s)) => s.as_bytes().first().map(|b| *b as i8).unwrap_or(0),
        other => {
            return Err(Error::Fault(format!(
                "unexpected typtype value: {other:?}"
            )))
        }
    };
    let typbasetype = match result.value(0, "typbasetype") {
        Some(Value::Oid(o)) => *o,
        other => {
            return Err(Error::Fault(format!(
                "unexpected typbasetype value: {other:?}"
            )))
        }
    };
    Ok(TypeKind::from_pg_type(typtype, typbasetype))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("slot"), "\"slot\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn query_builder_accumulates_params() {
        let q = Query::new("SELECT $1, $2").bind(1i32).bind("x");
        assert_eq!(q.params.len(), 2);
        assert_eq!(q.params[0], Value::Int4(1));
        assert_eq!(q.params[1], Value::Text("x".into()));
    }
}
