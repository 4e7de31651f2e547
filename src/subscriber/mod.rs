//! Logical-decoding subscriber.
//!
//! [`Subscriber::connect`] opens two connections: a primary one in
//! replication mode that carries the CopyBoth stream, and an auxiliary SQL
//! connection for type-catalog lookups and user queries. Three tasks run
//! per subscriber:
//!
//! - a **reader** owning the primary read half, driving the pgoutput state
//!   machine and dispatching enriched events to the handler executor;
//! - a **handler worker** (the executor) running user code in order, with
//!   bounded-queue backpressure into the reader;
//! - an **LSN flusher** writing periodic `StandbyStatusUpdate`s; the write
//!   half it shares with the keepalive reply path sits behind one lock.
//!
//! Delivery is at-least-once: an LSN is only reported flushed after the
//! handler called [`AckHandle::ack`] for the transaction containing it.

pub mod executor;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};

use crate::client::connection::{Connection, PgStream};
use crate::client::session;
use crate::client::sql::{quote_ident, SqlClient};
use crate::config::{ReplicationMode, StreamingMode, SubscriberConfig};
use crate::error::{Error, Result, ServerError};
use crate::protocol::backend::BackendMessage;
use crate::protocol::framing;
use crate::protocol::frontend;
use crate::protocol::replication::{
    encode_standby_status_update, parse_copy_data, pg_epoch_micros, ReplicationCopyData,
};
use crate::types::DecoderRegistry;

pub use executor::{FlowControlledExecutor, DEFAULT_WORK_QUEUE};
pub use state::{AckHandle, Change, ChangeEvent, RelationCacheEntry, TableRef};

use state::{Progress, StateMachine};

/// User callback for enriched change events.
///
/// Events carrying an [`AckHandle`] (`Commit`, `StreamCommit`,
/// `StreamAbort` with an LSN) should be acknowledged once the transaction
/// is durably processed.
pub trait ChangeHandler: Send + Sync + 'static {
    fn handle(&self, event: ChangeEvent);
}

impl<F> ChangeHandler for F
where
    F: Fn(ChangeEvent) + Send + Sync + 'static,
{
    fn handle(&self, event: ChangeEvent) {
        self(event)
    }
}

struct Shared {
    progress: Arc<Progress>,
    replicating: AtomicBool,
    closing: AtomicBool,
    close_lock: Mutex<bool>,
    outcome: std::sync::Mutex<Option<Result<()>>>,
    done: Notify,
    /// Write half of the primary connection. This mutex is the flush lock
    /// serializing the flusher and the keepalive reply path.
    writer: Mutex<WriteHalf<PgStream>>,
    aux: SqlClient,
    executor: FlowControlledExecutor,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A running logical-replication subscription.
pub struct Subscriber {
    shared: Arc<Shared>,
}

impl Subscriber {
    /// Start replicating from `slot` and deliver events to `handler`.
    pub async fn connect(
        slot: &str,
        handler: impl ChangeHandler,
        config: SubscriberConfig,
    ) -> Result<Subscriber> {
        validate(&config)?;

        let registry = Arc::new(DecoderRegistry::new());

        let mut primary_cfg = config.connect.clone();
        primary_cfg.replication = ReplicationMode::Database;
        let mut primary = Connection::open(
            &primary_cfg.host,
            primary_cfg.port,
            &primary_cfg.tls,
        )
        .await?;
        if let Err(e) = session::startup(&mut primary, &primary_cfg).await {
            primary.close().await;
            return Err(e);
        }

        let mut aux_cfg = config.connect.clone();
        aux_cfg.replication = ReplicationMode::Off;
        let aux = match SqlClient::connect_shared(aux_cfg, registry).await {
            Ok(aux) => aux,
            Err(e) => {
                primary.close().await;
                return Err(e);
            }
        };

        if let Err(e) = start_replication(&mut primary, slot, &config).await {
            aux.close().await;
            primary.close().await;
            return Err(e);
        }
        info!(
            slot,
            start_lsn = %config.start_lsn,
            protocol_version = config.protocol_version,
            "replication started"
        );

        let (read_half, write_half) = primary.into_split();

        let progress = Arc::new(Progress::default());
        progress.commit_flush(config.start_lsn);

        let shared = Arc::new(Shared {
            progress: progress.clone(),
            replicating: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            close_lock: Mutex::new(false),
            outcome: std::sync::Mutex::new(None),
            done: Notify::new(),
            writer: Mutex::new(write_half),
            aux: aux.clone(),
            executor: FlowControlledExecutor::new(config.work_queue, config.submit_timeout),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let machine = StateMachine::new(
            config.streaming,
            config.protocol_version,
            config.connect.key_fn.clone(),
            aux,
            progress,
        );

        let handler: Arc<dyn ChangeHandler> = Arc::new(handler);
        let reader = tokio::spawn(run_reader(
            shared.clone(),
            read_half,
            machine,
            handler,
        ));
        let flusher = tokio::spawn(run_flusher(shared.clone(), config.ack_interval));
        shared
            .tasks
            .lock()
            .expect("task list poisoned")
            .extend([reader, flusher]);

        Ok(Subscriber { shared })
    }

    /// The auxiliary SQL client. Usable for regular queries while the
    /// subscription runs; closed together with the subscriber.
    pub fn sql(&self) -> &SqlClient {
        &self.shared.aux
    }

    /// True while the CopyBoth stream is live.
    pub fn is_replicating(&self) -> bool {
        self.shared.replicating.load(Ordering::SeqCst)
    }

    /// True once the subscriber reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.shared
            .outcome
            .lock()
            .expect("outcome lock poisoned")
            .is_some()
    }

    /// The last LSN reported to the server as flushed.
    pub fn flushed_lsn(&self) -> crate::lsn::Lsn {
        self.shared.progress.flushed()
    }

    /// Block until the subscription ends. Rethrows the terminal error:
    /// server errors and connection drops fail, `close()` resolves `Ok`.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let mut notified = std::pin::pin!(self.shared.done.notified());
            // Register before checking, or a notify between the check and
            // the await would be lost.
            notified.as_mut().enable();
            if let Some(out) = self
                .shared
                .outcome
                .lock()
                .expect("outcome lock poisoned")
                .clone()
            {
                return out;
            }
            notified.await;
        }
    }

    /// Stop replicating: drain the handler executor, force a final flush,
    /// stop the timer and reader, and close both connections. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.shared.close_lock.lock().await;
        if *guard {
            return Ok(());
        }
        *guard = true;
        self.shared.closing.store(true, Ordering::SeqCst);
        debug!("closing subscriber");

        // Drain queued handler calls; their acks must not be lost.
        self.shared.executor.close().await;

        // Final flush carrying those acks.
        if let Err(e) = send_status(&self.shared, false).await {
            warn!(error = %e, "final flush failed during close");
        }

        // Stop the flusher and reader.
        for task in self
            .shared
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
        {
            task.abort();
        }

        // Close both connections; secondary errors are logged, not raised.
        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "primary connection shutdown");
            }
        }
        self.shared.aux.close().await;

        self.shared.replicating.store(false, Ordering::SeqCst);
        finish(&self.shared, Ok(()));
        Ok(())
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("done", &self.is_done())
            .field("flushed_lsn", &self.shared.progress.flushed())
            .finish()
    }
}

fn validate(config: &SubscriberConfig) -> Result<()> {
    if config.publications.is_empty() {
        return Err(Error::Incorrect(
            "at least one publication is required".into(),
        ));
    }
    if !(2..=4).contains(&config.protocol_version) {
        return Err(Error::Unsupported(format!(
            "pgoutput protocol version {} is not supported (2-4 are)",
            config.protocol_version
        )));
    }
    if config.streaming == StreamingMode::Parallel && config.protocol_version != 4 {
        return Err(Error::Incorrect(
            "streaming 'parallel' requires protocol version 4".into(),
        ));
    }
    Ok(())
}

fn start_replication_command(slot: &str, config: &SubscriberConfig) -> String {
    let publications = config
        .publications
        .iter()
        .map(|p| p.replace('\'', "''"))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "START_REPLICATION SLOT {} LOGICAL {} (proto_version '{}', publication_names '{}', streaming '{}', binary 'true', messages '{}')",
        quote_ident(slot),
        config.start_lsn,
        config.protocol_version,
        publications,
        config.streaming.option_value(),
        config.messages,
    )
}

/// Issue START_REPLICATION via the simple-query protocol and wait for the
/// server to switch the connection into CopyBoth mode.
async fn start_replication(
    primary: &mut Connection,
    slot: &str,
    config: &SubscriberConfig,
) -> Result<()> {
    let command = start_replication_command(slot, config);
    debug!(%command, "starting replication");
    let mut buf = BytesMut::with_capacity(command.len() + 16);
    frontend::put_query(&mut buf, &command);
    primary.send(&buf).await?;

    loop {
        match primary.read_message().await? {
            BackendMessage::CopyBothResponse => return Ok(()),
            BackendMessage::ParameterStatus { name, value } => {
                primary.parameters.insert(name, value);
            }
            BackendMessage::Notice(n) => info!(notice = %n, "server notice"),
            BackendMessage::Error(e) => {
                // Consume the terminating ReadyForQuery so the error is
                // surfaced from a clean connection state.
                loop {
                    match primary.read_message().await {
                        Ok(BackendMessage::ReadyForQuery(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                return Err(Error::Server(e));
            }
            BackendMessage::ReadyForQuery(_) => {
                return Err(Error::Fault(
                    "START_REPLICATION completed without entering CopyBoth mode".into(),
                ))
            }
            other => {
                return Err(Error::Fault(format!(
                    "unexpected message while starting replication: {other:?}"
                )))
            }
        }
    }
}

/// Write one StandbyStatusUpdate under the flush lock and commit the
/// flushed position.
async fn send_status(shared: &Shared, reply_asap: bool) -> Result<()> {
    let mut writer = shared.writer.lock().await;
    let lsn = shared.progress.flush_target();
    let payload =
        encode_standby_status_update(lsn, lsn, lsn, pg_epoch_micros(), reply_asap);
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    frontend::put_copy_data(&mut buf, &payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    shared.progress.commit_flush(lsn);
    trace!(%lsn, "standby status update sent");
    Ok(())
}

fn finish(shared: &Shared, result: Result<()>) {
    {
        let mut out = shared.outcome.lock().expect("outcome lock poisoned");
        if out.is_none() {
            *out = Some(result);
        }
    }
    shared.replicating.store(false, Ordering::SeqCst);
    shared.done.notify_waiters();
}

async fn run_reader(
    shared: Arc<Shared>,
    mut read_half: ReadHalf<PgStream>,
    mut machine: StateMachine,
    handler: Arc<dyn ChangeHandler>,
) {
    let result = reader_loop(&shared, &mut read_half, &mut machine, &handler).await;
    match result {
        Ok(()) => finish(&shared, Ok(())),
        Err(e) => {
            // Anything noticed while closing is the close, not a failure:
            // the executor and socket are being torn down under the reader.
            if shared.closing.load(Ordering::SeqCst) {
                finish(&shared, Ok(()));
            } else {
                warn!(error = %e, "replication reader terminated");
                finish(&shared, Err(e));
            }
        }
    }
}

async fn reader_loop(
    shared: &Shared,
    read_half: &mut ReadHalf<PgStream>,
    machine: &mut StateMachine,
    handler: &Arc<dyn ChangeHandler>,
) -> Result<()> {
    loop {
        if shared.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let frame = framing::read_frame(read_half).await?;
        match frame.tag {
            b'd' => match parse_copy_data(&frame.payload)? {
                ReplicationCopyData::PrimaryKeepAlive {
                    wal_end,
                    reply_asap,
                    ..
                } => {
                    trace!(%wal_end, reply_asap, "keepalive");
                    if reply_asap {
                        send_status(shared, false).await?;
                    }
                }
                ReplicationCopyData::WalData {
                    wal_start, section, ..
                } => {
                    let event = machine.handle(wal_start, &section).await?;
                    let handler = handler.clone();
                    shared
                        .executor
                        .submit(Box::new(move || handler.handle(event)))
                        .await?;
                }
            },
            b'E' => {
                let e = ServerError::parse(&frame.payload);
                return Err(Error::Server(e));
            }
            b'N' => {
                let n = ServerError::parse(&frame.payload);
                info!(notice = %n, "server notice");
            }
            b'S' => trace!("parameter status during replication"),
            b'c' => {
                return Err(Error::Unavailable(
                    "server ended the replication stream (CopyDone)".into(),
                ))
            }
            other => {
                return Err(Error::Fault(format!(
                    "unexpected message tag {:?} in replication mode",
                    other as char
                )))
            }
        }
    }
}

async fn run_flusher(shared: Arc<Shared>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // completes immediately
    loop {
        ticker.tick().await;
        if shared.closing.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = send_status(&shared, false).await {
            // Write failures reach the subscriber's completion signal.
            if !shared.closing.load(Ordering::SeqCst) {
                warn!(error = %e, "LSN flush failed");
                finish(&shared, Err(e));
            }
            return;
        }
    }
}
