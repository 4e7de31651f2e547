//! Connection and subscriber configuration.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::lsn::Lsn;
use crate::types::Value;

/// Maps a table OID and attribute name to the key used in decoded rows.
///
/// The default returns the attribute name unchanged.
pub type KeyFn = Arc<dyn Fn(u32, &str) -> String + Send + Sync>;

/// Overrides the parameter OID chosen for an outgoing value. Returning
/// `None` falls back to the built-in OID for the value's variant.
pub type OidFn = Arc<dyn Fn(&Value) -> Option<u32> + Send + Sync>;

pub(crate) fn default_key_fn() -> KeyFn {
    Arc::new(|_oid, name| name.to_string())
}

#[derive(Debug, Clone)]
pub enum SslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub mode: SslMode,
    pub ca_pem_path: Option<PathBuf>,
    pub sni_hostname: Option<String>,
    pub client_cert_pem_path: Option<PathBuf>,
    pub client_key_pem_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        TlsConfig {
            mode: SslMode::Disable,
            ca_pem_path: None,
            sni_hostname: None,
            client_cert_pem_path: None,
            client_key_pem_path: None,
        }
    }
}

/// Value of the `replication` startup parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// Normal SQL session.
    #[default]
    Off,
    /// Logical replication session bound to a database.
    Database,
}

impl ReplicationMode {
    pub(crate) fn startup_value(self) -> Option<&'static str> {
        match self {
            ReplicationMode::Off => None,
            ReplicationMode::Database => Some("database"),
        }
    }
}

/// Options for a single connection, immutable after startup.
#[derive(Clone)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub password: String,
    pub database: String,
    pub application_name: String,

    pub replication: ReplicationMode,
    pub tls: TlsConfig,

    /// Row-key derivation for decoded rows.
    pub key_fn: KeyFn,
    /// Parameter OID override for outgoing values.
    pub oid_fn: Option<OidFn>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            database: "postgres".into(),
            application_name: "pgcdc".into(),
            replication: ReplicationMode::Off,
            tls: TlsConfig::disabled(),
            key_fn: default_key_fn(),
            oid_fn: None,
        }
    }
}

impl std::fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("replication", &self.replication)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// `streaming` option of `START_REPLICATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingMode {
    #[default]
    Off,
    On,
    /// Requires pgoutput protocol version 4.
    Parallel,
}

impl StreamingMode {
    pub(crate) fn option_value(self) -> &'static str {
        match self {
            StreamingMode::Off => "off",
            StreamingMode::On => "on",
            StreamingMode::Parallel => "parallel",
        }
    }
}

/// Options recognized by [`Subscriber::connect`](crate::subscriber::Subscriber::connect).
#[derive(Clone)]
pub struct SubscriberConfig {
    /// How to reach and authenticate with the server. The replication mode
    /// is forced to `Database` for the primary connection.
    pub connect: ConnectConfig,

    /// Publications to subscribe to. Must be non-empty.
    pub publications: BTreeSet<String>,

    /// pgoutput protocol version: 2, 3 or 4.
    pub protocol_version: u8,

    /// Transaction streaming mode. `Parallel` requires `protocol_version` 4.
    pub streaming: StreamingMode,

    /// Whether to receive logical decoding messages (`pg_logical_emit_message`).
    pub messages: bool,

    /// Position to start streaming from; zero means the slot's oldest.
    pub start_lsn: Lsn,

    /// Interval between standby status updates carrying the flushed LSN.
    pub ack_interval: Duration,

    /// Capacity of the handler work queue.
    pub work_queue: usize,

    /// How long a full work queue may block the reader before failing with
    /// a backpressure timeout. `None` blocks indefinitely.
    pub submit_timeout: Option<Duration>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            publications: BTreeSet::new(),
            protocol_version: 2,
            streaming: StreamingMode::Off,
            messages: true,
            start_lsn: Lsn::ZERO,
            ack_interval: Duration::from_secs(10),
            work_queue: 256,
            submit_timeout: None,
        }
    }
}

impl std::fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("connect", &self.connect)
            .field("publications", &self.publications)
            .field("protocol_version", &self.protocol_version)
            .field("streaming", &self.streaming)
            .field("messages", &self.messages)
            .field("start_lsn", &self.start_lsn)
            .field("ack_interval", &self.ack_interval)
            .field("work_queue", &self.work_queue)
            .field("submit_timeout", &self.submit_timeout)
            .finish()
    }
}
