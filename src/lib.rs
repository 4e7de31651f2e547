//! # pgcdc
//!
//! A Tokio-based PostgreSQL wire-protocol client built around logical
//! replication: subscribe to a publication and receive structured,
//! schema-enriched change events decoded from the pgoutput stream.
//!
//! ## Features
//!
//! - **Logical-decoding subscriber** - pgoutput protocol versions 2-4,
//!   streamed transactions, relation/type caching, at-least-once
//!   acknowledgement of commit LSNs
//! - **SQL client** - simple, extended and pipelined queries over the same
//!   wire engine, used for replication management and catalog lookups
//! - **Binary codec** - scalars, arrays, ranges, geometrics, numeric,
//!   intervals, tsvector, LSNs; user types learned from `pg_type` at runtime
//! - **SCRAM-SHA-256(-PLUS)** - SASL authentication with
//!   `tls-server-end-point` channel binding over TLS
//! - **TLS support** - optional rustls-based encryption with verify modes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pgcdc::{Change, ChangeEvent, ConnectConfig, Subscriber, SubscriberConfig};
//!
//! # async fn example() -> pgcdc::Result<()> {
//! let mut config = SubscriberConfig {
//!     connect: ConnectConfig {
//!         host: "localhost".into(),
//!         user: "postgres".into(),
//!         password: "secret".into(),
//!         database: "mydb".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! config.publications.insert("my_publication".into());
//!
//! let subscriber = Subscriber::connect(
//!     "my_slot",
//!     |event: ChangeEvent| {
//!         match &event.change {
//!             Change::Insert { schema, table, new_row, .. } => {
//!                 println!("insert into {schema}.{table}: {new_row:?}");
//!             }
//!             Change::Commit { tx_end_lsn, .. } => {
//!                 println!("committed through {tx_end_lsn}");
//!             }
//!             _ => {}
//!         }
//!         // Durably processed: let the server discard WAL up to here.
//!         if let Some(ack) = &event.ack {
//!             ack.ack();
//!         }
//!     },
//!     config,
//! )
//! .await?;
//!
//! subscriber.wait().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `tls-rustls` (default) - TLS support via rustls
//! - `integration-tests` - containerized end-to-end tests

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod lsn;
pub mod protocol;
pub mod subscriber;
pub mod tls;
pub mod types;

pub use client::{ignoring_duplicates, CreatedSlot, Query, QueryResult, Row, SqlClient};
pub use config::{
    ConnectConfig, ReplicationMode, SslMode, StreamingMode, SubscriberConfig, TlsConfig,
};
pub use error::{Error, Result, ServerError};
pub use lsn::Lsn;
pub use subscriber::{
    AckHandle, Change, ChangeEvent, ChangeHandler, FlowControlledExecutor, Subscriber,
};
pub use types::Value;
