//! Connection management and the SQL client.
//!
//! [`Connection`](connection::Connection) is the low-level owner of one
//! duplex stream; [`SqlClient`](sql::SqlClient) layers the simple and
//! extended query protocols on top behind a connection-scoped mutex.

pub mod connection;
pub mod sql;

pub(crate) mod session;

pub use connection::{BackendKey, Connection, PgStream};
pub use sql::{ignoring_duplicates, CreatedSlot, Query, QueryResult, Row, SqlClient};
