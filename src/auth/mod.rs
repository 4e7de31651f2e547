//! Authentication mechanisms for PostgreSQL connections.
//!
//! SASL with `SCRAM-SHA-256` is the supported password authentication, and
//! `SCRAM-SHA-256-PLUS` adds channel binding when the session runs over
//! TLS. Everything else the server might ask for (cleartext, MD5,
//! Kerberos, GSSAPI, SSPI) is rejected as unsupported.

pub mod scram;

pub use scram::{ChannelBinding, ScramClient};
