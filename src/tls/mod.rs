//! TLS session upgrade.
//!
//! PostgreSQL negotiates TLS in-band: the client sends an SSLRequest, the
//! server answers a single byte, and on `'S'` the raw socket is wrapped in
//! a TLS stream. The upgrade also captures the SHA-256 of the server's
//! end-entity certificate, which SCRAM-SHA-256-PLUS binds the session to.

#[cfg(feature = "tls-rustls")]
pub mod rustls;

#[cfg(feature = "tls-rustls")]
pub use self::rustls::{maybe_upgrade, Upgraded};
