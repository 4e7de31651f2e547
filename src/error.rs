//! Error taxonomy shared by every layer of the crate.
//!
//! All failures are classified into five kinds:
//! - [`Error::Unavailable`] - the peer cannot be reached or went away
//! - [`Error::Forbidden`] - authentication or certificate rejection
//! - [`Error::Incorrect`] - caller-side misuse; wire state untouched
//! - [`Error::Unsupported`] - a feature the crate deliberately does not do
//! - [`Error::Fault`] - protocol desynchronization; the connection is closed
//!
//! Server-side `ErrorResponse` messages are surfaced as [`Error::Server`]
//! with the full field mapping; they terminate an exchange cleanly and leave
//! the client usable.

use std::collections::BTreeMap;

use thiserror::Error;

/// Error type for all pgcdc operations.
///
/// Note: `std::io::Error` is not `Clone`, so I/O failures store the message.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The server is unreachable, hung up, or the stream ended mid-frame.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// TLS or authentication rejection. Not retryable with the same inputs.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Caller error - bad parameter value, use of a closed client. The wire
    /// state is untouched and the client remains usable.
    #[error("incorrect: {0}")]
    Incorrect(String),

    /// A protocol feature the crate does not implement (CopyIn, non-SASL
    /// auth, two-phase pgoutput messages, unknown tags).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Protocol desynchronization. The connection has been closed; the
    /// stateful wire protocol cannot be resumed mid-message.
    #[error("fault: {0}")]
    Fault(String),

    /// The server sent an `ErrorResponse`. The exchange terminated cleanly
    /// at `ReadyForQuery` and the client is still usable.
    #[error("server error: {0}")]
    Server(ServerError),

    /// No decoder is registered for this OID. Recoverable: the data-row
    /// layer installs a decoder from `pg_type` and retries exactly once.
    #[error("unknown data type oid {0}")]
    UnknownDataType(u32),
}

impl Error {
    #[inline]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    #[inline]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden(_))
    }

    #[inline]
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Fault(_))
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server(_))
    }

    /// True when a failed call leaves the client usable (`Incorrect`,
    /// `Unsupported`, server error). Everything else closes the connection.
    pub fn leaves_client_usable(&self) -> bool {
        matches!(
            self,
            Error::Incorrect(_) | Error::Unsupported(_) | Error::Server(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Unavailable(err.to_string())
    }
}

/// Result type alias for pgcdc operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Decoded `ErrorResponse` / `NoticeResponse` fields, keyed semantically.
///
/// PostgreSQL sends `(field_code, cstring)` pairs; the codes are mapped to
/// the names below. Unknown codes are preserved in `extra` by code byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
    /// Fields with codes this crate does not name.
    pub extra: BTreeMap<char, String>,
}

impl ServerError {
    /// Parse the `(code, cstring)* \0` field list of an ErrorResponse or
    /// NoticeResponse body.
    pub fn parse(payload: &[u8]) -> ServerError {
        let mut fields = ServerError::default();
        let mut b = payload;
        while !b.is_empty() {
            let code = b[0];
            b = &b[1..];
            if code == 0 {
                break;
            }
            let Some(pos) = b.iter().position(|&x| x == 0) else {
                break;
            };
            let s = String::from_utf8_lossy(&b[..pos]).to_string();
            b = &b[pos + 1..];
            match code {
                b'S' => fields.severity = s,
                b'V' => {} // non-localized severity, duplicates 'S'
                b'C' => fields.code = s,
                b'M' => fields.message = s,
                b'D' => fields.detail = Some(s),
                b'H' => fields.hint = Some(s),
                b'P' => fields.position = s.parse().ok(),
                b's' => fields.schema = Some(s),
                b't' => fields.table = Some(s),
                b'c' => fields.column = Some(s),
                b'd' => fields.data_type = Some(s),
                b'n' => fields.constraint = Some(s),
                b'F' => fields.file = Some(s),
                b'L' => fields.line = Some(s),
                b'R' => fields.routine = Some(s),
                other => {
                    fields.extra.insert(other as char, s);
                }
            }
        }
        fields
    }

    /// SQLSTATE 42710: the object being created already exists.
    #[inline]
    pub fn is_duplicate_object(&self) -> bool {
        self.code == "42710"
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (SQLSTATE {})", self.message, self.code)
        }
    }
}
