//! Startup and authentication handshake.
//!
//! Drives the connection from a fresh socket to `ReadyForQuery`: startup
//! parameters, the SASL exchange, and collection of `ParameterStatus` /
//! `BackendKeyData`.

use bytes::BytesMut;
use tracing::{debug, info};

use crate::auth::{ChannelBinding, ScramClient};
use crate::client::connection::{BackendKey, Connection};
use crate::config::ConnectConfig;
use crate::error::{Error, Result};
use crate::protocol::backend::{AuthRequest, BackendMessage};
use crate::protocol::frontend;

/// Run the startup sequence on a freshly opened connection.
pub(crate) async fn startup(conn: &mut Connection, cfg: &ConnectConfig) -> Result<()> {
    let mut params: Vec<(&str, &str)> = vec![
        ("user", cfg.user.as_str()),
        ("database", cfg.database.as_str()),
        ("client_encoding", "UTF8"),
        ("application_name", cfg.application_name.as_str()),
    ];
    if let Some(mode) = cfg.replication.startup_value() {
        params.push(("replication", mode));
    }
    conn.send(&frontend::startup(&params)).await?;

    loop {
        match conn.read_message().await? {
            BackendMessage::Authentication(req) => match req {
                AuthRequest::Ok => debug!("authentication ok"),
                AuthRequest::Sasl { mechanisms } => {
                    sasl_authenticate(conn, cfg, &mechanisms).await?;
                }
                AuthRequest::CleartextPassword => {
                    return Err(Error::Unsupported(
                        "cleartext password authentication is not supported".into(),
                    ))
                }
                AuthRequest::Md5Password => {
                    return Err(Error::Unsupported(
                        "MD5 password authentication is not supported".into(),
                    ))
                }
                AuthRequest::Kerberos | AuthRequest::Gss | AuthRequest::Sspi => {
                    return Err(Error::Unsupported(
                        "GSSAPI/Kerberos/SSPI authentication is not supported".into(),
                    ))
                }
                AuthRequest::SaslContinue { .. } | AuthRequest::SaslFinal { .. } => {
                    return Err(Error::Fault(
                        "SASL continuation outside an exchange".into(),
                    ))
                }
                AuthRequest::Other(code) => {
                    return Err(Error::Unsupported(format!(
                        "unknown authentication method: {code}"
                    )))
                }
            },
            BackendMessage::ParameterStatus { name, value } => {
                conn.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                conn.backend_key = Some(BackendKey {
                    process_id,
                    secret_key,
                });
            }
            BackendMessage::Notice(n) => info!(notice = %n, "server notice during startup"),
            BackendMessage::Error(e) => return Err(classify_startup_error(e)),
            BackendMessage::ReadyForQuery(_) => {
                debug!(
                    server_version = conn.parameters.get("server_version").map(String::as_str),
                    "session established"
                );
                return Ok(());
            }
            other => {
                return Err(Error::Fault(format!(
                    "unexpected message during startup: {other:?}"
                )))
            }
        }
    }
}

/// SQLSTATE class 28 (invalid authorization) reads as a credential
/// rejection; anything else stays a server error.
fn classify_startup_error(e: crate::error::ServerError) -> Error {
    if e.code.starts_with("28") {
        Error::Forbidden(e.to_string())
    } else {
        Error::Server(e)
    }
}

async fn sasl_authenticate(
    conn: &mut Connection,
    cfg: &ConnectConfig,
    mechanisms: &[String],
) -> Result<()> {
    let plus = mechanisms.iter().any(|m| m == "SCRAM-SHA-256-PLUS");
    let plain = mechanisms.iter().any(|m| m == "SCRAM-SHA-256");

    let binding = match (plus, conn.certificate_hash()) {
        (true, Some(hash)) => ChannelBinding::TlsServerEndPoint(hash),
        _ if plain => ChannelBinding::None,
        _ => {
            return Err(Error::Unsupported(format!(
                "no mutually supported SASL mechanism in {mechanisms:?}"
            )))
        }
    };
    let mechanism = binding.mechanism();
    debug!(mechanism, "starting SASL authentication");

    let scram = ScramClient::new(&cfg.user, binding);
    let mut buf = BytesMut::new();
    frontend::put_sasl_initial_response(&mut buf, mechanism, scram.client_first.as_bytes());
    conn.send(&buf).await?;

    let server_first = match read_auth_step(conn).await? {
        AuthRequest::SaslContinue { data } => String::from_utf8_lossy(&data).into_owned(),
        other => {
            return Err(Error::Fault(format!(
                "expected SASL continue, got {other:?}"
            )))
        }
    };

    let (client_final, auth_message, salted_password) =
        scram.client_final(&cfg.password, &server_first)?;
    let mut buf = BytesMut::new();
    frontend::put_sasl_response(&mut buf, client_final.as_bytes());
    conn.send(&buf).await?;

    let server_final = match read_auth_step(conn).await? {
        AuthRequest::SaslFinal { data } => String::from_utf8_lossy(&data).into_owned(),
        other => {
            return Err(Error::Fault(format!(
                "expected SASL final, got {other:?}"
            )))
        }
    };
    ScramClient::verify_server_final(&server_final, &salted_password, &auth_message)?;
    debug!("SASL authentication complete");
    Ok(())
}

/// Read the next authentication step, passing notices through and mapping
/// errors.
async fn read_auth_step(conn: &mut Connection) -> Result<AuthRequest> {
    loop {
        match conn.read_message().await? {
            BackendMessage::Authentication(req) => return Ok(req),
            BackendMessage::Notice(n) => info!(notice = %n, "server notice during auth"),
            BackendMessage::Error(e) => return Err(classify_startup_error(e)),
            other => {
                return Err(Error::Fault(format!(
                    "unexpected message during authentication: {other:?}"
                )))
            }
        }
    }
}
