//! SQL-client tests against a scripted in-process server.
//!
//! Each test listens on an ephemeral port, answers the startup handshake,
//! then plays a fixed response script so client behavior can be asserted
//! without a real PostgreSQL: extended-query decoding, pipeline
//! short-circuiting, connection-mutex serialization, and the
//! desynchronization policy.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pgcdc::{ConnectConfig, Error, Query, SqlClient, TlsConfig, Value};

// ============================================================================
// Wire Helpers
// ============================================================================

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
    out.extend_from_slice(body);
    out
}

fn auth_ok() -> Vec<u8> {
    frame(b'R', &0i32.to_be_bytes())
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    frame(b'S', &body)
}

fn backend_key_data() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&4242i32.to_be_bytes());
    body.extend_from_slice(&7i32.to_be_bytes());
    frame(b'K', &body)
}

fn ready_for_query() -> Vec<u8> {
    frame(b'Z', b"I")
}

fn parse_complete() -> Vec<u8> {
    frame(b'1', &[])
}

fn bind_complete() -> Vec<u8> {
    frame(b'2', &[])
}

fn parameter_description(oids: &[u32]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(oids.len() as i16).to_be_bytes());
    for oid in oids {
        body.extend_from_slice(&oid.to_be_bytes());
    }
    frame(b't', &body)
}

/// RowDescription with one column per `(name, type_oid)`, text format
/// (as a server describes an unbound statement).
fn row_description(cols: &[(&str, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(cols.len() as i16).to_be_bytes());
    for (name, oid) in cols {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0u32.to_be_bytes()); // table oid
        body.extend_from_slice(&0i16.to_be_bytes()); // attnum
        body.extend_from_slice(&oid.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes()); // typlen
        body.extend_from_slice(&(-1i32).to_be_bytes()); // typmod
        body.extend_from_slice(&0i16.to_be_bytes()); // format
    }
    frame(b'T', &body)
}

fn data_row(cells: &[Option<&[u8]>]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(cells.len() as i16).to_be_bytes());
    for cell in cells {
        match cell {
            Some(bytes) => {
                body.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                body.extend_from_slice(bytes);
            }
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    frame(b'D', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = Vec::from(tag.as_bytes());
    body.push(0);
    frame(b'C', &body)
}

fn error_response(code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(b"ERROR\0");
    body.push(b'C');
    body.extend_from_slice(code.as_bytes());
    body.push(0);
    body.push(b'M');
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body.push(0);
    frame(b'E', &body)
}

// ============================================================================
// Scripted Server
// ============================================================================

async fn read_startup(socket: &mut TcpStream) -> Result<()> {
    let mut len_bytes = [0u8; 4];
    socket.read_exact(&mut len_bytes).await?;
    let len = i32::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len - 4];
    socket.read_exact(&mut payload).await?;
    Ok(())
}

async fn read_tagged_frame(socket: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut hdr = [0u8; 5];
    socket.read_exact(&mut hdr).await?;
    let tag = hdr[0];
    let len = i32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as usize;
    let mut body = vec![0u8; len - 4];
    socket.read_exact(&mut body).await?;
    Ok((tag, body))
}

/// Read client frames up to and including Sync ('S'); returns the tags.
async fn read_until_sync(socket: &mut TcpStream) -> Result<Vec<u8>> {
    let mut tags = Vec::new();
    loop {
        let (tag, _) = read_tagged_frame(socket).await?;
        tags.push(tag);
        if tag == b'S' {
            return Ok(tags);
        }
    }
}

/// Accept one connection and complete the startup handshake.
async fn accept_session(listener: &TcpListener) -> Result<TcpStream> {
    let (mut socket, _) = listener.accept().await?;
    read_startup(&mut socket).await?;
    let mut greeting = Vec::new();
    greeting.extend(auth_ok());
    greeting.extend(parameter_status("server_version", "16.3"));
    greeting.extend(backend_key_data());
    greeting.extend(ready_for_query());
    socket.write_all(&greeting).await?;
    Ok(socket)
}

async fn connect_client(port: u16) -> Result<SqlClient> {
    let cfg = ConnectConfig {
        host: "127.0.0.1".into(),
        port,
        tls: TlsConfig::disabled(),
        ..Default::default()
    };
    Ok(SqlClient::connect(cfg).await?)
}

async fn spawn_listener() -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

// ============================================================================
// Tests
// ============================================================================

/// Extended query echo: `SELECT $1 AS n` with a bound int returns
/// `{"n": 1}` decoded from the binary result column.
#[tokio::test]
async fn extended_query_select_echo() -> Result<()> {
    let (listener, port) = spawn_listener().await?;

    let server = tokio::spawn(async move {
        let mut socket = accept_session(&listener).await?;
        let tags = read_until_sync(&mut socket).await?;
        assert_eq!(tags, vec![b'P', b'D', b'B', b'E', b'S']);

        let mut response = Vec::new();
        response.extend(parse_complete());
        response.extend(parameter_description(&[23]));
        response.extend(row_description(&[("n", 23)]));
        response.extend(bind_complete());
        response.extend(data_row(&[Some(&1i32.to_be_bytes())]));
        response.extend(command_complete("SELECT 1"));
        response.extend(ready_for_query());
        socket.write_all(&response).await?;
        Ok::<_, anyhow::Error>(socket)
    });

    let client = connect_client(port).await?;
    let result = client
        .eq_one(Query::new("SELECT $1 AS n").bind(1i32))
        .await?;

    assert_eq!(result.value(0, "n"), Some(&Value::Int4(1)));
    assert_eq!(result.rows.len(), 1);
    let tag = result.command.as_ref().expect("command tag");
    assert_eq!(tag.command, "SELECT");
    assert_eq!(tag.rows, Some(1));

    server.await??;
    Ok(())
}

/// Simple query results arrive in text format; NULL columns are omitted
/// from the row mapping.
#[tokio::test]
async fn simple_query_text_rows_and_null_omission() -> Result<()> {
    let (listener, port) = spawn_listener().await?;

    let server = tokio::spawn(async move {
        let mut socket = accept_session(&listener).await?;
        let (tag, body) = read_tagged_frame(&mut socket).await?;
        assert_eq!(tag, b'Q');
        assert!(body.starts_with(b"SELECT v, missing FROM t"));

        let mut response = Vec::new();
        response.extend(row_description(&[("v", 25), ("missing", 25)]));
        response.extend(data_row(&[Some(b"hello"), None]));
        response.extend(command_complete("SELECT 1"));
        response.extend(ready_for_query());
        socket.write_all(&response).await?;
        Ok::<_, anyhow::Error>(())
    });

    let client = connect_client(port).await?;
    let results = client.sq("SELECT v, missing FROM t").await?;

    assert_eq!(results.len(), 1);
    let row = &results[0].rows[0];
    assert_eq!(row.get("v"), Some(&Value::Text("hello".into())));
    assert!(!row.contains_key("missing"), "NULL column must be omitted");

    server.await??;
    Ok(())
}

/// Pipeline short-circuit: the error for the failing statement is raised
/// and results for already-completed statements are discarded.
#[tokio::test]
async fn pipeline_short_circuits_on_error() -> Result<()> {
    let (listener, port) = spawn_listener().await?;

    let server = tokio::spawn(async move {
        let mut socket = accept_session(&listener).await?;
        let tags = read_until_sync(&mut socket).await?;
        // Three queries worth of Parse/Describe/Bind/Execute, one Sync.
        assert_eq!(tags.len(), 13);

        let mut response = Vec::new();
        // First statement succeeds.
        response.extend(parse_complete());
        response.extend(parameter_description(&[]));
        response.extend(row_description(&[("a", 23)]));
        response.extend(bind_complete());
        response.extend(data_row(&[Some(&1i32.to_be_bytes())]));
        response.extend(command_complete("SELECT 1"));
        // Second fails; the server skips the third until Sync.
        response.extend(error_response("42P01", "relation \"nope\" does not exist"));
        response.extend(ready_for_query());
        socket.write_all(&response).await?;
        Ok::<_, anyhow::Error>(())
    });

    let client = connect_client(port).await?;
    let err = client
        .eq(vec![
            Query::new("SELECT 1 AS a"),
            Query::new("SELECT * FROM nope"),
            Query::new("SELECT 3"),
        ])
        .await
        .unwrap_err();

    match err {
        Error::Server(e) => {
            assert_eq!(e.code, "42P01");
            assert!(e.message.contains("nope"));
        }
        other => panic!("expected server error, got {other:?}"),
    }

    // The connection survived a clean server error.
    server.await??;
    Ok(())
}

/// Two concurrent pipelines on one client serialize: the server observes
/// complete Parse..Sync batches, never interleaved frames.
#[tokio::test]
async fn concurrent_pipelines_serialize() -> Result<()> {
    let (listener, port) = spawn_listener().await?;

    let server = tokio::spawn(async move {
        let mut socket = accept_session(&listener).await?;
        for _ in 0..2 {
            let tags = read_until_sync(&mut socket).await?;
            // A whole batch, in order, before any response is written.
            assert_eq!(tags, vec![b'P', b'D', b'B', b'E', b'S']);

            let mut response = Vec::new();
            response.extend(parse_complete());
            response.extend(parameter_description(&[]));
            response.extend(row_description(&[("x", 23)]));
            response.extend(bind_complete());
            response.extend(data_row(&[Some(&7i32.to_be_bytes())]));
            response.extend(command_complete("SELECT 1"));
            response.extend(ready_for_query());
            socket.write_all(&response).await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let client = Arc::new(connect_client(port).await?);
    let c1 = client.clone();
    let c2 = client.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { c1.eq_one(Query::new("SELECT 7 AS x")).await }),
        tokio::spawn(async move { c2.eq_one(Query::new("SELECT 7 AS x")).await }),
    );
    assert_eq!(r1??.value(0, "x"), Some(&Value::Int4(7)));
    assert_eq!(r2??.value(0, "x"), Some(&Value::Int4(7)));

    server.await??;
    Ok(())
}

/// A malformed response mid-exchange closes the connection with a
/// desynchronization fault; later calls report the client disconnected.
#[tokio::test]
async fn desynchronization_disconnects_client() -> Result<()> {
    let (listener, port) = spawn_listener().await?;

    let server = tokio::spawn(async move {
        let mut socket = accept_session(&listener).await?;
        let _ = read_until_sync(&mut socket).await?;
        // A tag no client understands.
        socket.write_all(&frame(b'?', &[])).await?;
        // Keep the socket open; the client must bail on its own.
        let mut scratch = [0u8; 16];
        let _ = socket.read(&mut scratch).await;
        Ok::<_, anyhow::Error>(())
    });

    let client = connect_client(port).await?;
    let err = client.eq_one(Query::new("SELECT 1")).await.unwrap_err();
    match &err {
        Error::Fault(msg) => assert!(msg.contains("desynchronization"), "got: {msg}"),
        other => panic!("expected fault, got {other:?}"),
    }

    let err = client.eq_one(Query::new("SELECT 1")).await.unwrap_err();
    match &err {
        Error::Incorrect(msg) => assert!(msg.contains("Disconnected"), "got: {msg}"),
        other => panic!("expected incorrect, got {other:?}"),
    }

    server.abort();
    Ok(())
}

/// A decode failure after the exchange condemns the connection the same
/// way a wire-level desynchronization does: the fault is raised and later
/// calls report the client disconnected.
#[tokio::test]
async fn decode_fault_disconnects_client() -> Result<()> {
    let (listener, port) = spawn_listener().await?;

    let server = tokio::spawn(async move {
        let mut socket = accept_session(&listener).await?;
        let (tag, _) = read_tagged_frame(&mut socket).await?;
        assert_eq!(tag, b'Q');

        // A text-format column whose bytes are not UTF-8.
        let mut response = Vec::new();
        response.extend(row_description(&[("v", 25)]));
        response.extend(data_row(&[Some(&[0xFF, 0xFE, 0xFD])]));
        response.extend(command_complete("SELECT 1"));
        response.extend(ready_for_query());
        socket.write_all(&response).await?;
        // Keep the socket open; the client must condemn it on its own.
        let mut scratch = [0u8; 16];
        let _ = socket.read(&mut scratch).await;
        Ok::<_, anyhow::Error>(())
    });

    let client = connect_client(port).await?;
    let err = client.sq("SELECT v FROM t").await.unwrap_err();
    assert!(matches!(err, Error::Fault(_)), "got {err:?}");

    let err = client.sq("SELECT 1").await.unwrap_err();
    match &err {
        Error::Incorrect(msg) => assert!(msg.contains("Disconnected"), "got: {msg}"),
        other => panic!("expected incorrect, got {other:?}"),
    }

    server.abort();
    Ok(())
}

/// An encode failure must not touch the wire: the connection stays usable.
#[tokio::test]
async fn encode_failure_leaves_wire_untouched() -> Result<()> {
    let (listener, port) = spawn_listener().await?;

    let server = tokio::spawn(async move {
        let mut socket = accept_session(&listener).await?;
        // Exactly one exchange is expected.
        let tags = read_until_sync(&mut socket).await?;
        assert_eq!(tags, vec![b'P', b'D', b'B', b'E', b'S']);
        let mut response = Vec::new();
        response.extend(parse_complete());
        response.extend(parameter_description(&[23]));
        response.extend(row_description(&[("n", 23)]));
        response.extend(bind_complete());
        response.extend(data_row(&[Some(&5i32.to_be_bytes())]));
        response.extend(command_complete("SELECT 1"));
        response.extend(ready_for_query());
        socket.write_all(&response).await?;
        Ok::<_, anyhow::Error>(())
    });

    let client = connect_client(port).await?;

    // The TOAST sentinel is not encodable; no frames may be sent.
    let err = client
        .eq_one(Query::new("SELECT $1").bind(Value::UnchangedToast))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Incorrect(_)), "got {err:?}");

    // The same client still completes a normal query.
    let result = client.eq_one(Query::new("SELECT $1 AS n").bind(5i32)).await?;
    assert_eq!(result.value(0, "n"), Some(&Value::Int4(5)));

    server.await??;
    Ok(())
}
