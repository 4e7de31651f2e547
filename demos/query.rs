// demos/query.rs
//
// cargo run --example query -- "SELECT now() AS ts, 1 + 1 AS sum"

use pgcdc::{ConnectConfig, Query, SqlClient, TlsConfig};

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let sql = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "SELECT 1 AS one".to_string());

    let client = SqlClient::connect(ConnectConfig {
        host: env("PGHOST", "127.0.0.1"),
        port: env("PGPORT", "5432").parse()?,
        user: env("PGUSER", "postgres"),
        password: env("PGPASSWORD", "postgres"),
        database: env("PGDATABASE", "postgres"),
        tls: TlsConfig::disabled(),
        ..Default::default()
    })
    .await?;

    let result = client.eq_one(Query::new(sql.as_str())).await?;
    for (i, row) in result.rows.iter().enumerate() {
        println!("row {i}: {row:?}");
    }
    if let Some(tag) = &result.command {
        println!("{} ({:?} rows)", tag.command, tag.rows);
    }

    client.close().await;
    Ok(())
}
