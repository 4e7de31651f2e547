// demos/subscribe.rs
//
// PGSLOT=my_slot PGPUBLICATION=my_pub cargo run --example subscribe

use std::collections::BTreeSet;

use pgcdc::{Change, ChangeEvent, ConnectConfig, Subscriber, SubscriberConfig, TlsConfig};

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = SubscriberConfig {
        connect: ConnectConfig {
            host: env("PGHOST", "127.0.0.1"),
            port: env("PGPORT", "5432").parse()?,
            user: env("PGUSER", "postgres"),
            password: env("PGPASSWORD", "postgres"),
            database: env("PGDATABASE", "postgres"),
            tls: TlsConfig::disabled(),
            ..Default::default()
        },
        publications: BTreeSet::from([env("PGPUBLICATION", "my_pub")]),
        start_lsn: env("START_LSN", "0/0").parse().map_err(|e| anyhow::anyhow!("{e}"))?,
        ..Default::default()
    };

    let slot = env("PGSLOT", "my_slot");
    let subscriber = Subscriber::connect(
        &slot,
        |event: ChangeEvent| {
            match &event.change {
                Change::Begin { xid, .. } => println!("begin xid={xid}"),
                Change::Insert {
                    schema,
                    table,
                    new_row,
                    ..
                } => println!("insert {schema}.{table}: {new_row:?}"),
                Change::Update {
                    schema,
                    table,
                    old_row,
                    new_row,
                    ..
                } => println!("update {schema}.{table}: {old_row:?} -> {new_row:?}"),
                Change::Delete {
                    schema,
                    table,
                    old_row,
                    ..
                } => println!("delete {schema}.{table}: {old_row:?}"),
                Change::Commit { tx_end_lsn, .. } => println!("commit through {tx_end_lsn}"),
                other => println!("{other:?}"),
            }
            if let Some(ack) = &event.ack {
                ack.ack();
            }
        },
        config,
    )
    .await?;

    println!("subscribed on slot {slot}; ctrl-c to stop");
    tokio::select! {
        result = subscriber.wait() => result?,
        _ = tokio::signal::ctrl_c() => subscriber.close().await?,
    }
    Ok(())
}
