//! The `server` command family: run the broker, and administer the local
//! database directly (keys, mailboxes, purges) without going over the wire.

use std::time::Duration;

use anyhow::Context;
use conduit_postmaster::assets::AssetStore;
use conduit_postmaster::server::{BrokerConfig, BrokerState, serve};
use conduit_postmaster::{access, db, mailboxes};

use crate::config::Config;

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let db_path = config.db_path();
    let pool = db::open(&db_path)
        .await
        .with_context(|| format!("open database {}", db_path.display()))?;
    let assets = AssetStore::new(config.files_path());
    assets.ensure_root().await?;
    assets.spawn_janitor(pool.clone());

    let state = BrokerState::new(
        pool,
        assets,
        BrokerConfig {
            enable_long_polling: config.enable_long_polling,
            throttle_delay: Duration::from_millis(config.throttle_delay_ms),
        },
    );
    let listener = tokio::net::TcpListener::bind(&config.host)
        .await
        .with_context(|| format!("bind {}", config.host))?;
    tracing::info!(listen = %config.host, db = %db_path.display(), "broker listening");
    serve(state, listener).await?;
    Ok(())
}

pub async fn access_create(config: &Config, name: Option<String>) -> anyhow::Result<()> {
    let pool = db::open(&config.db_path()).await?;
    let key = access::create_full_access(&pool, name.as_deref()).await?;
    println!("Access key created:");
    println!("  Access key name: {}", key.name);
    println!("  Access key: {}", key.secret);
    Ok(())
}

pub async fn access_list(config: &Config) -> anyhow::Result<()> {
    let pool = db::open(&config.db_path()).await?;
    let keys = access::list(&pool).await?;
    if keys.is_empty() {
        println!("No access keys.");
        return Ok(());
    }
    for key in keys {
        if key.full_access {
            println!("{} (full access)", key.name);
        } else {
            println!("{} (mailbox {})", key.name, key.mailbox_id);
        }
    }
    Ok(())
}

pub async fn access_revoke(config: &Config, name: &str) -> anyhow::Result<()> {
    let pool = db::open(&config.db_path()).await?;
    access::revoke(&pool, name).await?;
    println!("Access key revoked: {name}");
    Ok(())
}

/// Create a mailbox and its bound key directly in the local database.
pub async fn register_local(config: &Config, mailbox: &str) -> anyhow::Result<()> {
    let pool = db::open(&config.db_path()).await?;
    let mb = mailboxes::create(&pool, mailbox).await?;
    let key = access::create_for_mailbox(&pool, &mb.id).await?;
    println!("Mailbox created: {}", mb.id);
    println!("Access key created: {}", key.secret);
    Ok(())
}

/// Drop every pending message for a mailbox in the local database.
pub async fn purge(config: &Config, mailbox: &str) -> anyhow::Result<()> {
    let pool = db::open(&config.db_path()).await?;
    if mailboxes::find(&pool, mailbox).await?.is_none() {
        anyhow::bail!("mailbox '{mailbox}' not found");
    }
    let purged = mailboxes::purge(&pool, mailbox).await?;
    println!("Mailbox purged of {purged} messages.");
    Ok(())
}
