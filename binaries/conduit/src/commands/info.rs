//! Broker metrics from the operator's side of the wire.

use crate::config::Config;

pub async fn system(config: &Config) -> anyhow::Result<()> {
    let client = config.admin_client()?;
    let stats = client.system_stats().await?;
    println!("Mailboxes: {}", stats.total_mailboxes);
    println!("Messages: {}", stats.message_count);
    println!("Pending messages: {}", stats.pending_messages);
    println!("Connected clients: {}", stats.connected_clients);
    println!("Database version: {}", stats.db_version);
    println!(
        "File store: {} files, {} bytes",
        stats.file_store_count, stats.file_store_size
    );
    Ok(())
}

pub async fn clients(config: &Config, offline_only: bool, verbose: bool) -> anyhow::Result<()> {
    let client = config.admin_client()?;
    let status = client.client_status().await?;
    for st in status.clients {
        if offline_only && st.online {
            continue;
        }
        let mut line = st.mailbox.clone();
        if verbose {
            let version = if st.version.is_empty() { "?" } else { &st.version };
            line = format!("[{version}] {line} ({})", st.host);
        }
        if st.online {
            println!("{line}  ONLINE");
        } else if st.last_seen_at.is_empty() {
            println!("{line}  OFFLINE - never checked in");
        } else {
            println!("{line}  OFFLINE - last seen {}", st.last_seen_at);
        }
    }
    Ok(())
}
