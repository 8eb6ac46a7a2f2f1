//! Remote mailbox lifecycle, driven through the broker's admin surface.

use crate::config::Config;

pub async fn register(config: &Config, mailbox: &str) -> anyhow::Result<()> {
    let client = config.admin_client()?;
    let resp = client.register(mailbox).await?;
    println!("Mailbox registered: {}", resp.mailbox);
    println!("Access key name: {}", resp.access_key_name);
    println!("Access key: {}", resp.access_key_secret);
    Ok(())
}

pub async fn deregister(config: &Config, mailbox: &str) -> anyhow::Result<()> {
    let client = config.admin_client()?;
    client.deregister(mailbox).await?;
    println!("Mailbox deregistered: {mailbox}");
    Ok(())
}
