//! Access keys: the capability tokens of the wire protocol. A key is either
//! full-access (admin) or bound to exactly one mailbox, and key names share a
//! namespace with mailbox ids.

use conduit_structs::ConduitError;
use sqlx::SqlitePool;

use crate::{mailboxes, storage_err};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessKey {
    pub name: String,
    pub secret: String,
    pub full_access: bool,
    /// Empty exactly when `full_access` is set.
    pub mailbox_id: String,
}

impl AccessKey {
    pub fn can_admin(&self) -> bool {
        self.full_access
    }

    pub fn can_put(&self, _mailbox: &str) -> bool {
        self.full_access
    }

    pub fn can_get(&self, mailbox: &str) -> bool {
        self.full_access || self.mailbox_id == mailbox
    }

    pub fn can_delete(&self, mailbox: &str) -> bool {
        self.can_get(mailbox)
    }
}

/// Create a full-access key. Without a name, a random identifier is used.
/// The name may not collide with another key or with a mailbox id.
pub async fn create_full_access(
    pool: &SqlitePool,
    name: Option<&str>,
) -> Result<AccessKey, ConduitError> {
    let name = match name {
        Some(name) => name.to_string(),
        None => conduit_crypt::signature::new_identifier(),
    };
    if exists(pool, &name).await? {
        return Err(ConduitError::AlreadyExists(format!("access key '{name}'")));
    }
    if mailboxes::find(pool, &name).await?.is_some() {
        return Err(ConduitError::NameCollision(name, "a mailbox"));
    }
    let key = AccessKey {
        name,
        secret: conduit_crypt::signature::new_identifier(),
        full_access: true,
        mailbox_id: String::new(),
    };
    insert(pool, &key).await?;
    Ok(key)
}

/// Create the key bound to a mailbox. The key takes the mailbox id as its
/// name, so registration fails when a key already claimed that name.
pub async fn create_for_mailbox(
    pool: &SqlitePool,
    mailbox_id: &str,
) -> Result<AccessKey, ConduitError> {
    if mailboxes::find(pool, mailbox_id).await?.is_none() {
        return Err(ConduitError::not_found(format!("mailbox '{mailbox_id}'")));
    }
    if exists(pool, mailbox_id).await? {
        return Err(ConduitError::AlreadyExists(format!(
            "access key '{mailbox_id}'"
        )));
    }
    let key = AccessKey {
        name: mailbox_id.to_string(),
        secret: conduit_crypt::signature::new_identifier(),
        full_access: false,
        mailbox_id: mailbox_id.to_string(),
    };
    insert(pool, &key).await?;
    Ok(key)
}

pub async fn find_by_name(
    pool: &SqlitePool,
    name: &str,
) -> Result<Option<AccessKey>, ConduitError> {
    let row = sqlx::query_as::<_, (String, String, i64, String)>(
        "SELECT name, secret, full_access, mailbox_id FROM access_keys WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .map_err(storage_err)?;
    Ok(row.map(|(name, secret, full_access, mailbox_id)| AccessKey {
        name,
        secret,
        full_access: full_access != 0,
        mailbox_id,
    }))
}

pub async fn exists(pool: &SqlitePool, name: &str) -> Result<bool, ConduitError> {
    let row = sqlx::query_scalar::<_, i64>("SELECT 1 FROM access_keys WHERE name = ? LIMIT 1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(storage_err)?;
    Ok(row.is_some())
}

/// Names of every key, full-access ones first.
pub async fn list(pool: &SqlitePool) -> Result<Vec<AccessKey>, ConduitError> {
    let rows = sqlx::query_as::<_, (String, String, i64, String)>(
        "SELECT name, secret, full_access, mailbox_id FROM access_keys \
         ORDER BY full_access DESC, name",
    )
    .fetch_all(pool)
    .await
    .map_err(storage_err)?;
    Ok(rows
        .into_iter()
        .map(|(name, secret, full_access, mailbox_id)| AccessKey {
            name,
            secret,
            full_access: full_access != 0,
            mailbox_id,
        })
        .collect())
}

pub async fn revoke(pool: &SqlitePool, name: &str) -> Result<(), ConduitError> {
    let result = sqlx::query("DELETE FROM access_keys WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await
        .map_err(storage_err)?;
    if result.rows_affected() == 0 {
        return Err(ConduitError::not_found(format!("access key '{name}'")));
    }
    Ok(())
}

async fn insert(pool: &SqlitePool, key: &AccessKey) -> Result<(), ConduitError> {
    sqlx::query(
        "INSERT INTO access_keys (name, secret, full_access, mailbox_id) VALUES (?, ?, ?, ?)",
    )
    .bind(&key.name)
    .bind(&key.secret)
    .bind(i64::from(key.full_access))
    .bind(&key.mailbox_id)
    .execute(pool)
    .await
    .map_err(storage_err)?;
    tracing::info!(name = %key.name, full_access = key.full_access, "access key created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn full_access_keys_have_no_mailbox() {
        let pool = db::open_memory().await.expect("db");
        let key = create_full_access(&pool, Some("ops")).await.expect("key");
        assert!(key.full_access);
        assert!(key.mailbox_id.is_empty());
        assert_eq!(key.secret.len(), 32);

        let found = find_by_name(&pool, "ops").await.expect("find").expect("some");
        assert_eq!(found, key);
    }

    #[tokio::test]
    async fn mailbox_keys_take_the_mailbox_name() {
        let pool = db::open_memory().await.expect("db");
        mailboxes::create(&pool, "newton.maxwell").await.expect("mailbox");
        let key = create_for_mailbox(&pool, "newton.maxwell").await.expect("key");
        assert!(!key.full_access);
        assert_eq!(key.name, "newton.maxwell");
        assert_eq!(key.mailbox_id, "newton.maxwell");
    }

    #[tokio::test]
    async fn mailbox_key_requires_the_mailbox() {
        let pool = db::open_memory().await.expect("db");
        let err = create_for_mailbox(&pool, "ghost").await.unwrap_err();
        assert!(matches!(err, ConduitError::NotFound(_)));
    }

    #[tokio::test]
    async fn names_are_unique_across_keys_and_mailboxes() {
        let pool = db::open_memory().await.expect("db");
        create_full_access(&pool, Some("ops")).await.expect("key");
        assert!(matches!(
            create_full_access(&pool, Some("ops")).await.unwrap_err(),
            ConduitError::AlreadyExists(_)
        ));

        mailboxes::create(&pool, "fleet.web").await.expect("mailbox");
        assert!(matches!(
            create_full_access(&pool, Some("fleet.web")).await.unwrap_err(),
            ConduitError::NameCollision(..)
        ));
        assert!(matches!(
            mailboxes::create(&pool, "ops").await.unwrap_err(),
            ConduitError::NameCollision(..)
        ));
    }

    #[tokio::test]
    async fn capability_matrix() {
        let admin = AccessKey {
            name: "ops".into(),
            secret: "s".into(),
            full_access: true,
            mailbox_id: String::new(),
        };
        let scoped = AccessKey {
            name: "alpha".into(),
            secret: "s".into(),
            full_access: false,
            mailbox_id: "alpha".into(),
        };
        assert!(admin.can_admin() && admin.can_put("beta") && admin.can_get("beta"));
        assert!(!scoped.can_admin());
        assert!(!scoped.can_put("alpha"));
        assert!(scoped.can_get("alpha") && scoped.can_delete("alpha"));
        assert!(!scoped.can_get("beta") && !scoped.can_delete("beta"));
    }

    #[tokio::test]
    async fn revoke_removes_the_key() {
        let pool = db::open_memory().await.expect("db");
        create_full_access(&pool, Some("ops")).await.expect("key");
        revoke(&pool, "ops").await.expect("revoke");
        assert!(find_by_name(&pool, "ops").await.expect("find").is_none());
        assert!(matches!(
            revoke(&pool, "ops").await.unwrap_err(),
            ConduitError::NotFound(_)
        ));
    }
}
