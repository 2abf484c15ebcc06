//! Named mutex with a time-to-live.
//!
//! A lock is a `(namespace, key)` pair; while its record exists and has not
//! expired, nobody else can acquire it. There is no owner tracking and no
//! reentrancy: a holder that crashes simply lets the TTL run out.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use surrealdb::{RecordId, sql::Datetime};
use tracing::debug;

use crate::db::schema::LockRecord;
use crate::db::{Db, enrollments::is_already_exists};

#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lock for `ttl`. Returns `false` if it is held.
    async fn acquire(&self, namespace: &str, key: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lock whether or not it is held.
    async fn release(&self, namespace: &str, key: &str) -> Result<()>;
}

/// Lock service backed by the `send_lock` table.
///
/// Acquisition is an expired-entry sweep followed by a create of the
/// deterministic record id; the create fails if a live entry exists.
#[derive(Clone)]
pub struct SurrealLockService {
    db: Db,
}

impl SurrealLockService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn record_id(namespace: &str, key: &str) -> RecordId {
        RecordId::from_table_key("send_lock", format!("{}:{}", namespace, key))
    }
}

fn is_contended(err: &surrealdb::Error) -> bool {
    if is_already_exists(err) {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    message.contains("conflict") || message.contains("can be retried")
}

#[async_trait]
impl LockService for SurrealLockService {
    async fn acquire(&self, namespace: &str, key: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let id = Self::record_id(namespace, key);
        let record = LockRecord {
            namespace: namespace.to_string(),
            key: key.to_string(),
            expires_at: Datetime::from(now + ttl),
        };

        let result = async {
            self.db
                .query(
                    r#"
                    DELETE $id WHERE expires_at <= $now;
                    CREATE $id CONTENT $record RETURN NONE;
                    "#,
                )
                .bind(("id", id.clone()))
                .bind(("now", Datetime::from(now)))
                .bind(("record", record))
                .await?
                .check()
        }
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_contended(&e) => {
                debug!("Lock {} is held", id);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, namespace: &str, key: &str) -> Result<()> {
        self.db
            .query("DELETE $id RETURN NONE")
            .bind(("id", Self::record_id(namespace, key)))
            .await?
            .check()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_connection, ensure_schema, DatabaseConfig};

    async fn setup_test_db() -> Db {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let locks = SurrealLockService::new(setup_test_db().await);
        let ttl = Duration::seconds(60);

        assert!(locks.acquire("drip-step", "a", ttl).await.unwrap());
        assert!(!locks.acquire("drip-step", "a", ttl).await.unwrap());

        // Different key or namespace is independent.
        assert!(locks.acquire("drip-step", "b", ttl).await.unwrap());
        assert!(locks.acquire("other", "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_the_lock() {
        let locks = SurrealLockService::new(setup_test_db().await);
        let ttl = Duration::seconds(60);

        assert!(locks.acquire("drip-step", "a", ttl).await.unwrap());
        locks.release("drip-step", "a").await.unwrap();
        assert!(locks.acquire("drip-step", "a", ttl).await.unwrap());

        // Releasing a lock nobody holds is fine.
        locks.release("drip-step", "never-held").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let locks = SurrealLockService::new(setup_test_db().await);

        assert!(locks.acquire("drip-step", "a", Duration::seconds(-1)).await.unwrap());
        assert!(locks.acquire("drip-step", "a", Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let locks = SurrealLockService::new(setup_test_db().await);
        let ttl = Duration::seconds(60);

        let (a, b) = tokio::join!(
            locks.acquire("drip-step", "race", ttl),
            locks.acquire("drip-step", "race", ttl),
        );
        assert_eq!([a.unwrap(), b.unwrap()].iter().filter(|won| **won).count(), 1);
    }
}
