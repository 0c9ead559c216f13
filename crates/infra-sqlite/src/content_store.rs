// SQLite ContentStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use contentmap_core::domain::{ContentObject, DomainError};
use contentmap_core::error::{PublishError, Result};
use contentmap_core::port::time_provider::SystemTimeProvider;
use contentmap_core::port::{ContentStore, StoreTransaction, TimeProvider};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tracing::debug;

/// Content store backed by the `contentmap` table
pub struct SqliteContentStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteContentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            time_provider: Arc::new(SystemTimeProvider),
        }
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Read a committed object
    pub async fn find(&self, obj_type: i32, obj_id: u64) -> Result<Option<ContentObject>> {
        let row: Option<ContentRow> = sqlx::query_as(
            "SELECT obj_type, obj_id, attributes FROM contentmap WHERE obj_type = ? AND obj_id = ?",
        )
        .bind(obj_type)
        .bind(to_db_id(obj_id)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(ContentRow::into_object).transpose()
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contentmap")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(SqliteStoreTransaction {
            state: TxState::Open(tx),
            time_provider: Arc::clone(&self.time_provider),
        }))
    }

    async fn keepalive(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

enum TxState {
    Open(Transaction<'static, Sqlite>),
    /// sqlx consumed the transaction on commit; dropping it after the failure
    /// queued a ROLLBACK that runs before the connection is used again
    CommitFailed,
    Finished,
}

/// One `BEGIN ... COMMIT` on a pooled connection
///
/// The connection is held until commit or rollback; both give it back to the
/// pool, after which further calls are rejected (rollback is a no-op).
pub struct SqliteStoreTransaction {
    state: TxState,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteStoreTransaction {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        match &mut self.state {
            TxState::Open(tx) => Ok(tx),
            _ => Err(PublishError::InvalidState(
                "store transaction already finished".to_string(),
            )),
        }
    }
}

#[async_trait]
impl StoreTransaction for SqliteStoreTransaction {
    async fn put_object(&mut self, object: &ContentObject) -> Result<()> {
        let attributes = serde_json::to_string(&object.attributes)?;
        let now = self.time_provider.now_millis();
        let tx = self.tx()?;

        sqlx::query(
            r#"
            INSERT INTO contentmap (obj_type, obj_id, attributes, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(obj_type, obj_id) DO UPDATE SET
                attributes = excluded.attributes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(object.obj_type)
        .bind(to_db_id(object.obj_id)?)
        .bind(attributes)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        debug!(content_id = %object.content_id(), "Stored object");
        Ok(())
    }

    async fn delete_object(&mut self, object: &ContentObject) -> Result<()> {
        let tx = self.tx()?;
        let result = sqlx::query("DELETE FROM contentmap WHERE obj_type = ? AND obj_id = ?")
            .bind(object.obj_type)
            .bind(to_db_id(object.obj_id)?)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;

        debug!(content_id = %object.content_id(), rows = %result.rows_affected(), "Deleted object");
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let TxState::Open(tx) = std::mem::replace(&mut self.state, TxState::Finished) else {
            return Err(PublishError::InvalidState(
                "store transaction already finished".to_string(),
            ));
        };
        if let Err(e) = tx.commit().await {
            self.state = TxState::CommitFailed;
            return Err(map_sqlx_error(e));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, TxState::Finished) {
            TxState::Open(tx) => tx.rollback().await.map_err(map_sqlx_error),
            TxState::CommitFailed => {
                debug!("Failed commit is rolled back by the driver when the connection is reused");
                Ok(())
            }
            TxState::Finished => Ok(()),
        }
    }
}

fn to_db_id(obj_id: u64) -> Result<i64> {
    i64::try_from(obj_id).map_err(|_| {
        PublishError::Domain(DomainError::InvalidContentId(format!(
            "object id {} exceeds the store's range",
            obj_id
        )))
    })
}

#[derive(Debug, sqlx::FromRow)]
struct ContentRow {
    obj_type: i32,
    obj_id: i64,
    attributes: String,
}

impl ContentRow {
    fn into_object(self) -> Result<ContentObject> {
        Ok(ContentObject {
            obj_type: self.obj_type,
            obj_id: self.obj_id as u64,
            attributes: serde_json::from_str(&self.attributes)?,
        })
    }
}
