//! Where the schema version lives.

use crate::classify::Classify;
use crate::config::MigratorConfig;
use crate::context::Context;
use crate::db::database::connect_options;
use crate::error::{KitError, KitResult, Resource};
use crate::resource;
use crate::util::RetryConfig;
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bookkeeping the migrator needs from a database.
///
/// The version is a single integer plus a dirty flag; a store that was never written
/// reports `None`. Version 0 written clean clears the store back to that state.
#[async_trait]
pub trait SchemaStore: Send + Sync + 'static {
    /// Take the cross-process migration lock, waiting at most `timeout`.
    async fn lock(&self, timeout: Duration) -> KitResult<()>;

    async fn unlock(&self) -> KitResult<()>;

    async fn version(&self) -> KitResult<Option<(i64, bool)>>;

    async fn set_version(&self, version: i64, dirty: bool) -> KitResult<()>;

    /// Execute one migration body, which may hold several statements.
    async fn run(&self, sql: &str) -> KitResult<()>;

    async fn close(&self) -> KitResult<()>;
}

/// Schema version kept in a Postgres table, guarded by a session advisory lock.
///
/// A single connection is held for the life of the store since advisory locks belong to
/// the session that took them.
pub struct PgSchemaStore {
    conn: Mutex<Option<PgConnection>>,
    table: String,
    lock_id: i64,
}

impl PgSchemaStore {
    /// Connect and make sure the bookkeeping table exists.
    pub async fn connect(ctx: &Context, config: &MigratorConfig, retry: &RetryConfig) -> KitResult<Self> {
        config.validate().map_err(|message| {
            KitError::generic()
                .for_resource(Resource::Migrator)
                .with_message(message)
        })?;

        let options = connect_options(&config.database).map_err(|e| e.for_resource(Resource::Migrator))?;
        let table = config.table_or_default().to_string();
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (version BIGINT NOT NULL PRIMARY KEY, dirty BOOLEAN NOT NULL)",
            table
        );

        let conn = resource::establish(
            ctx,
            Resource::Migrator,
            &config.database.name,
            retry,
            move |_, exceeded| {
                let options = options.clone();
                let create = create.clone();
                async move {
                    let mut conn = PgConnection::connect_with(&options)
                        .await
                        .map_err(Classify::classify)?;
                    let prepared = sqlx::query(&create)
                        .execute(&mut conn)
                        .await
                        .map(|_| ())
                        .map_err(Classify::classify);
                    if prepared.is_err() || exceeded.is_cancelled() {
                        let _ = conn.close().await;
                        prepared?;
                        return Err(KitError::timed_out().with_message("connected after deadline"));
                    }
                    Ok(conn)
                }
            },
        )
        .await?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            lock_id: advisory_lock_id(&config.database.name, &table),
            table,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Borrow the connection behind a locked guard, failing once the store is closed.
macro_rules! connection {
    ($guard:expr) => {
        $guard
            .as_mut()
            .ok_or_else(|| KitError::generic().with_message("schema store is closed"))?
    };
}

#[async_trait]
impl SchemaStore for PgSchemaStore {
    async fn lock(&self, timeout: Duration) -> KitResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = connection!(guard);
        let give_up = Instant::now() + timeout;

        loop {
            let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                .bind(self.lock_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(Classify::classify)?;
            if acquired {
                debug!(lock_id = self.lock_id, "Acquired migration lock");
                return Ok(());
            }
            if Instant::now() + LOCK_POLL_INTERVAL > give_up {
                return Err(KitError::timed_out()
                    .with_message("cannot acquire migration lock")
                    .with_field("lock_timeout_ms", timeout.as_millis()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self) -> KitResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = connection!(guard);
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_id)
            .execute(&mut *conn)
            .await
            .map_err(Classify::classify)?;
        Ok(())
    }

    async fn version(&self) -> KitResult<Option<(i64, bool)>> {
        let mut guard = self.conn.lock().await;
        let conn = connection!(guard);
        let sql = format!("SELECT version, dirty FROM {} LIMIT 1", self.table);
        sqlx::query_as::<_, (i64, bool)>(&sql)
            .fetch_optional(&mut *conn)
            .await
            .map_err(Classify::classify)
    }

    async fn set_version(&self, version: i64, dirty: bool) -> KitResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = connection!(guard);
        let truncate = format!("TRUNCATE {}", self.table);
        let insert = format!("INSERT INTO {} (version, dirty) VALUES ($1, $2)", self.table);

        let mut tx = conn.begin().await.map_err(Classify::classify)?;
        sqlx::query(&truncate)
            .execute(&mut *tx)
            .await
            .map_err(Classify::classify)?;
        if version > 0 || dirty {
            sqlx::query(&insert)
                .bind(version)
                .bind(dirty)
                .execute(&mut *tx)
                .await
                .map_err(Classify::classify)?;
        }
        tx.commit().await.map_err(Classify::classify)
    }

    async fn run(&self, sql: &str) -> KitResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = connection!(guard);
        // Without bind arguments the simple query protocol is used, which accepts a body
        // of several statements.
        sqlx::Executor::execute(&mut *conn, sql)
            .await
            .map(|_| ())
            .map_err(Classify::classify)
    }

    async fn close(&self) -> KitResult<()> {
        let Some(conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        conn.close().await.map_err(Classify::classify)
    }
}

/// Stable lock key for one bookkeeping table of one database (FNV-1a).
fn advisory_lock_id(database: &str, table: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in database.bytes().chain([b':']).chain(table.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as i64
}
