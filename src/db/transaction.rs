//! Context-scoped, reentrant transactions.
//!
//! The outermost [`TransactionManager::transaction`] call begins a transaction and attaches
//! its handle to the context it passes down. Nested calls, and every query run with that
//! context, find the handle and reuse it; only the outermost call commits or rolls back.
//! The handle is attached under a key private to its manager, so sibling contexts forked
//! before the transaction began never see it.

use crate::classify::Classify;
use crate::context::{Context, ScopeKey};
use crate::error::{ErrorKind, KitError, KitResult};
use async_trait::async_trait;
use futures_util::FutureExt;
use sqlx::{PgPool, Postgres};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Transaction isolation levels.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Begins and settles physical transactions.
#[async_trait]
pub trait TransactionBackend: Send + Sync + 'static {
    type Transaction: Send + 'static;

    /// Begin a read-write transaction at `level`.
    async fn begin(&self, level: IsolationLevel) -> KitResult<Self::Transaction>;

    async fn commit(&self, tx: Self::Transaction) -> KitResult<()>;

    async fn rollback(&self, tx: Self::Transaction) -> KitResult<()>;
}

/// The live transaction shared by one call chain.
///
/// Statements issued through the same handle are serialized by its lock, in the order
/// the callers acquire it.
pub struct TransactionHandle<T> {
    level: IsolationLevel,
    slot: Mutex<Option<T>>,
}

impl<T> TransactionHandle<T> {
    fn new(level: IsolationLevel, tx: T) -> Self {
        Self {
            level,
            slot: Mutex::new(Some(tx)),
        }
    }

    /// Isolation level the transaction was begun with.
    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    /// Lock the session to run statements on it.
    ///
    /// Holds `None` once the owning call has settled the transaction.
    pub async fn session(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().await
    }

    async fn take(&self) -> Option<T> {
        self.slot.lock().await.take()
    }
}

/// Rolls the transaction back when the owning call exits without settling it.
///
/// Panics in the transaction body are caught and rolled back inline; this guard covers the
/// remaining abnormal exit, the owning future being dropped before it finished.
struct TransactionScope<B: TransactionBackend> {
    backend: Arc<B>,
    handle: Option<Arc<TransactionHandle<B::Transaction>>>,
}

impl<B: TransactionBackend> TransactionScope<B> {
    fn new(backend: Arc<B>, handle: Arc<TransactionHandle<B::Transaction>>) -> Self {
        Self {
            backend,
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) -> Option<Arc<TransactionHandle<B::Transaction>>> {
        self.handle.take()
    }
}

impl<B: TransactionBackend> Drop for TransactionScope<B> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let backend = Arc::clone(&self.backend);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(tx) = handle.take().await {
                        if let Err(e) = backend.rollback(tx).await {
                            warn!(error = %e, "Rollback after abandoned transaction failed");
                        }
                    }
                    warn!("Transaction rolled back via Drop - the owning call was abandoned");
                });
            }
            Err(_) => {
                warn!("Transaction abandoned outside a runtime, leaving rollback to the driver");
            }
        }
    }
}

/// Runs reentrant transactions on a backend.
pub struct TransactionManager<B: TransactionBackend> {
    backend: Arc<B>,
    key: ScopeKey,
    default_level: IsolationLevel,
}

impl<B: TransactionBackend> TransactionManager<B> {
    pub fn new(backend: B, default_level: IsolationLevel) -> Self {
        Self {
            backend: Arc::new(backend),
            key: ScopeKey::unique(),
            default_level,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn default_level(&self) -> IsolationLevel {
        self.default_level
    }

    /// The transaction active in `ctx`, if any.
    pub fn current(&self, ctx: &Context) -> Option<Arc<TransactionHandle<B::Transaction>>> {
        ctx.value::<TransactionHandle<B::Transaction>>(self.key)
    }

    /// Run `f` inside a transaction.
    ///
    /// When `ctx` already carries a transaction of this manager, `f` joins it: `level` is
    /// ignored and nothing is begun or settled here. Otherwise a transaction is begun at
    /// `level` (or the default level), `f` receives a context carrying it, and it is
    /// committed when `f` succeeds and the context is still live, rolled back on any other
    /// exit. Failures come back as `TransactionFailed` wrapping the cause; a rollback
    /// failure is attached as the `rollback_error` field. A panic in `f` rolls back and
    /// then resumes unwinding unchanged.
    pub async fn transaction<T, F, Fut>(
        &self,
        ctx: &Context,
        level: Option<IsolationLevel>,
        f: F,
    ) -> KitResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = KitResult<T>>,
    {
        if self.current(ctx).is_some() {
            return f(ctx.clone())
                .await
                .map_err(|e| e.wrap_as(ErrorKind::TransactionFailed));
        }

        let level = level.unwrap_or(self.default_level);
        let tx = self
            .backend
            .begin(level)
            .await
            .map_err(|e| e.wrap_as(ErrorKind::TransactionFailed))?;
        debug!(level = %level, "Transaction begun");

        let handle = Arc::new(TransactionHandle::new(level, tx));
        let mut scope = TransactionScope::new(Arc::clone(&self.backend), Arc::clone(&handle));

        if let Err(e) = ctx.check() {
            scope.disarm();
            return Err(self.roll_back(&handle, e).await);
        }

        let inner = ctx.with_value(self.key, Arc::clone(&handle));
        let outcome = AssertUnwindSafe(f(inner)).catch_unwind().await;
        scope.disarm();

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(self.roll_back(&handle, e).await),
            Err(panic) => {
                if let Some(tx) = handle.take().await {
                    if let Err(e) = self.backend.rollback(tx).await {
                        warn!(error = %e, "Rollback after panic failed");
                    }
                }
                std::panic::resume_unwind(panic);
            }
        };

        if let Err(e) = ctx.check() {
            return Err(self.roll_back(&handle, e).await);
        }

        let Some(tx) = handle.take().await else {
            return Err(KitError::transaction_failed().with_message("transaction already settled"));
        };
        self.backend
            .commit(tx)
            .await
            .map_err(|e| e.wrap_as(ErrorKind::TransactionFailed))?;
        debug!(level = %level, "Transaction committed");

        Ok(value)
    }

    async fn roll_back(
        &self,
        handle: &TransactionHandle<B::Transaction>,
        cause: KitError,
    ) -> KitError {
        let err = cause.wrap_as(ErrorKind::TransactionFailed);
        let Some(tx) = handle.take().await else {
            return err;
        };
        match self.backend.rollback(tx).await {
            Ok(()) => {
                debug!("Transaction rolled back");
                err
            }
            Err(rollback) => err.with_field("rollback_error", rollback),
        }
    }
}

/// Postgres transactions on a connection pool.
pub struct PgTransactions {
    pool: PgPool,
}

impl PgTransactions {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionBackend for PgTransactions {
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self, level: IsolationLevel) -> KitResult<Self::Transaction> {
        let mut tx = self.pool.begin().await.map_err(Classify::classify)?;
        let set = format!("SET TRANSACTION ISOLATION LEVEL {} READ WRITE", level.as_sql());
        sqlx::query(&set)
            .execute(&mut *tx)
            .await
            .map_err(Classify::classify)?;
        Ok(tx)
    }

    async fn commit(&self, tx: Self::Transaction) -> KitResult<()> {
        tx.commit().await.map_err(Classify::classify)
    }

    async fn rollback(&self, tx: Self::Transaction) -> KitResult<()> {
        tx.rollback().await.map_err(Classify::classify)
    }
}
