//! Schema migrations.
//!
//! The migrator moves a database between versions of a [`MigrationSet`], keeping the
//! current version in a [`SchemaStore`]. Every operation holds the store's cross-process
//! lock, and operations on one migrator never overlap.
//!
//! A version is marked dirty while its migration runs. A failure leaves it dirty: `apply`
//! and `assert` refuse to proceed, while `rollback` first forces the store back to the
//! previous clean version.

mod source;
mod store;

pub use source::{Migration, MigrationSet};
pub use store::{PgSchemaStore, SchemaStore};

use crate::config::MigratorConfig;
use crate::context::Context;
use crate::error::{KitError, KitResult, Resource};
use crate::util::{RetryConfig, deadline};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Migrator<S: SchemaStore = PgSchemaStore> {
    inner: Arc<Inner<S>>,
    closed: AtomicBool,
}

struct Inner<S> {
    store: S,
    migrations: MigrationSet,
    lock_timeout: Duration,
    busy: Mutex<()>,
    stop: CancellationToken,
}

impl Migrator<PgSchemaStore> {
    /// Load the migrations directory and connect to the database holding the schema.
    pub async fn connect(ctx: &Context, config: MigratorConfig, retry: &RetryConfig) -> KitResult<Self> {
        let migrations = MigrationSet::load(&config.migrations_path_or_default())
            .map_err(|e| e.for_resource(Resource::Migrator))?;
        debug!(count = migrations.len(), latest = migrations.latest(), "Loaded migrations");

        let store = PgSchemaStore::connect(ctx, &config, retry).await?;
        Ok(Self::new(store, migrations, config.lock_timeout_or_default()))
    }
}

impl<S: SchemaStore> Migrator<S> {
    /// Migrator over an already connected store.
    ///
    /// `lock_timeout` bounds the wait for the store lock when the context has no deadline.
    pub fn new(store: S, migrations: MigrationSet, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                migrations,
                lock_timeout,
                busy: Mutex::new(()),
                stop: CancellationToken::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.inner.migrations
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Current schema version and whether it is dirty; an empty store is version 0.
    pub async fn version(&self, ctx: &Context) -> KitResult<(i64, bool)> {
        self.locked(ctx, |inner, _| async move { inner.current().await })
            .await
    }

    /// Fail unless the schema is clean and exactly at `version`.
    pub async fn assert(&self, ctx: &Context, version: i64) -> KitResult<()> {
        self.locked(ctx, move |inner, _| async move { inner.assert(version).await })
            .await
    }

    /// Apply every migration between the current version and `version`.
    pub async fn apply(&self, ctx: &Context, version: i64) -> KitResult<()> {
        self.locked(ctx, move |inner, exceeded| async move {
            inner.apply(&exceeded, version).await
        })
        .await
    }

    /// Revert every migration between the current version and `version`; 0 reverts them all.
    pub async fn rollback(&self, ctx: &Context, version: i64) -> KitResult<()> {
        self.locked(ctx, move |inner, exceeded| async move {
            inner.rollback(&exceeded, version).await
        })
        .await
    }

    /// Stop after the migration in progress, if any, and release the store.
    /// Closing an already closed migrator does nothing.
    pub async fn close(&self, ctx: &Context) -> KitResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(resource = %Resource::Migrator, "Closing migrator");
        self.inner.stop.cancel();
        let inner = self.inner.clone();
        deadline::run(ctx, move |_| async move {
            let _idle = inner.busy.lock().await;
            inner.store.close().await
        })
        .await
        .map_err(|e| e.for_resource(Resource::Migrator))?;
        info!(resource = %Resource::Migrator, "Closed migrator");

        Ok(())
    }

    /// Run `step` under the deadline of `ctx`, holding both the busy lock and the store lock.
    async fn locked<T, F, Fut>(&self, ctx: &Context, step: F) -> KitResult<T>
    where
        F: FnOnce(Arc<Inner<S>>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = KitResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(KitError::generic()
                .for_resource(Resource::Migrator)
                .with_message("migrator is closed"));
        }
        ctx.check().map_err(|e| e.for_resource(Resource::Migrator))?;

        let lock_timeout = ctx.remaining().unwrap_or(self.inner.lock_timeout);
        let inner = self.inner.clone();

        deadline::run(ctx, move |exceeded| async move {
            let _busy = inner.busy.lock().await;
            inner.store.lock(lock_timeout).await?;
            let result = step(inner.clone(), exceeded).await;
            let unlocked = inner.store.unlock().await;
            let value = result?;
            unlocked?;
            Ok(value)
        })
        .await
        .map_err(|e| e.for_resource(Resource::Migrator))
    }
}

impl<S: SchemaStore> Inner<S> {
    async fn current(&self) -> KitResult<(i64, bool)> {
        Ok(self.store.version().await?.unwrap_or((0, false)))
    }

    async fn assert(&self, desired: i64) -> KitResult<()> {
        let (current, dirty) = self.current().await?;
        if dirty {
            return Err(dirty_error(current));
        }
        if desired < current {
            return Err(behind_error(desired, current));
        }
        if desired > current {
            return Err(KitError::generic()
                .with_message(format!(
                    "desired schema version {} ahead of current one {}",
                    desired, current
                ))
                .with_field("version", current));
        }

        info!(resource = %Resource::Migrator, "Desired schema version {} asserted", desired);
        Ok(())
    }

    async fn apply(&self, exceeded: &CancellationToken, desired: i64) -> KitResult<()> {
        let (current, dirty) = self.current().await?;
        if dirty {
            return Err(dirty_error(current));
        }
        if desired == current {
            info!(resource = %Resource::Migrator, "No migrations to apply");
            return Ok(());
        }
        if desired < current {
            return Err(behind_error(desired, current));
        }
        if !self.migrations.contains(desired) {
            return Err(unknown_error(desired));
        }

        let steps = self.migrations.steps_up(current, desired);
        info!(resource = %Resource::Migrator, "{} migrations to be applied", steps.len());

        for migration in steps {
            self.ensure_running(exceeded, migration.version)?;
            self.store.set_version(migration.version, true).await?;
            self.store
                .run(&migration.up)
                .await
                .map_err(|e| step_error(e, migration))?;
            self.store.set_version(migration.version, false).await?;
            debug!(version = migration.version, name = %migration.name, "Applied migration");
        }

        info!(resource = %Resource::Migrator, "Applied all migrations successfully");
        Ok(())
    }

    async fn rollback(&self, exceeded: &CancellationToken, desired: i64) -> KitResult<()> {
        let (mut current, dirty) = self.current().await?;
        if dirty {
            let previous = self.migrations.previous(current);
            info!(
                resource = %Resource::Migrator,
                "Current schema version {} is dirty, forcing it back to version {}",
                current,
                previous
            );
            self.store.set_version(previous, false).await?;
            current = previous;
        }
        if desired == current {
            info!(resource = %Resource::Migrator, "No migrations to rollback");
            return Ok(());
        }
        if desired > current {
            return Err(KitError::generic()
                .with_message(format!(
                    "desired schema version {} ahead of current one {}",
                    desired, current
                ))
                .with_field("version", current));
        }
        if desired != 0 && !self.migrations.contains(desired) {
            return Err(unknown_error(desired));
        }

        let steps = self.migrations.steps_down(current, desired);
        if let Some(missing) = steps.iter().find(|m| m.down.is_none()) {
            return Err(KitError::not_found()
                .with_message("missing down migration")
                .with_field("version", missing.version));
        }
        info!(resource = %Resource::Migrator, "{} migrations to be rollbacked", steps.len());

        for migration in steps {
            self.ensure_running(exceeded, migration.version)?;
            let Some(down) = migration.down.as_deref() else {
                continue;
            };
            self.store.set_version(migration.version, true).await?;
            self.store
                .run(down)
                .await
                .map_err(|e| step_error(e, migration))?;
            self.store
                .set_version(self.migrations.previous(migration.version), false)
                .await?;
            debug!(version = migration.version, name = %migration.name, "Rollbacked migration");
        }

        info!(resource = %Resource::Migrator, "Rollbacked all migrations successfully");
        Ok(())
    }

    /// Refuse to start another step once closing began or the deadline passed.
    fn ensure_running(&self, exceeded: &CancellationToken, next: i64) -> KitResult<()> {
        if self.stop.is_cancelled() {
            return Err(KitError::generic()
                .with_message("migrator stopped before the next migration")
                .with_field("version", next));
        }
        if exceeded.is_cancelled() {
            return Err(KitError::timed_out()
                .with_message("deadline exceeded before the next migration")
                .with_field("version", next));
        }
        Ok(())
    }
}

fn dirty_error(current: i64) -> KitError {
    KitError::generic()
        .with_message(format!("current schema version {} is dirty", current))
        .with_field("version", current)
}

fn behind_error(desired: i64, current: i64) -> KitError {
    KitError::generic()
        .with_message(format!(
            "desired schema version {} behind from current one {}",
            desired, current
        ))
        .with_field("version", current)
}

fn unknown_error(desired: i64) -> KitError {
    KitError::not_found()
        .with_message(format!("unknown schema version {}", desired))
        .with_field("version", desired)
}

fn step_error(err: KitError, migration: &Migration) -> KitError {
    err.with_field("version", migration.version)
        .with_field("migration", &migration.name)
}
