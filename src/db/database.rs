//! Pooled Postgres client.

use crate::classify::Classify;
use crate::config::DatabaseConfig;
use crate::context::Context;
use crate::db::statement::Statement;
use crate::db::transaction::{IsolationLevel, PgTransactions, TransactionManager};
use crate::error::{KitError, KitResult, Resource};
use crate::resource;
use crate::util::{RetryConfig, deadline};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Connection, FromRow, PgPool};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Instrument, debug_span, info};

/// Run `$body` against the transaction active in `$ctx`, or the pool when there is none.
///
/// `$executor` is bound to `&mut PgConnection` or `&PgPool` and `$args` to the encoded
/// parameters. The body runs within the context deadline; its driver error is classified
/// and tagged with the database resource.
macro_rules! on_executor {
    ($db:ident, $ctx:expr, $stmt:expr, $operation:literal, |$executor:ident, $args:ident| $body:expr) => {{
        let ctx: &Context = $ctx;
        let statement: &Statement = $stmt;
        let span = debug_span!(
            "sql",
            operation = $operation,
            sql = %statement.sql(),
            params = statement.params().len()
        );

        async {
            ctx.check()?;
            let $args = statement.arguments()?;

            let result = match $db.transactions.current(ctx) {
                Some(handle) => {
                    let mut session = handle.session().await;
                    let tx = session.as_mut().ok_or_else(|| {
                        KitError::transaction_failed().with_message("transaction already settled")
                    })?;
                    let $executor = &mut **tx;
                    deadline::bound(ctx, async { $body.map_err(Classify::classify) }).await
                }
                None => {
                    let $executor = $db.pool();
                    deadline::bound(ctx, async { $body.map_err(Classify::classify) }).await
                }
            }?;

            ctx.check()?;
            Ok::<_, KitError>(result)
        }
        .instrument(span)
        .await
        .map_err(|e| e.for_resource(Resource::Database))
    }};
}

/// Postgres client over a bounded connection pool.
///
/// Queries find the transaction active in their context, if any, and run on it; otherwise
/// they check a connection out of the pool.
pub struct Database {
    config: DatabaseConfig,
    transactions: TransactionManager<PgTransactions>,
    closed: AtomicBool,
}

impl Database {
    /// Connect to the database, retrying the dial per `retry` within the deadline of `ctx`.
    pub async fn connect(
        ctx: &Context,
        config: DatabaseConfig,
        retry: &RetryConfig,
    ) -> KitResult<Self> {
        config.validate().map_err(|message| {
            KitError::generic()
                .for_resource(Resource::Database)
                .with_message(message)
        })?;

        let options = connect_options(&config)?;
        let pool_options = PgPoolOptions::new()
            .min_connections(config.min_connections_or_default())
            .max_connections(config.max_connections_or_default())
            .idle_timeout(Some(config.idle_timeout_or_default()))
            .max_lifetime(Some(config.max_lifetime_or_default()))
            .acquire_timeout(config.dial_timeout_or_default());

        let pool = resource::establish(
            ctx,
            Resource::Database,
            &config.name,
            retry,
            move |_, exceeded| {
                let options = options.clone();
                let pool_options = pool_options.clone();
                async move {
                    let pool = pool_options
                        .connect_with(options)
                        .await
                        .map_err(Classify::classify)?;
                    let pinged = ping(&pool).await;
                    if exceeded.is_cancelled() || pinged.is_err() {
                        // Never leave a late or broken pool behind.
                        pool.close().await;
                    }
                    pinged?;
                    if exceeded.is_cancelled() {
                        return Err(KitError::timed_out().with_message("connected after deadline"));
                    }
                    Ok(pool)
                }
            },
        )
        .await?;

        let default_level = config.default_isolation_level_or_default();
        Ok(Self {
            config,
            transactions: TransactionManager::new(PgTransactions::new(pool), default_level),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        self.transactions.backend().pool()
    }

    /// Whether `ctx` carries a transaction of this database.
    pub fn in_transaction(&self, ctx: &Context) -> bool {
        self.transactions.current(ctx).is_some()
    }

    /// Check pool occupancy, liveness and the context; any failure is `Unhealthy`.
    pub async fn health(&self, ctx: &Context) -> KitResult<()> {
        let pool = self.pool().clone();
        let minimum = self.config.min_connections_or_default();

        resource::check_health(ctx, Resource::Database, move |ctx| async move {
            let current = pool.size();
            resource::assess_health(&ctx, Resource::Database, current, minimum, ping(&pool)).await
        })
        .await
    }

    /// Run a query and scan every row into `T`.
    pub async fn query<T>(&self, ctx: &Context, stmt: &Statement) -> KitResult<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        on_executor!(self, ctx, stmt, "query", |executor, args| {
            sqlx::query_as_with::<_, T, _>(stmt.sql(), args)
                .fetch_all(executor)
                .await
        })
    }

    /// Run a query expected to return exactly one row; no row is `NotFound`.
    pub async fn query_one<T>(&self, ctx: &Context, stmt: &Statement) -> KitResult<T>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        on_executor!(self, ctx, stmt, "query_one", |executor, args| {
            sqlx::query_as_with::<_, T, _>(stmt.sql(), args)
                .fetch_one(executor)
                .await
        })
    }

    /// Run a statement and return the number of affected rows.
    pub async fn exec(&self, ctx: &Context, stmt: &Statement) -> KitResult<u64> {
        on_executor!(self, ctx, stmt, "exec", |executor, args| {
            sqlx::query_with(stmt.sql(), args)
                .execute(executor)
                .await
                .map(|done| done.rows_affected())
        })
    }

    /// Run `f` in a transaction; see [`TransactionManager::transaction`].
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
        self.transactions
            .transaction(ctx, level, f)
            .await
            .map_err(|e| e.for_resource(Resource::Database))
    }

    /// Close the pool. Closing an already closed database does nothing.
    pub async fn close(&self, ctx: &Context) -> KitResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(resource = %Resource::Database, "Closing {} database", self.config.name);
        let pool = self.pool().clone();
        deadline::run(ctx, move |_| async move {
            pool.close().await;
            Ok(())
        })
        .await
        .map_err(|e| e.for_resource(Resource::Database))?;
        info!(resource = %Resource::Database, "Closed {} database", self.config.name);

        Ok(())
    }
}

async fn ping(pool: &PgPool) -> KitResult<()> {
    let mut conn = pool.acquire().await.map_err(Classify::classify)?;
    conn.ping().await.map_err(Classify::classify)
}

/// Driver options for `config`, including the session parameters every connection gets.
pub(crate) fn connect_options(config: &DatabaseConfig) -> KitResult<PgConnectOptions> {
    let ssl_mode = if config.ssl_mode.is_empty() {
        PgSslMode::Prefer
    } else {
        config.ssl_mode.parse::<PgSslMode>().map_err(|e| {
            KitError::generic()
                .for_resource(Resource::Database)
                .with_message(format!("invalid sslmode '{}'", config.ssl_mode))
                .caused_by(e)
        })?
    };

    let timeout_ms = config.statement_timeout_or_default().as_millis().to_string();
    let isolation = config
        .default_isolation_level_or_default()
        .as_sql()
        .to_lowercase()
        .replace(' ', "\\ ");

    Ok(PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.name)
        .application_name(config.app_name_or_default())
        .ssl_mode(ssl_mode)
        .options([
            ("standard_conforming_strings", "on".to_string()),
            ("default_transaction_isolation", isolation),
            ("statement_timeout", timeout_ms.clone()),
            ("lock_timeout", timeout_ms),
        ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            host: "db.internal".to_string(),
            port: 5433,
            ssl_mode: "require".to_string(),
            user: "app".to_string(),
            password: "secret".to_string(),
            name: "orders".to_string(),
            statement_timeout_secs: Some(5),
            default_isolation_level: Some(IsolationLevel::RepeatableRead),
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn test_connect_options_carry_session_parameters() {
        let options = connect_options(&config()).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("orders"));
        assert_eq!(options.get_application_name(), Some("resource-kit"));
        assert!(matches!(options.get_ssl_mode(), PgSslMode::Require));

        let session = options.get_options().unwrap_or_default();
        assert!(session.contains("statement_timeout=5000"));
        assert!(session.contains("lock_timeout=5000"));
        assert!(session.contains("default_transaction_isolation=repeatable\\ read"));
        assert!(session.contains("standard_conforming_strings=on"));
    }

    #[test]
    fn test_invalid_sslmode_is_rejected() {
        let err = connect_options(&DatabaseConfig {
            ssl_mode: "sometimes".to_string(),
            ..config()
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert_eq!(err.resource(), Some(Resource::Database));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config_without_dialing() {
        let err = Database::connect(
            &Context::background(),
            DatabaseConfig {
                min_connections: Some(9),
                max_connections: Some(3),
                ..config()
            },
            &RetryConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert!(err.to_string().contains("cannot exceed"));
    }
}
