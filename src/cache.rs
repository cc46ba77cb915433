//! Redis backed cache.
//!
//! Values are stored as JSON. A missing key is reported as a [`CacheMiss`], which
//! classifies as `NotFound`.

use crate::classify::{CacheMiss, Classify};
use crate::config::CacheConfig;
use crate::context::Context;
use crate::error::{KitError, KitResult, Resource};
use crate::pool::{Pool, PoolSettings, RedisManager, RedisPool};
use crate::resource;
use crate::util::{RetryConfig, deadline};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

pub struct Cache {
    config: CacheConfig,
    pool: RedisPool,
    closed: AtomicBool,
}

/// Dial a Redis pool for `config` and prove it works, closing it again on failure or when
/// the deadline already fired.
pub(crate) async fn open_redis_pool(
    ctx: &Context,
    resource: Resource,
    config: &CacheConfig,
    max_connections: u32,
    retry: &RetryConfig,
) -> KitResult<RedisPool> {
    config.validate().map_err(|message| {
        KitError::generic()
            .for_resource(resource)
            .with_message(message)
    })?;

    let url = config.url().map_err(|e| e.for_resource(resource))?;
    let client = redis::Client::open(url.as_str())
        .map_err(|e| e.classify().for_resource(resource))?;
    let settings = PoolSettings {
        min: config.min_connections_or_default(),
        max: max_connections,
        idle_timeout: config.idle_timeout_or_default(),
        max_lifetime: config.max_lifetime_or_default(),
    };
    let dial_timeout = config.dial_timeout_or_default();
    let command_timeout = config.command_timeout();

    resource::establish(ctx, resource, &config.target(), retry, move |_, exceeded| {
        let manager = RedisManager::new(client.clone(), dial_timeout, command_timeout);
        async move {
            let pool = Pool::new(manager, settings);
            let ready = async {
                pool.fill_min().await?;
                pool.ping().await
            }
            .await;
            if ready.is_err() || exceeded.is_cancelled() {
                pool.close();
            }
            ready?;
            if exceeded.is_cancelled() {
                return Err(KitError::timed_out().with_message("connected after deadline"));
            }
            Ok(pool)
        }
    })
    .await
}

impl Cache {
    /// Connect to the cache, retrying the dial per `retry` within the deadline of `ctx`.
    pub async fn connect(ctx: &Context, config: CacheConfig, retry: &RetryConfig) -> KitResult<Self> {
        let max = config.max_connections_or_default();
        let pool = open_redis_pool(ctx, Resource::Cache, &config, max, retry).await?;
        Ok(Self {
            config,
            pool,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Check pool occupancy, a PING round trip and the context; any failure is `Unhealthy`.
    pub async fn health(&self, ctx: &Context) -> KitResult<()> {
        let pool = self.pool.clone();
        let minimum = self.config.min_connections_or_default();

        resource::check_health(ctx, Resource::Cache, move |ctx| async move {
            let current = pool.size();
            resource::assess_health(&ctx, Resource::Cache, current, minimum, pool.ping()).await
        })
        .await
    }

    /// Store `value` under `key`, expiring after `ttl` when given.
    pub async fn set<T>(&self, ctx: &Context, key: &str, value: &T, ttl: Option<Duration>) -> KitResult<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value).map_err(|e| self.tag(e.classify()))?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }

        debug!(key, "Cache set");
        self.bounded(ctx, self.pool.query::<()>(&cmd)).await
    }

    /// Load the value stored under `key`; a missing key is `NotFound`.
    pub async fn get<T>(&self, ctx: &Context, key: &str) -> KitResult<T>
    where
        T: DeserializeOwned,
    {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);

        let payload: Option<Vec<u8>> = self.bounded(ctx, self.pool.query(&cmd)).await?;
        let Some(payload) = payload else {
            return Err(self.tag(
                CacheMiss {
                    key: key.to_string(),
                }
                .classify(),
            ));
        };
        serde_json::from_slice(&payload).map_err(|e| self.tag(e.classify().with_field("key", key)))
    }

    /// Remove `key`; a key that did not exist is `NotFound`.
    pub async fn delete(&self, ctx: &Context, key: &str) -> KitResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);

        let removed: u64 = self.bounded(ctx, self.pool.query(&cmd)).await?;
        if removed == 0 {
            return Err(self.tag(
                CacheMiss {
                    key: key.to_string(),
                }
                .classify(),
            ));
        }
        Ok(())
    }

    /// Close the pool. Closing an already closed cache does nothing.
    pub async fn close(&self, ctx: &Context) -> KitResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(resource = %Resource::Cache, "Closing cache");
        let pool = self.pool.clone();
        deadline::run(ctx, move |_| async move {
            pool.close();
            Ok(())
        })
        .await
        .map_err(|e| self.tag(e))?;
        info!(resource = %Resource::Cache, "Closed cache");

        Ok(())
    }

    async fn bounded<T>(
        &self,
        ctx: &Context,
        operation: impl std::future::Future<Output = KitResult<T>>,
    ) -> KitResult<T> {
        ctx.check().map_err(|e| self.tag(e))?;
        deadline::bound(ctx, operation).await.map_err(|e| self.tag(e))
    }

    fn tag(&self, err: KitError) -> KitError {
        err.for_resource(Resource::Cache)
    }
}
