//! Bounded connection pool for the Redis backed clients.
//!
//! The pool never holds more than `max` connections: checkouts wait on a semaphore sized
//! to `max`, and a new connection is only dialed when no idle one is available and a slot
//! is free. Idle connections past their idle or lifetime ceiling are discarded on checkout.
//!
//! Both ways of giving up halfway are safe. A checkout dropped while dialing gives its
//! slot back, and a connection dropped while a command is in flight is closed rather
//! than returned, since its reply would otherwise be read by the next borrower.

use crate::classify::Classify;
use crate::error::{KitError, KitResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Dials the physical connections a [`Pool`] hands out.
#[async_trait]
pub trait Manage: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> KitResult<Self::Connection>;
}

/// Size and age limits of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub min: u32,
    pub max: u32,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

struct Idle<C> {
    conn: C,
    created: Instant,
    last_used: Instant,
}

impl<C> Idle<C> {
    fn is_expired(&self, settings: &PoolSettings) -> bool {
        self.created.elapsed() >= settings.max_lifetime
            || self.last_used.elapsed() >= settings.idle_timeout
    }
}

struct Shared<M: Manage> {
    manager: M,
    settings: PoolSettings,
    idle: Mutex<VecDeque<Idle<M::Connection>>>,
    permits: Arc<Semaphore>,
    total: AtomicU32,
    closed: AtomicBool,
    /// Signalled whenever a slot is freed or a connection goes idle.
    released: Notify,
}

/// A reserved slot that is given back on drop unless a connection took it over.
struct Slot<'a, M: Manage> {
    shared: &'a Shared<M>,
    claimed: bool,
}

impl<M: Manage> Slot<'_, M> {
    fn claim(mut self) {
        self.claimed = true;
    }
}

impl<M: Manage> Drop for Slot<'_, M> {
    fn drop(&mut self) {
        if !self.claimed {
            self.shared.release_slot();
        }
    }
}

impl<M: Manage> Shared<M> {
    fn reserve_slot(&self) -> Option<Slot<'_, M>> {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                (total < self.settings.max).then_some(total + 1)
            })
            .ok()
            .map(|_| Slot {
                shared: self,
                claimed: false,
            })
    }

    fn release_slot(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }

    fn put_idle(&self, entry: Idle<M::Connection>) {
        self.idle.lock().push_back(entry);
        self.released.notify_waiters();
    }

    fn pop_live(&self) -> Option<Idle<M::Connection>> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop_front() {
            if entry.is_expired(&self.settings) {
                self.release_slot();
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// Dial into `slot`. The slot is freed if dialing fails or is abandoned.
    async fn dial(&self, slot: Slot<'_, M>) -> KitResult<Idle<M::Connection>> {
        let conn = self.manager.connect().await?;
        slot.claim();
        let now = Instant::now();
        Ok(Idle {
            conn,
            created: now,
            last_used: now,
        })
    }
}

/// A shared, bounded set of connections.
pub struct Pool<M: Manage> {
    shared: Arc<Shared<M>>,
}

impl<M: Manage> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Manage> Pool<M> {
    pub fn new(manager: M, settings: PoolSettings) -> Self {
        let max = settings.max.max(1);
        Self {
            shared: Arc::new(Shared {
                manager,
                settings: PoolSettings { max, ..settings },
                idle: Mutex::new(VecDeque::new()),
                permits: Arc::new(Semaphore::new(max as usize)),
                total: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                released: Notify::new(),
            }),
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.shared.settings
    }

    /// Connections currently open or being dialed, idle or checked out.
    pub fn size(&self) -> u32 {
        self.shared.total.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Dial connections until the pool holds at least `min` of them.
    pub async fn fill_min(&self) -> KitResult<()> {
        while self.size() < self.shared.settings.min {
            let Some(slot) = self.shared.reserve_slot() else {
                break;
            };
            let entry = self.shared.dial(slot).await?;
            self.shared.put_idle(entry);
        }
        Ok(())
    }

    /// Take a connection, waiting while all `max` of them are in use.
    pub async fn checkout(&self) -> KitResult<Pooled<M>> {
        if self.is_closed() {
            return Err(closed_error());
        }

        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|e| closed_error().caused_by(e))?;

        loop {
            // Registered before looking so a release in between is not missed.
            let mut released = std::pin::pin!(self.shared.released.notified());
            released.as_mut().enable();

            if self.is_closed() {
                return Err(closed_error());
            }
            if let Some(entry) = self.shared.pop_live() {
                return Ok(self.wrap(entry, permit));
            }
            if let Some(slot) = self.shared.reserve_slot() {
                let entry = self.shared.dial(slot).await?;
                debug!(size = self.size(), "Opened pooled connection");
                return Ok(self.wrap(entry, permit));
            }
            // The remaining slots are held by a warm-up dial without a permit.
            released.await;
        }
    }

    fn wrap(&self, entry: Idle<M::Connection>, permit: OwnedSemaphorePermit) -> Pooled<M> {
        Pooled {
            conn: Some(entry.conn),
            created: entry.created,
            in_flight: false,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        }
    }

    /// Close every idle connection and refuse further checkouts.
    ///
    /// Connections still checked out are closed when they come back. Returns false when
    /// the pool was already closed.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.permits.close();
        let drained: Vec<_> = self.shared.idle.lock().drain(..).collect();
        for _ in &drained {
            self.shared.release_slot();
        }
        self.shared.released.notify_waiters();
        debug!(closed = drained.len(), "Drained idle connections");
        true
    }
}

fn closed_error() -> KitError {
    KitError::generic().with_message("pool is closed")
}

/// A checked out connection, returned to the pool on drop.
pub struct Pooled<M: Manage> {
    conn: Option<M::Connection>,
    created: Instant,
    in_flight: bool,
    shared: Arc<Shared<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: Manage> Pooled<M> {
    /// Close the connection instead of returning it, e.g. after an I/O failure.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.shared.release_slot();
        }
    }

    /// Flag that a request was written and its reply is not read yet.
    ///
    /// A connection dropped while flagged is closed, not returned.
    pub fn begin_exchange(&mut self) {
        self.in_flight = true;
    }

    /// Flag that the reply of the current request was fully read.
    pub fn end_exchange(&mut self) {
        self.in_flight = false;
    }
}

impl<M: Manage> Deref for Pooled<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection out, and both consume the guard.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<M: Manage> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<M: Manage> Drop for Pooled<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.in_flight {
            debug!("Closing connection abandoned mid-command");
            drop(conn);
            self.shared.release_slot();
            return;
        }
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.release_slot();
            return;
        }
        self.shared.put_idle(Idle {
            conn,
            created: self.created,
            last_used: Instant::now(),
        });
    }
}

/// Dials Redis connections.
pub struct RedisManager {
    client: redis::Client,
    dial_timeout: Duration,
    command_timeout: Duration,
}

impl RedisManager {
    pub fn new(client: redis::Client, dial_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            client,
            dial_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl Manage for RedisManager {
    type Connection = redis::aio::Connection;

    async fn connect(&self) -> KitResult<Self::Connection> {
        match tokio::time::timeout(self.dial_timeout, self.client.get_async_connection()).await {
            Ok(result) => result.map_err(Classify::classify),
            Err(elapsed) => Err(KitError::timed_out()
                .with_message("dial")
                .with_field("timeout_ms", self.dial_timeout.as_millis())
                .caused_by(elapsed)),
        }
    }
}

pub type RedisPool = Pool<RedisManager>;

impl Pool<RedisManager> {
    /// Run one command within the configured read/write budget.
    pub async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> KitResult<T> {
        self.query_within(cmd, Duration::ZERO).await
    }

    /// Run one command whose server side blocks for up to `blocking`, on top of the
    /// regular budget.
    pub async fn query_within<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
        blocking: Duration,
    ) -> KitResult<T> {
        let budget = self.manager().command_timeout + blocking;
        let mut conn = self.checkout().await?;

        conn.begin_exchange();
        let outcome = tokio::time::timeout(budget, cmd.query_async::<_, T>(&mut *conn)).await;
        conn.end_exchange();

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    conn.discard();
                }
                Err(e.classify())
            }
            Err(elapsed) => {
                conn.discard();
                Err(KitError::timed_out()
                    .with_message("command")
                    .with_field("timeout_ms", budget.as_millis())
                    .caused_by(elapsed))
            }
        }
    }

    /// Round trip a PING.
    pub async fn ping(&self) -> KitResult<()> {
        let reply: String = self.query(&redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(KitError::generic().with_message(format!("unexpected PING reply '{}'", reply)))
        }
    }
}
