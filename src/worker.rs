//! Background task worker on a Redis broker.
//!
//! Tasks are JSON envelopes pushed onto one Redis list per queue
//! (`{namespace}:queue:{name}`). Consumers pop with `BRPOP` across all configured
//! queues, ordered either strictly by priority or by a weighted draw per poll. A failed
//! task goes back onto its queue until it has used up `max_retry`, then it is moved to
//! `{namespace}:dead`.

use crate::cache::open_redis_pool;
use crate::classify::Classify;
use crate::config::WorkerConfig;
use crate::context::Context;
use crate::error::{KitError, KitResult, Resource};
use crate::pool::RedisPool;
use crate::resource;
use crate::util::{RetryConfig, deadline};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Retries granted to an enqueued task that does not ask for a number.
pub const DEFAULT_TASK_MAX_RETRY: u32 = 25;

/// How long one `BRPOP` blocks before the consumer re-checks for shutdown.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a broker failure before polling again.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: Uuid,
    kind: String,
    payload: serde_json::Value,
    queue: String,
    max_retry: Option<u32>,
    #[serde(default)]
    retried: u32,
    enqueued_at: DateTime<Utc>,
}

impl Task {
    /// Create a task of `kind` carrying `payload` as JSON, bound for the default queue.
    pub fn new<T: Serialize + ?Sized>(kind: impl Into<String>, payload: &T) -> KitResult<Self> {
        let payload = serde_json::to_value(payload).map_err(|e| {
            e.classify()
                .for_resource(Resource::Worker)
        })?;
        Ok(Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            queue: crate::config::DEFAULT_WORKER_QUEUE.to_string(),
            max_retry: None,
            retried: 0,
            enqueued_at: Utc::now(),
        })
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn retried(&self) -> u32 {
        self.retried
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry.unwrap_or(DEFAULT_TASK_MAX_RETRY)
    }

    /// Decode the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> KitResult<T> {
        T::deserialize(&self.payload).map_err(|e| {
            e.classify()
                .for_resource(Resource::Worker)
                .with_field("task", &self.kind)
        })
    }

    /// The same task with one more retry used, or `None` once retries are exhausted.
    fn retry(&self) -> Option<Task> {
        (self.retried < self.max_retry()).then(|| Task {
            retried: self.retried + 1,
            ..self.clone()
        })
    }

    /// A fresh occurrence of a scheduled task.
    fn occurrence(&self) -> Task {
        Task {
            id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            retried: 0,
            ..self.clone()
        }
    }
}

/// Handles the tasks of one kind.
pub type TaskHandler = Arc<dyn Fn(Context, Task) -> BoxFuture<'static, KitResult<()>> + Send + Sync>;

/// Order in which the queues are polled.
///
/// Strict mode always puts higher priorities first. Otherwise each poll draws the order at
/// random, a queue's chance to come first being its share of the total priority.
pub fn queue_order<R: Rng + ?Sized>(
    queues: &BTreeMap<String, u32>,
    strict: bool,
    rng: &mut R,
) -> Vec<String> {
    let mut remaining: Vec<(&String, u32)> = queues.iter().map(|(n, p)| (n, *p)).collect();

    if strict {
        remaining.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        return remaining.into_iter().map(|(n, _)| n.clone()).collect();
    }

    let mut order = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let total: u64 = remaining.iter().map(|(_, p)| u64::from(*p).max(1)).sum();
        let mut pick = rng.gen_range(0..total);
        let mut index = remaining.len() - 1;
        for (i, (_, priority)) in remaining.iter().enumerate() {
            let weight = u64::from(*priority).max(1);
            if pick < weight {
                index = i;
                break;
            }
            pick -= weight;
        }
        order.push(remaining.remove(index).0.clone());
    }
    order
}

fn queue_key(namespace: &str, queue: &str) -> String {
    format!("{}:queue:{}", namespace, queue)
}

fn dead_key(namespace: &str) -> String {
    format!("{}:dead", namespace)
}

/// Where a failed task goes next.
#[derive(Debug, Clone, PartialEq)]
enum Requeue {
    /// Back onto its queue with one more retry used.
    Retry { key: String, task: Task },
    /// Onto the dead list, unchanged.
    Dead { key: String, task: Task },
}

impl Requeue {
    fn after_failure(namespace: &str, task: &Task) -> Self {
        match task.retry() {
            Some(next) => Requeue::Retry {
                key: queue_key(namespace, &next.queue),
                task: next,
            },
            None => Requeue::Dead {
                key: dead_key(namespace),
                task: task.clone(),
            },
        }
    }
}

struct Scheduled {
    expression: String,
    schedule: cron::Schedule,
    task: Task,
}

/// State shared by the consumer and scheduler loops.
struct Core {
    pool: RedisPool,
    namespace: String,
    queues: BTreeMap<String, u32>,
    strict: bool,
    handlers: RwLock<HashMap<String, TaskHandler>>,
    stop: CancellationToken,
}

impl Core {
    fn queue_key(&self, queue: &str) -> String {
        queue_key(&self.namespace, queue)
    }

    async fn push(&self, key: &str, task: &Task) -> KitResult<()> {
        let payload = serde_json::to_vec(task).map_err(Classify::classify)?;
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key).arg(payload);
        self.pool.query::<()>(&cmd).await
    }

    async fn consume(self: Arc<Self>, consumer: u32) {
        debug!(consumer, "Consumer started");
        while !self.stop.is_cancelled() {
            let keys: Vec<String> = {
                let mut rng = rand::thread_rng();
                queue_order(&self.queues, self.strict, &mut rng)
                    .iter()
                    .map(|q| self.queue_key(q))
                    .collect()
            };

            // BRPOP is never interrupted mid-command: the connection would go back to the
            // pool with a reply still pending. Shutdown is noticed between polls instead.
            let mut cmd = redis::cmd("BRPOP");
            cmd.arg(&keys).arg(POLL_TIMEOUT.as_secs());
            let popped: KitResult<Option<(String, Vec<u8>)>> =
                self.pool.query_within(&cmd, POLL_TIMEOUT).await;

            match popped {
                Ok(Some((_, payload))) => match serde_json::from_slice::<Task>(&payload) {
                    Ok(task) => self.process(task).await,
                    Err(e) => error!(error = %e, "Dropping undecodable task"),
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, consumer, "Polling the broker failed");
                    tokio::select! {
                        _ = tokio::time::sleep(FAILURE_BACKOFF) => {}
                        _ = self.stop.cancelled() => {}
                    }
                }
            }
        }
        debug!(consumer, "Consumer stopped");
    }

    async fn process(&self, task: Task) {
        let span = info_span!("task", kind = %task.kind, id = %task.id, queue = %task.queue);
        async {
            let handler = self.handlers.read().get(&task.kind).cloned();
            let outcome = match handler {
                Some(handler) => {
                    let run = handler(Context::background(), task.clone());
                    match AssertUnwindSafe(run).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(KitError::generic().with_message("task handler panicked")),
                    }
                }
                None => Err(KitError::not_found().with_message("no handler registered")),
            };

            let Err(err) = outcome else {
                debug!("Task done");
                return;
            };

            let (key, next) = match Requeue::after_failure(&self.namespace, &task) {
                Requeue::Retry { key, task } => {
                    warn!(error = %err, retried = task.retried, max_retry = task.max_retry(), "Task failed, retrying");
                    (key, task)
                }
                Requeue::Dead { key, task } => {
                    error!(error = %err, retried = task.retried, "Task failed permanently");
                    (key, task)
                }
            };
            if let Err(e) = self.push(&key, &next).await {
                error!(error = %e, "Could not requeue failed task");
            }
        }
        .instrument(span)
        .await
    }

    async fn schedule(self: Arc<Self>, scheduled: Scheduled) {
        while let Some(at) = scheduled.schedule.upcoming(Utc).next() {
            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.stop.cancelled() => break,
            }

            let task = scheduled.task.occurrence();
            match self.push(&self.queue_key(&task.queue), &task).await {
                Ok(()) => info!(
                    "Enqueued task {} on queue {} with id {}",
                    task.kind, task.queue, task.id
                ),
                Err(e) => error!(error = %e, cron = %scheduled.expression, "Scheduled enqueue failed"),
            }
        }
    }
}

/// Background task worker.
pub struct Worker {
    config: WorkerConfig,
    core: Arc<Core>,
    schedules: Mutex<Vec<Scheduled>>,
    loops: Mutex<JoinSet<()>>,
    running: AtomicBool,
    closed: AtomicBool,
}

impl Worker {
    /// Connect to the broker, retrying the dial per `retry` within the deadline of `ctx`.
    ///
    /// The broker pool gets one extra connection per consumer, since every consumer holds
    /// one while it blocks on the queues.
    pub async fn connect(
        ctx: &Context,
        config: WorkerConfig,
        retry: &RetryConfig,
    ) -> KitResult<Self> {
        config.validate().map_err(|message| {
            KitError::generic()
                .for_resource(Resource::Worker)
                .with_message(message)
        })?;

        let concurrency = config.concurrency_or_default();
        let max = config.broker.max_connections_or_default() + concurrency;
        let pool = open_redis_pool(ctx, Resource::Worker, &config.broker, max, retry).await?;

        let core = Arc::new(Core {
            pool,
            namespace: config.namespace_or_default().to_string(),
            queues: config.queues_or_default(),
            strict: config.strict_priority_or_default(),
            handlers: RwLock::new(HashMap::new()),
            stop: CancellationToken::new(),
        });

        Ok(Self {
            config,
            core,
            schedules: Mutex::new(Vec::new()),
            loops: Mutex::new(JoinSet::new()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle tasks of `kind` with `handler`, replacing any earlier handler.
    pub fn register<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Context, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KitResult<()>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |ctx: Context, task: Task| handler(ctx, task).boxed());
        self.core.handlers.write().insert(kind.into(), handler);
    }

    /// Push `task` onto its queue.
    pub async fn enqueue(&self, ctx: &Context, task: &Task) -> KitResult<()> {
        ctx.check().map_err(|e| e.for_resource(Resource::Worker))?;
        deadline::bound(ctx, self.core.push(&self.core.queue_key(&task.queue), task))
            .await
            .map_err(|e| e.for_resource(Resource::Worker))?;
        debug!(kind = %task.kind, queue = %task.queue, id = %task.id, "Enqueued task");
        Ok(())
    }

    /// Enqueue a fresh copy of `task` at every time matching the cron `expression`
    /// (seconds resolution, UTC).
    ///
    /// Tasks without their own `max_retry` get the configured schedule default. Schedules
    /// take effect on the next [`Worker::run`].
    pub fn schedule(&self, expression: &str, task: Task) -> KitResult<()> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| {
            KitError::generic()
                .for_resource(Resource::Worker)
                .with_message("invalid cron expression")
                .with_field("cron", expression)
                .caused_by(e)
        })?;
        let task = match task.max_retry {
            Some(_) => task,
            None => task.with_max_retry(self.config.schedule_default_retry_or_default()),
        };
        self.schedules.lock().push(Scheduled {
            expression: expression.to_string(),
            schedule,
            task,
        });
        Ok(())
    }

    /// Start the consumers and the scheduler, and return once they are running.
    pub fn run(&self, _ctx: &Context) -> KitResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KitError::generic()
                .for_resource(Resource::Worker)
                .with_message("worker is closed"));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(KitError::generic()
                .for_resource(Resource::Worker)
                .with_message("worker is already running"));
        }

        let mut loops = self.loops.lock();
        for consumer in 0..self.config.concurrency_or_default() {
            let core = Arc::clone(&self.core);
            loops.spawn(core.consume(consumer).in_current_span());
        }
        for scheduled in self.schedules.lock().drain(..) {
            let core = Arc::clone(&self.core);
            loops.spawn(core.schedule(scheduled).in_current_span());
        }

        info!(resource = %Resource::Worker, "Worker started with queues {:?}", self.core.queues);
        Ok(())
    }

    /// Check pool occupancy, a PING round trip and the context; any failure is `Unhealthy`.
    pub async fn health(&self, ctx: &Context) -> KitResult<()> {
        let pool = self.core.pool.clone();
        let minimum = self.config.broker.min_connections_or_default();

        resource::check_health(ctx, Resource::Worker, move |ctx| async move {
            let current = pool.size();
            resource::assess_health(&ctx, Resource::Worker, current, minimum, pool.ping()).await
        })
        .await
    }

    /// Stop polling, give in-flight tasks up to the stop timeout to finish, then abort
    /// them and close the broker pool. Closing an already closed worker does nothing.
    pub async fn close(&self, ctx: &Context) -> KitResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(resource = %Resource::Worker, "Closing worker");
        self.core.stop.cancel();

        let mut loops = std::mem::take(&mut *self.loops.lock());
        let stop_timeout = self.config.stop_timeout_or_default();
        let pool = self.core.pool.clone();

        deadline::run(ctx, move |_| async move {
            let drained = tokio::time::timeout(stop_timeout, async {
                while loops.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    remaining = loops.len(),
                    "Tasks still running after the stop timeout, aborting them"
                );
                loops.shutdown().await;
            }
            pool.close();
            Ok(())
        })
        .await
        .map_err(|e| e.for_resource(Resource::Worker))?;

        info!(resource = %Resource::Worker, "Closed worker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn queues() -> BTreeMap<String, u32> {
        BTreeMap::from([
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
            ("low".to_string(), 1),
        ])
    }

    #[test]
    fn test_strict_order_follows_priority() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            assert_eq!(
                queue_order(&queues(), true, &mut rng),
                vec!["critical", "default", "low"]
            );
        }
    }

    #[test]
    fn test_weighted_order_visits_every_queue_once() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut order = queue_order(&queues(), false, &mut rng);
            order.sort();
            assert_eq!(order, vec!["critical", "default", "low"]);
        }
    }

    #[test]
    fn test_weighted_order_favours_higher_priority() {
        let mut rng = StdRng::seed_from_u64(42);
        let samples = 2000;
        let critical_first = (0..samples)
            .filter(|_| queue_order(&queues(), false, &mut rng)[0] == "critical")
            .count();
        // Expected share is 6/10.
        assert!(critical_first > samples * 5 / 10);
        assert!(critical_first < samples * 7 / 10);
    }

    #[test]
    fn test_task_retry_until_exhausted() {
        let task = Task::new("email:send", &serde_json::json!({"to": "ada@example.com"}))
            .unwrap()
            .with_max_retry(2);

        let first = task.retry().unwrap();
        assert_eq!(first.retried(), 1);
        assert_eq!(first.id(), task.id());
        let second = first.retry().unwrap();
        assert_eq!(second.retried(), 2);
        assert!(second.retry().is_none());
    }

    #[test]
    fn test_task_payload_and_defaults() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Email {
            to: String,
        }

        let task = Task::new(
            "email:send",
            &Email {
                to: "ada@example.com".to_string(),
            },
        )
        .unwrap();
        assert_eq!(task.queue(), "default");
        assert_eq!(task.max_retry(), DEFAULT_TASK_MAX_RETRY);
        assert_eq!(
            task.payload::<Email>().unwrap(),
            Email {
                to: "ada@example.com".to_string()
            }
        );
        assert!(task.payload::<u64>().is_err());
    }

    #[test]
    fn test_scheduled_occurrence_is_a_new_task() {
        let task = Task::new("report:daily", &()).unwrap().with_max_retry(3);
        let retried = task.retry().unwrap();
        let next = retried.occurrence();
        assert_ne!(next.id(), task.id());
        assert_eq!(next.retried(), 0);
        assert_eq!(next.kind(), "report:daily");
    }

    #[test]
    fn test_task_envelope_round_trips_through_json() {
        let task = Task::new("email:send", &serde_json::json!({"n": 1}))
            .unwrap()
            .on_queue("critical");
        let decoded: Task = serde_json::from_slice(&serde_json::to_vec(&task).unwrap()).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn test_failed_task_is_requeued_until_dead_lettered() {
        let task = Task::new("email:send", &())
            .unwrap()
            .on_queue("critical")
            .with_max_retry(2);

        let Requeue::Retry { key, task: first } = Requeue::after_failure("kit", &task) else {
            panic!("first failure must be retried");
        };
        assert_eq!(key, "kit:queue:critical");
        assert_eq!(first.retried(), 1);

        let Requeue::Retry { task: second, .. } = Requeue::after_failure("kit", &first) else {
            panic!("second failure must be retried");
        };
        assert_eq!(second.retried(), 2);

        assert_eq!(
            Requeue::after_failure("kit", &second),
            Requeue::Dead {
                key: "kit:dead".to_string(),
                task: second.clone(),
            }
        );
    }

    #[test]
    fn test_task_without_retries_goes_straight_to_dead_list() {
        let task = Task::new("report:daily", &()).unwrap().with_max_retry(0);
        match Requeue::after_failure("jobs", &task) {
            Requeue::Dead { key, task: dead } => {
                assert_eq!(key, "jobs:dead");
                assert_eq!(dead.retried(), 0);
                assert_eq!(dead.id(), task.id());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
