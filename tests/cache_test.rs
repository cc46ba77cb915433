//! Integration tests for the Redis cache and task worker.
//!
//! Tests against a live server need TEST_REDIS_URL.
//! Example: TEST_REDIS_URL="redis://localhost:6379"

use resource_kit::config::{CacheConfig, WorkerConfig};
use resource_kit::{Cache, Context, ErrorKind, Resource, RetryConfig, Task, Worker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedReadHalf;
use url::Url;

fn config_from_url(raw: &str) -> CacheConfig {
    let url = Url::parse(raw).unwrap();
    CacheConfig {
        host: url.host_str().unwrap_or("localhost").to_string(),
        port: url.port().unwrap_or(6379),
        ssl_mode: url.scheme() == "rediss",
        password: url.password().map(str::to_string),
        ..CacheConfig::default()
    }
}

fn redis_config() -> Option<CacheConfig> {
    match std::env::var("TEST_REDIS_URL") {
        Ok(url) => Some(config_from_url(&url)),
        Err(_) => {
            eprintln!("Skipping test: TEST_REDIS_URL not set");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
    user: String,
    visits: u32,
}

#[tokio::test]
async fn test_refused_connection_reports_attempts() {
    let config = CacheConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        dial_timeout_secs: Some(1),
        ..CacheConfig::default()
    };
    let ctx = Context::background().with_timeout(Duration::from_secs(10));
    let retry = RetryConfig::new(2, Duration::from_millis(10), Duration::from_millis(10));

    let err = Cache::connect(&ctx, config, &retry).await.err().unwrap();

    assert_eq!(err.kind(), ErrorKind::Generic);
    assert_eq!(err.resource(), Some(Resource::Cache));
    assert_eq!(err.field("attempts"), Some("2"));
    assert_eq!(err.field("target"), Some("127.0.0.1:1"));
}

/// Read one command sent as a RESP array of bulk strings.
async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(String::from_utf8(buf).ok()?);
    }
    Some(args)
}

/// Answers PING, and GET with the JSON string `value-of-{key}`; the reply to
/// `GET slow` is held back for `delay`.
async fn fake_redis(delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut reader = BufReader::new(read);
                while let Some(args) = read_command(&mut reader).await {
                    let reply = match args.first().map(String::as_str) {
                        Some("PING") => "+PONG\r\n".to_string(),
                        Some("GET") => {
                            let key = args.get(1).cloned().unwrap_or_default();
                            if key == "slow" {
                                tokio::time::sleep(delay).await;
                            }
                            let value = format!("\"value-of-{key}\"");
                            format!("${}\r\n{}\r\n", value.len(), value)
                        }
                        _ => "-ERR unknown command\r\n".to_string(),
                    };
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn test_abandoned_command_does_not_leak_its_reply() {
    let port = fake_redis(Duration::from_millis(300)).await;
    let config = CacheConfig {
        host: "127.0.0.1".to_string(),
        port,
        min_connections: Some(1),
        max_connections: Some(1),
        ..CacheConfig::default()
    };
    let ctx = Context::background().with_timeout(Duration::from_secs(5));
    let cache = Cache::connect(&ctx, config, &RetryConfig::default()).await.unwrap();

    let short = Context::background().with_timeout(Duration::from_millis(30));
    let err = cache.get::<String>(&short, "slow").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert_eq!(err.resource(), Some(Resource::Cache));

    let value: String = cache.get(&Context::background(), "fast").await.unwrap();
    assert_eq!(value, "value-of-fast");

    cache.close(&Context::background()).await.unwrap();
}

#[tokio::test]
async fn test_set_get_delete() {
    let Some(config) = redis_config() else {
        return;
    };
    let ctx = Context::background().with_timeout(Duration::from_secs(10));
    let cache = Cache::connect(&ctx, config, &RetryConfig::default()).await.unwrap();
    cache.health(&ctx).await.unwrap();

    let key = format!("kit:test:{}", uuid::Uuid::new_v4());
    let session = Session {
        user: "ada".to_string(),
        visits: 3,
    };
    cache
        .set(&ctx, &key, &session, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    let loaded: Session = cache.get(&ctx, &key).await.unwrap();
    assert_eq!(loaded, session);

    cache.delete(&ctx, &key).await.unwrap();
    let miss = cache.get::<Session>(&ctx, &key).await.unwrap_err();
    assert_eq!(miss.kind(), ErrorKind::NotFound);
    assert_eq!(cache.delete(&ctx, &key).await.unwrap_err().kind(), ErrorKind::NotFound);

    cache.close(&ctx).await.unwrap();
    cache.close(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_worker_processes_enqueued_task() {
    let Some(broker) = redis_config() else {
        return;
    };
    let ctx = Context::background().with_timeout(Duration::from_secs(10));
    let config = WorkerConfig {
        broker,
        concurrency: Some(2),
        namespace: Some(format!("kit-test-{}", uuid::Uuid::new_v4().simple())),
        ..WorkerConfig::default()
    };
    let worker = Worker::connect(&ctx, config, &RetryConfig::default()).await.unwrap();

    let handled = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&handled);
    worker.register("session:expire", move |_ctx: Context, task: Task| {
        let counter = Arc::clone(&counter);
        async move {
            let session: Session = task.payload()?;
            assert_eq!(session.user, "ada");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    worker.run(&ctx).unwrap();
    let task = Task::new(
        "session:expire",
        &Session {
            user: "ada".to_string(),
            visits: 1,
        },
    )
    .unwrap();
    worker.enqueue(&ctx, &task).await.unwrap();

    for _ in 0..50 {
        if handled.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    worker.health(&ctx).await.unwrap();
    worker.close(&Context::background()).await.unwrap();
}
