//! Resource Kit Library
//!
//! Resilient access to the stateful services a process depends on: a Postgres database,
//! a Redis cache, a Redis backed task broker and a schema migrator. Every client connects
//! under a bounded deadline with retry, reports health, classifies driver failures into a
//! small set of [`ErrorKind`]s and closes gracefully.

pub mod cache;
pub mod classify;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod migrator;
pub mod pool;
pub mod resource;
pub mod util;
pub mod worker;

pub use cache::Cache;
pub use config::{CacheConfig, Cli, DatabaseConfig, MigratorConfig, WorkerConfig};
pub use context::Context;
pub use db::{Database, IsolationLevel, Statement};
pub use error::{ErrorKind, KitError, KitResult, Resource};
pub use migrator::Migrator;
pub use util::RetryConfig;
pub use worker::{Task, Worker};
