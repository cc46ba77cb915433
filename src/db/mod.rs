//! Relational database access.
//!
//! - [`Database`]: pooled Postgres client with query, exec and transaction support
//! - [`TransactionManager`]: reentrant, context-scoped transactions over any backend
//! - [`Statement`]: SQL text plus positional parameters

pub mod database;
pub mod statement;
pub mod transaction;

pub use database::Database;
pub use statement::{QueryParam, Statement};
pub use transaction::{
    IsolationLevel, PgTransactions, TransactionBackend, TransactionHandle, TransactionManager,
};
