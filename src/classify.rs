//! Translation of driver errors into classified [`KitError`]s.
//!
//! Classification is a pure mapping from known diagnostics to an [`ErrorKind`]:
//!
//! | Input | Kind |
//! |---|---|
//! | SQLSTATE 23000, 23001, 23502, 23503, 23505, 23514, 23P01 | `IntegrityViolation` |
//! | `sqlx::Error::RowNotFound` | `NotFound` |
//! | [`CacheMiss`] | `NotFound` |
//! | pool acquire / command timeouts | `TimedOut` |
//! | an already classified `KitError` | unchanged |
//! | anything else | `Generic` |
//!
//! The raw error is always kept as the source of the classified one.

use crate::error::{ErrorKind, KitError};
use regex::Regex;
use std::sync::LazyLock;

/// Integrity constraint violation codes (SQLSTATE class 23).
const INTEGRITY_SQL_STATES: &[&str] = &[
    "23000", // integrity_constraint_violation
    "23001", // restrict_violation
    "23502", // not_null_violation
    "23503", // foreign_key_violation
    "23505", // unique_violation
    "23514", // check_violation
    "23P01", // exclusion_violation
];

static SQL_STATE_IN_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(SQLSTATE ([0-9A-Z]{5})\)").expect("valid SQLSTATE pattern")
});

/// Map a SQLSTATE code to the kind it is classified as.
pub fn kind_for_sql_state(code: &str) -> ErrorKind {
    if INTEGRITY_SQL_STATES.contains(&code) {
        ErrorKind::IntegrityViolation
    } else {
        ErrorKind::Generic
    }
}

/// Extract an embedded `(SQLSTATE xxxxx)` code from an error message.
pub fn sql_state_in_message(message: &str) -> Option<&str> {
    SQL_STATE_IN_MESSAGE
        .captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Sentinel for a cache lookup that found nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache miss for key '{key}'")]
pub struct CacheMiss {
    pub key: String,
}

/// Conversion of a raw error into a classified one.
pub trait Classify {
    fn classify(self) -> KitError;
}

/// Classify any supported error.
pub fn classify<E: Classify>(err: E) -> KitError {
    err.classify()
}

impl Classify for KitError {
    fn classify(self) -> KitError {
        self
    }
}

impl Classify for sqlx::Error {
    fn classify(self) -> KitError {
        match &self {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let kind = code
                    .as_deref()
                    .map(kind_for_sql_state)
                    .unwrap_or(ErrorKind::Generic);
                let mut err = KitError::new(kind);
                if let Some(code) = code {
                    err = err.with_field("sql_state", code);
                }
                if let Some(constraint) = db_err.constraint() {
                    err = err.with_field("constraint", constraint);
                }
                err.caused_by(self)
            }
            sqlx::Error::RowNotFound => KitError::not_found().caused_by(self),
            sqlx::Error::PoolTimedOut => KitError::timed_out()
                .with_message("connection pool acquire")
                .caused_by(self),
            _ => {
                let message = self.to_string();
                match sql_state_in_message(&message).map(|code| (code, kind_for_sql_state(code))) {
                    Some((code, kind)) => KitError::new(kind)
                        .with_field("sql_state", code)
                        .caused_by(self),
                    None => KitError::generic().caused_by(self),
                }
            }
        }
    }
}

impl Classify for redis::RedisError {
    fn classify(self) -> KitError {
        if self.is_timeout() {
            KitError::timed_out().caused_by(self)
        } else {
            KitError::generic().caused_by(self)
        }
    }
}

impl Classify for CacheMiss {
    fn classify(self) -> KitError {
        KitError::not_found()
            .with_message("cache miss")
            .with_field("key", &self.key)
            .caused_by(self)
    }
}

impl Classify for serde_json::Error {
    fn classify(self) -> KitError {
        KitError::generic()
            .with_message("payload encoding")
            .caused_by(self)
    }
}

impl Classify for std::io::Error {
    fn classify(self) -> KitError {
        match self.kind() {
            std::io::ErrorKind::TimedOut => KitError::timed_out().caused_by(self),
            std::io::ErrorKind::NotFound => KitError::not_found().caused_by(self),
            _ => KitError::generic().caused_by(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Resource;

    #[test]
    fn test_sql_state_table() {
        let cases = [
            ("23000", ErrorKind::IntegrityViolation),
            ("23001", ErrorKind::IntegrityViolation),
            ("23502", ErrorKind::IntegrityViolation),
            ("23503", ErrorKind::IntegrityViolation),
            ("23505", ErrorKind::IntegrityViolation),
            ("23514", ErrorKind::IntegrityViolation),
            ("23P01", ErrorKind::IntegrityViolation),
            ("42P01", ErrorKind::Generic),
            ("40001", ErrorKind::Generic),
            ("57014", ErrorKind::Generic),
            ("", ErrorKind::Generic),
        ];
        for (code, expected) in cases {
            assert_eq!(kind_for_sql_state(code), expected, "code {code}");
        }
    }

    #[test]
    fn test_sql_state_in_message() {
        assert_eq!(
            sql_state_in_message(
                "ERROR: duplicate key value violates unique constraint \"users_pkey\" (SQLSTATE 23505)"
            ),
            Some("23505")
        );
        assert_eq!(sql_state_in_message("(SQLSTATE 23P01)"), Some("23P01"));
        assert_eq!(sql_state_in_message("connection refused"), None);
    }

    #[test]
    fn test_row_not_found_is_not_found() {
        let err = sqlx::Error::RowNotFound.classify();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_pool_timeout_is_timed_out() {
        assert_eq!(
            sqlx::Error::PoolTimedOut.classify().kind(),
            ErrorKind::TimedOut
        );
    }

    #[test]
    fn test_embedded_sql_state_in_protocol_error() {
        let err = sqlx::Error::Protocol("insert failed (SQLSTATE 23503)".to_string()).classify();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
        assert_eq!(err.field("sql_state"), Some("23503"));
    }

    #[test]
    fn test_unknown_errors_default_to_generic() {
        let err = sqlx::Error::PoolClosed.classify();
        assert_eq!(err.kind(), ErrorKind::Generic);

        let err = std::io::Error::other("broken pipe").classify();
        assert_eq!(err.kind(), ErrorKind::Generic);
    }

    #[test]
    fn test_cache_miss_is_not_found() {
        let err = CacheMiss {
            key: "user:1".to_string(),
        }
        .classify();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), Some("cache miss"));
        assert_eq!(err.field("key"), Some("user:1"));
    }

    #[test]
    fn test_redis_timeout_is_timed_out() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err = redis::RedisError::from(io).classify();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let inputs = vec![
            sqlx::Error::RowNotFound,
            sqlx::Error::PoolTimedOut,
            sqlx::Error::PoolClosed,
            sqlx::Error::Protocol("bad (SQLSTATE 23505)".to_string()),
        ];
        for input in inputs {
            let once = classify(input).for_resource(Resource::Database);
            let kind = once.kind();
            let message = once.to_string();
            let twice = classify(once);
            assert_eq!(twice.kind(), kind);
            assert_eq!(twice.to_string(), message);
        }
    }
}
