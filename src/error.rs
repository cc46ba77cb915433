//! Error types for resource access.
//!
//! Every failure that leaves this crate is a [`KitError`]: one of a small, closed set of
//! [`ErrorKind`]s, tagged with the [`Resource`] that produced it, plus whatever structured
//! context an operator needs (attempt count, SQLSTATE, rollback outcome) and the wrapped
//! driver error as its source.

use std::fmt;
use thiserror::Error;

/// Boxed cause kept behind a classified error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Semantic error kinds. Callers branch on these, never on driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Generic,
    TimedOut,
    Unhealthy,
    NotFound,
    IntegrityViolation,
    TransactionFailed,
}

impl ErrorKind {
    fn describe(&self) -> &'static str {
        match self {
            Self::Generic => "failed",
            Self::TimedOut => "timed out",
            Self::Unhealthy => "unhealthy",
            Self::NotFound => "not found",
            Self::IntegrityViolation => "integrity violation",
            Self::TransactionFailed => "transaction failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// The external dependency an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Database,
    Cache,
    Worker,
    Migrator,
}

impl Resource {
    /// Get the display name for this resource.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Worker => "worker",
            Self::Migrator => "migrator",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A classified error.
///
/// Immutable once built: the builder methods consume and return the error.
#[derive(Error, Debug)]
#[error("{}", self.render())]
pub struct KitError {
    kind: ErrorKind,
    resource: Option<Resource>,
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
    #[source]
    source: Option<BoxError>,
}

impl KitError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            resource: None,
            message: None,
            fields: Vec::new(),
            source: None,
        }
    }

    pub fn generic() -> Self {
        Self::new(ErrorKind::Generic)
    }

    pub fn timed_out() -> Self {
        Self::new(ErrorKind::TimedOut)
    }

    pub fn unhealthy() -> Self {
        Self::new(ErrorKind::Unhealthy)
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound)
    }

    pub fn integrity_violation() -> Self {
        Self::new(ErrorKind::IntegrityViolation)
    }

    pub fn transaction_failed() -> Self {
        Self::new(ErrorKind::TransactionFailed)
    }

    /// Tag the error with the resource that produced it, unless it already carries one.
    pub fn for_resource(mut self, resource: Resource) -> Self {
        self.resource.get_or_insert(resource);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach a context field. A later value for the same name replaces the earlier one.
    pub fn with_field(mut self, name: &'static str, value: impl fmt::Display) -> Self {
        let value = value.to_string();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    pub fn caused_by(mut self, cause: impl Into<BoxError>) -> Self {
        self.source = Some(cause.into());
        self
    }

    /// Wrap `self` as the cause of a new error of `kind`.
    ///
    /// Returns `self` untouched when it already has that kind, so repeated wrapping
    /// through nested layers never piles up identical levels.
    pub fn wrap_as(self, kind: ErrorKind) -> Self {
        if self.kind == kind {
            return self;
        }
        let resource = self.resource;
        let mut wrapped = KitError::new(kind).caused_by(self);
        wrapped.resource = resource;
        wrapped
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn resource(&self) -> Option<Resource> {
        self.resource
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Look up a context field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Check whether this error, or any classified error in its source chain, has `kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        let mut current: Option<&KitError> = Some(self);
        while let Some(err) = current {
            if err.kind == kind {
                return true;
            }
            current = err
                .source
                .as_deref()
                .and_then(|s| s.downcast_ref::<KitError>());
        }
        false
    }

    /// Check if this error is safe to retry.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::TimedOut
    }

    fn render(&self) -> String {
        let mut out = match self.resource {
            Some(resource) => format!("{} {}", resource, self.kind),
            None => self.kind.to_string(),
        };
        if let Some(message) = &self.message {
            out.push_str(": ");
            out.push_str(message);
        }
        if !self.fields.is_empty() {
            let fields: Vec<String> = self
                .fields
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            out.push_str(&format!(" ({})", fields.join(", ")));
        }
        if let Some(source) = &self.source {
            out.push_str(&format!(": {}", source));
        }
        out
    }
}

/// Result type alias for resource operations.
pub type KitResult<T> = Result<T, KitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KitError::timed_out()
            .for_resource(Resource::Database)
            .with_field("attempts", 3);
        assert_eq!(err.to_string(), "database timed out (attempts=3)");
    }

    #[test]
    fn test_error_display_with_message_and_cause() {
        let cause = std::io::Error::other("connection refused");
        let err = KitError::generic()
            .for_resource(Resource::Cache)
            .with_message("dial failed")
            .caused_by(cause);
        assert_eq!(
            err.to_string(),
            "cache failed: dial failed: connection refused"
        );
    }

    #[test]
    fn test_for_resource_keeps_first_tag() {
        let err = KitError::generic()
            .for_resource(Resource::Migrator)
            .for_resource(Resource::Database);
        assert_eq!(err.resource(), Some(Resource::Migrator));
    }

    #[test]
    fn test_with_field_replaces_existing() {
        let err = KitError::generic()
            .with_field("attempts", 1)
            .with_field("attempts", 2);
        assert_eq!(err.field("attempts"), Some("2"));
    }

    #[test]
    fn test_wrap_as_never_double_wraps() {
        let err = KitError::transaction_failed().wrap_as(ErrorKind::TransactionFailed);
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_is_walks_source_chain() {
        let err = KitError::not_found()
            .for_resource(Resource::Database)
            .wrap_as(ErrorKind::TransactionFailed);
        assert_eq!(err.kind(), ErrorKind::TransactionFailed);
        assert_eq!(err.resource(), Some(Resource::Database));
        assert!(err.is(ErrorKind::NotFound));
        assert!(!err.is(ErrorKind::IntegrityViolation));
    }

    #[test]
    fn test_error_retryable() {
        assert!(KitError::timed_out().is_retryable());
        assert!(!KitError::generic().is_retryable());
        assert!(!KitError::integrity_violation().is_retryable());
    }
}
