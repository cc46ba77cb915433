//! SQL statements with positional parameters.
//!
//! A [`Statement`] is plain SQL with `$1, $2, ...` placeholders plus the values bound to
//! them. There is deliberately no builder: callers write the SQL.

use crate::error::{KitError, KitResult};
use chrono::{DateTime, Utc};
use sqlx::Arguments;
use sqlx::postgres::PgArguments;
use sqlx::types::Json;
use uuid::Uuid;

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl QueryParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Timestamp(_) => "timestamp",
            Self::Uuid(_) => "uuid",
        }
    }
}

macro_rules! param_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for QueryParam {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

param_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
    DateTime<Utc> => Timestamp,
    Uuid => Uuid,
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// SQL text and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<QueryParam>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<QueryParam>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[QueryParam] {
        &self.params
    }

    /// Encode the parameters for the Postgres driver.
    pub fn arguments(&self) -> KitResult<PgArguments> {
        let mut args = PgArguments::default();
        for (position, param) in self.params.iter().enumerate() {
            let added = match param.clone() {
                QueryParam::Null => args.add(None::<String>),
                QueryParam::Bool(v) => args.add(v),
                QueryParam::Int(v) => args.add(v),
                QueryParam::Float(v) => args.add(v),
                QueryParam::String(v) => args.add(v),
                QueryParam::Bytes(v) => args.add(v),
                QueryParam::Json(v) => args.add(Json(v)),
                QueryParam::Timestamp(v) => args.add(v),
                QueryParam::Uuid(v) => args.add(v),
            };
            added.map_err(|e| {
                KitError::generic()
                    .with_message("cannot encode parameter")
                    .with_field("position", position + 1)
                    .with_field("type", param.type_name())
                    .caused_by(e)
            })?;
        }
        Ok(args)
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}
