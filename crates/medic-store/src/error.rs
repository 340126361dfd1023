//! Store error types.

use thiserror::Error;

/// Errors surfaced by the persistence layer.
///
/// Duplicate-key and foreign-key violations are distinguished so callers
/// can absorb them without corrupting session state; everything else maps
/// to `Query`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database '{url}': {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("migration failed: {0}")]
    Migrate(#[source] sqlx::Error),

    #[error("duplicate key: {context}")]
    DuplicateKey { context: String },

    #[error("foreign key violation: {context}")]
    ForeignKey { context: String },

    #[error("row not found: {context}")]
    NotFound { context: String },

    #[error("invalid persisted JSON in {column}: {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Query(#[from] sqlx::Error),
}

impl StoreError {
    /// Classify an sqlx error raised by `context`, promoting constraint
    /// violations to their typed variants.
    pub(crate) fn from_sqlx(err: sqlx::Error, context: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Self::DuplicateKey {
                    context: context.to_string(),
                };
            }
            if db.is_foreign_key_violation() {
                return Self::ForeignKey {
                    context: context.to_string(),
                };
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return Self::NotFound {
                context: context.to_string(),
            };
        }
        Self::Query(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
