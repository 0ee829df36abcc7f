// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for store operations.

use thiserror::Error;

/// Errors from the durable store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A uniqueness constraint was violated (job name, webhook token).
    #[error("Duplicate {0}")]
    Duplicate(&'static str),

    /// The referenced row does not exist or is not visible to the caller.
    #[error("Not found")]
    NotFound,
}

impl StoreError {
    /// Classify a sqlx error, mapping unique-constraint violations to
    /// [`StoreError::Duplicate`] with the given label.
    pub fn from_unique(err: sqlx::Error, what: &'static str) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            if db.is_unique_violation() {
                return StoreError::Duplicate(what);
            }
        }
        StoreError::Database(err)
    }
}

/// Result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;
