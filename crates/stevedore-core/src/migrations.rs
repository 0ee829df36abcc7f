// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations.
//!
//! Migration files live in `crates/stevedore-core/migrations` and are
//! applied in lexicographic filename order, each in its own transaction,
//! recorded by the migrator. Safe to call repeatedly; already-applied
//! migrations are skipped.
//!
//! # Example
//!
//! ```ignore
//! let pool = stevedore_core::db::connect(&database_url, 20).await?;
//! stevedore_core::migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;
use sqlx::PgPool;

/// Embedded migrator for the stevedore schema.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply all pending migrations.
pub async fn run(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
