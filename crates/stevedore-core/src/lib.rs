// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stevedore Core - Domain Model and Durable Store
//!
//! This crate holds everything the execution subsystem persists: job
//! definitions, runs, and the work queue, together with the state machine
//! that governs a run's lifecycle.
//!
//! The store is PostgreSQL via sqlx. Every mutation that moves a run
//! toward a terminal state is a conditional `UPDATE` guarded on the
//! expected prior status, so concurrent writers (supervisor, reaper, kill
//! command) race safely: the first terminal write wins and later ones are
//! no-ops.
//!
//! # Invariants upheld here
//!
//! - A queue row exists for every unclaimed pending run and for no
//!   terminal run ([`queue::purge_terminal`] reconciles leftovers).
//! - A queue row is claimed by at most one worker
//!   (`FOR UPDATE ... SKIP LOCKED` in [`queue::claim`]).
//! - A terminal run is never resurrected (status guards on every update).

#![deny(missing_docs)]

/// Connection pool construction and health checks.
pub mod db;

/// Error types for store operations.
pub mod error;

/// Job definition persistence.
pub mod jobs;

/// Embedded database migrations.
pub mod migrations;

/// Domain types shared across the workspace.
pub mod models;

/// Run persistence and guarded state transitions.
pub mod runs;

/// The durable work queue connecting triggers to workers.
pub mod queue;

/// The run lifecycle state machine.
pub mod state;

pub use error::{Result, StoreError};
pub use models::{CreateJob, Job, JobRun, QueueItem, RunStatus};
