// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The run lifecycle state machine.
//!
//! ```text
//!                  ┌─────────┐
//!                  │ PENDING │──── pre-exec failure ────┐
//!                  └────┬────┘                          │
//!                       │ claim                         │
//!                       ▼                               ▼
//!                  ┌─────────┐    exit != 0 / fault ┌────────┐
//!        ┌─────────│ RUNNING │──────────────────────│ FAILED │
//!        │         └────┬────┘    timeout/heartbeat └────────┘
//!   pause│  resume      │ exit 0
//!        ▼              ▼
//!   ┌────────┐    ┌───────────┐
//!   │ PAUSED │    │ SUCCEEDED │
//!   └────┬───┘    └───────────┘
//!        │ kill (also from RUNNING)
//!        ▼
//!   ┌───────────┐
//!   │ CANCELLED │
//!   └───────────┘
//! ```
//!
//! The table below is enforced at the store layer: every transition out of
//! a non-terminal state is a conditional `UPDATE` keyed on the expected
//! prior status, so at most one terminal write ever wins. This module is
//! the single written-down form of the legal transitions; the SQL guards
//! in [`crate::runs`] must stay in agreement with it.

use crate::models::RunStatus;

impl RunStatus {
    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            // Claimed by a worker.
            (Pending, Running) => true,
            // Pre-exec failure: pull, create, or start failed.
            (Pending, Failed) => true,
            // Control commands.
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Running, Cancelled) | (Paused, Cancelled) => true,
            // Natural exit, wait fault, timeout, or heartbeat expiry.
            (Running, Succeeded) => true,
            (Running, Failed) | (Paused, Failed) => true,
            // Terminal states have no outgoing edges; everything else is
            // illegal.
            _ => false,
        }
    }
}
