// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WES Core - run model, state machine and run store
//!
//! This crate holds everything about a workflow run that does not depend on
//! how the run is executed: the records, the transition table, the rules for
//! applying updates, and the persistence layer shared by the monitor daemon
//! and the callback handler.
//!
//! # Run lifecycle
//!
//! ```text
//!            submit                poll/callback
//! QUEUED ───────────► INITIALIZING ─────────────► RUNNING ───► COMPLETE
//!    │                     │                       │  ▲
//!    │                     │                       ▼  │        EXECUTOR_ERROR
//!    │                     │                     PAUSED        SYSTEM_ERROR
//!    │                     │                                   CANCELED
//!    └── cancel request ──►CANCELING ── monitor ──► CANCELED
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`model`] | `WorkflowRun`, `TaskLog`, `RunState` |
//! | [`state_machine`] | Pure transition table |
//! | [`update`] | Invariant-enforcing update application |
//! | [`persistence`] | `RunStore` trait with PostgreSQL and SQLite backends |
//! | [`migrations`] | Embedded schema migrations |
//!
//! # Update semantics
//!
//! All writes go through [`persistence::RunStore::apply_update`], which
//! re-reads the run, validates the change with [`update::apply`] and writes
//! it back with a compare-and-set on the run revision. Terminal runs are
//! frozen; an update repeating the last recorded event id is a no-op.

pub mod error;
pub mod migrations;
pub mod model;
pub mod persistence;
pub mod state_machine;
pub mod update;

pub use error::{CoreError, Result};
pub use model::{NewRun, NewTaskLog, Outputs, RunState, TaskLog, WorkflowRun, WorkflowType};
pub use persistence::{RunFilter, RunStore};
pub use state_machine::is_valid_transition;
pub use update::{ApplyOutcome, AppliedUpdate, CancelRequest, Rejection, RunUpdate};
