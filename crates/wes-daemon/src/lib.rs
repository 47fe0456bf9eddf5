// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WES Daemon - workflow monitor, executors and callbacks
//!
//! This crate moves workflow runs recorded in the run store through their
//! lifecycle on an external execution backend:
//!
//! - [`monitor::Monitor`] polls the store, submits QUEUED runs, reconciles
//!   active ones against the backend and carries out cancel requests.
//! - [`executor`] holds the backend adapters (local stub, AWS HealthOmics,
//!   Arvados, Seven Bridges) behind the [`executor::Executor`] trait.
//! - [`callback::CallbackHandler`] applies state changes pushed by a backend.
//! - [`runs::RunService`] creates, lists and cancels runs for the request
//!   layer.
//!
//! All state changes go through [`wes_core::RunStore::apply_update`], so the
//! monitor and the callback handler share one set of transition rules.

pub mod callback;
pub mod config;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod runs;

pub use error::{Error, Result};
