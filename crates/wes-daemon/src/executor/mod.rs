// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor module - workflow execution backends.

pub mod arvados;
pub mod local;
pub mod omics;
pub mod params;
pub mod sevenbridges;
mod traits;

use std::sync::Arc;

pub use arvados::ArvadosExecutor;
pub use local::LocalExecutor;
pub use omics::OmicsExecutor;
pub use sevenbridges::SevenBridgesExecutor;
pub use traits::*;

use crate::config::{Config, ExecutorKind};

/// Build the executor selected by `config`.
pub fn build_executor(config: &Config) -> Result<Arc<dyn Executor>> {
    let missing = |name: &str| ExecutorError::Config(format!("{} settings are missing", name));

    let executor: Arc<dyn Executor> = match config.executor {
        ExecutorKind::Local => Arc::new(LocalExecutor::new()),
        ExecutorKind::Omics => {
            let settings = config.omics.as_ref().ok_or_else(|| missing("HealthOmics"))?;
            Arc::new(OmicsExecutor::new(settings)?)
        }
        ExecutorKind::Arvados => {
            let settings = config.arvados.as_ref().ok_or_else(|| missing("Arvados"))?;
            Arc::new(ArvadosExecutor::new(settings)?)
        }
        ExecutorKind::SevenBridges => {
            let settings = config
                .sevenbridges
                .as_ref()
                .ok_or_else(|| missing("Seven Bridges"))?;
            Arc::new(SevenBridgesExecutor::new(settings)?)
        }
    };
    Ok(executor)
}
