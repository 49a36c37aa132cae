//! Lifecycle manager configuration.
//!
//! Static knobs are fixed at construction; the builder's batch size
//! and disable switch are also updatable at runtime through the
//! CONFIG_UPDATE opcode, so they live behind atomics.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{LifecycleError, LifecycleResult};
use indexgrid_meta::StorageKind;

/// Config key for the builder's per-tick batch size.
pub const BUILD_BATCH_SIZE_KEY: &str = "settings.build.batch_size";

/// Config key for disabling background builds.
pub const BUILD_DISABLE_KEY: &str = "build.background.disable";

/// Version this indexer advertises in its service map.
pub const INDEXER_VERSION: u64 = 5;

/// Tunables for the lifecycle manager and its background tasks.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Enterprise edition; replicas and partitioned indexes are
    /// rejected when false.
    pub enterprise: bool,
    /// Cluster-wide storage mode that a "gsi" create resolves to.
    /// `None` falls back to plasma.
    pub storage_mode: Option<StorageKind>,
    /// Initial builder batch size (updatable via CONFIG_UPDATE).
    pub build_batch_size: i32,
    /// Initial background-build disable switch (updatable via
    /// CONFIG_UPDATE).
    pub build_background_disabled: bool,
    /// Janitor cleanup period.
    pub janitor_interval: Duration,
    /// Builder channel/ticker poll period.
    pub builder_tick: Duration,
    /// Post-tick settle delay that lets rebalance tokens land before
    /// the builder issues builds.
    pub builder_settle: Duration,
    /// Service-map drift check period.
    pub updator_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            enterprise: true,
            storage_mode: None,
            build_batch_size: 5,
            build_background_disabled: false,
            janitor_interval: Duration::from_secs(60),
            builder_tick: Duration::from_millis(200),
            builder_settle: Duration::from_secs(120),
            updator_interval: Duration::from_secs(60),
        }
    }
}

/// Runtime-updatable builder settings, shared between the dispatcher
/// (CONFIG_UPDATE) and the builder task.
#[derive(Debug)]
pub(crate) struct BuildSettings {
    batch_size: AtomicI32,
    disable: AtomicBool,
}

impl BuildSettings {
    pub(crate) fn new(config: &LifecycleConfig) -> Self {
        BuildSettings {
            batch_size: AtomicI32::new(config.build_batch_size),
            disable: AtomicBool::new(config.build_background_disabled),
        }
    }

    pub(crate) fn batch_size(&self) -> i32 {
        self.batch_size.load(Ordering::Acquire)
    }

    pub(crate) fn build_disabled(&self) -> bool {
        self.disable.load(Ordering::Acquire)
    }

    /// Apply a CONFIG_UPDATE blob. The sender is expected to transmit
    /// the full map; missing or mistyped keys fail the request.
    pub(crate) fn apply(&self, config: &Map<String, Value>) -> LifecycleResult<()> {
        let batch_size = config
            .get(BUILD_BATCH_SIZE_KEY)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                LifecycleError::InvalidRequest(format!("missing config key {BUILD_BATCH_SIZE_KEY}"))
            })?;
        let disable = config
            .get(BUILD_DISABLE_KEY)
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                LifecycleError::InvalidRequest(format!("missing config key {BUILD_DISABLE_KEY}"))
            })?;

        self.batch_size.store(batch_size as i32, Ordering::Release);
        self.disable.store(disable, Ordering::Release);
        Ok(())
    }
}
