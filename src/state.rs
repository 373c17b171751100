//! # Application State Management
//!
//! State shared by every HTTP handler and WebSocket bridge.
//!
//! ## Arc<RwLock<T>> Pattern:
//! - **Arc**: many handlers hold a reference to the same data
//! - **RwLock**: many concurrent readers, or one writer
//!
//! Configuration is read on every call start and written only by the config
//! endpoint. Call metrics are written at call start and end.
//!
//! A poisoned lock is recovered rather than propagated: the protected data is
//! plain counters and a config struct, both valid after any panic.

use crate::config::AppConfig;
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Call counters
    pub metrics: Arc<RwLock<CallMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters over the lifetime of the server.
///
/// ## Fields:
/// - **calls_started**: calls that reached `start()`
/// - **calls_failed**: calls whose start failed with a fatal error (not cancellations)
/// - **calls_rejected**: bridge connections refused because of the call limit
/// - **active_calls**: bridges currently holding a call slot
#[derive(Debug, Default, Clone, Serialize)]
pub struct CallMetrics {
    pub calls_started: u64,
    pub calls_failed: u64,
    pub calls_rejected: u64,
    pub active_calls: usize,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(CallMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so a call start never blocks a
    /// config update for longer than the copy.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *write(&self.config) = new_config;
        Ok(())
    }

    /// Claim a call slot. Returns `false` when `max_concurrent_calls` bridges
    /// already hold one.
    pub fn try_acquire_call_slot(&self) -> bool {
        let limit = read(&self.config).performance.max_concurrent_calls;
        let mut metrics = write(&self.metrics);
        if metrics.active_calls >= limit {
            metrics.calls_rejected += 1;
            return false;
        }
        metrics.active_calls += 1;
        true
    }

    /// Give a call slot back. Never goes below zero.
    pub fn release_call_slot(&self) {
        let mut metrics = write(&self.metrics);
        metrics.active_calls = metrics.active_calls.saturating_sub(1);
    }

    pub fn record_call_started(&self) {
        write(&self.metrics).calls_started += 1;
    }

    pub fn record_call_failed(&self) {
        write(&self.metrics).calls_failed += 1;
    }

    pub fn get_metrics_snapshot(&self) -> CallMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
