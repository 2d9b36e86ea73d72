//! # Application State Management
//!
//! Shared state accessed by the HTTP handlers and by every call monitor socket.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers and socket actors hold a reference
//! - **RwLock**: many readers OR one writer
//!
//! Per-call state is deliberately absent: each monitoring socket owns its own
//! call session. Only configuration and aggregate counters live here.

use crate::call::session::SessionStats;
use crate::config::AppConfig;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Aggregate call counters
    pub metrics: Arc<RwLock<ServiceMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters aggregated across all calls since server start.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServiceMetrics {
    /// Monitoring sockets currently attached to a call
    pub active_calls: u32,
    pub total_calls: u64,
    /// Calls that ended in the failed phase
    pub failed_calls: u64,
    /// Connections refused because the call limit was reached
    pub rejected_calls: u64,
    pub decoded_chunks: u64,
    pub dropped_chunks: u64,
    pub turns_played: u64,
    pub turns_skipped: u64,
    pub transcript_lines: u64,
    /// Agent finals that had to wait for the caller
    pub deferred_agent_finals: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(ServiceMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Update the configuration with validation.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Claim a call slot. Returns false when `limit` calls are already active.
    pub fn try_begin_call(&self, limit: usize) -> bool {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_calls as usize >= limit {
            metrics.rejected_calls += 1;
            return false;
        }
        metrics.active_calls += 1;
        metrics.total_calls += 1;
        true
    }

    /// Release a call slot and fold the call's counters into the totals.
    pub fn finish_call(&self, stats: &SessionStats, failed: bool) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_calls > 0 {
            metrics.active_calls -= 1;
        }
        if failed {
            metrics.failed_calls += 1;
        }
        metrics.decoded_chunks += stats.decoded_chunks;
        metrics.dropped_chunks += stats.dropped_chunks;
        metrics.turns_played += stats.turns_played;
        metrics.turns_skipped += stats.turns_skipped;
        metrics.transcript_lines += stats.transcript_lines;
        metrics.deferred_agent_finals += stats.deferred_agent_finals;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> ServiceMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl ServiceMetrics {
    /// Fraction of calls that ended in failure (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls > 0 {
            self.failed_calls as f64 / self.total_calls as f64
        } else {
            0.0
        }
    }

    /// Fraction of audio chunks that could not be decoded (0.0 to 1.0).
    pub fn drop_rate(&self) -> f64 {
        let total = self.decoded_chunks + self.dropped_chunks;
        if total > 0 {
            self.dropped_chunks as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_slots_respect_limit() {
        let state = AppState::new(AppConfig::default());
        assert!(state.try_begin_call(2));
        assert!(state.try_begin_call(2));
        assert!(!state.try_begin_call(2));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_calls, 2);
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.rejected_calls, 1);
    }

    #[test]
    fn test_finish_call_folds_stats() {
        let state = AppState::new(AppConfig::default());
        state.try_begin_call(10);
        let stats = SessionStats {
            decoded_chunks: 9,
            dropped_chunks: 1,
            turns_played: 3,
            ..Default::default()
        };
        state.finish_call(&stats, true);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_calls, 0);
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.turns_played, 3);
        assert!((metrics.drop_rate() - 0.1).abs() < 1e-9);
        assert!((metrics.failure_rate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_finish_without_begin_does_not_underflow() {
        let state = AppState::new(AppConfig::default());
        state.finish_call(&SessionStats::default(), false);
        assert_eq!(state.get_metrics_snapshot().active_calls, 0);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = AppState::new(AppConfig::default());
        let mut config = state.get_config();
        config.server.port = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }
}
