//! Passive heartbeat/quality tracking for the currently active transport.
//!
//! The monitor never sends application traffic itself (beyond transport
//! heartbeats it is told about); it derives a quality score from what the
//! transport reports and emits signals the
//! [`FallbackManager`](crate::core::fallback::FallbackManager) consumes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub heartbeat_interval: Duration,
    pub consecutive_timeout_limit: u32,
    pub baseline_latency: Duration,
    pub degraded_band: f64,
    pub healthy_band: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            consecutive_timeout_limit: 3,
            baseline_latency: Duration::from_millis(300),
            degraded_band: 0.5,
            healthy_band: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    HeartbeatTimeout { consecutive_timeouts: u32 },
    HealthChanged { quality: f64, status: HealthStatus },
    RecoveryNeeded { reason: String, quality: f64 },
}

struct Counters {
    heartbeat_successes: AtomicU64,
    heartbeat_attempts: AtomicU64,
    consecutive_timeouts: AtomicU32,
    consecutive_errors: AtomicU32,
    last_latency_ms: AtomicU64,
    last_band: AtomicU32,
}

/// Observes one transport's health signals and turns them into `MonitorEvent`s.
pub struct ConnectionMonitor {
    config: MonitorConfig,
    counters: Counters,
    events: mpsc::Sender<MonitorEvent>,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig, events: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            config,
            counters: Counters {
                heartbeat_successes: AtomicU64::new(0),
                heartbeat_attempts: AtomicU64::new(0),
                consecutive_timeouts: AtomicU32::new(0),
                consecutive_errors: AtomicU32::new(0),
                last_latency_ms: AtomicU64::new(0),
                last_band: AtomicU32::new(band_index(1.0)),
            },
            events,
        }
    }

    pub async fn record_heartbeat_success(&self, latency: Duration) {
        self.counters.heartbeat_attempts.fetch_add(1, Ordering::Relaxed);
        self.counters.heartbeat_successes.fetch_add(1, Ordering::Relaxed);
        self.counters.consecutive_timeouts.store(0, Ordering::Relaxed);
        self.counters.last_latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
        self.emit_if_band_changed().await;
    }

    pub async fn record_heartbeat_timeout(&self) {
        self.counters.heartbeat_attempts.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.counters.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(consecutive, "heartbeat timeout");
        let _ = self.events.send(MonitorEvent::HeartbeatTimeout { consecutive_timeouts: consecutive }).await;

        if consecutive >= self.config.consecutive_timeout_limit {
            let quality = self.quality();
            let _ = self
                .events
                .send(MonitorEvent::RecoveryNeeded {
                    reason: format!("{consecutive} consecutive heartbeat timeouts"),
                    quality,
                })
                .await;
        }
        self.emit_if_band_changed().await;
    }

    pub async fn record_error(&self) {
        self.counters.consecutive_errors.fetch_add(1, Ordering::Relaxed);
        self.emit_if_band_changed().await;
    }

    pub fn record_error_cleared(&self) {
        self.counters.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// Composite quality score in `[0, 1]`: heartbeat success rate, weighted
    /// down by latency above baseline and by consecutive errors.
    pub fn quality(&self) -> f64 {
        let attempts = self.counters.heartbeat_attempts.load(Ordering::Relaxed);
        let successes = self.counters.heartbeat_successes.load(Ordering::Relaxed);
        let success_rate = if attempts == 0 { 1.0 } else { successes as f64 / attempts as f64 };

        let latency_ms = self.counters.last_latency_ms.load(Ordering::Relaxed) as f64;
        let baseline_ms = self.config.baseline_latency.as_millis() as f64;
        let latency_penalty = if baseline_ms > 0.0 && latency_ms > baseline_ms {
            ((latency_ms - baseline_ms) / baseline_ms).min(1.0)
        } else {
            0.0
        };

        let errors = self.counters.consecutive_errors.load(Ordering::Relaxed) as f64;
        let error_penalty = (errors * 0.1).min(0.5);

        (success_rate * (1.0 - latency_penalty * 0.5) - error_penalty).clamp(0.0, 1.0)
    }

    pub fn status(&self) -> HealthStatus {
        let quality = self.quality();
        if quality >= self.config.healthy_band {
            HealthStatus::Healthy
        } else if quality >= self.config.degraded_band {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    async fn emit_if_band_changed(&self) {
        let status = self.status();
        let band = band_index(match status {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.6,
            HealthStatus::Unhealthy => 0.0,
        });
        let previous = self.counters.last_band.swap(band, Ordering::Relaxed);
        if previous != band {
            let quality = self.quality();
            info!(quality, ?status, "connection quality band changed");
            let _ = self.events.send(MonitorEvent::HealthChanged { quality, status }).await;
        }
    }
}

fn band_index(value: f64) -> u32 {
    (value * 1000.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_timeouts_trigger_recovery_needed() {
        let (tx, mut rx) = mpsc::channel(16);
        let monitor = ConnectionMonitor::new(
            MonitorConfig { consecutive_timeout_limit: 3, ..Default::default() },
            tx,
        );

        for _ in 0..3 {
            monitor.record_heartbeat_timeout().await;
        }

        let mut saw_recovery = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, MonitorEvent::RecoveryNeeded { .. }) {
                saw_recovery = true;
            }
        }
        assert!(saw_recovery);
    }

    #[tokio::test]
    async fn healthy_heartbeats_keep_quality_high() {
        let (tx, _rx) = mpsc::channel(16);
        let monitor = ConnectionMonitor::new(MonitorConfig::default(), tx);
        for _ in 0..5 {
            monitor.record_heartbeat_success(Duration::from_millis(50)).await;
        }
        assert!(monitor.quality() > 0.9);
        assert_eq!(monitor.status(), HealthStatus::Healthy);
    }
}
