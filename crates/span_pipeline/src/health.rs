//! Health derivation from metrics snapshots.
//!
//! Status is a pure function of a [`MetricsSnapshot`] and [`HealthThresholds`];
//! [`HealthCheck`] binds the two to a live metrics engine and adds a readiness
//! flag owned by the hosting process.

use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tri-state pipeline health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy and degraded pipelines are still serving traffic.
    pub fn is_serving(&self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Percentage thresholds for drop and export error rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub warning_drop: f64,
    pub critical_drop: f64,
    pub warning_error: f64,
    pub critical_error: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_drop: 1.0,
            critical_drop: 5.0,
            warning_error: 2.0,
            critical_error: 10.0,
        }
    }
}

impl HealthThresholds {
    /// Critical thresholds are checked before warning thresholds.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> HealthStatus {
        let drop_rate = snapshot.drop_rate();
        let error_rate = snapshot.error_rate();

        if drop_rate >= self.critical_drop || error_rate >= self.critical_error {
            HealthStatus::Unhealthy
        } else if drop_rate >= self.warning_drop || error_rate >= self.warning_error {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Response body of the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
}

/// Read-only health views over a live metrics engine.
#[derive(Debug)]
pub struct HealthCheck {
    metrics: Arc<PipelineMetrics>,
    thresholds: HealthThresholds,
    ready: AtomicBool,
}

impl HealthCheck {
    pub fn new(metrics: Arc<PipelineMetrics>, thresholds: HealthThresholds) -> Self {
        Self {
            metrics,
            thresholds,
            ready: AtomicBool::new(false),
        }
    }

    /// `/health`: derived status plus the full snapshot it was derived from.
    pub fn health(&self) -> HealthReport {
        let metrics = self.metrics.snapshot();
        HealthReport {
            status: self.thresholds.evaluate(&metrics),
            timestamp: Utc::now(),
            metrics,
        }
    }

    /// Raw metrics for `/metrics`.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Readiness for `/ready`. Independent of health status.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }
}
