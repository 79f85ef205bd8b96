//! Health state shared by the upload and ping paths, the liveness pinger, and
//! the `status.json` file that exposes both.
//!
//! Ping and upload failures are tracked separately: a failing health
//! endpoint never marks uploads degraded and vice versa.

use crate::buffer::BufferStats;
use crate::clock::Clock;
use crate::config::DeviceIdentity;
use crate::event::Category;
use crate::governor::{Activity, RateGovernor};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Failure tracking for one path (ping, or uploads of one category).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStatus {
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// Batches discarded after a permanent rejection. Unused for ping.
    #[serde(default)]
    pub rejected_batches: u64,
}

impl PathStatus {
    fn success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.degraded = false;
        self.last_success_at = Some(now);
    }

    fn failure(&mut self, now: DateTime<Utc>, reason: &str, threshold: u32) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.degraded = self.consecutive_failures >= threshold;
        self.last_error = Some(reason.to_string());
        self.last_error_at = Some(now);
    }
}

/// Snapshot written to `status.json` and printed by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub device_id: DeviceIdentity,
    pub updated_at: DateTime<Utc>,
    pub degraded: bool,
    pub ping: PathStatus,
    pub uploads: BTreeMap<Category, PathStatus>,
    #[serde(default)]
    pub buffers: Vec<BufferStats>,
}

impl HealthReport {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read(path)?;
        serde_json::from_slice(&content).map_err(std::io::Error::other)
    }
}

#[derive(Debug, Default)]
struct Inner {
    ping: PathStatus,
    uploads: BTreeMap<Category, PathStatus>,
}

/// Process-wide health counters.
#[derive(Debug)]
pub struct HealthState {
    device: DeviceIdentity,
    threshold: u32,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl HealthState {
    pub fn new(device: DeviceIdentity, threshold: u32, clock: Arc<dyn Clock>) -> Self {
        let inner = Inner {
            ping: PathStatus::default(),
            uploads: Category::ALL
                .into_iter()
                .map(|c| (c, PathStatus::default()))
                .collect(),
        };
        Self {
            device,
            threshold: threshold.max(1),
            clock,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_ping_success(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.ping.degraded {
            info!("health endpoint reachable again");
        }
        inner.ping.success(now);
    }

    pub fn record_ping_failure(&self, reason: &str) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let was_degraded = inner.ping.degraded;
        inner.ping.failure(now, reason, self.threshold);
        if inner.ping.degraded && !was_degraded {
            warn!(
                failures = inner.ping.consecutive_failures,
                "health ping degraded"
            );
        }
    }

    pub fn record_upload_success(&self, category: Category) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let status = inner.uploads.entry(category).or_default();
        if status.degraded {
            info!(category = %category, "uploads recovered");
        }
        status.success(now);
    }

    /// Count a failed upload. `rejected` marks a permanent rejection whose
    /// batch was discarded.
    pub fn record_upload_failure(&self, category: Category, reason: &str, rejected: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let threshold = self.threshold;
        let status = inner.uploads.entry(category).or_default();
        let was_degraded = status.degraded;
        status.failure(now, reason, threshold);
        if rejected {
            status.rejected_batches += 1;
        }
        if status.degraded && !was_degraded {
            warn!(
                category = %category,
                failures = status.consecutive_failures,
                "uploads degraded"
            );
        }
    }

    pub fn ping_status(&self) -> PathStatus {
        self.lock().ping.clone()
    }

    pub fn upload_status(&self, category: Category) -> PathStatus {
        self.lock().uploads.get(&category).cloned().unwrap_or_default()
    }

    pub fn is_degraded(&self) -> bool {
        let inner = self.lock();
        inner.ping.degraded || inner.uploads.values().any(|s| s.degraded)
    }

    pub fn report(&self) -> HealthReport {
        let inner = self.lock();
        HealthReport {
            device_id: self.device.clone(),
            updated_at: self.clock.now(),
            degraded: inner.ping.degraded || inner.uploads.values().any(|s| s.degraded),
            ping: inner.ping.clone(),
            uploads: inner.uploads.clone(),
            buffers: Vec::new(),
        }
    }

    /// Write the current report (plus buffer stats) to `path` atomically.
    pub fn write_status(&self, path: &Path, buffers: Vec<BufferStats>) -> std::io::Result<()> {
        let mut report = self.report();
        report.buffers = buffers;
        let bytes = serde_json::to_vec_pretty(&report).map_err(std::io::Error::other)?;
        paths::write_atomic(path, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Health monitor
// ---------------------------------------------------------------------------

/// Result of one monitor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingResult {
    /// Ping quota for this window is used up; nothing was sent.
    Skipped,
    Healthy,
    Unhealthy(String),
}

/// Liveness pinger. Shares nothing with the upload path except the HTTP
/// connection pool and the health state it writes to.
#[derive(Debug)]
pub struct HealthMonitor {
    http: reqwest::Client,
    url: String,
    governor: Arc<RateGovernor>,
    state: Arc<HealthState>,
}

impl HealthMonitor {
    pub fn new(
        http: reqwest::Client,
        url: String,
        governor: Arc<RateGovernor>,
        state: Arc<HealthState>,
    ) -> Self {
        Self {
            http,
            url,
            governor,
            state,
        }
    }

    /// Ping once if the ping quota allows it and record the result.
    pub async fn tick(&self) -> PingResult {
        if !self.governor.try_consume(Activity::Ping) {
            debug!("ping quota exhausted, skipping");
            return PingResult::Skipped;
        }
        match self.http.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(status = resp.status().as_u16(), "health ping ok");
                self.state.record_ping_success();
                PingResult::Healthy
            }
            Ok(resp) => {
                let reason = format!("health endpoint returned HTTP {}", resp.status().as_u16());
                warn!("{reason}");
                self.state.record_ping_failure(&reason);
                PingResult::Unhealthy(reason)
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    "health ping timed out".to_string()
                } else {
                    format!("health ping failed: {e}")
                };
                warn!("{reason}");
                self.state.record_ping_failure(&reason);
                PingResult::Unhealthy(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EventBuffer;
    use crate::clock::ManualClock;
    use crate::config::OverflowPolicy;
    use chrono::TimeZone;

    fn state(threshold: u32) -> HealthState {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 2, 2, 2, 2).unwrap(),
        ));
        HealthState::new(DeviceIdentity::new("crib-9"), threshold, clock)
    }

    #[test]
    fn ping_degrades_at_threshold_and_recovers() {
        let s = state(3);
        s.record_ping_failure("boom");
        s.record_ping_failure("boom");
        assert!(!s.ping_status().degraded);
        s.record_ping_failure("boom");
        assert!(s.ping_status().degraded);
        assert!(s.is_degraded());
        s.record_ping_success();
        assert_eq!(s.ping_status().consecutive_failures, 0);
        assert!(!s.is_degraded());
    }

    #[test]
    fn ping_failures_do_not_touch_uploads() {
        let s = state(3);
        for _ in 0..3 {
            s.record_ping_failure("down");
            s.record_upload_success(Category::Vitals);
        }
        assert!(s.ping_status().degraded);
        assert!(!s.upload_status(Category::Vitals).degraded);
        assert!(!s.upload_status(Category::Feeding).degraded);
    }

    #[test]
    fn upload_failures_are_per_category() {
        let s = state(2);
        s.record_upload_failure(Category::Feeding, "HTTP 503", false);
        s.record_upload_failure(Category::Feeding, "HTTP 400", true);
        let feedings = s.upload_status(Category::Feeding);
        assert!(feedings.degraded);
        assert_eq!(feedings.rejected_batches, 1);
        assert_eq!(feedings.last_error.as_deref(), Some("HTTP 400"));
        assert!(!s.upload_status(Category::Vitals).degraded);
        assert!(!s.ping_status().degraded);
    }

    #[test]
    fn status_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let s = state(1);
        s.record_ping_failure("refused");
        s.write_status(&path, Vec::new()).unwrap();
        let report = HealthReport::load(&path).unwrap();
        assert!(report.degraded);
        assert_eq!(report.device_id.as_str(), "crib-9");
        assert_eq!(report.ping.last_error.as_deref(), Some("refused"));
        assert!(report.uploads.contains_key(&Category::Vitals));
    }

    #[test]
    fn status_file_carries_buffer_capacity_and_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let buffer = EventBuffer::in_memory(8, OverflowPolicy::RejectNew);
        buffer
            .enqueue(Category::Feeding, serde_json::json!({ "ml": 20 }), Utc::now())
            .unwrap();
        let s = state(3);
        s.write_status(&path, vec![buffer.stats(Category::Vitals)]).unwrap();
        s.write_status(&path, vec![buffer.stats(Category::Feeding)]).unwrap();

        let report = HealthReport::load(&path).unwrap();
        assert_eq!(report.buffers.len(), 1);
        let feedings = &report.buffers[0];
        assert_eq!(feedings.category, Category::Feeding);
        assert_eq!(feedings.pending, 1);
        assert_eq!(feedings.capacity, 8);
    }
}
