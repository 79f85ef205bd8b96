//! Rate governor: fixed quota windows anchored to wall-clock boundaries.
//!
//! A window of period `p` starts at the largest multiple of `p` (in seconds
//! since the UNIX epoch) not after "now", so a per-minute window resets at
//! the top of every minute and a per-hour window at the top of every hour.

use crate::clock::Clock;
use crate::config::AgentConfig;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A rate-limited activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Sample,
    Ping,
    Upload,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Activity::Sample => "sample",
            Activity::Ping => "ping",
            Activity::Upload => "upload",
        })
    }
}

/// Quota state for one activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
    pub period: Duration,
}

impl RateWindow {
    pub fn new(limit: u32, period: Duration, now: DateTime<Utc>) -> Self {
        Self {
            window_start: window_start(now, period),
            count: 0,
            limit,
            period,
        }
    }

    /// Reset the count if `now` falls in a later window.
    fn roll(&mut self, now: DateTime<Utc>) {
        let start = window_start(now, self.period);
        if start != self.window_start {
            self.window_start = start;
            self.count = 0;
        }
    }

    fn try_consume(&mut self, now: DateTime<Utc>) -> bool {
        self.roll(now);
        if self.count < self.limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    fn remaining(&mut self, now: DateTime<Utc>) -> u32 {
        self.roll(now);
        self.limit.saturating_sub(self.count)
    }
}

/// Start of the fixed window containing `now`.
fn window_start(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_secs = i64::try_from(period.as_secs()).unwrap_or(i64::MAX).max(1);
    let secs = now.timestamp();
    let start = secs - secs.rem_euclid(period_secs);
    Utc.timestamp_opt(start, 0).single().unwrap_or(now)
}

/// Independent quota windows for sampling, pinging and uploading.
#[derive(Debug)]
pub struct RateGovernor {
    clock: Arc<dyn Clock>,
    sample: Mutex<RateWindow>,
    ping: Mutex<RateWindow>,
    upload: Mutex<RateWindow>,
}

impl RateGovernor {
    /// All windows start fresh at the current instant.
    pub fn new(
        clock: Arc<dyn Clock>,
        samples_per_minute: u32,
        pings_per_minute: u32,
        uploads_per_hour: u32,
    ) -> Self {
        let now = clock.now();
        let minute = Duration::from_secs(60);
        let hour = Duration::from_secs(3600);
        Self {
            sample: Mutex::new(RateWindow::new(samples_per_minute, minute, now)),
            ping: Mutex::new(RateWindow::new(pings_per_minute, minute, now)),
            upload: Mutex::new(RateWindow::new(uploads_per_hour, hour, now)),
            clock,
        }
    }

    pub fn from_config(config: &AgentConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            clock,
            config.samples_per_minute,
            config.pings_per_minute,
            config.uploads_per_hour,
        )
    }

    fn window(&self, activity: Activity) -> MutexGuard<'_, RateWindow> {
        let window = match activity {
            Activity::Sample => &self.sample,
            Activity::Ping => &self.ping,
            Activity::Upload => &self.upload,
        };
        window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one unit of quota. `false` means the window is exhausted and
    /// nothing was changed.
    pub fn try_consume(&self, activity: Activity) -> bool {
        let now = self.clock.now();
        self.window(activity).try_consume(now)
    }

    pub fn remaining(&self, activity: Activity) -> u32 {
        let now = self.clock.now();
        self.window(activity).remaining(now)
    }

    /// Copy of the current window (after rolling it forward).
    pub fn snapshot(&self, activity: Activity) -> RateWindow {
        let now = self.clock.now();
        let mut window = self.window(activity);
        window.roll(now);
        window.clone()
    }
}
