use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::UsageWindow;

const MILLIS_PER_SECOND: u64 = 1_000;
const MILLIS_PER_MINUTE: u64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: u64 = 7 * MILLIS_PER_DAY;
const MILLIS_PER_MONTH: u64 = 30 * MILLIS_PER_DAY;
const MILLIS_PER_YEAR: u64 = 365 * MILLIS_PER_DAY;

/// Closed set of window units. An unrecognized unit in a policy document is a
/// configuration error and fails at deserialization, never per request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DurationUnit {
    pub fn millis(self) -> u64 {
        match self {
            DurationUnit::Second => MILLIS_PER_SECOND,
            DurationUnit::Minute => MILLIS_PER_MINUTE,
            DurationUnit::Hour => MILLIS_PER_HOUR,
            DurationUnit::Day => MILLIS_PER_DAY,
            DurationUnit::Week => MILLIS_PER_WEEK,
            DurationUnit::Month => MILLIS_PER_MONTH,
            DurationUnit::Year => MILLIS_PER_YEAR,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub unit: DurationUnit,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    pub points: u32,
}

fn default_multiplier() -> u32 {
    1
}

impl RateLimitConfig {
    pub fn window_millis(&self) -> u64 {
        self.unit.millis().saturating_mul(u64::from(self.multiplier))
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining: u32,
    pub headers: BTreeMap<String, String>,
}

/// Sliding-window admission check over the permit's usage-log window.
/// Two concurrent calls can both observe an under-limit count and both pass;
/// admission is best-effort, not hard real-time.
pub fn check(config: &RateLimitConfig, window: UsageWindow, now_ms: u64) -> RateLimitOutcome {
    let window_ms = config.window_millis();
    let points = u64::from(config.points);
    let allowed = window.count < points;
    let remaining = if allowed {
        config.points.saturating_sub(window.count as u32)
    } else {
        0
    };

    // The window frees a slot when its oldest entry ages out.
    let reset_ms = window
        .oldest_ts_ms
        .map(|oldest| oldest.saturating_add(window_ms))
        .unwrap_or(now_ms);

    let mut headers = BTreeMap::new();
    headers.insert("X-RateLimit-Limit".to_string(), config.points.to_string());
    headers.insert("X-RateLimit-Remaining".to_string(), remaining.to_string());
    headers.insert(
        "X-RateLimit-Reset".to_string(),
        (reset_ms / MILLIS_PER_SECOND).to_string(),
    );
    if !allowed {
        let retry_after_secs = reset_ms
            .saturating_sub(now_ms)
            .div_ceil(MILLIS_PER_SECOND)
            .max(1);
        headers.insert("Retry-After".to_string(), retry_after_secs.to_string());
    }

    RateLimitOutcome {
        allowed,
        remaining,
        headers,
    }
}
