//! Progress accounting shared by every long-running operation.
//!
//! Producers push [`ProgressSample`]s through a channel as work
//! advances; nothing here retains history. Rates are computed from
//! wall-clock deltas, the percentage is clamped so a lying content
//! length can never drive it past 100, and emission is throttled to a
//! configured minimum interval with the first and final samples always
//! let through.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Stage of a provisioning pipeline, also the `type` tag of the wire
/// progress object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Starting,
    Downloading,
    Decompressing,
    ExtractingIso,
    RecreatingIso,
    Flashing,
    Verifying,
    Configuring,
    Finished,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Starting => "starting",
            Stage::Downloading => "downloading",
            Stage::Decompressing => "decompressing",
            Stage::ExtractingIso => "extracting-iso",
            Stage::RecreatingIso => "recreating-iso",
            Stage::Flashing => "flashing",
            Stage::Verifying => "verifying",
            Stage::Configuring => "configuring",
            Stage::Finished => "finished",
            Stage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One progress observation. Emitted, never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub stage: Stage,
    pub bytes_written: u64,
    /// Percent complete in [0, 100].
    pub percentage: f64,
    /// Instantaneous bytes/second since the previous sample.
    pub speed: f64,
    /// Bytes/second over the whole operation.
    pub average_speed: f64,
    /// Seconds to completion at the current speed; `None` while stalled.
    pub eta_seconds: Option<f64>,
}

impl ProgressSample {
    /// The all-zero sample that opens an operation.
    pub fn zeroed(stage: Stage) -> Self {
        Self {
            stage,
            bytes_written: 0,
            percentage: 0.0,
            speed: 0.0,
            average_speed: 0.0,
            eta_seconds: None,
        }
    }

    /// A percent-only sample for phases measured by ratio rather than
    /// by bytes (ISO extraction and mastering).
    pub fn percent_only(stage: Stage, percentage: f64) -> Self {
        Self {
            stage,
            bytes_written: 0,
            percentage: percentage.clamp(0.0, 100.0),
            speed: 0.0,
            average_speed: 0.0,
            eta_seconds: None,
        }
    }
}

/// 100 * written / total, clamped to [0, 100]. A zero or undeclared
/// total reads as 0 percent, not a division blowup.
pub fn percentage(bytes_written: u64, total_bytes: u64) -> f64 {
    if total_bytes == 0 {
        return 0.0;
    }
    (bytes_written as f64 * 100.0 / total_bytes as f64).clamp(0.0, 100.0)
}

/// Remaining seconds at `speed` bytes/second. `None` when stalled so
/// callers render "unknown" instead of infinity.
pub fn eta_seconds(bytes_written: u64, total_bytes: u64, speed: f64) -> Option<f64> {
    if speed <= 0.0 {
        return None;
    }
    let remaining = total_bytes.saturating_sub(bytes_written);
    Some(remaining as f64 / speed)
}

/// Stateful sample producer for byte-counted operations.
pub struct ProgressMeter {
    stage: Stage,
    total_bytes: u64,
    throttle: Duration,
    started: Instant,
    last_rate_at: Instant,
    last_rate_bytes: u64,
    last_emit: Option<Instant>,
}

impl ProgressMeter {
    pub fn new(stage: Stage, total_bytes: u64, throttle: Duration) -> Self {
        let now = Instant::now();
        Self {
            stage,
            total_bytes,
            throttle,
            started: now,
            last_rate_at: now,
            last_rate_bytes: 0,
            last_emit: None,
        }
    }

    /// The opening sample. Also arms the throttle, so the next tick
    /// within the window is suppressed.
    pub fn zero(&mut self) -> ProgressSample {
        self.last_emit = Some(Instant::now());
        ProgressSample::zeroed(self.stage)
    }

    /// A throttled tick: `Some` when the interval has elapsed since the
    /// last emission (or nothing was emitted yet), `None` otherwise.
    pub fn sample(&mut self, bytes_written: u64) -> Option<ProgressSample> {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.throttle {
                return None;
            }
        }
        Some(self.emit(bytes_written, now))
    }

    /// The closing sample, always emitted.
    pub fn final_sample(&mut self, bytes_written: u64) -> ProgressSample {
        self.emit(bytes_written, Instant::now())
    }

    fn emit(&mut self, bytes_written: u64, now: Instant) -> ProgressSample {
        let rate_window = now.duration_since(self.last_rate_at).as_secs_f64();
        let elapsed = now.duration_since(self.started).as_secs_f64();

        let speed = if rate_window > 0.0 {
            bytes_written.saturating_sub(self.last_rate_bytes) as f64 / rate_window
        } else {
            0.0
        };
        let average_speed = if elapsed > 0.0 {
            bytes_written as f64 / elapsed
        } else {
            0.0
        };

        self.last_rate_at = now;
        self.last_rate_bytes = bytes_written;
        self.last_emit = Some(now);

        ProgressSample {
            stage: self.stage,
            bytes_written,
            percentage: percentage(bytes_written, self.total_bytes),
            speed,
            average_speed,
            eta_seconds: eta_seconds(bytes_written, self.total_bytes, speed),
        }
    }
}

/// Extract the last percent token from a chunk of live tool output.
///
/// Accepts both `42%` and `23.45%`; mastering tools print the decimal
/// form, directory sync the whole form. Hand-parsed so a stray `%` in a
/// path cannot produce a value.
pub fn scan_percent(chunk: &str) -> Option<f64> {
    let bytes = chunk.as_bytes();
    let mut found = None;
    for (idx, b) in bytes.iter().enumerate() {
        if *b != b'%' {
            continue;
        }
        let mut start = idx;
        let mut dots = 0;
        while start > 0 {
            let prev = bytes[start - 1];
            if prev.is_ascii_digit() {
                start -= 1;
            } else if prev == b'.' && dots == 0 {
                dots = 1;
                start -= 1;
            } else {
                break;
            }
        }
        let token = &chunk[start..idx];
        // Reject empty runs and fraction-only tokens like ".45".
        if token.is_empty() || token.starts_with('.') || !token.bytes().any(|b| b.is_ascii_digit())
        {
            continue;
        }
        if let Ok(value) = token.parse::<f64>() {
            found = Some(value);
        }
    }
    found
}

/// Wire form of a progress tick: newline-delimited JSON between the
/// flash worker and its spawner, and the payload surfaced to frontends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub percentage: f64,
    pub speed: f64,
    pub average_speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    pub bytes_written: u64,
    #[serde(rename = "type")]
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub canceled: bool,
}

impl ProgressMessage {
    pub fn from_sample(sample: &ProgressSample) -> Self {
        Self {
            percentage: sample.percentage,
            speed: sample.speed,
            average_speed: sample.average_speed,
            eta: sample.eta_seconds,
            bytes_written: sample.bytes_written,
            stage: sample.stage,
            canceled: false,
        }
    }

    pub fn canceled_at(stage: Stage, bytes_written: u64, percentage: f64) -> Self {
        Self {
            percentage,
            speed: 0.0,
            average_speed: 0.0,
            eta: None,
            bytes_written,
            stage,
            canceled: true,
        }
    }

    pub fn to_sample(&self) -> ProgressSample {
        ProgressSample {
            stage: self.stage,
            bytes_written: self.bytes_written,
            percentage: self.percentage,
            speed: self.speed,
            average_speed: self.average_speed,
            eta_seconds: self.eta,
        }
    }
}
