use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NOT_AVAILABLE: &str = "N/A";

/// A metric reading that may legitimately be missing.
///
/// Always travels as a string; a missing reading is the literal `"N/A"`,
/// never zero or null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Metric {
    Value(String),
    NotAvailable,
}

impl Metric {
    pub fn value(value: impl Into<String>) -> Self {
        Metric::Value(value.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Metric::Value(value) => value,
            Metric::NotAvailable => NOT_AVAILABLE,
        }
    }
}

impl From<String> for Metric {
    fn from(value: String) -> Self {
        if value == NOT_AVAILABLE {
            Metric::NotAvailable
        } else {
            Metric::Value(value)
        }
    }
}

impl From<Metric> for String {
    fn from(metric: Metric) -> Self {
        match metric {
            Metric::Value(value) => value,
            Metric::NotAvailable => NOT_AVAILABLE.to_string(),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Janky frames since the last gfxinfo reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct JankStats {
    pub janky_frames: u64,
    /// As reported by gfxinfo, e.g. "12.50".
    pub percent: String,
    /// `None` when gfxinfo reported janky frames but no total.
    pub total_frames: Option<u64>,
}

impl Default for JankStats {
    fn default() -> Self {
        Self {
            janky_frames: 0,
            percent: "0".to_string(),
            total_frames: Some(0),
        }
    }
}

impl fmt::Display for JankStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total_frames {
            Some(total) => write!(f, "{}% ({}/{})", self.percent, self.janky_frames, total),
            None => write!(f, "{}% ({}/?)", self.percent, self.janky_frames),
        }
    }
}

impl From<JankStats> for String {
    fn from(stats: JankStats) -> Self {
        stats.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfSample {
    pub device: String,
    pub package: String,
    /// Wall clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Milliseconds since the sampler started.
    pub elapsed: u64,
    pub cpu: Metric,
    /// MB.
    pub ram: Metric,
    /// KB.
    pub gpu: Metric,
    pub missed_vsync: Metric,
    pub jank: JankStats,
    /// New frames observed during the tick; an estimate, not a time-normalized rate.
    pub fps: Metric,
}

impl PerfSample {
    pub fn clock_label(&self) -> String {
        Local
            .timestamp_millis_opt(self.timestamp)
            .single()
            .map(|ts| ts.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "--:--:--".to_string())
    }

    pub fn elapsed_label(&self) -> String {
        let secs = self.elapsed / 1000;
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerfEvent {
    Sample(PerfSample),
    Status { device: String, message: String },
}

impl PerfEvent {
    pub fn status(device: &str, message: impl Into<String>) -> Self {
        PerfEvent::Status {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn device(&self) -> &str {
        match self {
            PerfEvent::Sample(sample) => &sample.device,
            PerfEvent::Status { device, .. } => device,
        }
    }
}
