//! One parsed sensor sample and the line parser that produces it.

use std::str::FromStr;

use crate::prelude::*;

/// The probe prints one JSON object per line. Anything that does not start
/// with `{` is boot noise and is skipped silently.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Raw ADC value of the moisture probe.
    pub raw: i64,

    /// Moisture percentage, clamped to 0–100.
    pub moisture: i64,

    pub temperature: f64,

    pub humidity: f64,

    pub status: Status,

    /// Assigned at ingestion, not by the probe.
    pub timestamp: DateTime<Local>,
}

/// The payload as the probe emits it. `moisture` is required, the rest the
/// firmware may leave out.
#[derive(Deserialize, Debug)]
struct RawReading {
    #[serde(default)]
    raw: i64,

    moisture: i64,

    #[serde(default)]
    temperature: f64,

    #[serde(default)]
    humidity: f64,

    #[serde(default)]
    status: Option<String>,
}

impl Reading {
    /// Parses one line from the probe. Returns `None` for noise: lines that
    /// are not UTF-8, do not start with `{`, or fail to parse as JSON.
    pub fn from_line(line: &[u8]) -> Option<Self> {
        let line = std::str::from_utf8(line).ok()?.trim();
        if !line.starts_with('{') {
            return None;
        }
        let raw: RawReading = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(error) => {
                debug!("skipping a malformed line: {}", error);
                return None;
            }
        };
        let moisture = raw.moisture.clamp(0, 100);
        Some(Self {
            raw: raw.raw,
            moisture,
            temperature: raw.temperature,
            humidity: raw.humidity,
            status: raw
                .status
                .and_then(|status| status.parse().ok())
                .unwrap_or_else(|| Status::from_moisture(moisture)),
            timestamp: Local::now(),
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Wet,
    Moist,
    Dry,
}

impl Status {
    /// Same thresholds the dashboard uses for the face expression.
    pub fn from_moisture(moisture: i64) -> Self {
        if moisture > 60 {
            Self::Wet
        } else if moisture > 30 {
            Self::Moist
        } else {
            Self::Dry
        }
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(string: &str) -> Result<Self> {
        match string {
            "WET" => Ok(Self::Wet),
            "MOIST" => Ok(Self::Moist),
            "DRY" => Ok(Self::Dry),
            _ => Err(anyhow!("unknown status: `{}`", string)),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Wet => "WET",
            Self::Moist => "MOIST",
            Self::Dry => "DRY",
        })
    }
}
