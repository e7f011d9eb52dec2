//! # Settings
//!
//! AgriPal is configured with a single TOML file.
//!
//! ## Example
//!
//! ```toml
//! device_id = "sensor_1"
//! farm_id = "farm_1"
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//!
//! [uploader]
//! url = "https://example.supabase.co"
//! api_key = "…"
//!
//! [mqtt]
//! host = "broker.example.com"
//! username = "…"
//! password = "…"
//! topic = "agripal/farm_1/sensor_1"
//! ```

use std::fs;
use std::path::Path;

use crate::prelude::*;

/// Read and parse the settings file.
pub fn read<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path = path.as_ref();
    toml::from_str(&fs::read_to_string(path)?)
        .with_context(|| format!("failed to read the settings from `{}`", path.display()))
}

#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// Device identifier attached to every uploaded record and published payload.
    pub device_id: String,

    /// Farm identifier attached to every uploaded record and published payload.
    pub farm_id: String,

    /// Ingestion tick interval.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    pub serial: SerialSettings,

    #[serde(default)]
    pub journal: JournalSettings,

    pub uploader: UploaderSettings,

    /// The publisher is disabled when the section is absent.
    #[serde(default)]
    pub mqtt: Option<MqttSettings>,
}

const fn default_tick_interval_ms() -> u64 {
    500
}

#[derive(Deserialize, Debug, Clone)]
pub struct SerialSettings {
    /// Serial device path, for example `/dev/ttyUSB0`.
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Upper bound on how long a single `read_one` may block.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// How many ticks to wait between reconnect attempts while disconnected.
    #[serde(default = "default_reconnect_every_ticks")]
    pub reconnect_every_ticks: u32,
}

const fn default_baud_rate() -> u32 {
    9600
}

const fn default_read_timeout_ms() -> u64 {
    2000
}

const fn default_reconnect_every_ticks() -> u32 {
    20
}

#[derive(Deserialize, Debug, Clone)]
pub struct JournalSettings {
    #[serde(default = "default_journal_path")]
    pub path: String,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
        }
    }
}

fn default_journal_path() -> String {
    "sensor-log.jsonl".into()
}

#[derive(Deserialize, Debug, Clone)]
pub struct UploaderSettings {
    /// Base URL of the hosted backend, without the `/rest/v1/…` suffix.
    pub url: String,

    pub api_key: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// A batch is flushed when it reaches `batch_size` or when this long has
    /// passed since the batch began, whichever comes first.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Records enqueued past this capacity are dropped with a warning.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_table() -> String {
    "sensor_readings".into()
}

const fn default_batch_size() -> usize {
    20
}

const fn default_flush_interval_secs() -> u64 {
    30
}

const fn default_queue_capacity() -> usize {
    10_000
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttSettings {
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    pub username: String,

    pub password: String,

    pub topic: String,

    #[serde(default = "default_tls")]
    pub tls: bool,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

const fn default_mqtt_port() -> u16 {
    8883
}

const fn default_tls() -> bool {
    true
}

const fn default_connect_timeout_secs() -> u64 {
    5
}
