//! The ingestion pipeline: serial probe in, journal, remote table and MQTT out.

pub mod client;
pub mod ingest;
pub mod journal;
pub mod publisher;
pub mod reading;
pub mod simulator;
pub mod source;
pub mod uploader;
