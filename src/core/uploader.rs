//! # Batch uploader
//!
//! Buffers accepted readings and flushes them to the hosted table in bounded
//! batches: a batch goes out when it reaches `batch_size` records or when
//! `flush_interval` has passed since the batch began, whichever comes first.
//!
//! Durability is best-effort, at-most-once: a failed bulk insert is logged
//! and the batch is dropped, and records past the queue capacity are dropped
//! on enqueue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, TrySendError};

use crate::prelude::*;
use crate::settings::UploaderSettings;

/// How often the worker re-checks the running flag while waiting for records.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One row of the remote `sensor_readings` table.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Record {
    pub device_id: String,
    pub farm_id: String,
    pub timestamp: String,
    pub raw_value: i64,
    pub moisture: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub status: Status,
}

impl Record {
    pub fn new(device_id: &str, farm_id: &str, reading: &Reading) -> Self {
        Self {
            device_id: device_id.into(),
            farm_id: farm_id.into(),
            timestamp: reading.timestamp.to_rfc3339(),
            raw_value: reading.raw,
            moisture: reading.moisture,
            temperature: reading.temperature,
            humidity: reading.humidity,
            status: reading.status,
        }
    }
}

/// The remote table the uploader writes to. Only bulk inserts, never updates
/// or deletes.
pub trait Table: Send + Sync {
    fn insert_all(&self, records: &[Record]) -> Result;
}

/// Hosted backend table behind a REST endpoint.
pub struct RestTable {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl RestTable {
    pub fn new(settings: &UploaderSettings) -> Result<Self> {
        Ok(Self {
            client: crate::core::client::builder().build()?,
            endpoint: format!("{}/rest/v1/{}", settings.url.trim_end_matches('/'), settings.table),
            api_key: settings.api_key.clone(),
        })
    }
}

impl Table for RestTable {
    fn insert_all(&self, records: &[Record]) -> Result {
        self.client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=minimal")
            .json(records)
            .send()?
            .error_for_status()
            .with_context(|| format!("bulk insert of {} records was rejected", records.len()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Running,
    Stopping,
}

pub struct BatchUploader {
    table: Arc<dyn Table>,
    device_id: String,
    farm_id: String,
    batch_size: usize,
    flush_interval: Duration,

    tx: Sender<Record>,
    rx: Receiver<Record>,

    state: Mutex<State>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchUploader {
    pub fn new(table: Arc<dyn Table>, device_id: &str, farm_id: &str, settings: &UploaderSettings) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(settings.queue_capacity);
        Self {
            table,
            device_id: device_id.into(),
            farm_id: farm_id.into(),
            batch_size: settings.batch_size,
            flush_interval: Duration::from_secs(settings.flush_interval_secs),
            tx,
            rx,
            state: Mutex::new(State::Stopped),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the upload worker. Does nothing when already running.
    pub fn start(&self) -> Result {
        let mut state = self.state.lock().expect("failed to acquire the uploader state lock");
        if *state != State::Stopped {
            debug!("the uploader is already running");
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let table = Arc::clone(&self.table);
        let rx = self.rx.clone();
        let batch_size = self.batch_size;
        let flush_interval = self.flush_interval;

        let handle = thread::Builder::new()
            .name("agripal::uploader".into())
            .spawn(move || worker_loop(&running, &rx, &*table, batch_size, flush_interval))?;
        *self.worker.lock().expect("failed to acquire the uploader worker lock") = Some(handle);
        *state = State::Running;
        info!("uploader started");
        Ok(())
    }

    /// Converts the reading into a table record and queues it for upload.
    /// Never blocks: the record is dropped with a warning when the queue is
    /// at capacity.
    pub fn enqueue(&self, reading: &Reading) {
        let record = Record::new(&self.device_id, &self.farm_id, reading);
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("the upload queue is full, dropping the record");
            }
            Err(TrySendError::Disconnected(_)) => {
                // Unreachable while `self.rx` is alive.
                warn!("the upload queue is gone, dropping the record");
            }
        }
    }

    /// Stops the worker and flushes whatever is still queued, best-effort.
    /// Safe to call more than once.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("failed to acquire the uploader state lock");
        if *state != State::Running {
            debug!("the uploader is not running");
            return;
        }
        *state = State::Stopping;

        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().expect("failed to acquire the uploader worker lock").take() {
            if worker.join().is_err() {
                error!("the upload worker has panicked");
            }
        }

        let remaining: Vec<Record> = self.rx.try_iter().collect();
        if !remaining.is_empty() {
            info!("flushing {} remaining records…", remaining.len());
            if let Err(error) = self.table.insert_all(&remaining) {
                error!("the final flush has failed: {:#}", error);
            }
        }

        *state = State::Stopped;
        info!("uploader stopped");
    }
}

fn worker_loop(
    running: &AtomicBool,
    rx: &Receiver<Record>,
    table: &dyn Table,
    batch_size: usize,
    flush_interval: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let mut batch = Vec::with_capacity(batch_size);
        let deadline = Instant::now() + flush_interval;

        while running.load(Ordering::SeqCst) && batch.len() < batch_size && Instant::now() < deadline {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(record) => batch.push(record),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if batch.is_empty() {
            continue;
        }
        match table.insert_all(&batch) {
            Ok(()) => info!("uploaded {} records", batch.len()),
            // The batch is dropped: availability over durability.
            Err(error) => error!("failed to upload {} records: {:#}", batch.len(), error),
        }
    }
}
