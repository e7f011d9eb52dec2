//! # Ingestion loop
//!
//! One tick: poll the probe once and fan the reading out to the display, the
//! journal, the uploader and the publisher. Each sink is independent, a
//! failure in one never stops the others. The display comes first so that the
//! dashboard is not gated on I/O.

use crate::core::journal::Journal;
use crate::core::publisher::Publisher;
use crate::core::simulator;
use crate::core::source::Source;
use crate::core::uploader::BatchUploader;
use crate::prelude::*;

/// What the display collaborator receives once per tick.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySample {
    pub moisture: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub status: Status,

    /// Synthetic samples come from the simulator, not the probe.
    pub synthetic: bool,
}

impl DisplaySample {
    fn new(reading: &Reading, synthetic: bool) -> Self {
        Self {
            moisture: reading.moisture,
            temperature: reading.temperature,
            humidity: reading.humidity,
            status: reading.status,
            synthetic,
        }
    }
}

/// Re-opens the reading source after a disconnect.
pub type Connector = Box<dyn FnMut() -> Result<Box<dyn Source>> + Send>;

pub struct Ingestor {
    connector: Connector,
    source: Option<Box<dyn Source>>,

    /// Ticks left until the next reconnect attempt.
    reconnect_countdown: u32,
    reconnect_every: u32,

    journal: Journal,
    uploader: BatchUploader,
    publisher: Option<Arc<dyn Publisher>>,
    display_tx: Sender<DisplaySample>,
}

impl Ingestor {
    pub fn new(
        connector: Connector,
        reconnect_every: u32,
        journal: Journal,
        uploader: BatchUploader,
        publisher: Option<Arc<dyn Publisher>>,
        display_tx: Sender<DisplaySample>,
    ) -> Self {
        Self {
            connector,
            source: None,
            reconnect_countdown: 0,
            reconnect_every,
            journal,
            uploader,
            publisher,
            display_tx,
        }
    }

    /// Runs one ingestion tick.
    pub fn tick(&mut self) {
        if self.source.is_none() {
            self.try_reconnect();
        }
        match self.source.as_mut() {
            None => {
                // Keep the dashboard alive on synthetic data, but never
                // persist or republish it.
                self.send_to_display(&simulator::synthetic(), true);
            }
            Some(source) => match source.read_one() {
                Ok(Some(reading)) => self.fan_out(&reading),
                Ok(None) => {}
                Err(error) => {
                    error!("lost the probe: {:#}", error);
                    self.source = None;
                    self.reconnect_countdown = self.reconnect_every;
                }
            },
        }
    }

    /// Stops the sinks in order: final upload flush first, then the broker.
    pub fn shutdown(self) {
        self.uploader.stop();
        if let Some(publisher) = self.publisher {
            publisher.disconnect();
        }
    }

    fn try_reconnect(&mut self) {
        if self.reconnect_countdown > 0 {
            self.reconnect_countdown -= 1;
            return;
        }
        self.reconnect_countdown = self.reconnect_every;
        match (self.connector)() {
            Ok(source) => {
                self.source = Some(source);
            }
            Err(error) => {
                debug!("the probe is still unreachable: {:#}", error);
            }
        }
    }

    fn fan_out(&mut self, reading: &Reading) {
        self.send_to_display(reading, false);
        self.journal
            .append(reading)
            .log(|| "failed to journal the reading")
            .ok();
        self.uploader.enqueue(reading);
        if let Some(publisher) = &self.publisher {
            if !publisher.publish(reading) {
                debug!("the reading was not published");
            }
        }
    }

    fn send_to_display(&self, reading: &Reading, synthetic: bool) {
        if let Err(error) = self.display_tx.send(DisplaySample::new(reading, synthetic)) {
            debug!("could not reach the display: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::source::tests::ScriptedSource;
    use crate::core::uploader::tests::{test_settings, RecordingTable};
    use crate::core::uploader::Table;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<Reading>>,
        disconnected: AtomicBool,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, reading: &Reading) -> bool {
            self.published
                .lock()
                .expect("failed to acquire the published lock")
                .push(reading.clone());
            true
        }

        fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        ingestor: Ingestor,
        table: Arc<RecordingTable>,
        publisher: Arc<RecordingPublisher>,
        display_rx: Receiver<DisplaySample>,
        journal_path: std::path::PathBuf,
        _directory: tempfile::TempDir,
    }

    fn harness(connector: Connector) -> Harness {
        let directory = tempfile::tempdir().expect("failed to create a temporary directory");
        let journal_path = directory.path().join("sensor-log.jsonl");
        let journal = Journal::new(&journal_path).expect("the journal opens");

        let table = Arc::new(RecordingTable::default());
        let uploader = BatchUploader::new(
            Arc::clone(&table) as Arc<dyn Table>,
            "sensor_1",
            "farm_1",
            &test_settings(),
        );
        let publisher = Arc::new(RecordingPublisher::default());
        let (display_tx, display_rx) = crossbeam_channel::unbounded();

        let ingestor = Ingestor::new(
            connector,
            3,
            journal,
            uploader,
            Some(Arc::clone(&publisher) as Arc<dyn Publisher>),
            display_tx,
        );
        Harness {
            ingestor,
            table,
            publisher,
            display_rx,
            journal_path,
            _directory: directory,
        }
    }

    #[test]
    fn one_line_fans_out_to_every_sink() -> Result {
        let mut harness = harness(Box::new(|| {
            Ok(Box::new(ScriptedSource {
                lines: vec![Ok(Some(
                    br#"{"raw":512,"moisture":45,"temperature":26.5,"humidity":60,"status":"MOIST"}"#,
                ))],
            }) as Box<dyn Source>)
        }));

        harness.ingestor.tick();

        let sample = harness.display_rx.try_recv()?;
        assert_eq!(sample.moisture, 45);
        assert_eq!(sample.temperature, 26.5);
        assert!(!sample.synthetic);

        let journal = std::fs::read_to_string(&harness.journal_path)?;
        assert_eq!(journal.lines().count(), 1);
        assert!(journal.contains(r#""moisture":45"#));

        let published = harness.publisher.published.lock().expect("lock");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].moisture, 45);
        drop(published);

        // The record reaches the table once the uploader flushes.
        harness.ingestor.uploader.start()?;
        harness.ingestor.uploader.stop();
        let batches = harness.table.batches.lock().expect("lock");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].device_id, "sensor_1");
        assert_eq!(batches[0][0].farm_id, "farm_1");
        assert_eq!(batches[0][0].moisture, 45);
        Ok(())
    }

    #[test]
    fn noise_and_empty_reads_have_no_side_effects() -> Result {
        let mut harness = harness(Box::new(|| {
            Ok(Box::new(ScriptedSource {
                lines: vec![Ok(Some(b"Soil probe v1.2 starting...")), Ok(None)],
            }) as Box<dyn Source>)
        }));

        harness.ingestor.tick();
        harness.ingestor.tick();

        assert!(harness.display_rx.try_recv().is_err());
        assert_eq!(std::fs::read_to_string(&harness.journal_path)?, "");
        assert!(harness.publisher.published.lock().expect("lock").is_empty());
        Ok(())
    }

    #[test]
    fn disconnected_probe_falls_back_to_synthetic_display_only() -> Result {
        let mut harness = harness(Box::new(|| Err(anyhow!("no such device"))));

        for _ in 0..10 {
            harness.ingestor.tick();
        }

        let samples: Vec<DisplaySample> = harness.display_rx.try_iter().collect();
        assert_eq!(samples.len(), 10);
        for sample in &samples {
            assert!(sample.synthetic);
            assert!((20..=95).contains(&sample.moisture));
        }

        // Synthetic data is for the display only.
        assert_eq!(std::fs::read_to_string(&harness.journal_path)?, "");
        assert!(harness.publisher.published.lock().expect("lock").is_empty());
        harness.ingestor.uploader.start()?;
        harness.ingestor.uploader.stop();
        assert!(harness.table.batches.lock().expect("lock").is_empty());
        Ok(())
    }

    #[test]
    fn read_error_switches_to_simulation_until_reconnect() -> Result {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector_attempts = Arc::clone(&attempts);
        let mut harness = harness(Box::new(move || {
            let attempt = connector_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                // First connection delivers one reading, then the port dies.
                Ok(Box::new(ScriptedSource {
                    lines: vec![
                        Ok(Some(br#"{"moisture":45}"#)),
                        Err(anyhow!("input/output error")),
                    ],
                }) as Box<dyn Source>)
            } else {
                Ok(Box::new(ScriptedSource {
                    lines: vec![Ok(Some(br#"{"moisture":50}"#))],
                }) as Box<dyn Source>)
            }
        }));

        harness.ingestor.tick(); // Reading accepted.
        harness.ingestor.tick(); // Read error, source dropped.

        // Simulation mode while the reconnect countdown runs down.
        let mut synthetic_ticks = 0;
        loop {
            harness.ingestor.tick();
            let sample = harness.display_rx.try_iter().last();
            if let Some(sample) = sample {
                if !sample.synthetic {
                    assert_eq!(sample.moisture, 50);
                    break;
                }
                synthetic_ticks += 1;
            }
            assert!(synthetic_ticks < 10, "the probe never came back");
        }
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        Ok(())
    }

    #[test]
    fn shutdown_stops_the_sinks() {
        let harness = harness(Box::new(|| Err(anyhow!("no such device"))));
        let publisher = Arc::clone(&harness.publisher);
        harness.ingestor.shutdown();
        assert!(publisher.disconnected.load(Ordering::SeqCst));
    }
}
