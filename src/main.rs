//! Entry point.

use std::time::Duration;

use crossbeam_channel::select;
use structopt::StructOpt;

use crate::core::ingest::{DisplaySample, Ingestor};
use crate::core::journal::Journal;
use crate::core::publisher::{MqttPublisher, Publisher};
use crate::core::source::{SerialSource, Source};
use crate::core::uploader::{BatchUploader, RestTable, Table};
use crate::opts::Opts;
use crate::prelude::*;

pub mod core;
pub mod logging;
pub mod opts;
pub mod prelude;
pub mod settings;

fn main() -> Result {
    let opts = Opts::from_args();
    logging::init(&opts)?;
    info!("reading the settings from `{}`…", opts.settings.display());
    let settings = settings::read(&opts.settings)?;
    debug!("settings: {:?}", settings);

    let journal = Journal::new(&settings.journal.path)?;

    let table = Arc::new(RestTable::new(&settings.uploader)?);
    let uploader = BatchUploader::new(
        table as Arc<dyn Table>,
        &settings.device_id,
        &settings.farm_id,
        &settings.uploader,
    );
    uploader.start()?;

    let publisher = match &settings.mqtt {
        Some(mqtt_settings) => {
            let publisher = MqttPublisher::new(mqtt_settings, &settings.device_id, &settings.farm_id)?;
            if publisher.connect() {
                info!("the broker is ready");
            } else {
                warn!("could not reach the broker, publishing is degraded");
            }
            Some(Arc::new(publisher) as Arc<dyn Publisher>)
        }
        None => {
            info!("no MQTT settings, publishing is disabled");
            None
        }
    };

    let (display_tx, display_rx) = crossbeam_channel::unbounded();
    let serial_settings = settings.serial.clone();
    let mut ingestor = Ingestor::new(
        Box::new(move || Ok(Box::new(SerialSource::open(&serial_settings)?) as Box<dyn Source>)),
        settings.serial.reconnect_every_ticks,
        journal,
        uploader,
        publisher,
        display_tx,
    );

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    info!("starting the ingestion loop…");
    let ticker = crossbeam_channel::tick(Duration::from_millis(settings.tick_interval_ms));
    loop {
        select! {
            recv(ticker) -> _ => {
                ingestor.tick();
                for sample in display_rx.try_iter() {
                    show(&sample);
                }
            }
            recv(shutdown_rx) -> _ => break,
        }
    }

    info!("shutting down…");
    ingestor.shutdown();
    Ok(())
}

/// Stands in for the dashboard: one line per sample.
fn show(sample: &DisplaySample) {
    info!(
        "{}moisture {}% | {:.1}°C | humidity {:.1}% | {}",
        if sample.synthetic { "(simulated) " } else { "" },
        sample.moisture,
        sample.temperature,
        sample.humidity,
        sample.status,
    );
}
