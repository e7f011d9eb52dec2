//! # Message publisher
//!
//! Republishes each accepted reading to the broker at QoS 1. The broker
//! connection is driven by a background network thread; the connected flag is
//! the only state shared with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Condvar;
use std::thread;
use std::time::{Duration, Instant};

use rumqttc::{Client, ConnectReturnCode, Event, MqttOptions, Packet, QoS, Transport};

use crate::prelude::*;
use crate::settings::MqttSettings;

/// Seam between the ingestion loop and the broker client.
pub trait Publisher: Send + Sync {
    /// Fails fast when not connected. Returns whether the payload was handed
    /// to the transport.
    fn publish(&self, reading: &Reading) -> bool;

    /// Idempotent, safe to call when never connected.
    fn disconnect(&self);
}

/// The fixed-shape payload the backend subscribes to.
#[derive(Serialize, Debug, PartialEq)]
pub struct Payload {
    pub device_id: String,
    pub farm_id: String,

    /// Unix seconds.
    pub timestamp: i64,

    pub soil_moisture: f64,
    pub temperature: f64,
    pub humidity: f64,

    /// The probe does not measure these yet, but the backend schema expects
    /// them.
    pub ph_level: f64,
    pub nitrogen: f64,
}

impl Payload {
    pub fn new(device_id: &str, farm_id: &str, reading: &Reading) -> Self {
        Self {
            device_id: device_id.into(),
            farm_id: farm_id.into(),
            timestamp: reading.timestamp.timestamp(),
            soil_moisture: reading.moisture as f64,
            temperature: reading.temperature,
            humidity: reading.humidity,
            ph_level: 7.0,
            nitrogen: 100.0,
        }
    }
}

/// Connected flag the network thread sets and the main thread waits on.
#[derive(Default)]
struct ConnectedFlag {
    connected: Mutex<bool>,
    condvar: Condvar,
}

impl ConnectedFlag {
    fn set(&self, connected: bool) {
        *self.connected.lock().expect("failed to acquire the connected flag") = connected;
        self.condvar.notify_all();
    }

    fn get(&self) -> bool {
        *self.connected.lock().expect("failed to acquire the connected flag")
    }

    /// Blocks until connected or until the timeout passes.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut connected = self.connected.lock().expect("failed to acquire the connected flag");
        while !*connected {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(connected, left)
                .expect("failed to wait on the connected flag");
            connected = guard;
        }
        true
    }
}

pub struct MqttPublisher {
    client: Client,
    topic: String,
    device_id: String,
    farm_id: String,
    connect_timeout: Duration,
    connected: Arc<ConnectedFlag>,
    stopping: Arc<AtomicBool>,
}

impl MqttPublisher {
    /// Builds the client and spawns the network thread. The connection itself
    /// is established asynchronously; use [`connect`](Self::connect) to wait
    /// for it.
    pub fn new(settings: &MqttSettings, device_id: &str, farm_id: &str) -> Result<Self> {
        let mut options = MqttOptions::new(format!("agripal-{}", device_id), &settings.host, settings.port);
        options.set_credentials(&settings.username, &settings.password);
        options.set_keep_alive(Duration::from_secs(60));
        if settings.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut connection) = Client::new(options, 10);
        let connected = Arc::new(ConnectedFlag::default());
        let stopping = Arc::new(AtomicBool::new(false));

        {
            let connected = Arc::clone(&connected);
            let stopping = Arc::clone(&stopping);
            thread::Builder::new().name("agripal::mqtt".into()).spawn(move || {
                for event in connection.iter() {
                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            if ack.code == ConnectReturnCode::Success {
                                info!("connected to the broker");
                                connected.set(true);
                            } else {
                                warn!("the broker refused the connection: {:?}", ack.code);
                                connected.set(false);
                            }
                        }
                        Ok(Event::Incoming(Packet::PubAck(ack))) => {
                            debug!("message #{} acknowledged", ack.pkid);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!("disconnected by the broker");
                            connected.set(false);
                        }
                        Ok(_) => {}
                        Err(error) => {
                            connected.set(false);
                            debug!("broker connection error: {}", error);
                            // The iterator retries on its own, just not instantly.
                            thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
                connected.set(false);
            })?;
        }

        Ok(Self {
            client,
            topic: settings.topic.clone(),
            device_id: device_id.into(),
            farm_id: farm_id.into(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            connected,
            stopping,
        })
    }

    /// Waits for the network thread to report a successful connection.
    pub fn connect(&self) -> bool {
        self.connected.wait(self.connect_timeout)
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, reading: &Reading) -> bool {
        if !self.connected.get() {
            debug!("not connected to the broker, skipping the publish");
            return false;
        }
        let payload = match serde_json::to_vec(&Payload::new(&self.device_id, &self.farm_id, reading)) {
            Ok(payload) => payload,
            Err(error) => {
                error!("failed to serialize the payload: {}", error);
                return false;
            }
        };
        match self.client.try_publish(&self.topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => {
                debug!(
                    "published M:{}% T:{}°C H:{}%",
                    reading.moisture, reading.temperature, reading.humidity
                );
                true
            }
            Err(error) => {
                warn!("failed to publish: {}", error);
                false
            }
        }
    }

    fn disconnect(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.set(false);
        if let Err(error) = self.client.disconnect() {
            debug!("failed to disconnect from the broker: {}", error);
        }
        info!("disconnected from the broker");
    }
}
