//! Synthetic readings for the display while the probe is disconnected.
//!
//! Simulation is a display fallback only: synthetic readings are never
//! journaled, uploaded or published.

use crate::prelude::*;

/// The probe ADC reads high when the soil is dry.
const ADC_SPAN: i64 = 1023;

pub fn synthetic() -> Reading {
    let moisture = fastrand::i64(20..=95);
    Reading {
        raw: ADC_SPAN - moisture * ADC_SPAN / 100,
        moisture,
        temperature: 18.0 + fastrand::f64() * 14.0,
        humidity: 35.0 + fastrand::f64() * 45.0,
        status: Status::from_moisture(moisture),
        timestamp: Local::now(),
    }
}
