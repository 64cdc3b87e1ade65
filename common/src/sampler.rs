use log::warn;
use thiserror::Error;

use crate::{
    config::DeviceConfig,
    types::{ReadStatus, SensorReading},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorFault {
    #[error("checksum mismatch")]
    Checksum,
    #[error("sensor did not respond")]
    Timeout,
    #[error("sensor read failed: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawHumiture {
    pub temperature: f32,
    pub humidity: f32,
}

/// Uncalibrated values as last read from the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawSample {
    pub temperature: f32,
    pub humidity: f32,
    pub air_quality: u16,
}

/// Combined temperature/humidity sensor on a digital bus.
pub trait HumitureSensor {
    fn read(&mut self) -> Result<RawHumiture, SensorFault>;
}

/// Air-quality sensor on an analog pin.
pub trait AnalogInput {
    fn read_raw(&mut self) -> Result<u16, SensorFault>;
}

pub struct SensorSampler<S, A> {
    humiture: S,
    analog: A,
    last: RawSample,
}

impl<S: HumitureSensor, A: AnalogInput> SensorSampler<S, A> {
    pub fn new(humiture: S, analog: A) -> Self {
        Self {
            humiture,
            analog,
            last: RawSample::default(),
        }
    }

    /// Always yields a reading; on a fault the previous raw values (zero
    /// before the first good read) are calibrated instead.
    pub fn sample(&mut self, config: &DeviceConfig) -> SensorReading {
        let fault = match self.humiture.read() {
            Ok(raw) => {
                self.last.temperature = raw.temperature;
                self.last.humidity = raw.humidity;
                None
            }
            Err(fault) => {
                warn!("humidity/temperature sensor fault: {fault}");
                Some(fault)
            }
        };

        match self.analog.read_raw() {
            Ok(raw) => self.last.air_quality = raw,
            Err(fault) => warn!("air quality input fault: {fault}; reusing {}", self.last.air_quality),
        }

        calibrate(self.last, config, ReadStatus::from(fault))
    }

    pub fn last_raw(&self) -> RawSample {
        self.last
    }
}

/// Subtracts the configured offsets from a raw sample.
pub fn calibrate(raw: RawSample, config: &DeviceConfig, status: ReadStatus) -> SensorReading {
    SensorReading {
        temperature: raw.temperature - config.temp_calibration,
        humidity: raw.humidity - config.humid_calibration,
        air_quality: calibrate_air_quality(raw.air_quality, config.airqual_calibration),
        status,
    }
}

/// Float offset on an integer channel; the result is truncated toward zero.
pub fn calibrate_air_quality(raw: u16, offset: f32) -> i32 {
    (f32::from(raw) - offset).trunc() as i32
}
