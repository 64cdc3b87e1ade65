use serde::{Deserialize, Serialize};

use crate::sampler::SensorFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    ChecksumFault,
    TimeoutFault,
    UnknownFault,
}

impl ReadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::ChecksumFault => "CHECKSUM_FAULT",
            Self::TimeoutFault => "TIMEOUT_FAULT",
            Self::UnknownFault => "UNKNOWN_FAULT",
        }
    }

    pub fn is_fault(self) -> bool {
        self != Self::Ok
    }
}

impl From<Option<SensorFault>> for ReadStatus {
    fn from(fault: Option<SensorFault>) -> Self {
        match fault {
            None => Self::Ok,
            Some(SensorFault::Checksum) => Self::ChecksumFault,
            Some(SensorFault::Timeout) => Self::TimeoutFault,
            Some(SensorFault::Unknown(_)) => Self::UnknownFault,
        }
    }
}

/// One calibrated sample. Values may be stale when `status` is a fault.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature: f32,
    pub humidity: f32,
    pub air_quality: i32,
    pub status: ReadStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub device_id: String,
    pub temperature: f32,
    pub humidity: f32,
    #[serde(rename = "airQuality")]
    pub air_quality: i32,
}

impl TelemetryPacket {
    pub fn new(device_id: &str, reading: &SensorReading) -> Self {
        Self {
            device_id: device_id.to_string(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            air_quality: reading.air_quality,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn packet_keeps_temperature_and_humidity_apart() {
        let reading = SensorReading {
            temperature: 24.5,
            humidity: 61.0,
            air_quality: 312,
            status: ReadStatus::Ok,
        };

        let packet = TelemetryPacket::new("dev-1", &reading);
        let value: Value = serde_json::to_value(&packet).unwrap();

        assert_eq!(value["device_id"], "dev-1");
        assert_eq!(value["temperature"], 24.5);
        assert_eq!(value["humidity"], 61.0);
        assert_eq!(value["airQuality"], 312);
        assert_eq!(value.as_object().unwrap().len(), 4);
    }

    #[test]
    fn receivers_ignore_unknown_packet_fields() {
        let packet: TelemetryPacket = serde_json::from_str(
            r#"{"device_id":"d","temperature":1,"humidity":2,"airQuality":3,"battery":4.1}"#,
        )
        .unwrap();

        assert_eq!(packet.air_quality, 3);
    }

    #[test]
    fn status_classification_from_fault() {
        assert_eq!(ReadStatus::from(None), ReadStatus::Ok);
        assert_eq!(
            ReadStatus::from(Some(SensorFault::Checksum)),
            ReadStatus::ChecksumFault
        );
        assert_eq!(
            ReadStatus::from(Some(SensorFault::Timeout)),
            ReadStatus::TimeoutFault
        );
        assert_eq!(
            ReadStatus::from(Some(SensorFault::Unknown("bus".into()))),
            ReadStatus::UnknownFault
        );
        assert!(!ReadStatus::Ok.is_fault());
    }
}
