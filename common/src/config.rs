use std::fmt;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Persisted identity, endpoint and calibration record.
///
/// The serialized key names are fixed by devices already in the field; extra
/// keys written by newer firmware are carried through `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default, deserialize_with = "lenient_string")]
    pub device_id: String,
    #[serde(rename = "server_IP", default, deserialize_with = "lenient_string")]
    pub server_address: String,
    #[serde(rename = "server_Port", default, deserialize_with = "lenient_string")]
    pub server_port: String,
    #[serde(default, deserialize_with = "lenient_f32")]
    pub temp_calibration: f32,
    #[serde(default, deserialize_with = "lenient_f32")]
    pub humid_calibration: f32,
    #[serde(
        rename = "airQual_calibration",
        default,
        deserialize_with = "lenient_f32"
    )]
    pub airqual_calibration: f32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("server address is empty")]
    MissingAddress,
    #[error("server port is empty")]
    MissingPort,
    #[error("server port `{0}` is not a port number")]
    InvalidPort(String),
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        trim_in_place(&mut self.device_id);
        trim_in_place(&mut self.server_address);
        trim_in_place(&mut self.server_port);
    }

    pub fn port(&self) -> Result<u16, EndpointError> {
        parse_port(&self.server_port)
    }

    pub fn endpoint(&self) -> Result<Endpoint, EndpointError> {
        Endpoint::parse(&self.server_address, &self.server_port)
    }

    /// True once identity and endpoint are usable for telemetry.
    pub fn is_provisioned(&self) -> bool {
        !self.device_id.trim().is_empty() && self.endpoint().is_ok()
    }

    pub fn access_point_ssid(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.device_id.trim())
    }
}

impl Endpoint {
    pub fn parse(address: &str, port: &str) -> Result<Self, EndpointError> {
        let host = address.trim();
        if host.is_empty() {
            return Err(EndpointError::MissingAddress);
        }

        Ok(Self {
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Runtime tuning for the node loop. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub portal_timeout_ms: u64,
    pub portal_poll_interval_ms: u64,
    pub restart_grace_ms: u64,
    pub boot_settle_ms: u64,
    pub status_pulse_ms: u64,
    pub sample_interval_ms: u64,
    pub debounce_ms: u64,
    pub ap_prefix: String,
    pub ap_passphrase: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            portal_timeout_ms: 120_000,
            portal_poll_interval_ms: 200,
            restart_grace_ms: 3_000,
            boot_settle_ms: 5_000,
            status_pulse_ms: 250,
            sample_interval_ms: 2_000,
            debounce_ms: 50,
            ap_prefix: "AMV_Device".to_string(),
            ap_passphrase: "12345677".to_string(),
        }
    }
}

impl NodeSettings {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.portal_timeout_ms = self.portal_timeout_ms.max(1_000);
        self.portal_poll_interval_ms = self.portal_poll_interval_ms.clamp(10, 5_000);
        self.status_pulse_ms = self.status_pulse_ms.min(5_000);

        // DHT11 needs at least a second between reads.
        self.sample_interval_ms = self
            .sample_interval_ms
            .max(1_000)
            .max(self.status_pulse_ms * 2);

        if self.ap_prefix.trim().is_empty() {
            self.ap_prefix = defaults.ap_prefix;
        }

        // WPA2 passphrases are 8..=63 characters.
        if !(8..=63).contains(&self.ap_passphrase.len()) {
            self.ap_passphrase = defaults.ap_passphrase;
        }
    }
}

fn parse_port(raw: &str) -> Result<u16, EndpointError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(EndpointError::MissingPort);
    }

    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(EndpointError::InvalidPort(raw.to_string())),
    }
}

fn trim_in_place(value: &mut String) {
    let trimmed = value.trim();
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(D::Error::custom(format!("expected string, found {other}"))),
    }
}

fn lenient_f32<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(0.0),
        Value::Number(value) => value
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| D::Error::custom("calibration is not a finite number"))?,
        Value::String(value) if value.trim().is_empty() => return Ok(0.0),
        Value::String(value) => value
            .trim()
            .parse::<f32>()
            .map_err(|_| D::Error::custom(format!("calibration `{value}` is not a number")))?,
        other => {
            return Err(D::Error::custom(format!(
                "expected calibration number, found {other}"
            )))
        }
    };

    // Offsets must stay finite to serialize as JSON numbers.
    if value.is_finite() {
        Ok(value)
    } else {
        Err(D::Error::custom(format!(
            "calibration `{value}` is not a finite number"
        )))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{ "device_id": "dev-1", "server_Port": "3000" }"#).unwrap();

        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.server_address, "");
        assert_eq!(config.server_port, "3000");
        assert_eq!(config.temp_calibration, 0.0);
        assert!(config.extra.is_empty());
    }

    #[test]
    fn accepts_numeric_port_and_string_calibrations() {
        let config: DeviceConfig = serde_json::from_str(
            r#"{ "server_Port": 8080, "temp_calibration": "1.5", "humid_calibration": -2 }"#,
        )
        .unwrap();

        assert_eq!(config.server_port, "8080");
        assert_eq!(config.temp_calibration, 1.5);
        assert_eq!(config.humid_calibration, -2.0);
    }

    #[test]
    fn rejects_non_numeric_calibration() {
        let result = serde_json::from_str::<DeviceConfig>(r#"{ "temp_calibration": "warm" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_finite_calibration() {
        for raw in [
            r#"{ "temp_calibration": "NaN" }"#,
            r#"{ "humid_calibration": "inf" }"#,
            r#"{ "airQual_calibration": " -inf " }"#,
            r#"{ "temp_calibration": 1e300 }"#,
        ] {
            assert!(serde_json::from_str::<DeviceConfig>(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let raw = r#"{"device_id":"a","server_IP":"10.0.0.2","server_Port":"3000","temp_calibration":0,"humid_calibration":0,"airQual_calibration":0,"location":"lab"}"#;
        let config: DeviceConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.extra.get("location"), Some(&Value::from("lab")));

        let encoded = serde_json::to_string(&config).unwrap();
        assert!(encoded.contains(r#""location":"lab""#));
        assert!(encoded.contains(r#""server_IP":"10.0.0.2""#));
        assert!(encoded.contains(r#""airQual_calibration":0.0"#));
    }

    #[test]
    fn endpoint_requires_positive_numeric_port() {
        let mut config = DeviceConfig {
            server_address: "192.168.254.150".into(),
            server_port: "0".into(),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint(),
            Err(EndpointError::InvalidPort("0".into()))
        );

        config.server_port = "http".into();
        assert!(config.endpoint().is_err());

        config.server_port = " 3000 ".into();
        assert_eq!(
            config.endpoint(),
            Ok(Endpoint {
                host: "192.168.254.150".into(),
                port: 3000
            })
        );
    }

    #[test]
    fn provisioned_requires_identity_and_endpoint() {
        let mut config = DeviceConfig::default();
        assert!(!config.is_provisioned());

        config.server_address = "10.0.0.2".into();
        config.server_port = "3000".into();
        assert!(!config.is_provisioned());

        config.device_id = "dev-1".into();
        assert!(config.is_provisioned());
    }

    #[test]
    fn sanitize_trims_identity_and_endpoint() {
        let mut config = DeviceConfig {
            device_id: " dev-1 ".into(),
            server_address: "\t10.0.0.2\n".into(),
            server_port: " 8080".into(),
            ..Default::default()
        };
        config.sanitize();

        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.server_address, "10.0.0.2");
        assert_eq!(config.server_port, "8080");
        assert_eq!(config.access_point_ssid("AMV_Device"), "AMV_Device-dev-1");
    }

    #[test]
    fn settings_sanitize_restores_invalid_passphrase() {
        let mut settings = NodeSettings {
            ap_passphrase: "short".into(),
            sample_interval_ms: 100,
            ..Default::default()
        };
        settings.sanitize();

        assert_eq!(settings.ap_passphrase, "12345677");
        assert_eq!(settings.sample_interval_ms, 1_000);
    }
}
