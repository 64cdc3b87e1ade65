use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DeviceConfig;

pub struct FormField {
    pub id: &'static str,
    pub label: &'static str,
    pub max_len: usize,
}

pub const TEXT_FIELD_MAX_LEN: usize = 50;
pub const CALIBRATION_FIELD_MAX_LEN: usize = 7;

pub const FORM_FIELDS: [FormField; 6] = [
    FormField {
        id: "deviceID",
        label: "Device ID",
        max_len: TEXT_FIELD_MAX_LEN,
    },
    FormField {
        id: "serverIPAddress",
        label: "Server IP Address",
        max_len: TEXT_FIELD_MAX_LEN,
    },
    FormField {
        id: "serverPortNumber",
        label: "Server Port Number",
        max_len: TEXT_FIELD_MAX_LEN,
    },
    FormField {
        id: "tempCalibrationValue",
        label: "Temperature Calibration Value",
        max_len: CALIBRATION_FIELD_MAX_LEN,
    },
    FormField {
        id: "humidCalibrationValue",
        label: "Humidity Calibration Value",
        max_len: CALIBRATION_FIELD_MAX_LEN,
    },
    FormField {
        id: "airQualCalibrationValue",
        label: "Air Quality Calibration Value",
        max_len: CALIBRATION_FIELD_MAX_LEN,
    },
];

/// The six provisioning inputs, exactly as typed. A missing field keeps the
/// current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalForm {
    #[serde(rename = "deviceID", default)]
    pub device_id: Option<String>,
    #[serde(rename = "serverIPAddress", default)]
    pub server_address: Option<String>,
    #[serde(rename = "serverPortNumber", default)]
    pub server_port: Option<String>,
    #[serde(rename = "tempCalibrationValue", default)]
    pub temp_calibration: Option<String>,
    #[serde(rename = "humidCalibrationValue", default)]
    pub humid_calibration: Option<String>,
    #[serde(rename = "airQualCalibrationValue", default)]
    pub airqual_calibration: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalMode {
    /// Join with a saved network credential if one works, otherwise serve the form.
    AutoConnect,
    /// Always serve the form.
    OnDemand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortalSession {
    pub ssid: String,
    pub passphrase: String,
    pub timeout_ms: u64,
    pub mode: PortalMode,
    pub form: PortalForm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalEvent {
    Pending,
    Submitted(PortalForm),
    /// A saved credential joined the network without user input.
    Connected,
}

#[derive(Debug, Error)]
#[error("provisioning portal unavailable: {0}")]
pub struct PortalError(pub String);

/// Access point plus form server used while provisioning.
pub trait PortalService {
    fn open(&mut self, session: &PortalSession) -> Result<(), PortalError>;

    /// Never blocks.
    fn poll(&mut self) -> PortalEvent;

    fn close(&mut self);
}

impl PortalForm {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            device_id: Some(config.device_id.clone()),
            server_address: Some(config.server_address.clone()),
            server_port: Some(config.server_port.clone()),
            temp_calibration: Some(format_calibration(config.temp_calibration)),
            humid_calibration: Some(format_calibration(config.humid_calibration)),
            airqual_calibration: Some(format_calibration(config.airqual_calibration)),
        }
    }

    /// Merges the submitted values over `base`.
    ///
    /// Text fields are length-limited and trimmed. Calibration text that does
    /// not parse as a number, or that still reads as the pre-filled value,
    /// leaves the current offset unchanged.
    pub fn apply_to(&self, base: &DeviceConfig) -> DeviceConfig {
        let mut config = base.clone();

        if let Some(value) = &self.device_id {
            config.device_id = limit(value, TEXT_FIELD_MAX_LEN).trim().to_string();
        }
        if let Some(value) = &self.server_address {
            config.server_address = limit(value, TEXT_FIELD_MAX_LEN).trim().to_string();
        }
        if let Some(value) = &self.server_port {
            config.server_port = limit(value, TEXT_FIELD_MAX_LEN).trim().to_string();
        }

        coerce_calibration(
            "temperature",
            self.temp_calibration.as_deref(),
            &mut config.temp_calibration,
        );
        coerce_calibration(
            "humidity",
            self.humid_calibration.as_deref(),
            &mut config.humid_calibration,
        );
        coerce_calibration(
            "air quality",
            self.airqual_calibration.as_deref(),
            &mut config.airqual_calibration,
        );

        config.sanitize();
        config
    }
}

fn format_calibration(value: f32) -> String {
    format!("{value}")
}

fn limit(value: &str, max_len: usize) -> &str {
    match value.char_indices().nth(max_len) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

fn coerce_calibration(name: &str, raw: Option<&str>, target: &mut f32) {
    let Some(raw) = raw else {
        return;
    };

    // Pre-filled text may be longer than the field limit.
    if raw.trim() == format_calibration(*target) {
        return;
    }

    let text = limit(raw, CALIBRATION_FIELD_MAX_LEN).trim();
    match text.parse::<f32>() {
        Ok(value) if value.is_finite() => *target = value,
        _ => warn!("ignoring {name} calibration `{raw}`; keeping {target}"),
    }
}

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>AMV Device Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>AMV Device Setup</h1>
  <p class="muted">Set the device identity, telemetry server and calibration offsets.</p>

  <div class="card">
    <label>Device ID</label><input id="deviceID" type="text" maxlength="50">
    <label>Server IP Address</label><input id="serverIPAddress" type="text" maxlength="50">
    <label>Server Port Number</label><input id="serverPortNumber" type="text" maxlength="50">
    <label>Temperature Calibration Value</label><input id="tempCalibrationValue" type="text" maxlength="7">
    <label>Humidity Calibration Value</label><input id="humidCalibrationValue" type="text" maxlength="7">
    <label>Air Quality Calibration Value</label><input id="airQualCalibrationValue" type="text" maxlength="7">
    <button id="save">Save</button>
  </div>

  <p id="status" class="muted"></p>

  <script>
    const ids=['deviceID','serverIPAddress','serverPortNumber','tempCalibrationValue','humidCalibrationValue','airQualCalibrationValue'];
    const q=(id)=>document.getElementById(id);

    async function api(path,opt){
      const r=await fetch(path,opt);let b={};
      try{b=await r.json();}catch(_){}
      if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));
      return b;
    }

    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const payload={};
        ids.forEach((id)=>{payload[id]=q(id).value;});
        await api('/api/device',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        q('status').className='ok'; q('status').textContent='Saved. The device will leave setup mode.';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });

    api('/api/device')
      .then((form)=>ids.forEach((id)=>{q(id).value=form[id]??'';}))
      .catch((err)=>{q('status').className='err';q('status').textContent=err.message;});
  </script>
</body>
</html>
"#;
