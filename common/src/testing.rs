use std::{collections::VecDeque, io};

use serde_json::Value;

use crate::{
    config::{DeviceConfig, Endpoint},
    node::Board,
    portal::{PortalError, PortalEvent, PortalMode, PortalService, PortalSession},
    sampler::{AnalogInput, HumitureSensor, RawHumiture, SensorFault},
    store::ConfigBackend,
    telemetry::{EventTransport, TransportError},
};

#[derive(Debug)]
pub struct MemoryBackend {
    pub data: Option<Vec<u8>>,
    pub mountable: bool,
    pub fail_writes: bool,
    pub writes: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            data: None,
            mountable: true,
            fail_writes: false,
            writes: 0,
        }
    }
}

impl MemoryBackend {
    pub fn with_config(config: &DeviceConfig) -> Self {
        Self {
            data: Some(serde_json::to_vec_pretty(config).unwrap()),
            ..Default::default()
        }
    }
}

impl ConfigBackend for MemoryBackend {
    fn mount(&mut self) -> io::Result<()> {
        if self.mountable {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "no medium"))
        }
    }

    fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.clone())
    }

    fn write_atomic(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::other("write rejected"));
        }
        self.writes += 1;
        self.data = Some(bytes.to_vec());
        Ok(())
    }
}

/// Plays back scripted results, then repeats the last one.
pub struct ScriptedHumiture {
    script: VecDeque<Result<RawHumiture, SensorFault>>,
    last: Result<RawHumiture, SensorFault>,
}

impl ScriptedHumiture {
    pub fn new(script: Vec<Result<RawHumiture, SensorFault>>) -> Self {
        let last = script.last().cloned().unwrap_or(Err(SensorFault::Timeout));
        Self {
            script: script.into(),
            last,
        }
    }

    pub fn constant(raw: RawHumiture) -> Self {
        Self::new(vec![Ok(raw)])
    }
}

impl HumitureSensor for ScriptedHumiture {
    fn read(&mut self) -> Result<RawHumiture, SensorFault> {
        self.script.pop_front().unwrap_or_else(|| self.last.clone())
    }
}

pub struct ScriptedAnalog {
    value: Option<u16>,
}

impl ScriptedAnalog {
    pub fn constant(value: u16) -> Self {
        Self { value: Some(value) }
    }

    pub fn failing() -> Self {
        Self { value: None }
    }
}

impl AnalogInput for ScriptedAnalog {
    fn read_raw(&mut self) -> Result<u16, SensorFault> {
        self.value
            .ok_or_else(|| SensorFault::Unknown("adc offline".into()))
    }
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub bound: Vec<Endpoint>,
    pub emitted: Vec<(String, Value)>,
    pub fail_emits: bool,
}

impl EventTransport for RecordingTransport {
    fn bind(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        self.bound.push(endpoint.clone());
        Ok(())
    }

    fn emit(&mut self, event: &str, payload: &Value) -> Result<(), TransportError> {
        if self.fail_emits {
            return Err(TransportError("connection refused".into()));
        }
        self.emitted.push((event.to_string(), payload.clone()));
        Ok(())
    }
}

/// Portal that replays queued events. An auto-connect session joins at once
/// when `saved_credential` is set.
#[derive(Debug, Default)]
pub struct ScriptedPortal {
    pub events: VecDeque<PortalEvent>,
    pub saved_credential: bool,
    pub fail_open: bool,
    pub opened: Vec<PortalSession>,
    pub closed: usize,
    mode: Option<PortalMode>,
}

impl ScriptedPortal {
    pub fn with_events(events: Vec<PortalEvent>) -> Self {
        Self {
            events: events.into(),
            ..Default::default()
        }
    }

    pub fn saved_credential() -> Self {
        Self {
            saved_credential: true,
            ..Default::default()
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, events: Vec<PortalEvent>) {
        self.events.extend(events);
    }
}

impl PortalService for ScriptedPortal {
    fn open(&mut self, session: &PortalSession) -> Result<(), PortalError> {
        if self.fail_open {
            return Err(PortalError("radio busy".into()));
        }
        self.mode = Some(session.mode);
        self.opened.push(session.clone());
        Ok(())
    }

    fn poll(&mut self) -> PortalEvent {
        if self.saved_credential && self.mode == Some(PortalMode::AutoConnect) {
            return PortalEvent::Connected;
        }
        self.events.pop_front().unwrap_or(PortalEvent::Pending)
    }

    fn close(&mut self) {
        self.mode = None;
        self.closed += 1;
    }
}

/// Virtual clock that only advances through `delay_ms`.
#[derive(Debug, Default)]
pub struct FakeBoard {
    pub now_ms: u64,
    pub button_pressed: bool,
    /// Next level read is pressed regardless of `button_pressed`.
    pub bounce_once: bool,
    pub status_log: Vec<bool>,
    pub delays: Vec<u64>,
    pub restarts: usize,
}

impl Board for FakeBoard {
    fn trigger_pressed(&mut self) -> bool {
        if self.bounce_once {
            self.bounce_once = false;
            return true;
        }
        self.button_pressed
    }

    fn set_status(&mut self, on: bool) {
        self.status_log.push(on);
    }

    fn delay_ms(&mut self, ms: u64) {
        self.delays.push(ms);
        self.now_ms += ms;
    }

    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }
}
