use std::{
    io,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht11, DhtError};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{AnyIOPin, Gpio2, Gpio34, Gpio4, IOPin, Input, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
    ws::{
        client::{EspWebSocketClient, EspWebSocketClientConfig, WebSocketEventType},
        FrameType,
    },
};
use log::{debug, info, warn};
use serde_json::Value;

use amv_common::{
    portal::PORTAL_HTML,
    protocol::{self, EngineFrame, CONNECT_FRAME},
    AnalogInput, Board, ConfigBackend, Endpoint, EventTransport, HumitureSensor, Node,
    NodeSettings, PortalError, PortalEvent, PortalForm, PortalMode, PortalService, PortalSession,
    RawHumiture, SensorFault, SensorSampler, TransportError,
};

const NVS_NAMESPACE: &str = "amv";
const NVS_CONFIG_KEY: &str = "config";

const TRIGGER_PIN: i32 = 4;
const DHT11_PIN: i32 = 5;
const STATUS_LED_PIN: i32 = 2;
const AIR_QUALITY_PIN: i32 = 34;

const MAX_HTTP_BODY: usize = 1024;
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const SOCKET_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let mut trigger = PinDriver::input(pins.gpio4)?;
    trigger.set_pull(Pull::Up)?;
    let status = PinDriver::output(pins.gpio2)?;

    let humiture = Dht11Sensor::new(pins.gpio5.downgrade()).context("failed to set up DHT11")?;
    let analog = AirQualityInput::new(adc1, pins.gpio34).context("failed to set up ADC")?;
    info!(
        "pins: trigger GPIO{TRIGGER_PIN}, DHT11 GPIO{DHT11_PIN}, led GPIO{STATUS_LED_PIN}, air quality GPIO{AIR_QUALITY_PIN}"
    );

    let backend = NvsBackend::new(nvs_partition.clone());
    let portal = EspPortal::new(modem, sys_loop, nvs_partition)?;

    let mut node = Node::new(
        EspBoard { trigger, status },
        backend,
        portal,
        EspSocketTransport::default(),
        SensorSampler::new(humiture, analog),
        NodeSettings::default(),
    );

    node.boot();
    node.run();

    // `restart` does not return on hardware.
    Err(anyhow!("node loop exited"))
}

struct EspBoard {
    trigger: PinDriver<'static, Gpio4, Input>,
    status: PinDriver<'static, Gpio2, Output>,
}

impl Board for EspBoard {
    fn trigger_pressed(&mut self) -> bool {
        self.trigger.is_low()
    }

    fn set_status(&mut self, on: bool) {
        let result = if on {
            self.status.set_high()
        } else {
            self.status.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive status led: {err:?}");
        }
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn now_ms(&self) -> u64 {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        u64::try_from(micros / 1000).unwrap_or(0)
    }

    fn restart(&mut self) {
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

/// Config record kept as a JSON string under one NVS key.
struct NvsBackend {
    partition: EspDefaultNvsPartition,
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsBackend {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            nvs: None,
        }
    }

    fn handle(&mut self) -> io::Result<&mut EspNvs<NvsDefault>> {
        self.nvs
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "nvs not mounted"))
    }
}

impl ConfigBackend for NvsBackend {
    fn mount(&mut self) -> io::Result<()> {
        if self.nvs.is_none() {
            let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
                .map_err(io::Error::other)?;
            self.nvs = Some(nvs);
        }
        Ok(())
    }

    fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        let nvs = self.handle()?;
        let Some(len) = nvs.str_len(NVS_CONFIG_KEY).map_err(io::Error::other)? else {
            return Ok(None);
        };

        // Reported length includes the NUL terminator.
        let mut buffer = vec![0_u8; len.max(1)];
        let value = nvs
            .get_str(NVS_CONFIG_KEY, &mut buffer)
            .map_err(io::Error::other)?;
        Ok(value.map(|text| text.as_bytes().to_vec()))
    }

    /// NVS commits a key as a unit.
    fn write_atomic(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let nvs = self.handle()?;
        nvs.set_str(NVS_CONFIG_KEY, text).map_err(io::Error::other)
    }
}

struct Dht11Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht11Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl HumitureSensor for Dht11Sensor {
    fn read(&mut self) -> Result<RawHumiture, SensorFault> {
        self.pin
            .set_high()
            .map_err(|err| SensorFault::Unknown(format!("{err:?}")))?;

        match dht11::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => Ok(RawHumiture {
                temperature: f32::from(reading.temperature),
                humidity: f32::from(reading.relative_humidity),
            }),
            Err(DhtError::ChecksumMismatch) => Err(SensorFault::Checksum),
            Err(DhtError::Timeout) => Err(SensorFault::Timeout),
            Err(err) => Err(SensorFault::Unknown(format!("{err:?}"))),
        }
    }
}

struct AirQualityInput {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl AirQualityInput {
    fn new(adc1: ADC1, pin: Gpio34) -> anyhow::Result<Self> {
        let adc = AdcDriver::new(adc1)?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(adc, pin, &config)?;
        Ok(Self { channel })
    }
}

impl AnalogInput for AirQualityInput {
    fn read_raw(&mut self) -> Result<u16, SensorFault> {
        self.channel
            .read()
            .map_err(|err| SensorFault::Unknown(format!("adc: {err:?}")))
    }
}

/// Soft AP plus HTTP form while provisioning; station mode otherwise.
struct EspPortal {
    wifi: BlockingWifi<EspWifi<'static>>,
    server: Option<EspHttpServer<'static>>,
    submissions: Option<mpsc::Receiver<PortalForm>>,
    joined: bool,
}

impl EspPortal {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        Ok(Self {
            wifi,
            server: None,
            submissions: None,
            joined: false,
        })
    }

    /// Joins with the credential the radio has stored, if any.
    fn join_saved_network(&mut self) -> bool {
        let stored = match self.wifi.get_configuration() {
            Ok(Configuration::Client(client)) | Ok(Configuration::Mixed(client, _)) => client,
            _ => return false,
        };
        if stored.ssid.is_empty() {
            return false;
        }

        if let Err(err) = self
            .wifi
            .set_configuration(&Configuration::Client(stored.clone()))
            .and_then(|()| self.wifi.start())
        {
            warn!("failed to start wifi station: {err:?}");
            return false;
        }

        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("joined `{}` on attempt {attempt}", stored.ssid);
                    return true;
                }
                Err(err) => warn!("wifi connect attempt {attempt} failed: {err:?}"),
            }
            let _ = self.wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
        false
    }

    fn start_access_point(&mut self, session: &PortalSession) -> anyhow::Result<()> {
        let station = match self.wifi.get_configuration() {
            Ok(Configuration::Client(client)) | Ok(Configuration::Mixed(client, _)) => client,
            _ => ClientConfiguration::default(),
        };

        let _ = self.wifi.stop();
        self.wifi.set_configuration(&Configuration::Mixed(
            station,
            AccessPointConfiguration {
                ssid: session
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("access point ssid too long"))?,
                password: session
                    .passphrase
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("access point passphrase too long"))?,
                auth_method: AuthMethod::WPA2Personal,
                ..Default::default()
            },
        ))?;
        self.wifi.start()?;

        let (submit_tx, submit_rx) = mpsc::channel();
        self.server = Some(create_portal_server(session.form.clone(), submit_tx)?);
        self.submissions = Some(submit_rx);
        info!("access point `{}` up", session.ssid);
        Ok(())
    }
}

impl PortalService for EspPortal {
    fn open(&mut self, session: &PortalSession) -> Result<(), PortalError> {
        self.joined = false;

        if session.mode == PortalMode::AutoConnect && self.join_saved_network() {
            self.joined = true;
            return Ok(());
        }

        self.start_access_point(session)
            .map_err(|err| PortalError(format!("{err:#}")))
    }

    fn poll(&mut self) -> PortalEvent {
        if self.joined {
            return PortalEvent::Connected;
        }

        match self.submissions.as_ref().map(|rx| rx.try_recv()) {
            Some(Ok(form)) => PortalEvent::Submitted(form),
            _ => PortalEvent::Pending,
        }
    }

    fn close(&mut self) {
        self.server = None;
        self.submissions = None;
        if self.joined {
            return;
        }

        if let Ok(Configuration::Mixed(station, _)) = self.wifi.get_configuration() {
            let _ = self.wifi.stop();
            if let Err(err) = self
                .wifi
                .set_configuration(&Configuration::Client(station))
                .and_then(|()| self.wifi.start())
            {
                warn!("failed to leave access point mode: {err:?}");
                return;
            }
            if let Err(err) = self.wifi.connect() {
                warn!("station reconnect failed: {err:?}");
            }
        }
    }
}

fn create_portal_server(
    form: PortalForm,
    submissions: mpsc::Sender<PortalForm>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let form = Arc::new(form);
        server.fn_handler("/api/device", Method::Get, move |req| {
            write_json(req, 200, form.as_ref())
        })?;
    }

    {
        let submissions = Mutex::new(submissions);
        server.fn_handler::<anyhow::Error, _>("/api/device", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form: PortalForm = match serde_json::from_slice(&body) {
                Ok(form) => form,
                Err(err) => {
                    return write_json(req, 400, &serde_json::json!({ "error": err.to_string() }))
                }
            };

            let sent = submissions
                .lock()
                .map_err(|_| anyhow!("portal submission lock poisoned"))?
                .send(form)
                .is_ok();
            if !sent {
                return write_json(req, 503, &serde_json::json!({ "error": "setup session has ended" }));
            }
            write_json(req, 202, &serde_json::json!({ "saved": true }))
        })?;
    }

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: serde::Serialize + ?Sized>(
    req: Request<&mut EspHttpConnection<'_>>,
    status: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

enum SocketFrame {
    Text(String),
    Closed,
}

/// Socket.IO client on the IDF websocket component. Incoming frames arrive on
/// the client's task and are handled on the next emit.
#[derive(Default)]
struct EspSocketTransport {
    url: Option<String>,
    client: Option<EspWebSocketClient<'static>>,
    frames: Option<mpsc::Receiver<SocketFrame>>,
}

impl EspSocketTransport {
    fn disconnect(&mut self) {
        self.client = None;
        self.frames = None;
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| TransportError("transport has no endpoint".into()))?;

        let (frame_tx, frame_rx) = mpsc::channel();
        let mut client = EspWebSocketClient::new(
            &url,
            &EspWebSocketClientConfig::default(),
            SOCKET_HANDSHAKE_TIMEOUT,
            move |event| {
                let frame = match event {
                    Ok(event) => match event.event_type {
                        WebSocketEventType::Text(text) => SocketFrame::Text(text.to_string()),
                        WebSocketEventType::Disconnected
                        | WebSocketEventType::Close(_)
                        | WebSocketEventType::Closed => SocketFrame::Closed,
                        _ => return,
                    },
                    Err(_) => SocketFrame::Closed,
                };
                let _ = frame_tx.send(frame);
            },
        )
        .map_err(|err| TransportError(format!("connect to {url} failed: {err:?}")))?;

        loop {
            let frame = frame_rx
                .recv_timeout(SOCKET_HANDSHAKE_TIMEOUT)
                .map_err(|_| TransportError(format!("handshake with {url} timed out")))?;
            let SocketFrame::Text(text) = frame else {
                return Err(TransportError("server closed during handshake".into()));
            };

            match protocol::decode_frame(&text) {
                EngineFrame::Open(_) => send_text(&mut client, CONNECT_FRAME)?,
                EngineFrame::Ping(payload) => send_text(&mut client, &protocol::pong_for(payload))?,
                EngineFrame::Connected => break,
                EngineFrame::ConnectError(reason) => {
                    return Err(TransportError(format!("server refused session: {reason}")));
                }
                _ => {}
            }
        }

        info!("socket session open at {url}");
        self.client = Some(client);
        self.frames = Some(frame_rx);
        Ok(())
    }

    /// Answers queued pings; false when the session has ended.
    fn service_incoming(&mut self) -> bool {
        let (Some(client), Some(frames)) = (self.client.as_mut(), self.frames.as_ref()) else {
            return false;
        };

        while let Ok(frame) = frames.try_recv() {
            let SocketFrame::Text(text) = frame else {
                return false;
            };
            match protocol::decode_frame(&text) {
                EngineFrame::Ping(payload) => {
                    if send_text(client, &protocol::pong_for(payload)).is_err() {
                        return false;
                    }
                }
                EngineFrame::Close | EngineFrame::Disconnected => return false,
                _ => {}
            }
        }
        client.is_connected()
    }
}

impl EventTransport for EspSocketTransport {
    fn bind(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        self.disconnect();
        self.url = Some(protocol::socket_url(endpoint));
        Ok(())
    }

    fn emit(&mut self, event: &str, payload: &Value) -> Result<(), TransportError> {
        let frame = protocol::encode_event(event, payload)
            .map_err(|err| TransportError(format!("failed to encode event: {err}")))?;

        if !self.service_incoming() {
            debug!("socket session not open; connecting");
            self.disconnect();
            self.connect()?;
        }

        let Some(client) = self.client.as_mut() else {
            return Err(TransportError("socket not connected".into()));
        };
        if let Err(err) = send_text(client, &frame) {
            self.disconnect();
            return Err(err);
        }
        Ok(())
    }
}

fn send_text(client: &mut EspWebSocketClient<'static>, text: &str) -> Result<(), TransportError> {
    client
        .send(FrameType::Text(false), text.as_bytes())
        .map_err(|err| TransportError(format!("send failed: {err:?}")))
}
