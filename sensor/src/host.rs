use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use amv_common::{
    portal::PORTAL_HTML,
    protocol::{self, EngineFrame, CONNECT_FRAME},
    AnalogInput, Board, Endpoint, EventTransport, FsBackend, HumitureSensor, Node, NodeSettings,
    PortalError, PortalEvent, PortalForm, PortalMode, PortalService, PortalSession, RawHumiture,
    SensorFault, SensorSampler, TransportError,
};

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_PORTAL_BIND: &str = "0.0.0.0:8090";
const TRIGGER_FILE_NAME: &str = "provision.trigger";
const SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
struct HostOptions {
    data_dir: PathBuf,
    portal_bind: SocketAddr,
    trigger_file: PathBuf,
    network_joined: bool,
    settings: NodeSettings,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = HostOptions::from_env()?;
    info!(
        "simulated node: data in {}, setup portal on {}, touch {} to provision",
        options.data_dir.display(),
        options.portal_bind,
        options.trigger_file.display()
    );

    let handle = Handle::current();
    let node_task = tokio::task::spawn_blocking(move || run_node(options, handle));

    tokio::select! {
        result = node_task => result.context("node task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            std::process::exit(0);
        }
    }
}

fn run_node(options: HostOptions, handle: Handle) -> anyhow::Result<()> {
    loop {
        let sampler = SensorSampler::new(SimulatedHumiture::default(), SimulatedAnalog::default());
        let mut node = Node::new(
            HostBoard::new(options.trigger_file.clone()),
            FsBackend::in_dir(&options.data_dir),
            HostPortal::new(handle.clone(), options.portal_bind, options.network_joined),
            SocketIoTransport::new(handle.clone()),
            sampler,
            options.settings.clone(),
        );

        node.boot();
        node.run();
        info!("node restarted");
    }
}

impl HostOptions {
    fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("AMV_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        let portal_bind = std::env::var("AMV_PORTAL_BIND")
            .unwrap_or_else(|_| DEFAULT_PORTAL_BIND.to_string());
        let portal_bind: SocketAddr = portal_bind
            .parse()
            .with_context(|| format!("invalid AMV_PORTAL_BIND `{portal_bind}`"))?;

        let trigger_file = std::env::var("AMV_TRIGGER_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join(TRIGGER_FILE_NAME));

        let network_joined = std::env::var("AMV_NETWORK_JOINED")
            .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let mut settings = NodeSettings::default();
        if let Some(secs) = env_u64("AMV_PORTAL_TIMEOUT_SECS") {
            settings.portal_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(ms) = env_u64("AMV_SAMPLE_INTERVAL_MS") {
            settings.sample_interval_ms = ms;
        }
        settings.sanitize();

        Ok(Self {
            data_dir,
            portal_bind,
            trigger_file,
            network_joined,
            settings,
        })
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!("ignoring {key}=`{value}`: {err}");
            None
        }
    }
}

/// Button is "pressed" while the trigger file exists.
struct HostBoard {
    trigger_file: PathBuf,
    status: Option<bool>,
}

impl HostBoard {
    fn new(trigger_file: PathBuf) -> Self {
        Self {
            trigger_file,
            status: None,
        }
    }
}

impl Board for HostBoard {
    fn trigger_pressed(&mut self) -> bool {
        self.trigger_file.exists()
    }

    fn set_status(&mut self, on: bool) {
        if self.status != Some(on) {
            debug!("status led {}", if on { "on" } else { "off" });
            self.status = Some(on);
        }
    }

    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn restart(&mut self) {
        warn!("restarting node");
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[derive(Default)]
struct SimulatedHumiture {
    tick: u32,
}

impl HumitureSensor for SimulatedHumiture {
    fn read(&mut self) -> Result<RawHumiture, SensorFault> {
        self.tick = self.tick.wrapping_add(1);
        if self.tick % 20 == 0 {
            return Err(SensorFault::Checksum);
        }

        Ok(RawHumiture {
            temperature: 24.0 + (self.tick % 8) as f32 * 0.2,
            humidity: 55.0 + (self.tick % 6) as f32 * 0.5,
        })
    }
}

#[derive(Default)]
struct SimulatedAnalog {
    tick: u16,
}

impl AnalogInput for SimulatedAnalog {
    fn read_raw(&mut self) -> Result<u16, SensorFault> {
        self.tick = self.tick.wrapping_add(1);
        Ok(300 + (self.tick % 10) * 3)
    }
}

#[derive(Clone)]
struct PortalState {
    form: Arc<PortalForm>,
    submissions: mpsc::UnboundedSender<PortalForm>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ActivePortal {
    local_addr: Option<SocketAddr>,
    submissions: Option<mpsc::UnboundedReceiver<PortalForm>>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

/// Setup form served over HTTP on the host network. `network_joined` stands
/// in for a saved station credential.
struct HostPortal {
    handle: Handle,
    bind: SocketAddr,
    network_joined: bool,
    active: Option<ActivePortal>,
}

impl HostPortal {
    fn new(handle: Handle, bind: SocketAddr, network_joined: bool) -> Self {
        Self {
            handle,
            bind,
            network_joined,
            active: None,
        }
    }

    #[cfg(test)]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().and_then(|active| active.local_addr)
    }
}

impl PortalService for HostPortal {
    fn open(&mut self, session: &PortalSession) -> Result<(), PortalError> {
        self.close();

        if session.mode == PortalMode::AutoConnect && self.network_joined {
            self.active = Some(ActivePortal {
                local_addr: None,
                submissions: None,
                shutdown: None,
                server: None,
            });
            return Ok(());
        }

        let listener = self
            .handle
            .block_on(TcpListener::bind(self.bind))
            .map_err(|err| PortalError(format!("failed to bind {}: {err}", self.bind)))?;
        let local_addr = listener.local_addr().ok();

        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = PortalState {
            form: Arc::new(session.form.clone()),
            submissions: submit_tx,
        };

        let app = Router::new()
            .route("/", get(handle_index))
            .route("/api/device", get(handle_get_device).put(handle_put_device))
            .with_state(state);

        let server = self.handle.spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                warn!("setup portal server stopped: {err}");
            }
        });

        info!(
            "setup portal for `{}` listening on http://{}",
            session.ssid,
            local_addr.unwrap_or(self.bind)
        );

        self.active = Some(ActivePortal {
            local_addr,
            submissions: Some(submit_rx),
            shutdown: Some(shutdown_tx),
            server: Some(server),
        });
        Ok(())
    }

    fn poll(&mut self) -> PortalEvent {
        let Some(active) = self.active.as_mut() else {
            return PortalEvent::Pending;
        };

        match active.submissions.as_mut() {
            None => PortalEvent::Connected,
            Some(submissions) => match submissions.try_recv() {
                Ok(form) => PortalEvent::Submitted(form),
                Err(_) => PortalEvent::Pending,
            },
        }
    }

    fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        if let Some(shutdown) = active.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(server) = active.server.take() {
            if let Err(err) = self.handle.block_on(server) {
                warn!("setup portal task failed: {err}");
            }
        }
        if let Some(addr) = active.local_addr {
            debug!("setup portal on {addr} closed");
        }
    }
}

async fn handle_index() -> Html<&'static str> {
    Html(PORTAL_HTML)
}

async fn handle_get_device(State(state): State<PortalState>) -> Json<PortalForm> {
    Json(state.form.as_ref().clone())
}

async fn handle_put_device(
    State(state): State<PortalState>,
    Json(form): Json<PortalForm>,
) -> axum::response::Response {
    if state.submissions.send(form).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "setup session has ended");
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "saved": true })),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Socket.IO client over a websocket, driven from the blocking node thread.
struct SocketIoTransport {
    handle: Handle,
    url: Option<String>,
    socket: Option<Socket>,
}

impl SocketIoTransport {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            url: None,
            socket: None,
        }
    }

    async fn send_frame(&mut self, frame: String) -> Result<(), TransportError> {
        if let Some(socket) = self.socket.as_mut() {
            if let Err(err) = service_incoming(socket).await {
                debug!("dropping stale socket: {err}");
                self.socket = None;
            }
        }

        if self.socket.is_none() {
            let url = self
                .url
                .clone()
                .ok_or_else(|| TransportError("transport has no endpoint".into()))?;
            self.socket = Some(open_session(&url).await?);
        }

        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError("socket not connected".into()));
        };

        if let Err(err) = socket.send(Message::Text(frame)).await {
            self.socket = None;
            return Err(TransportError(format!("send failed: {err}")));
        }
        Ok(())
    }
}

impl EventTransport for SocketIoTransport {
    fn bind(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if let Some(mut socket) = self.socket.take() {
            let _ = self.handle.block_on(socket.close(None));
        }
        self.url = Some(protocol::socket_url(endpoint));
        Ok(())
    }

    fn emit(&mut self, event: &str, payload: &Value) -> Result<(), TransportError> {
        let frame = protocol::encode_event(event, payload)
            .map_err(|err| TransportError(format!("failed to encode event: {err}")))?;
        let handle = self.handle.clone();
        handle.block_on(self.send_frame(frame))
    }
}

async fn open_session(url: &str) -> Result<Socket, TransportError> {
    let connect = tokio::time::timeout(SOCKET_CONNECT_TIMEOUT, async {
        let (mut socket, _) = connect_async(url)
            .await
            .map_err(|err| TransportError(format!("connect to {url} failed: {err}")))?;

        while let Some(message) = socket.next().await {
            let message = message.map_err(|err| TransportError(err.to_string()))?;
            let Message::Text(text) = message else {
                continue;
            };

            match protocol::decode_frame(&text) {
                EngineFrame::Open(_) => send_text(&mut socket, CONNECT_FRAME.to_string()).await?,
                EngineFrame::Ping(payload) => {
                    send_text(&mut socket, protocol::pong_for(payload)).await?
                }
                EngineFrame::Connected => {
                    info!("socket session open at {url}");
                    return Ok(socket);
                }
                EngineFrame::ConnectError(reason) => {
                    return Err(TransportError(format!("server refused session: {reason}")));
                }
                EngineFrame::Close | EngineFrame::Disconnected => break,
                _ => {}
            }
        }

        Err(TransportError("server closed during handshake".into()))
    });

    connect
        .await
        .map_err(|_| TransportError(format!("handshake with {url} timed out")))?
}

/// Answers pings and notices a closed session without waiting for traffic.
async fn service_incoming(socket: &mut Socket) -> Result<(), TransportError> {
    while let Some(next) = socket.next().now_or_never() {
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Err(TransportError(err.to_string())),
            None => return Err(TransportError("socket closed".into())),
        };

        let Message::Text(text) = message else {
            continue;
        };
        match protocol::decode_frame(&text) {
            EngineFrame::Ping(payload) => send_text(socket, protocol::pong_for(payload)).await?,
            EngineFrame::Close | EngineFrame::Disconnected => {
                return Err(TransportError("server ended the session".into()));
            }
            _ => {}
        }
    }
    Ok(())
}

async fn send_text(socket: &mut Socket, text: String) -> Result<(), TransportError> {
    socket
        .send(Message::Text(text))
        .await
        .map_err(|err| TransportError(err.to_string()))
}
