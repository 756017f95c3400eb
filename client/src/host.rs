use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::mpsc,
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use heatzone_common::{
    pacing::SLEEP_STEP, ActuationState, ClientConfig, ClientRole, Datagram, Deadline, FileStorage,
    Framing, Heating, LocalPanel, Ports, RefreshFlag, RelayDriver, RelayError, RelayVariant,
    ReportSink, RuntimeConfig, SyncAction, SyncNode, ZoneView,
};

const RECV_BUFFER: usize = 512;
const DISPLAY_POLL: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct AppState {
    heating: Arc<Heating>,
    role: Arc<ClientRole>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct PanelView {
    zone: String,
    #[serde(flatten)]
    panel: LocalPanel,
    #[serde(rename = "hcOk")]
    hc_ok: bool,
    zones: Vec<ZoneView>,
}

/// Clients only mirror state; relays belong to the controller.
struct NoRelay;

impl RelayDriver for NoRelay {
    fn variant(&self) -> RelayVariant {
        RelayVariant::Direct
    }

    fn set(&self, relay: u8, _state: ActuationState) -> Result<(), RelayError> {
        Err(RelayError {
            relay,
            message: "client nodes drive no relays".to_string(),
        })
    }
}

/// Hands local snapshots to the socket task without blocking the caller.
struct ChannelReports(mpsc::UnboundedSender<Datagram>);

impl ReportSink for ChannelReports {
    fn push(&self, datagram: Datagram) {
        if self.0.send(datagram).is_err() {
            debug!("report dropped, sender task gone");
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("HEATZONE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.heatzone"));
    let mut runtime = load_runtime_config(&data_dir.join("runtime.json"))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config: {err:#}");
            RuntimeConfig::default()
        });
    runtime.apply_overrides(|key| std::env::var(key).ok());
    runtime.sanitize();

    let identity = runtime.node.hostname.clone();
    let controller_ip = runtime
        .sync
        .controller_ip
        .context("controller address missing, set HEATZONE_CONTROLLER_IP")?;
    let udp_port = runtime.sync.udp_port;
    let controller = SocketAddr::new(controller_ip, udp_port);

    let kv_path = data_dir.join("kv.json");
    let storage = FileStorage::open(kv_path.as_path())
        .with_context(|| format!("failed to open key-value store {}", kv_path.display()))?;
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let display = Arc::new(RefreshFlag::default());
    let heating = Arc::new(Heating::new(
        runtime.heating.clone(),
        Ports {
            storage: Arc::new(storage),
            relay: Arc::new(NoRelay),
            display: display.clone(),
            reports: Arc::new(ChannelReports(report_tx)),
        },
        vec![identity.clone()],
    ));
    let framing = Arc::new(
        Framing::from_config(runtime.sync.encryption.as_ref())
            .context("invalid udp encryption material")?,
    );
    let role = Arc::new(ClientRole::new(&identity, &heating, display.clone()));
    let node = Arc::new(SyncNode::new(heating.clone(), framing, role.clone(), udp_port));

    let socket = UdpSocket::bind(("0.0.0.0", udp_port))
        .await
        .with_context(|| format!("failed to bind udp socket on port {udp_port}"))?;

    let mut services = Services {
        node,
        role: role.clone(),
        socket: Arc::new(socket),
        controller,
        config: runtime.client.clone(),
        sleep_mode: runtime.heating.sleep_mode,
        display,
        reports: Some(report_rx),
        handles: Vec::new(),
    };
    services.run(true);

    let app = Router::new()
        .route("/api/panel", get(handle_get_panel))
        .route("/api/setpoint", post(handle_request_setpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { heating, role });

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.node.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind client server at {addr}"))?;

    info!("client `{identity}` listening on http://{addr}, controller at {controller}");
    let served = axum::serve(listener, app).await;
    services.stop();
    served?;
    Ok(())
}

/// The client's background loops, started and stopped as one unit.
struct Services {
    node: Arc<SyncNode>,
    role: Arc<ClientRole>,
    socket: Arc<UdpSocket>,
    controller: SocketAddr,
    config: ClientConfig,
    sleep_mode: bool,
    display: Arc<RefreshFlag>,
    reports: Option<mpsc::UnboundedReceiver<Datagram>>,
    handles: Vec<JoinHandle<()>>,
}

impl Services {
    fn run(&mut self, enabled: bool) {
        if !enabled {
            info!("heating services disabled");
            self.stop();
            return;
        }
        if !self.handles.is_empty() {
            return;
        }

        self.handles.push(spawn_udp_loop(self.node.clone(), self.socket.clone()));
        self.handles.push(spawn_update_loop(
            self.node.clone(),
            self.role.clone(),
            self.socket.clone(),
            self.controller,
            self.config.clone(),
            self.sleep_mode,
        ));
        self.handles.push(spawn_sensor_loop(
            self.node.heating().clone(),
            self.role.identity().to_string(),
            Duration::from_millis(self.config.sample_interval_ms),
        ));
        self.handles.push(spawn_display_loop(self.role.clone(), self.display.clone()));
        if let Some(reports) = self.reports.take() {
            self.handles.push(spawn_report_loop(
                self.node.clone(),
                self.socket.clone(),
                self.controller,
                reports,
            ));
        }
    }

    fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

fn spawn_udp_loop(node: Arc<SyncNode>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!("udp receive failed: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            for action in node.handle(&buf[..len], from, monotonic_ms()) {
                match action {
                    SyncAction::Send { to, payload } => send(&socket, to, &payload).await,
                    SyncAction::Reboot { from } => {
                        warn!("restarting on request from {from}");
                        std::process::exit(0);
                    }
                }
            }
        }
    })
}

/// Pushes pending setpoints and pulls every zone from the controller.
fn spawn_update_loop(
    node: Arc<SyncNode>,
    role: Arc<ClientRole>,
    socket: Arc<UdpSocket>,
    controller: SocketAddr,
    config: ClientConfig,
    sleep_mode: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (outgoing, wait) = role.update_plan(&config);
            for datagram in &outgoing {
                send(&socket, controller, &node.seal(datagram)).await;
            }

            if sleep_mode {
                wait_until(Deadline::after(Utc::now(), wait)).await;
            } else {
                tokio::time::sleep(wait).await;
            }
        }
    })
}

/// Simulated local sensor. Readings go through the engine, which queues the snapshot push.
fn spawn_sensor_loop(heating: Arc<Heating>, identity: String, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick: u64 = 0;
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            tick = tick.saturating_add(1);

            // Hardware integration point: swap for a DS18B20 read on real nodes.
            let reading = 19.0 + ((tick % 8) as f32 * 0.2);
            heating.record_sample(&identity, reading, false, monotonic_ms());
        }
    })
}

fn spawn_report_loop(
    node: Arc<SyncNode>,
    socket: Arc<UdpSocket>,
    controller: SocketAddr,
    mut reports: mpsc::UnboundedReceiver<Datagram>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            send(&socket, controller, &node.seal(&report)).await;
        }
    })
}

fn spawn_display_loop(role: Arc<ClientRole>, display: Arc<RefreshFlag>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DISPLAY_POLL);
        loop {
            interval.tick().await;
            if !display.take() {
                continue;
            }
            let panel = role.panel();
            info!(
                "display: value {} setpoint {}{}",
                format_reading(panel.value),
                format_reading(panel.setpoint),
                panel
                    .pending
                    .map(|pending| format!(" (pending {pending:.1})"))
                    .unwrap_or_default()
            );
        }
    })
}

async fn send(socket: &UdpSocket, to: SocketAddr, payload: &[u8]) {
    if let Err(err) = socket.send_to(payload, to).await {
        warn!("udp send to {to} failed: {err}");
    }
}

async fn wait_until(deadline: Deadline) {
    while let Some(step) = deadline.remaining(Utc::now(), SLEEP_STEP) {
        tokio::time::sleep(step).await;
    }
}

async fn handle_get_panel(State(state): State<AppState>) -> impl IntoResponse {
    Json(PanelView {
        zone: state.role.identity().to_string(),
        panel: state.role.panel(),
        hc_ok: state.heating.hc_ok(),
        zones: state.heating.iter().map(|zone| ZoneView::from(&zone)).collect(),
    })
}

async fn handle_request_setpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(setpoint) = value.parse::<f32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    if let Err(err) = state.role.request_setpoint(setpoint) {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    handle_get_panel(State(state)).await.into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn format_reading(reading: Option<f32>) -> String {
    reading
        .map(|value| format!("{value:.1}"))
        .unwrap_or_else(|| "--.-".to_string())
}

async fn load_runtime_config(path: &std::path::Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
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
