use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use reqwest::StatusCode;
use tokio::{net::TcpListener, net::UdpSocket, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use heatzone_common::{
    pacing::SLEEP_STEP, ControllerRole, Deadline, FileStorage, Framing, HcPoll, Heating, NoReports,
    Ports, RefreshFlag, RuntimeConfig, SyncAction, SyncNode,
};

use crate::{api, relay::LogRelay};

const HC_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BUFFER: usize = 512;

#[derive(Clone)]
pub struct AppState {
    pub heating: Arc<Heating>,
    pub framing: Arc<Framing>,
    pub runtime: Arc<Mutex<RuntimeConfig>>,
    pub store: AppStore,
}

#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    kv_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.apply_overrides(|key| std::env::var(key).ok());
    runtime.sanitize();

    let storage = FileStorage::open(store.kv_path.as_path())
        .with_context(|| format!("failed to open key-value store {}", store.kv_path.display()))?;
    let heating = Arc::new(Heating::new(
        runtime.heating.clone(),
        Ports {
            storage: Arc::new(storage),
            relay: Arc::new(LogRelay::new(runtime.node.relay_variant)),
            display: Arc::new(RefreshFlag::default()),
            reports: Arc::new(NoReports),
        },
        runtime.node.local_zones.clone(),
    ));
    let framing = Arc::new(
        Framing::from_config(runtime.sync.encryption.as_ref())
            .context("invalid udp encryption material")?,
    );

    let udp_port = runtime.sync.udp_port;
    let socket = UdpSocket::bind(("0.0.0.0", udp_port))
        .await
        .with_context(|| format!("failed to bind udp socket on port {udp_port}"))?;
    let node = Arc::new(SyncNode::new(
        heating.clone(),
        framing.clone(),
        Arc::new(ControllerRole),
        udp_port,
    ));
    let http = reqwest::Client::builder()
        .timeout(HC_TIMEOUT)
        .build()
        .context("failed to build hc client")?;

    let http_port = runtime.node.http_port;
    let app_state = AppState {
        heating,
        framing,
        runtime: Arc::new(Mutex::new(runtime)),
        store,
    };

    let mut services = Services::new(node, Arc::new(socket), http);
    services.run(true);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}, udp port {udp_port}");
    let served = axum::serve(listener, api::router(app_state)).await;
    services.stop();
    served?;
    Ok(())
}

/// The controller's background loops, started and stopped as one unit.
pub struct Services {
    node: Arc<SyncNode>,
    socket: Arc<UdpSocket>,
    http: reqwest::Client,
    handles: Vec<JoinHandle<()>>,
}

impl Services {
    pub fn new(node: Arc<SyncNode>, socket: Arc<UdpSocket>, http: reqwest::Client) -> Self {
        Self {
            node,
            socket,
            http,
            handles: Vec::new(),
        }
    }

    pub fn run(&mut self, enabled: bool) {
        if !enabled {
            info!("heating services disabled");
            self.stop();
            return;
        }
        if !self.handles.is_empty() {
            return;
        }
        self.handles.push(spawn_udp_loop(self.node.clone(), self.socket.clone()));
        self.handles.push(spawn_monitor_loop(self.node.heating().clone(), self.http.clone()));
    }

    pub fn stop(&mut self) {
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
            let actions = node.handle(&buf[..len], from, monotonic_ms());
            execute_sync_actions(&socket, actions).await;
        }
    })
}

async fn execute_sync_actions(socket: &UdpSocket, actions: Vec<SyncAction>) {
    for action in actions {
        match action {
            SyncAction::Send { to, payload } => {
                if let Err(err) = socket.send_to(&payload, to).await {
                    warn!("udp send to {to} failed: {err}");
                }
            }
            SyncAction::Reboot { from } => {
                warn!("restarting on request from {from}");
                std::process::exit(0);
            }
        }
    }
}

fn spawn_monitor_loop(heating: Arc<Heating>, http: reqwest::Client) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(heating.config().sweep_interval_ms);
        let sleep_mode = heating.config().sleep_mode;
        let mut ticker = tokio::time::interval(interval);

        loop {
            if sleep_mode {
                wait_until(Deadline::after(Utc::now(), interval)).await;
            } else {
                ticker.tick().await;
            }

            let report = heating.age_sweep(monotonic_ms());
            debug!(
                "aging sweep: {} zones heating, {} erased",
                report.zones_on,
                report.erased.len()
            );

            let ok = match report.hc {
                HcPoll::Fetch(url) => poll_hc(&http, &url).await,
                HcPoll::Unconfigured => true,
                HcPoll::Unreadable => false,
            };
            heating.apply_hc_result(ok, monotonic_ms());
        }
    })
}

async fn poll_hc(http: &reqwest::Client, url: &str) -> bool {
    let outcome = http.get(url).send().await.map(|response| response.status());
    hc_granted(url, outcome)
}

/// Only a 200 authorizes heating; the body is not inspected.
fn hc_granted<E: std::fmt::Display>(url: &str, outcome: Result<StatusCode, E>) -> bool {
    match outcome {
        Ok(status) if status == StatusCode::OK => true,
        Ok(status) => {
            warn!("hc refused heating with status {status}");
            false
        }
        Err(err) => {
            warn!("hc request to {url} failed: {err}");
            false
        }
    }
}

/// Sleeps towards a wall-clock deadline in short steps so a suspend cannot stretch the wait.
pub async fn wait_until(deadline: Deadline) {
    while let Some(step) = deadline.remaining(Utc::now(), SLEEP_STEP) {
        tokio::time::sleep(step).await;
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATZONE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heatzone"));
        Self::in_dir(data_dir)
    }

    pub fn in_dir(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            kv_path: Arc::new(data_dir.join("kv.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
