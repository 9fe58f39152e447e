use std::{io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::Mutex,
};
use tracing::{info, warn};

use pannan_common::{
    api::{apply_name_update, names_payload, NameUpdateRequest},
    handle_line, read_bus, ConsoleReply, DeviceAddress, Eeprom, MemoryEeprom, Monitor,
    NameRegistry, RuntimeConfig, StorageError, TemperatureBus,
};

const DEFAULT_SIM_SENSORS: &str = "281A2B030000800C,2865E80500000045,10C3F2470208001B";

// Lock order is always registry, then monitor.
#[derive(Clone)]
struct AppState {
    registry: Arc<Mutex<NameRegistry<FileEeprom>>>,
    monitor: Arc<Mutex<Monitor>>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    eeprom_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// EEPROM image kept in RAM and written back to a file on commit. Commits
/// block, so async callers go through `block_in_place`.
struct FileEeprom {
    path: PathBuf,
    image: MemoryEeprom,
}

/// Stand-in for the 1-Wire bus when running off-device.
struct SimulatedBus {
    addresses: Vec<DeviceAddress>,
    tick: u64,
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
    runtime.sanitize();

    let eeprom = FileEeprom::open(store.eeprom_path.as_ref().clone(), runtime.monitor.eeprom_size)
        .context("failed to open eeprom image")?;
    let registry =
        NameRegistry::new(eeprom, runtime.registry).context("registry layout does not fit")?;

    let sim_sensors =
        std::env::var("PANNAN_SIM_SENSORS").unwrap_or_else(|_| DEFAULT_SIM_SENSORS.to_string());
    let mut bus = SimulatedBus::parse(&sim_sensors).context("invalid PANNAN_SIM_SENSORS")?;

    info!("locating devices...");
    let addresses = bus.discover();
    info!("found {} devices", addresses.len());

    let names = registry.load();
    info!(
        "{} of {} name slots in use",
        names.count(),
        runtime.registry.max_slots
    );

    let monitor = Monitor::from_discovery(addresses, &names);
    if monitor.dropped() > 0 {
        warn!("ignoring {} devices beyond the sensor table", monitor.dropped());
    }
    for sensor in monitor.sensors() {
        info!(
            "sensor {} ({}) -> {}",
            sensor.address,
            sensor.address.family().as_str(),
            sensor.display_name()
        );
    }

    let app_state = AppState {
        registry: Arc::new(Mutex::new(registry)),
        monitor: Arc::new(Mutex::new(monitor)),
    };

    spawn_sample_loop(
        app_state.clone(),
        bus,
        Duration::from_millis(runtime.monitor.sample_interval_ms),
    );
    spawn_console_loop(app_state.clone());

    let app = router(app_state);

    let port = std::env::var("PANNAN_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sensor server at {addr}"))?;

    info!("sensor node listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/sensors", get(handle_get_sensors))
        .route("/api/names", get(handle_get_names).post(handle_post_name))
        .route("/api/names/clear", post(handle_clear_names))
        .with_state(app_state)
}

fn spawn_sample_loop(app_state: AppState, mut bus: SimulatedBus, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp();

            let addresses = app_state.monitor.lock().await.addresses();
            let readings = read_bus(&mut bus, &addresses);

            let (valid, total) = {
                let mut monitor = app_state.monitor.lock().await;
                let valid = monitor.apply_readings(&readings, Some(now));
                (valid, monitor.sensors().len())
            };

            if valid < total {
                warn!("{} of {total} sensors returned no reading", total - valid);
            }
        }
    });
}

fn spawn_console_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Started");

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let reply = apply_console_line(&app_state, &line).await;
                    for line in reply.lines {
                        println!("{line}");
                    }
                }
                Ok(None) => {
                    info!("console input closed");
                    break;
                }
                Err(err) => {
                    warn!("console read error: {err}");
                    break;
                }
            }
        }
    });
}

async fn apply_console_line(app_state: &AppState, line: &str) -> ConsoleReply {
    let mut registry = app_state.registry.lock().await;
    let reply = tokio::task::block_in_place(|| handle_line(&mut *registry, line));

    if reply.names_changed {
        let names = registry.load();
        app_state.monitor.lock().await.refresh_names(&names);
    }

    reply
}

async fn handle_get_sensors(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.monitor.lock().await.snapshot();
    Json(snapshot)
}

async fn handle_get_names(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry.lock().await;
    let payload = names_payload(&registry.load(), registry.layout().max_slots);
    Json(payload)
}

async fn handle_post_name(
    State(state): State<AppState>,
    payload: Result<Json<NameUpdateRequest>, JsonRejection>,
) -> axum::response::Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("name update rejected: {}", rejection.body_text());
            return error_response(StatusCode::BAD_REQUEST, "invalid name payload");
        }
    };

    let mut registry = state.registry.lock().await;

    match tokio::task::block_in_place(|| apply_name_update(&mut *registry, &request)) {
        Ok(payload) => {
            info!(
                "name '{}' stored for {} at index {}",
                request.name.trim_end(),
                request.address.trim(),
                payload.index
            );
            let names = registry.load();
            state.monitor.lock().await.refresh_names(&names);
            Json(payload).into_response()
        }
        Err(err) => {
            warn!("name update rejected: {err}");
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            error_response(status, &err.to_string())
        }
    }
}

async fn handle_clear_names(State(state): State<AppState>) -> axum::response::Response {
    let mut registry = state.registry.lock().await;

    if let Err(err) = tokio::task::block_in_place(|| registry.clear()) {
        warn!("failed to clear names: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to clear names");
    }

    info!("all sensor names cleared");
    let names = registry.load();
    state.monitor.lock().await.refresh_names(&names);
    Json(serde_json::json!({ "cleared": true })).into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("PANNAN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.pannan"));
        Self::in_dir(data_dir)
    }

    fn in_dir(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            eeprom_path: Arc::new(data_dir.join("eeprom.bin")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl FileEeprom {
    fn open(path: PathBuf, capacity: usize) -> anyhow::Result<Self> {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no eeprom image at {}; starting blank", path.display());
                Vec::new()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        if bytes.len() > capacity {
            warn!(
                "eeprom image {} is {} bytes; only the first {capacity} are used",
                path.display(),
                bytes.len()
            );
        }

        Ok(Self {
            path,
            image: MemoryEeprom::from_image(bytes, capacity),
        })
    }
}

impl Eeprom for FileEeprom {
    fn capacity(&self) -> usize {
        self.image.capacity()
    }

    fn read_byte(&self, offset: usize) -> u8 {
        self.image.read_byte(offset)
    }

    fn write_byte(&mut self, offset: usize, value: u8) {
        self.image.write_byte(offset, value)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if !self.image.is_dirty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StorageError::Commit(format!("{}: {err}", parent.display())))?;
        }
        std::fs::write(&self.path, self.image.as_bytes())
            .map_err(|err| StorageError::Commit(format!("{}: {err}", self.path.display())))?;

        self.image.mark_clean();
        Ok(())
    }
}

impl SimulatedBus {
    fn parse(list: &str) -> anyhow::Result<Self> {
        let addresses = list
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse::<DeviceAddress>()
                    .with_context(|| format!("bad sensor address '{item}'"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { addresses, tick: 0 })
    }
}

impl TemperatureBus for SimulatedBus {
    fn discover(&mut self) -> Vec<DeviceAddress> {
        self.addresses.clone()
    }

    fn start_conversion(&mut self) {
        self.tick = self.tick.saturating_add(1);
    }

    fn read_celsius(&mut self, address: &DeviceAddress) -> Option<f32> {
        if !address.family().is_readable() {
            return None;
        }

        // Offset by bus position so each simulated sensor reads differently.
        let position = self.addresses.iter().position(|a| a == address)?;
        Some(4.0 + position as f32 * 6.0 + (self.tick % 8) as f32 * 0.25)
    }
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
