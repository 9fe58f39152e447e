use std::{
    io::{BufRead, ErrorKind},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;

use pannan_common::{
    api::{apply_name_update, names_payload, NameUpdateRequest},
    config::NetworkConfig,
    handle_line, read_bus, ConsoleReply, DeviceAddress, Eeprom, MemoryEeprom, Monitor,
    NameRegistry, RuntimeConfig, StorageError, TemperatureBus,
};

const NVS_NAMESPACE: &str = "pannan";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_EEPROM_KEY: &str = "eeprom";
const NVS_BLOB_MAX: usize = 4096;

const ONE_WIRE_PIN: i32 = 2;

const MAX_HTTP_BODY: usize = 1024;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const CONSOLE_POLL_MS: u64 = 50;
// Anything earlier means SNTP has not set the clock yet.
const MIN_SYNCED_EPOCH: i64 = 1_600_000_000;

type SharedRegistry = Arc<Mutex<NameRegistry<NvsEeprom>>>;
type SharedMonitor = Arc<Mutex<Monitor>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// EEPROM emulation: a RAM image mirrored to one NVS blob on commit.
struct NvsEeprom {
    nvs: EspNvs<NvsDefault>,
    image: MemoryEeprom,
}

struct OneWireBus {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    delay: Ets,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut bus =
        OneWireBus::new(pins.gpio2.downgrade()).context("failed to initialize one-wire bus")?;

    let eeprom = NvsEeprom::open(nvs_partition.clone(), runtime.monitor.eeprom_size)
        .context("failed to open eeprom image")?;
    let registry =
        NameRegistry::new(eeprom, runtime.registry).context("registry layout does not fit")?;

    info!("locating devices on GPIO{ONE_WIRE_PIN}...");
    let addresses = bus.discover();
    info!("found {} devices", addresses.len());

    let monitor = Monitor::from_discovery(addresses, &registry.load());
    if monitor.dropped() > 0 {
        warn!("ignoring {} devices beyond the sensor table", monitor.dropped());
    }
    for sensor in monitor.sensors() {
        info!("sensor {} -> {}", sensor.address, sensor.display_name());
    }

    let registry: SharedRegistry = Arc::new(Mutex::new(registry));
    let monitor: SharedMonitor = Arc::new(Mutex::new(monitor));

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            warn!("wifi unavailable ({err:#}); serving console only");
            None
        }
    };

    let server = match wifi {
        Some(_) => Some(create_http_server(registry.clone(), monitor.clone())?),
        None => None,
    };

    spawn_console(registry.clone(), monitor.clone())?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let period = Duration::from_millis(runtime.monitor.sample_interval_ms);

    loop {
        let now = chrono::Utc::now().timestamp();
        let sampled_at = (now >= MIN_SYNCED_EPOCH).then_some(now);

        // The conversion delay and bus reads run unlocked so HTTP and the
        // console never wait on the bus.
        let addresses = lock(&monitor)?.addresses();
        let readings = read_bus(&mut bus, &addresses);

        let (valid, total) = {
            let mut monitor = lock(&monitor)?;
            let valid = monitor.apply_readings(&readings, sampled_at);
            (valid, monitor.sensors().len())
        };
        if valid < total {
            warn!("{} of {total} sensors returned no reading", total - valid);
        }

        thread::sleep(period);
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock)?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BLOB_MAX];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl NvsEeprom {
    fn open(partition: EspDefaultNvsPartition, capacity: usize) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BLOB_MAX];

        let bytes = match nvs.get_blob(NVS_EEPROM_KEY, &mut buffer)? {
            Some(stored) => stored.to_vec(),
            None => {
                info!("no eeprom image in NVS; starting blank");
                Vec::new()
            }
        };

        Ok(Self {
            nvs,
            image: MemoryEeprom::from_image(bytes, capacity),
        })
    }
}

impl Eeprom for NvsEeprom {
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

        self.nvs
            .set_blob(NVS_EEPROM_KEY, self.image.as_bytes())
            .map_err(|err| StorageError::Commit(format!("{err:?}")))?;
        self.image.mark_clean();
        Ok(())
    }
}

impl OneWireBus {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        Ok(Self {
            one_wire,
            delay: Ets,
        })
    }
}

impl TemperatureBus for OneWireBus {
    fn discover(&mut self) -> Vec<DeviceAddress> {
        let mut found = Vec::new();

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                // ROM code is transmitted family byte first.
                Ok(address) => {
                    let address = DeviceAddress::new(address.0.to_le_bytes());
                    if !address.family().is_readable() {
                        info!(
                            "{address} is a {} device; it will be listed without readings",
                            address.family().as_str()
                        );
                    }
                    found.push(address);
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        found
    }

    fn start_conversion(&mut self) {
        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start temperature conversion: {err:?}");
            return;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);
    }

    fn read_celsius(&mut self, address: &DeviceAddress) -> Option<f32> {
        if !address.family().is_readable() {
            return None;
        }

        let rom = Address(u64::from_le_bytes(*address.as_bytes()));

        let sensor = match Ds18b20::new::<core::convert::Infallible>(rom) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("{address} is not a DS18B20: {err:?}");
                return None;
            }
        };

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read {address}: {err:?}");
                None
            }
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(anyhow::Error::from(err).context("all wifi connect attempts failed"));
    }

    Ok(esp_wifi)
}

fn create_http_server(
    registry: SharedRegistry,
    monitor: SharedMonitor,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let monitor = monitor.clone();
        server.fn_handler::<anyhow::Error, _>("/api/sensors", Method::Get, move |req| {
            let payload = lock(&monitor)?.snapshot();
            write_json(req, &payload)
        })?;
    }

    {
        let registry = registry.clone();
        server.fn_handler::<anyhow::Error, _>("/api/names", Method::Get, move |req| {
            let payload = {
                let registry = lock(&registry)?;
                names_payload(&registry.load(), registry.layout().max_slots)
            };
            write_json(req, &payload)
        })?;
    }

    {
        let registry = registry.clone();
        let monitor = monitor.clone();
        server.fn_handler::<anyhow::Error, _>("/api/names", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<NameUpdateRequest>(&body) else {
                return write_error(req, 400, "invalid name payload");
            };

            let result = {
                let mut registry = lock(&registry)?;
                let result = apply_name_update(&mut *registry, &request);
                if result.is_ok() {
                    let names = registry.load();
                    lock(&monitor)?.refresh_names(&names);
                }
                result
            };

            match result {
                Ok(payload) => {
                    info!(
                        "name '{}' stored for {} at index {}",
                        request.name.trim_end(),
                        request.address.trim(),
                        payload.index
                    );
                    write_json(req, &payload)
                }
                Err(err) => {
                    warn!("name update rejected: {err}");
                    write_error(req, err.status_code(), &err.to_string())
                }
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/names/clear", Method::Post, move |req| {
        {
            let mut registry = lock(&registry)?;
            if let Err(err) = registry.clear() {
                warn!("failed to clear names: {err:#}");
                drop(registry);
                return write_error(req, 500, "Failed to clear names");
            }
            let names = registry.load();
            lock(&monitor)?.refresh_names(&names);
        }

        info!("all sensor names cleared");
        let payload = serde_json::json!({ "cleared": true });
        write_json(req, &payload)
    })?;

    Ok(server)
}

fn spawn_console(registry: SharedRegistry, monitor: SharedMonitor) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("console".to_string())
        .stack_size(8192)
        .spawn(move || console_loop(&registry, &monitor))
        .context("failed to spawn console thread")?;
    Ok(())
}

fn console_loop(registry: &SharedRegistry, monitor: &SharedMonitor) {
    let stdin = std::io::stdin();
    let mut line = String::new();
    println!("Started");

    loop {
        match stdin.lock().read_line(&mut line) {
            Ok(_) if line.ends_with('\n') => {
                match apply_console_line(registry, monitor, &line) {
                    Ok(reply) => {
                        for out in reply.lines {
                            println!("{out}");
                        }
                    }
                    Err(err) => warn!("console command failed: {err:#}"),
                }
                line.clear();
            }
            // Partial line or nothing buffered on the UART yet.
            Ok(_) => thread::sleep(Duration::from_millis(CONSOLE_POLL_MS)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(CONSOLE_POLL_MS))
            }
            Err(err) => {
                warn!("console read failed: {err}");
                line.clear();
                thread::sleep(Duration::from_millis(CONSOLE_POLL_MS));
            }
        }
    }
}

fn apply_console_line(
    registry: &SharedRegistry,
    monitor: &SharedMonitor,
    line: &str,
) -> anyhow::Result<ConsoleReply> {
    let mut registry = lock(registry)?;
    let reply = handle_line(&mut *registry, line);

    if reply.names_changed {
        let names = registry.load();
        lock(monitor)?.refresh_names(&names);
    }

    Ok(reply)
}

fn lock<T>(mutex: &Mutex<T>) -> anyhow::Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("lock poisoned"))
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
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

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}
