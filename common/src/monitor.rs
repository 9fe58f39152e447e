use crate::address::DeviceAddress;
use crate::registry::{NameTable, SensorName};
use crate::types::{SensorPayload, SensorsPayload};

pub const MAX_SENSORS: usize = 16;
pub const UNKNOWN_NAME: &str = "unknown";

/// The 1-Wire bus as seen by the sampling loop. Implementations log their own
/// bus faults and report them as missing readings.
pub trait TemperatureBus {
    fn discover(&mut self) -> Vec<DeviceAddress>;

    /// Kicks off a conversion on every device before individual reads.
    fn start_conversion(&mut self) {}

    fn read_celsius(&mut self, address: &DeviceAddress) -> Option<f32>;
}

pub type Readings<T> = heapless::Vec<T, MAX_SENSORS>;

/// Runs one conversion and reads each address. Touches only the bus, so it can
/// run without holding the monitor.
pub fn read_bus<B: TemperatureBus + ?Sized>(
    bus: &mut B,
    addresses: &[DeviceAddress],
) -> Readings<Option<f32>> {
    let mut readings = Readings::new();
    if addresses.is_empty() {
        return readings;
    }

    bus.start_conversion();
    for address in addresses.iter().take(MAX_SENSORS) {
        let _ = readings.push(bus.read_celsius(address));
    }
    readings
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredSensor {
    pub address: DeviceAddress,
    pub name: Option<SensorName>,
    pub temp_c: Option<f32>,
}

impl MonitoredSensor {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_NAME)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Monitor {
    sensors: heapless::Vec<MonitoredSensor, MAX_SENSORS>,
    dropped: usize,
    sampled_at: Option<i64>,
}

impl Monitor {
    pub fn from_discovery(
        addresses: impl IntoIterator<Item = DeviceAddress>,
        names: &NameTable,
    ) -> Self {
        let mut monitor = Self::default();

        for address in addresses {
            if monitor.position(&address).is_some() {
                continue;
            }
            let sensor = MonitoredSensor {
                address,
                name: names.name_of(&address).cloned(),
                temp_c: None,
            };
            if monitor.sensors.push(sensor).is_err() {
                monitor.dropped += 1;
            }
        }

        monitor
    }

    pub fn sensors(&self) -> &[MonitoredSensor] {
        &self.sensors
    }

    /// Discovered devices that did not fit the table.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn sampled_at(&self) -> Option<i64> {
        self.sampled_at
    }

    pub fn position(&self, address: &DeviceAddress) -> Option<usize> {
        self.sensors.iter().position(|s| s.address == *address)
    }

    pub fn refresh_names(&mut self, names: &NameTable) {
        for sensor in self.sensors.iter_mut() {
            sensor.name = names.name_of(&sensor.address).cloned();
        }
    }

    pub fn addresses(&self) -> Readings<DeviceAddress> {
        self.sensors.iter().map(|s| s.address).collect()
    }

    /// Reads every sensor once and returns how many produced a value.
    pub fn sample<B: TemperatureBus + ?Sized>(
        &mut self,
        bus: &mut B,
        now_epoch: Option<i64>,
    ) -> usize {
        let readings = read_bus(bus, &self.addresses());
        self.apply_readings(&readings, now_epoch)
    }

    /// Stores readings taken by [`read_bus`] for the sensors returned by
    /// [`Monitor::addresses`], in the same order.
    pub fn apply_readings(&mut self, readings: &[Option<f32>], now_epoch: Option<i64>) -> usize {
        if self.sensors.is_empty() {
            return 0;
        }

        let mut valid = 0;
        for (index, sensor) in self.sensors.iter_mut().enumerate() {
            sensor.temp_c = readings
                .get(index)
                .copied()
                .flatten()
                .filter(|t| t.is_finite());
            if sensor.temp_c.is_some() {
                valid += 1;
            }
        }

        self.sampled_at = now_epoch;
        valid
    }

    pub fn snapshot(&self) -> SensorsPayload {
        SensorsPayload {
            count: self.sensors.len(),
            sampled_at: self.sampled_at,
            sensors: self
                .sensors
                .iter()
                .enumerate()
                .map(|(index, sensor)| SensorPayload {
                    index,
                    address: sensor.address,
                    family: sensor.address.family().as_str(),
                    name: sensor.display_name().to_string(),
                    temp_c: sensor.temp_c,
                    valid: sensor.temp_c.is_some(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::RegistryLayout;
    use crate::eeprom::MemoryEeprom;
    use crate::registry::NameRegistry;

    struct FakeBus {
        readings: HashMap<DeviceAddress, f32>,
        conversions: u32,
    }

    impl TemperatureBus for FakeBus {
        fn discover(&mut self) -> Vec<DeviceAddress> {
            let mut addresses: Vec<_> = self.readings.keys().copied().collect();
            addresses.sort();
            addresses
        }

        fn start_conversion(&mut self) {
            self.conversions += 1;
        }

        fn read_celsius(&mut self, address: &DeviceAddress) -> Option<f32> {
            self.readings.get(address).copied()
        }
    }

    fn address(n: u8) -> DeviceAddress {
        DeviceAddress::new([0x28, n, 0, 0, 0, 0, 0, 0xA0])
    }

    fn named(entries: &[(DeviceAddress, &str)]) -> NameTable {
        let mut registry =
            NameRegistry::new(MemoryEeprom::new(512), RegistryLayout::default()).unwrap();
        for (address, name) in entries {
            registry.add_or_update(address, name).unwrap();
        }
        registry.load()
    }

    #[test]
    fn unnamed_sensors_read_unknown() {
        let names = named(&[(address(2), "freezer")]);
        let monitor = Monitor::from_discovery([address(1), address(2)], &names);

        let display: Vec<&str> = monitor
            .sensors()
            .iter()
            .map(|s| s.display_name())
            .collect();
        assert_eq!(display, vec!["unknown", "freezer"]);
    }

    #[test]
    fn refresh_picks_up_renames() {
        let mut monitor = Monitor::from_discovery([address(1)], &NameTable::default());
        assert_eq!(monitor.sensors()[0].display_name(), UNKNOWN_NAME);

        monitor.refresh_names(&named(&[(address(1), "garage")]));
        assert_eq!(monitor.sensors()[0].display_name(), "garage");

        monitor.refresh_names(&NameTable::default());
        assert_eq!(monitor.sensors()[0].display_name(), UNKNOWN_NAME);
    }

    #[test]
    fn failed_reads_mark_sensor_invalid() {
        let mut bus = FakeBus {
            readings: HashMap::from([(address(1), 4.5), (address(3), f32::NAN)]),
            conversions: 0,
        };
        let mut monitor =
            Monitor::from_discovery([address(1), address(2), address(3)], &NameTable::default());

        let valid = monitor.sample(&mut bus, Some(1_700_000_000));

        assert_eq!(valid, 1);
        assert_eq!(bus.conversions, 1);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.sampled_at, Some(1_700_000_000));
        assert_eq!(snapshot.sensors[0].temp_c, Some(4.5));
        assert!(snapshot.sensors[0].valid);
        assert!(!snapshot.sensors[1].valid);
        assert!(!snapshot.sensors[2].valid);
    }

    #[test]
    fn readings_taken_outside_the_monitor_apply_in_order() {
        let mut bus = FakeBus {
            readings: HashMap::from([(address(1), -18.5), (address(2), 4.0)]),
            conversions: 0,
        };
        let mut monitor = Monitor::from_discovery([address(2), address(1)], &NameTable::default());

        let addresses = monitor.addresses();
        let readings = read_bus(&mut bus, &addresses);
        assert_eq!(bus.conversions, 1);
        assert_eq!(readings.as_slice(), &[Some(4.0), Some(-18.5)]);

        let valid = monitor.apply_readings(&readings, Some(42));
        assert_eq!(valid, 2);
        assert_eq!(monitor.sensors()[0].temp_c, Some(4.0));
        assert_eq!(monitor.sensors()[1].temp_c, Some(-18.5));
        assert_eq!(monitor.sampled_at(), Some(42));

        // Short reading lists leave the remaining sensors invalid.
        monitor.apply_readings(&[Some(5.0)], None);
        assert_eq!(monitor.sensors()[1].temp_c, None);
    }

    #[test]
    fn empty_bus_skips_conversion() {
        let mut bus = FakeBus {
            readings: HashMap::new(),
            conversions: 0,
        };
        assert!(read_bus(&mut bus, &[]).is_empty());
        assert_eq!(bus.conversions, 0);
    }

    #[test]
    fn discovery_dedups_and_bounds() {
        let addresses = (0..20).map(address).chain([address(0)]);
        let monitor = Monitor::from_discovery(addresses, &NameTable::default());

        assert_eq!(monitor.sensors().len(), MAX_SENSORS);
        assert_eq!(monitor.dropped(), 4);
    }

    #[test]
    fn snapshot_serializes_for_http_export() {
        let names = named(&[(address(1), "fridge")]);
        let mut bus = FakeBus {
            readings: HashMap::from([(address(1), 3.25)]),
            conversions: 0,
        };
        let mut monitor = Monitor::from_discovery(bus.discover(), &names);
        monitor.sample(&mut bus, None);

        let json = serde_json::to_value(monitor.snapshot()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "count": 1,
                "sampledAt": null,
                "sensors": [{
                    "index": 0,
                    "address": "28010000000000A0",
                    "family": "DS18B20",
                    "name": "fridge",
                    "tempC": 3.25,
                    "valid": true
                }]
            })
        );
    }
}
