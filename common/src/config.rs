use serde::{Deserialize, Serialize};

use crate::address::ADDR_SIZE;

/// Upper bound for `RegistryLayout::max_slots`; sizes the in-RAM tables.
pub const MAX_SLOTS_LIMIT: usize = 16;
/// Upper bound for `RegistryLayout::name_capacity`.
pub const MAX_NAME_CAPACITY: usize = 16;
pub const MIN_NAME_CAPACITY: usize = 2;
pub const MAX_RECORD_SIZE: usize = 1 + ADDR_SIZE + MAX_NAME_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryLayout {
    pub max_slots: usize,
    pub name_capacity: usize,
}

impl Default for RegistryLayout {
    fn default() -> Self {
        Self {
            max_slots: 12,
            name_capacity: 10,
        }
    }
}

impl RegistryLayout {
    /// Used flag + address + name.
    pub fn record_size(&self) -> usize {
        1 + ADDR_SIZE + self.name_capacity
    }

    pub fn slot_offset(&self, index: usize) -> usize {
        index * self.record_size()
    }

    /// Bytes of storage the whole table occupies.
    pub fn storage_size(&self) -> usize {
        self.max_slots * self.record_size()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_slots == 0 || self.max_slots > MAX_SLOTS_LIMIT {
            return Err("max_slots must be between 1 and 16");
        }
        if !(MIN_NAME_CAPACITY..=MAX_NAME_CAPACITY).contains(&self.name_capacity) {
            return Err("name_capacity must be between 2 and 16");
        }
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.max_slots = self.max_slots.clamp(1, MAX_SLOTS_LIMIT);
        self.name_capacity = self
            .name_capacity
            .clamp(MIN_NAME_CAPACITY, MAX_NAME_CAPACITY);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    pub eeprom_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 10_000,
            eeprom_size: 1024,
        }
    }
}

impl MonitorConfig {
    pub fn sanitize(&mut self) {
        self.sample_interval_ms = self.sample_interval_ms.clamp(1_000, 3_600_000);
        self.eeprom_size = self.eeprom_size.clamp(64, 4096);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub http_port: u16,
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub registry: RegistryLayout,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.registry.sanitize();
        self.monitor.sanitize();

        // The table must always fit the medium.
        let min_eeprom = self.registry.storage_size();
        if self.monitor.eeprom_size < min_eeprom {
            self.monitor.eeprom_size = min_eeprom;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_device_table() {
        let layout = RegistryLayout::default();
        assert_eq!(layout.record_size(), 19);
        assert_eq!(layout.storage_size(), 12 * 19);
        assert_eq!(layout.slot_offset(3), 57);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_bounds_layout() {
        let layout = RegistryLayout {
            max_slots: 17,
            name_capacity: 10,
        };
        assert!(layout.validate().is_err());

        let layout = RegistryLayout {
            max_slots: 12,
            name_capacity: 1,
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn sanitize_grows_eeprom_to_fit_table() {
        let mut runtime = RuntimeConfig::default();
        runtime.registry.max_slots = 40;
        runtime.registry.name_capacity = 16;
        runtime.monitor.eeprom_size = 64;
        runtime.sanitize();

        assert_eq!(runtime.registry.max_slots, 16);
        assert_eq!(runtime.monitor.eeprom_size, 16 * 25);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"network":{"http_port":80,"wifi_ssid":"","wifi_pass":""}}"#)
                .unwrap();
        assert_eq!(runtime.network.http_port, 80);
        assert_eq!(runtime.registry, RegistryLayout::default());
        assert_eq!(runtime.monitor.sample_interval_ms, 10_000);
    }
}
