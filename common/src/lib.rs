pub mod address;
pub mod api;
pub mod config;
pub mod console;
pub mod eeprom;
pub mod monitor;
pub mod registry;
pub mod types;

pub use address::{AddressParseError, DeviceAddress, SensorFamily, ADDR_SIZE};
pub use api::{apply_name_update, names_payload, NameUpdateError, NameUpdateRequest};
pub use config::{MonitorConfig, NetworkConfig, RegistryLayout, RuntimeConfig};
pub use console::{handle_line, ConsoleReply};
pub use eeprom::{Eeprom, MemoryEeprom, StorageError};
pub use monitor::{read_bus, Monitor, TemperatureBus, UNKNOWN_NAME};
pub use registry::{
    name_input, NameError, NameRecord, NameRegistry, NameTable, RegistryError, SensorName, Upsert,
};
pub use types::{NameUpdatePayload, NamesPayload, SensorPayload, SensorsPayload};
