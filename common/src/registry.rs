//! Persistent address -> name table.
//!
//! Slot `i` is stored at `i * record_size` and holds a used flag, the raw
//! 8-byte address and a NUL padded name. Occupied slots always form a prefix;
//! a scan stops at the first free slot, so a zeroed slot in the middle hides
//! everything after it.

use core::fmt;
use core::ops::Deref;

use serde::Serialize;
use thiserror::Error;

use crate::address::{AddressHex, DeviceAddress, ADDR_SIZE};
use crate::config::{RegistryLayout, MAX_NAME_CAPACITY, MAX_RECORD_SIZE, MAX_SLOTS_LIMIT};
use crate::eeprom::{Eeprom, StorageError};

const USED: u8 = 1;
const FREE: u8 = 0;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry full ({capacity} slots)")]
    Full { capacity: usize },
    #[error("slot {index} out of range ({max_slots} slots)")]
    SlotOutOfRange { index: usize, max_slots: usize },
    #[error("registry needs {required} bytes but storage holds {capacity}")]
    LayoutDoesNotFit { required: usize, capacity: usize },
    #[error("invalid registry layout: {0}")]
    InvalidLayout(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is {len} bytes, limit is {capacity}")]
    TooLong { len: usize, capacity: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SensorName(heapless::String<MAX_NAME_CAPACITY>);

impl SensorName {
    pub fn new(name: &str) -> Result<Self, NameError> {
        let mut inner = heapless::String::new();
        inner.push_str(name).map_err(|_| NameError::TooLong {
            len: name.len(),
            capacity: MAX_NAME_CAPACITY,
        })?;
        Ok(Self(inner))
    }

    /// Applies the stored-name rule: cut at the first NUL, drop trailing CR/LF,
    /// then keep at most `capacity - 1` bytes on a char boundary.
    pub fn truncated(raw: &str, capacity: usize) -> Self {
        let raw = raw.split('\0').next().unwrap_or_default();
        let stripped = raw.trim_end_matches(&['\r', '\n'][..]);

        let mut end = stripped
            .len()
            .min(capacity.saturating_sub(1))
            .min(MAX_NAME_CAPACITY);
        while !stripped.is_char_boundary(end) {
            end -= 1;
        }

        // The cut can expose a CR/LF that sat in the middle of the input.
        let kept = stripped[..end].trim_end_matches(&['\r', '\n'][..]);

        let mut inner = heapless::String::new();
        // `end` is bounded by MAX_NAME_CAPACITY above.
        let _ = inner.push_str(kept);
        Self(inner)
    }

    fn from_stored(bytes: &[u8]) -> Self {
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        let bytes = &bytes[..len.min(MAX_NAME_CAPACITY)];

        let mut inner = heapless::String::new();
        match core::str::from_utf8(bytes) {
            Ok(text) => {
                for ch in text.chars() {
                    let _ = inner.push(if ch.is_control() { '?' } else { ch });
                }
            }
            Err(_) => {
                for byte in bytes {
                    let ch = if byte.is_ascii_graphic() || *byte == b' ' {
                        *byte as char
                    } else {
                        '?'
                    };
                    let _ = inner.push(ch);
                }
            }
        }
        Self(inner)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for SensorName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operator-supplied name with line endings removed. Blank names are rejected;
/// length is left to the registry's truncation rule.
pub fn name_input(raw: &str) -> Result<&str, NameError> {
    let name = raw.trim_end_matches(&['\r', '\n'][..]);
    if name.trim().is_empty() {
        return Err(NameError::Empty);
    }
    Ok(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRecord {
    pub address: DeviceAddress,
    pub name: SensorName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Updated { index: usize },
    Appended { index: usize },
}

impl Upsert {
    pub fn index(self) -> usize {
        match self {
            Self::Updated { index } | Self::Appended { index } => index,
        }
    }
}

/// Occupied prefix of the table, as read by [`NameRegistry::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameTable {
    entries: heapless::Vec<NameRecord, MAX_SLOTS_LIMIT>,
}

impl NameTable {
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[NameRecord] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&NameRecord> {
        self.entries.get(index)
    }

    pub fn find(&self, address: &DeviceAddress) -> Option<usize> {
        find_address(&self.entries, address)
    }

    pub fn name_of(&self, address: &DeviceAddress) -> Option<&SensorName> {
        self.find(address).map(|index| &self.entries[index].name)
    }

    pub fn render_listing(&self) -> Vec<ListingRow> {
        render_listing(&self.entries)
    }
}

pub fn find_address(entries: &[NameRecord], address: &DeviceAddress) -> Option<usize> {
    entries.iter().position(|entry| entry.address == *address)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingRow {
    pub index: usize,
    pub address: AddressHex,
    pub name: SensorName,
}

impl fmt::Display for ListingRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.index, self.address, self.name)
    }
}

pub fn render_listing(entries: &[NameRecord]) -> Vec<ListingRow> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| ListingRow {
            index,
            address: entry.address.to_hex(),
            name: entry.name.clone(),
        })
        .collect()
}

pub struct NameRegistry<E> {
    eeprom: E,
    layout: RegistryLayout,
}

impl<E: Eeprom> NameRegistry<E> {
    pub fn new(eeprom: E, layout: RegistryLayout) -> Result<Self, RegistryError> {
        layout.validate().map_err(RegistryError::InvalidLayout)?;

        let required = layout.storage_size();
        let capacity = eeprom.capacity();
        if required > capacity {
            return Err(RegistryError::LayoutDoesNotFit { required, capacity });
        }

        Ok(Self { eeprom, layout })
    }

    pub fn layout(&self) -> RegistryLayout {
        self.layout
    }

    pub fn eeprom(&self) -> &E {
        &self.eeprom
    }

    /// Raw medium access, bypassing the record format.
    pub fn eeprom_mut(&mut self) -> &mut E {
        &mut self.eeprom
    }

    pub fn into_inner(self) -> E {
        self.eeprom
    }

    pub fn load(&self) -> NameTable {
        let mut table = NameTable::default();

        for index in 0..self.layout.max_slots {
            let Some(record) = self.read_slot(index) else {
                break;
            };
            if table.entries.push(record).is_err() {
                break;
            }
        }

        table
    }

    pub fn lookup_name(&self, address: &DeviceAddress) -> Option<SensorName> {
        self.load().name_of(address).cloned()
    }

    /// Writes a full record at `index`. Appending is `index == count`.
    pub fn set(
        &mut self,
        index: usize,
        address: &DeviceAddress,
        name: &str,
    ) -> Result<(), RegistryError> {
        if index >= self.layout.max_slots {
            return Err(RegistryError::SlotOutOfRange {
                index,
                max_slots: self.layout.max_slots,
            });
        }

        let name = SensorName::truncated(name, self.layout.name_capacity);
        let record = self.encode_record(address, &name);
        let offset = self.layout.slot_offset(index);

        for (i, byte) in record.iter().enumerate() {
            self.eeprom.write_byte(offset + i, *byte);
        }

        self.eeprom.commit()?;
        Ok(())
    }

    pub fn add_or_update(
        &mut self,
        address: &DeviceAddress,
        name: &str,
    ) -> Result<Upsert, RegistryError> {
        let table = self.load();

        let outcome = match table.find(address) {
            Some(index) => Upsert::Updated { index },
            None if table.count() >= self.layout.max_slots => {
                return Err(RegistryError::Full {
                    capacity: self.layout.max_slots,
                });
            }
            None => Upsert::Appended {
                index: table.count(),
            },
        };

        self.set(outcome.index(), address, name)?;
        Ok(outcome)
    }

    /// Zeroes the whole medium, not only the table range.
    pub fn clear(&mut self) -> Result<(), RegistryError> {
        for offset in 0..self.eeprom.capacity() {
            self.eeprom.write_byte(offset, FREE);
        }
        self.eeprom.commit()?;
        Ok(())
    }

    fn read_slot(&self, index: usize) -> Option<NameRecord> {
        let offset = self.layout.slot_offset(index);
        let size = self.layout.record_size();

        let mut raw = [0_u8; MAX_RECORD_SIZE];
        for (i, byte) in raw[..size].iter_mut().enumerate() {
            *byte = self.eeprom.read_byte(offset + i);
        }

        decode_record(&raw[..size])
    }

    fn encode_record(
        &self,
        address: &DeviceAddress,
        name: &SensorName,
    ) -> heapless::Vec<u8, MAX_RECORD_SIZE> {
        let mut raw = heapless::Vec::new();
        let _ = raw.push(USED);
        let _ = raw.extend_from_slice(address.as_bytes());
        let _ = raw.extend_from_slice(name.as_bytes());
        // NUL padding up to the fixed record size.
        let _ = raw.resize(self.layout.record_size(), 0);
        raw
    }
}

fn decode_record(raw: &[u8]) -> Option<NameRecord> {
    if raw[0] == FREE {
        return None;
    }

    let mut address = [0_u8; ADDR_SIZE];
    address.copy_from_slice(&raw[1..1 + ADDR_SIZE]);

    Some(NameRecord {
        address: DeviceAddress::new(address),
        name: SensorName::from_stored(&raw[1 + ADDR_SIZE..]),
    })
}
