use core::fmt::{self, Write};
use core::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const ADDR_SIZE: usize = 8;
pub const ADDR_HEX_LEN: usize = ADDR_SIZE * 2;

pub type AddressHex = heapless::String<ADDR_HEX_LEN>;

/// ROM code of a device on the 1-Wire bus. The first byte is the family code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; ADDR_SIZE]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("expected 16 hex characters, got {len}")]
    Length { len: usize },
    #[error("address contains non-hex characters")]
    InvalidHex,
}

impl DeviceAddress {
    pub const fn new(bytes: [u8; ADDR_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDR_SIZE] {
        &self.0
    }

    pub fn family_code(&self) -> u8 {
        self.0[0]
    }

    pub fn family(&self) -> SensorFamily {
        SensorFamily::from_code(self.family_code())
    }

    pub fn to_hex(&self) -> AddressHex {
        let mut out = AddressHex::new();
        // 16 chars always fit.
        let _ = write!(out, "{self}");
        out
    }
}

impl From<[u8; ADDR_SIZE]> for DeviceAddress {
    fn from(bytes: [u8; ADDR_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ADDR_HEX_LEN {
            return Err(AddressParseError::Length { len: s.len() });
        }

        let mut bytes = [0_u8; ADDR_SIZE];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| AddressParseError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFamily {
    Ds18s20,
    Ds1822,
    Ds18b20,
    Max31850,
    Unknown(u8),
}

impl SensorFamily {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x10 => Self::Ds18s20,
            0x22 => Self::Ds1822,
            0x28 => Self::Ds18b20,
            0x3B => Self::Max31850,
            other => Self::Unknown(other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ds18s20 => "DS18S20",
            Self::Ds1822 => "DS1822",
            Self::Ds18b20 => "DS18B20",
            Self::Max31850 => "MAX31850",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Families the node's bus driver can convert and read. Other thermometers
    /// are listed and nameable but never produce a reading.
    pub fn is_readable(self) -> bool {
        matches!(self, Self::Ds18b20)
    }
}
