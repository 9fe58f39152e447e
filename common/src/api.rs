//! Request handling shared by the HTTP front ends.

use serde::Deserialize;
use thiserror::Error;

use crate::address::{AddressParseError, DeviceAddress};
use crate::eeprom::Eeprom;
use crate::registry::{name_input, NameRegistry, NameTable, RegistryError, Upsert};
use crate::types::{NameUpdatePayload, NamesPayload};

#[derive(Debug, Clone, Deserialize)]
pub struct NameUpdateRequest {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum NameUpdateError {
    #[error("Invalid address '{address}': {source}")]
    BadAddress {
        address: String,
        source: AddressParseError,
    },
    #[error("Missing 'name' value")]
    MissingName,
    #[error("Registry full ({capacity} slots)")]
    Full { capacity: usize },
    #[error("Failed to persist names: {0}")]
    Registry(RegistryError),
}

impl NameUpdateError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadAddress { .. } | Self::MissingName | Self::Full { .. } => 400,
            Self::Registry(_) => 500,
        }
    }
}

impl From<RegistryError> for NameUpdateError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Full { capacity } => Self::Full { capacity },
            other => Self::Registry(other),
        }
    }
}

/// Validates the request fully before touching storage.
pub fn apply_name_update<E: Eeprom>(
    registry: &mut NameRegistry<E>,
    request: &NameUpdateRequest,
) -> Result<NameUpdatePayload, NameUpdateError> {
    let address = request
        .address
        .trim()
        .parse::<DeviceAddress>()
        .map_err(|source| NameUpdateError::BadAddress {
            address: request.address.clone(),
            source,
        })?;
    let name = name_input(&request.name).map_err(|_| NameUpdateError::MissingName)?;

    let outcome = registry.add_or_update(&address, name)?;
    Ok(NameUpdatePayload {
        index: outcome.index(),
        updated: matches!(outcome, Upsert::Updated { .. }),
    })
}

pub fn names_payload(table: &NameTable, capacity: usize) -> NamesPayload {
    NamesPayload {
        count: table.count(),
        capacity,
        names: table.render_listing(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryLayout;
    use crate::eeprom::MemoryEeprom;

    fn request(address: &str, name: &str) -> NameUpdateRequest {
        NameUpdateRequest {
            address: address.to_string(),
            name: name.to_string(),
        }
    }

    fn registry(max_slots: usize) -> NameRegistry<MemoryEeprom> {
        let layout = RegistryLayout {
            max_slots,
            name_capacity: 10,
        };
        NameRegistry::new(MemoryEeprom::new(512), layout).unwrap()
    }

    #[test]
    fn appends_then_updates() {
        let mut registry = registry(12);

        let first =
            apply_name_update(&mut registry, &request("281A2B030000800C", "fridge")).unwrap();
        assert_eq!(first.index, 0);
        assert!(!first.updated);

        let second =
            apply_name_update(&mut registry, &request(" 281a2b030000800c ", "freezer")).unwrap();
        assert_eq!(second.index, 0);
        assert!(second.updated);

        let payload = names_payload(&registry.load(), 12);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "count": 1,
                "capacity": 12,
                "names": [{"index": 0, "address": "281A2B030000800C", "name": "freezer"}]
            })
        );
    }

    #[test]
    fn invalid_requests_are_bad_requests() {
        let mut registry = registry(12);

        let err = apply_name_update(&mut registry, &request("zz", "fridge")).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().starts_with("Invalid address 'zz'"));

        let err =
            apply_name_update(&mut registry, &request("281A2B030000800C", "\r\n")).unwrap_err();
        assert!(matches!(err, NameUpdateError::MissingName));
        assert_eq!(err.status_code(), 400);

        assert_eq!(registry.load().count(), 0);
    }

    #[test]
    fn full_registry_is_a_bad_request() {
        let mut registry = registry(1);
        apply_name_update(&mut registry, &request("2800000000000001", "a")).unwrap();

        let err =
            apply_name_update(&mut registry, &request("2800000000000002", "b")).unwrap_err();
        assert!(matches!(err, NameUpdateError::Full { capacity: 1 }));
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "Registry full (1 slots)");
    }
}
