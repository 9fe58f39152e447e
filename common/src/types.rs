use serde::Serialize;

use crate::address::DeviceAddress;
use crate::registry::ListingRow;

#[derive(Debug, Clone, Serialize)]
pub struct SensorPayload {
    pub index: usize,
    pub address: DeviceAddress,
    pub family: &'static str,
    pub name: String,
    #[serde(rename = "tempC")]
    pub temp_c: Option<f32>,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorsPayload {
    pub count: usize,
    #[serde(rename = "sampledAt")]
    pub sampled_at: Option<i64>,
    pub sensors: Vec<SensorPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamesPayload {
    pub count: usize,
    pub capacity: usize,
    pub names: Vec<ListingRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NameUpdatePayload {
    pub index: usize,
    pub updated: bool,
}
