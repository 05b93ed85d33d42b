//! Minimal Redfish wire shapes; only the fields the provisioning core reads.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ODataRef {
    #[serde(rename = "@odata.id")]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct Collection {
    #[serde(rename = "Members", default)]
    pub members: Vec<ODataRef>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MemorySummary {
    #[serde(rename = "TotalSystemMemoryGiB", default)]
    pub total_system_memory_gib: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessorSummary {
    #[serde(rename = "Count", default)]
    pub count: u32,
}

#[derive(Debug, Deserialize)]
pub struct ComputerSystem {
    #[serde(rename = "Manufacturer", default)]
    pub manufacturer: String,
    #[serde(rename = "Model", default)]
    pub model: String,
    #[serde(rename = "SerialNumber", default)]
    pub serial_number: String,
    #[serde(rename = "PowerState", default)]
    pub power_state: String,
    #[serde(rename = "MemorySummary", default)]
    pub memory_summary: MemorySummary,
    #[serde(rename = "ProcessorSummary", default)]
    pub processor_summary: ProcessorSummary,
}

#[derive(Debug, Deserialize)]
pub struct Manager {
    #[serde(rename = "VirtualMedia")]
    pub virtual_media: Option<ODataRef>,
}

#[derive(Debug, Deserialize)]
pub struct VirtualMedia {
    #[serde(rename = "Inserted", default)]
    pub inserted: Option<bool>,
    #[serde(rename = "Image", default)]
    pub image: Option<String>,
    #[serde(rename = "MediaTypes", default)]
    pub media_types: Vec<String>,
}
