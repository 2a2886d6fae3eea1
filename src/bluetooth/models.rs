use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BluetoothState {
    Idle,
    Scanning,
    Advertising,
    Connected,
    Off,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BluetoothEventType {
    AdvertisingStart,
    AdvertisingStop,
    ScanStart,
    ScanResult,
    ScanStop,
    Connect,
    Disconnect,
    Error,
}

/// Known metric kinds carried by summaries and event metadata. Tagged
/// variants instead of free-form JSON so consumers get typed values; the
/// `Text` catch-all keeps unrecognized payloads representable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TextList(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl MetricValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetricValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetricValue::Int(value) => Some(*value),
            _ => None,
        }
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdvertisingSet {
    pub set_id: Option<i32>,
    pub interval_ms: Option<i32>,
    pub tx_power: Option<String>,
    pub data_length: i32,
    pub service_uuids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdvertisingState {
    pub is_advertising: bool,
    pub sets: Vec<AdvertisingSet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanningState {
    pub is_scanning: bool,
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BondedDevice {
    pub address: String,
    pub name: Option<String>,
    pub bond_state: BondState,
}

/// Everything one combined dumpsys snapshot told us about a device's adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedSnapshot {
    pub serial: String,
    pub timestamp: f64,
    pub adapter_enabled: bool,
    pub address: Option<String>,
    pub scanning: ScanningState,
    pub advertising: AdvertisingState,
    /// Profile name → last reported state, both uppercased.
    pub profiles: BTreeMap<String, String>,
    pub bonded_devices: Vec<BondedDevice>,
    pub raw_text: String,
}

/// One classified logcat line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedEvent {
    pub serial: String,
    pub timestamp: f64,
    pub event_type: BluetoothEventType,
    pub message: String,
    pub tag: Option<String>,
    pub metadata: Metrics,
    pub raw_line: String,
}

/// Debounced observable state for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSummary {
    pub serial: String,
    pub active_states: BTreeSet<BluetoothState>,
    pub metrics: Metrics,
    pub timestamp: f64,
}
