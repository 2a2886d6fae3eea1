use std::collections::{BTreeMap, BTreeSet};

use super::models::{
    AdvertisingState, BluetoothEventType, BluetoothState, MetricValue, Metrics, ParsedEvent,
    ParsedSnapshot, ScanningState, StateSummary,
};

pub const DEFAULT_ADVERTISING_TIMEOUT_S: f64 = 3.0;
pub const DEFAULT_SCANNING_TIMEOUT_S: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub summary: StateSummary,
    /// False when active_states and metrics match the previous emission;
    /// the timestamp still advances.
    pub changed: bool,
}

/// Fuses snapshots (authoritative) and logcat events (toggles) into one
/// debounced per-device summary. Advertising/scanning claims decay unless
/// reconfirmed within their timeout.
pub struct BluetoothStateMachine {
    serial: Option<String>,
    adapter_enabled: bool,
    advertising_active: bool,
    scanning_active: bool,
    connected_active: bool,
    advertising_snapshot: AdvertisingState,
    scanning_snapshot: ScanningState,
    profiles: BTreeMap<String, String>,
    advertising_timeout_s: f64,
    scanning_timeout_s: f64,
    last_advertising_seen: Option<f64>,
    last_scanning_seen: Option<f64>,
    current_summary: StateSummary,
}

impl BluetoothStateMachine {
    pub fn new(advertising_timeout_s: f64, scanning_timeout_s: f64) -> Self {
        Self {
            serial: None,
            adapter_enabled: true,
            advertising_active: false,
            scanning_active: false,
            connected_active: false,
            advertising_snapshot: AdvertisingState::default(),
            scanning_snapshot: ScanningState::default(),
            profiles: BTreeMap::new(),
            advertising_timeout_s,
            scanning_timeout_s,
            last_advertising_seen: None,
            last_scanning_seen: None,
            current_summary: StateSummary {
                serial: "unknown".to_string(),
                active_states: BTreeSet::from([BluetoothState::Unknown]),
                metrics: Metrics::new(),
                timestamp: 0.0,
            },
        }
    }

    /// Snapshots override every flag from their own fields.
    pub fn apply_snapshot(&mut self, snapshot: &ParsedSnapshot) -> StateUpdate {
        self.ensure_serial(&snapshot.serial);
        self.adapter_enabled = snapshot.adapter_enabled;
        self.advertising_snapshot = snapshot.advertising.clone();
        self.scanning_snapshot = snapshot.scanning.clone();
        self.profiles = snapshot.profiles.clone();

        if snapshot.advertising.is_advertising {
            self.advertising_active = true;
            self.last_advertising_seen = Some(snapshot.timestamp);
        } else {
            self.advertising_active = false;
        }
        if snapshot.scanning.is_scanning {
            self.scanning_active = true;
            self.last_scanning_seen = Some(snapshot.timestamp);
        } else {
            self.scanning_active = false;
        }

        self.apply_timeouts(snapshot.timestamp);
        self.emit(snapshot.timestamp)
    }

    /// Events toggle individual flags by type.
    pub fn apply_event(&mut self, event: &ParsedEvent) -> StateUpdate {
        self.ensure_serial(&event.serial);
        match event.event_type {
            BluetoothEventType::AdvertisingStart => {
                self.advertising_active = true;
                self.last_advertising_seen = Some(event.timestamp);
            }
            BluetoothEventType::AdvertisingStop => {
                self.advertising_active = false;
            }
            BluetoothEventType::ScanStart | BluetoothEventType::ScanResult => {
                self.scanning_active = true;
                self.last_scanning_seen = Some(event.timestamp);
            }
            BluetoothEventType::ScanStop => {
                self.scanning_active = false;
            }
            BluetoothEventType::Connect => {
                self.connected_active = true;
            }
            BluetoothEventType::Disconnect => {
                self.connected_active = false;
            }
            BluetoothEventType::Error => {}
        }
        self.apply_timeouts(event.timestamp);
        self.emit(event.timestamp)
    }

    fn ensure_serial(&mut self, serial: &str) {
        if self.serial.is_none() {
            self.serial = Some(serial.to_string());
            self.current_summary.serial = serial.to_string();
        }
    }

    fn apply_timeouts(&mut self, timestamp: f64) {
        if self.advertising_active {
            if let Some(last_seen) = self.last_advertising_seen {
                if timestamp - last_seen > self.advertising_timeout_s {
                    self.advertising_active = false;
                }
            }
        }
        if self.scanning_active {
            if let Some(last_seen) = self.last_scanning_seen {
                if timestamp - last_seen > self.scanning_timeout_s {
                    self.scanning_active = false;
                }
            }
        }
    }

    fn emit(&mut self, timestamp: f64) -> StateUpdate {
        let summary = StateSummary {
            serial: self.serial.clone().unwrap_or_else(|| "unknown".to_string()),
            active_states: self.calculate_states(),
            metrics: self.calculate_metrics(),
            timestamp,
        };
        let changed = summary.active_states != self.current_summary.active_states
            || summary.metrics != self.current_summary.metrics;
        if changed {
            self.current_summary = summary;
        } else {
            self.current_summary.timestamp = timestamp;
        }
        StateUpdate {
            summary: self.current_summary.clone(),
            changed,
        }
    }

    fn calculate_states(&self) -> BTreeSet<BluetoothState> {
        if !self.adapter_enabled {
            return BTreeSet::from([BluetoothState::Off]);
        }
        let mut states = BTreeSet::new();
        if self.advertising_active {
            states.insert(BluetoothState::Advertising);
        }
        if self.scanning_active {
            states.insert(BluetoothState::Scanning);
        }
        if self.connected_active || self.has_connected_profile() {
            states.insert(BluetoothState::Connected);
        }
        if states.is_empty() {
            states.insert(BluetoothState::Idle);
        }
        states
    }

    fn has_connected_profile(&self) -> bool {
        self.profiles.values().any(|state| {
            let upper = state.to_uppercase();
            upper.contains("CONNECTED") && !upper.contains("DISCONNECTED")
        })
    }

    fn calculate_metrics(&self) -> Metrics {
        let mut metrics = Metrics::new();
        metrics.insert(
            "adapter_enabled".to_string(),
            MetricValue::Bool(self.adapter_enabled),
        );
        metrics.insert(
            "advertising_sets".to_string(),
            MetricValue::Int(self.advertising_snapshot.sets.len() as i64),
        );
        metrics.insert(
            "scanners".to_string(),
            MetricValue::Int(self.scanning_snapshot.clients.len() as i64),
        );
        if !self.profiles.is_empty() {
            metrics.insert(
                "profiles".to_string(),
                MetricValue::Map(self.profiles.clone()),
            );
        }
        if let Some(last) = self.last_advertising_seen {
            metrics.insert("last_advertising_seen".to_string(), MetricValue::Float(last));
        }
        if let Some(last) = self.last_scanning_seen {
            metrics.insert("last_scanning_seen".to_string(), MetricValue::Float(last));
        }
        metrics
    }
}

impl Default for BluetoothStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_ADVERTISING_TIMEOUT_S, DEFAULT_SCANNING_TIMEOUT_S)
    }
}
