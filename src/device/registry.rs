use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::adb::parse::{DeviceProbe, RefreshedAttrs};
use crate::events::{CoreEvent, EventBus};
use crate::models::{ConnectionState, Device, DeviceSummary, TriState};

/// One device as seen by a discovery poll: the `adb devices -l` row plus the
/// identity probe (absent when the probe failed or was skipped).
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub summary: DeviceSummary,
    pub probe: Option<DeviceProbe>,
}

pub const DEFAULT_REMOVAL_HYSTERESIS: u32 = 2;
pub const DEFAULT_CHANGE_DEBOUNCE: Duration = Duration::from_millis(300);

struct RegistryInner {
    devices: HashMap<String, Device>,
    /// Consecutive polls a serial has been absent; removal fires at the
    /// hysteresis threshold so momentary USB flicker does not evict.
    missing_polls: HashMap<String, u32>,
    pending_fields: HashMap<String, BTreeSet<String>>,
    last_change_emit: HashMap<String, Instant>,
}

/// In-memory device cache keyed by serial. All mutation happens under the
/// single internal lock; the poller and the attr refresher are the only
/// writers.
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
    bus: EventBus,
    removal_hysteresis: u32,
    debounce: Duration,
}

impl DeviceRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self::with_tuning(bus, DEFAULT_REMOVAL_HYSTERESIS, DEFAULT_CHANGE_DEBOUNCE)
    }

    pub fn with_tuning(bus: EventBus, removal_hysteresis: u32, debounce: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                devices: HashMap::new(),
                missing_polls: HashMap::new(),
                pending_fields: HashMap::new(),
                last_change_emit: HashMap::new(),
            }),
            bus,
            removal_hysteresis: removal_hysteresis.max(1),
            debounce,
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        let guard = self.inner.lock().expect("registry poisoned");
        let mut devices: Vec<Device> = guard.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.serial.cmp(&b.serial));
        devices
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        let guard = self.inner.lock().expect("registry poisoned");
        guard.devices.get(serial).cloned()
    }

    pub fn serials(&self) -> Vec<String> {
        let guard = self.inner.lock().expect("registry poisoned");
        let mut serials: Vec<String> = guard.devices.keys().cloned().collect();
        serials.sort();
        serials
    }

    pub fn operational_serials(&self) -> Vec<String> {
        let guard = self.inner.lock().expect("registry poisoned");
        let mut serials: Vec<String> = guard
            .devices
            .values()
            .filter(|device| device.state.is_operational())
            .map(|device| device.serial.clone())
            .collect();
        serials.sort();
        serials
    }

    pub fn connection_state(&self, serial: &str) -> Option<ConnectionState> {
        let guard = self.inner.lock().expect("registry poisoned");
        guard.devices.get(serial).map(|device| device.state)
    }

    /// Drop a device immediately, bypassing hysteresis.
    pub fn invalidate(&self, serial: &str) {
        let removed = {
            let mut guard = self.inner.lock().expect("registry poisoned");
            guard.missing_polls.remove(serial);
            guard.pending_fields.remove(serial);
            guard.devices.remove(serial).is_some()
        };
        if removed {
            info!(serial, "device invalidated");
            self.bus.publish(CoreEvent::DeviceRemoved {
                serial: serial.to_string(),
            });
        }
    }

    pub fn apply_discovery(&self, snapshot: Vec<DiscoveredDevice>) {
        self.apply_discovery_at(snapshot, Instant::now());
    }

    pub fn apply_refreshed_attrs(&self, serial: &str, refreshed: RefreshedAttrs) {
        self.apply_refreshed_attrs_at(serial, refreshed, Instant::now());
    }

    /// Emit coalesced `DeviceChanged` events whose debounce window elapsed.
    pub fn flush_changes(&self) {
        self.flush_changes_at(Instant::now());
    }

    fn apply_discovery_at(&self, snapshot: Vec<DiscoveredDevice>, now: Instant) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        {
            let mut guard = self.inner.lock().expect("registry poisoned");
            let inner = &mut *guard;
            let mut seen = BTreeSet::new();

            for discovered in snapshot {
                let serial = discovered.summary.serial.clone();
                seen.insert(serial.clone());
                inner.missing_polls.remove(&serial);

                match inner.devices.get_mut(&serial) {
                    None => {
                        let mut device = Device::from_summary(&discovered.summary);
                        if let Some(probe) = &discovered.probe {
                            apply_probe(&mut device, probe);
                        }
                        inner.devices.insert(serial.clone(), device.clone());
                        added.push(device);
                    }
                    Some(device) => {
                        let mut fields = merge_summary(device, &discovered.summary);
                        if let Some(probe) = &discovered.probe {
                            fields.extend(merge_probe(device, probe));
                        }
                        if !fields.is_empty() {
                            inner
                                .pending_fields
                                .entry(serial.clone())
                                .or_default()
                                .extend(fields);
                        }
                    }
                }
            }

            let absent: Vec<String> = inner
                .devices
                .keys()
                .filter(|serial| !seen.contains(*serial))
                .cloned()
                .collect();
            for serial in absent {
                let misses = inner.missing_polls.entry(serial.clone()).or_insert(0);
                *misses += 1;
                if *misses >= self.removal_hysteresis {
                    inner.devices.remove(&serial);
                    inner.missing_polls.remove(&serial);
                    inner.pending_fields.remove(&serial);
                    inner.last_change_emit.remove(&serial);
                    removed.push(serial);
                }
            }
        }

        for device in added {
            info!(serial = %device.serial, state = ?device.state, "device added");
            self.bus.publish(CoreEvent::DeviceAdded { device });
        }
        for serial in removed {
            info!(serial = %serial, "device removed");
            self.bus.publish(CoreEvent::DeviceRemoved { serial });
        }
        self.flush_changes_at(now);
    }

    fn apply_refreshed_attrs_at(&self, serial: &str, refreshed: RefreshedAttrs, now: Instant) {
        {
            let mut guard = self.inner.lock().expect("registry poisoned");
            let inner = &mut *guard;
            let Some(device) = inner.devices.get_mut(serial) else {
                debug!(serial, "refreshed attrs for unknown device dropped");
                return;
            };
            let mut fields = BTreeSet::new();
            for (key, value) in refreshed.extended {
                // The refresher never downgrades a known value to unknown;
                // absent keys simply keep their previous value.
                let changed = device
                    .extended
                    .get(&key)
                    .map(|existing| existing != &value)
                    .unwrap_or(true);
                if changed {
                    fields.insert(format!("extended.{key}"));
                    device.extended.insert(key, value);
                }
            }
            if refreshed.gms_version.is_some() && device.gms_version != refreshed.gms_version {
                device.gms_version = refreshed.gms_version;
                fields.insert("gms_version".to_string());
            }
            if refreshed.audio_state.is_some() && device.audio_state != refreshed.audio_state {
                device.audio_state = refreshed.audio_state;
                fields.insert("audio_state".to_string());
            }
            if let Some(bt_state) = refreshed.bluetooth_manager_state {
                // Readable manager state doubles as a radio fallback when the
                // settings probe could not tell.
                if device.bt_on == TriState::Unknown {
                    device.bt_on = TriState::from_bool(Some(bt_state.contains("ON")));
                    fields.insert("bt_on".to_string());
                }
                if device.bluetooth_manager_state.as_deref() != Some(bt_state.as_str()) {
                    device.bluetooth_manager_state = Some(bt_state);
                    fields.insert("bluetooth_manager_state".to_string());
                }
            }
            if !fields.is_empty() {
                inner
                    .pending_fields
                    .entry(serial.to_string())
                    .or_default()
                    .extend(fields);
            }
        }
        self.flush_changes_at(now);
    }

    fn flush_changes_at(&self, now: Instant) {
        let mut emissions = Vec::new();
        {
            let mut guard = self.inner.lock().expect("registry poisoned");
            let due: Vec<String> = guard
                .pending_fields
                .keys()
                .filter(|serial| {
                    guard
                        .last_change_emit
                        .get(*serial)
                        .map(|last| now.duration_since(*last) >= self.debounce)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            for serial in due {
                let Some(fields) = guard.pending_fields.remove(&serial) else {
                    continue;
                };
                let Some(device) = guard.devices.get(&serial).cloned() else {
                    continue;
                };
                guard.last_change_emit.insert(serial, now);
                emissions.push((device, fields.into_iter().collect::<Vec<_>>()));
            }
        }
        for (device, fields_changed) in emissions {
            debug!(serial = %device.serial, fields = ?fields_changed, "device changed");
            self.bus.publish(CoreEvent::DeviceChanged {
                device,
                fields_changed,
            });
        }
    }
}

/// Discovery rows are authoritative: a fresh discovery may overwrite known
/// values, including with unknowns.
fn merge_summary(device: &mut Device, summary: &DeviceSummary) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    if device.state != summary.state {
        device.state = summary.state;
        fields.insert("state".to_string());
    }
    if device.usb != summary.usb {
        device.usb = summary.usb.clone();
        fields.insert("usb".to_string());
    }
    if device.product != summary.product {
        device.product = summary.product.clone();
        fields.insert("product".to_string());
    }
    if summary.model.is_some() && device.model != summary.model {
        device.model = summary.model.clone();
        fields.insert("model".to_string());
    }
    fields
}

fn apply_probe(device: &mut Device, probe: &DeviceProbe) {
    merge_probe(device, probe);
}

fn merge_probe(device: &mut Device, probe: &DeviceProbe) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    if probe.model.is_some() && device.model != probe.model {
        device.model = probe.model.clone();
        fields.insert("model".to_string());
    }
    if probe.android_version.is_some() && device.android_version != probe.android_version {
        device.android_version = probe.android_version.clone();
        fields.insert("android_version".to_string());
    }
    if probe.api_level.is_some() && device.api_level != probe.api_level {
        device.api_level = probe.api_level.clone();
        fields.insert("api_level".to_string());
    }
    if probe.build_fingerprint.is_some() && device.build_fingerprint != probe.build_fingerprint {
        device.build_fingerprint = probe.build_fingerprint.clone();
        fields.insert("build_fingerprint".to_string());
    }
    if probe.wifi_on.is_known() && device.wifi_on != probe.wifi_on {
        device.wifi_on = probe.wifi_on;
        fields.insert("wifi_on".to_string());
    }
    if probe.bt_on.is_known() && device.bt_on != probe.bt_on {
        device.bt_on = probe.bt_on;
        fields.insert("bt_on".to_string());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::mpsc::Receiver;

    fn summary(serial: &str, state: ConnectionState) -> DeviceSummary {
        DeviceSummary {
            serial: serial.to_string(),
            state,
            usb: None,
            product: None,
            model: Some("Pixel".to_string()),
            transport_id: None,
        }
    }

    fn discovered(serial: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            summary: summary(serial, ConnectionState::Device),
            probe: None,
        }
    }

    fn drain(rx: &Receiver<CoreEvent>) -> Vec<CoreEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn one_poll_flicker_does_not_remove() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let registry = DeviceRegistry::new(bus);

        registry.apply_discovery(vec![discovered("S1"), discovered("S2")]);
        registry.apply_discovery(vec![discovered("S1")]);
        registry.apply_discovery(vec![discovered("S1"), discovered("S2")]);

        let events = drain(&rx);
        let removed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, CoreEvent::DeviceRemoved { .. }))
            .collect();
        assert!(removed.is_empty(), "hysteresis must absorb one missed poll");

        let added: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::DeviceAdded { device } => Some(device.serial.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(added, vec!["S1".to_string(), "S2".to_string()]);
        assert_eq!(registry.serials(), vec!["S1", "S2"]);
    }

    #[test]
    fn two_consecutive_misses_remove_exactly_once() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let registry = DeviceRegistry::new(bus);

        registry.apply_discovery(vec![discovered("S1"), discovered("S2")]);
        registry.apply_discovery(vec![discovered("S1")]);
        registry.apply_discovery(vec![discovered("S1")]);
        registry.apply_discovery(vec![discovered("S1")]);

        let events = drain(&rx);
        let removed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::DeviceRemoved { serial } => Some(serial.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec!["S2".to_string()]);
        assert_eq!(registry.serials(), vec!["S1"]);
    }

    #[test]
    fn reconnect_after_removal_adds_again() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let registry = DeviceRegistry::new(bus);

        registry.apply_discovery(vec![discovered("S1")]);
        registry.apply_discovery(vec![]);
        registry.apply_discovery(vec![]);
        registry.apply_discovery(vec![discovered("S1")]);

        let added_count = drain(&rx)
            .iter()
            .filter(|e| matches!(e, CoreEvent::DeviceAdded { .. }))
            .count();
        assert_eq!(added_count, 2, "one DeviceAdded per contiguous interval");
    }

    #[test]
    fn discovery_state_change_is_reported() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let registry = DeviceRegistry::with_tuning(bus, 2, Duration::from_millis(0));

        registry.apply_discovery(vec![discovered("S1")]);
        registry.apply_discovery(vec![DiscoveredDevice {
            summary: summary("S1", ConnectionState::Unauthorized),
            probe: None,
        }]);

        let changes: Vec<_> = drain(&rx)
            .into_iter()
            .filter_map(|e| match e {
                CoreEvent::DeviceChanged { fields_changed, .. } => Some(fields_changed),
                _ => None,
            })
            .collect();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].contains(&"state".to_string()));
    }

    #[test]
    fn debounce_coalesces_bursts() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let registry = DeviceRegistry::with_tuning(bus, 2, Duration::from_millis(300));
        let t0 = Instant::now();

        registry.apply_discovery_at(vec![discovered("S1")], t0);
        // Three rapid attr updates inside one debounce window.
        for (tick, level) in [(10u64, "90"), (20, "89"), (30, "88")] {
            let mut attrs = BTreeMap::new();
            attrs.insert("battery_level".to_string(), level.to_string());
            registry.apply_refreshed_attrs_at(
                "S1",
                RefreshedAttrs {
                    extended: attrs,
                    ..RefreshedAttrs::default()
                },
                t0 + Duration::from_millis(tick),
            );
        }

        let first_wave = drain(&rx)
            .iter()
            .filter(|e| matches!(e, CoreEvent::DeviceChanged { .. }))
            .count();
        assert_eq!(first_wave, 1, "burst must coalesce into the first emission");

        registry.flush_changes_at(t0 + Duration::from_millis(400));
        let second_wave: Vec<_> = drain(&rx)
            .into_iter()
            .filter_map(|e| match e {
                CoreEvent::DeviceChanged { device, .. } => Some(device),
                _ => None,
            })
            .collect();
        assert_eq!(second_wave.len(), 1);
        assert_eq!(
            second_wave[0].extended.get("battery_level").map(String::as_str),
            Some("88")
        );
    }

    #[test]
    fn refresher_populates_connectivity_attributes() {
        let bus = EventBus::new();
        let registry = DeviceRegistry::with_tuning(bus, 2, Duration::from_millis(0));
        registry.apply_discovery(vec![discovered("S1")]);

        registry.apply_refreshed_attrs(
            "S1",
            RefreshedAttrs {
                extended: BTreeMap::new(),
                gms_version: Some("24.08.12".to_string()),
                audio_state: Some("mode=NORMAL | ringer=SILENT".to_string()),
                bluetooth_manager_state: Some("ON".to_string()),
            },
        );

        let device = registry.device("S1").expect("device");
        assert_eq!(device.gms_version.as_deref(), Some("24.08.12"));
        assert_eq!(device.audio_state.as_deref(), Some("mode=NORMAL | ringer=SILENT"));
        assert_eq!(device.bluetooth_manager_state.as_deref(), Some("ON"));
        // No settings read succeeded, so the manager state fills in bt_on.
        assert_eq!(device.bt_on, TriState::On);

        // A later probe that could not read these fields leaves them intact.
        registry.apply_refreshed_attrs("S1", RefreshedAttrs::default());
        let device = registry.device("S1").expect("device");
        assert_eq!(device.gms_version.as_deref(), Some("24.08.12"));
        assert_eq!(device.bluetooth_manager_state.as_deref(), Some("ON"));
    }

    #[test]
    fn refresher_unknown_does_not_overwrite_known() {
        let bus = EventBus::new();
        let registry = DeviceRegistry::new(bus);
        registry.apply_discovery(vec![DiscoveredDevice {
            summary: summary("S1", ConnectionState::Device),
            probe: Some(DeviceProbe {
                model: Some("Pixel 7".to_string()),
                android_version: Some("14".to_string()),
                api_level: Some("34".to_string()),
                build_fingerprint: None,
                wifi_on: TriState::On,
                bt_on: TriState::Unknown,
            }),
        }]);

        // Later probe with unknown radio states keeps the known value.
        registry.apply_discovery(vec![DiscoveredDevice {
            summary: summary("S1", ConnectionState::Device),
            probe: Some(DeviceProbe {
                model: None,
                android_version: None,
                api_level: None,
                build_fingerprint: None,
                wifi_on: TriState::Unknown,
                bt_on: TriState::Unknown,
            }),
        }]);

        let device = registry.device("S1").expect("device");
        assert_eq!(device.wifi_on, TriState::On);
        assert_eq!(device.android_version.as_deref(), Some("14"));
    }
}
