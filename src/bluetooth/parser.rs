use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

use super::models::{
    AdvertisingSet, AdvertisingState, BluetoothEventType, BondState, BondedDevice, MetricValue,
    Metrics, ParsedEvent, ParsedSnapshot, ScanningState,
};

const SCANNING_KEYWORDS: [&str; 5] = [
    "startscan",
    "isdiscovering: true",
    "isscanning: true",
    "onbatchscanresults",
    "onscanresult",
];
const SCANNING_STOP_KEYWORDS: [&str; 3] =
    ["stopscan", "isdiscovering: false", "isscanning: false"];
const ADVERTISING_KEYWORDS: [&str; 3] = [
    "startadvertising",
    "onadvertisingsetstarted",
    "isadvertising: true",
];
const ADVERTISING_STOP_KEYWORDS: [&str; 3] = [
    "stopadvertising",
    "onadvertisingsetstopped",
    "isadvertising: false",
];

/// Pure parser over `dumpsys` snapshots and logcat lines. All regexes are
/// compiled once up front.
pub struct BluetoothParser {
    re_address: Regex,
    re_interval: Regex,
    re_tx_power: Regex,
    re_data_len: Regex,
    re_uuids: Regex,
    re_profile_state: Regex,
    re_client_uid: Regex,
    re_client: Regex,
    re_tag_message: Regex,
    re_set_id: Regex,
    re_bonded_mac_first: Regex,
    re_bonded_name_addr: Regex,
    re_bonded_addr_name: Regex,
}

impl Default for BluetoothParser {
    fn default() -> Self {
        Self {
            re_address: Regex::new(r"address\s*[:=]\s*([0-9A-Fa-f:]{11,})").unwrap(),
            re_interval: Regex::new(r"interval(?:=|:)\s*(\d+)").unwrap(),
            re_tx_power: Regex::new(r"tx\s*power(?:=|:)\s*([A-Za-z0-9+\-]+)").unwrap(),
            re_data_len: Regex::new(r"data(?:Len|Length)?(?:=|:)\s*(\d+)").unwrap(),
            re_uuids: Regex::new(r"uuid[s]?\s*[:=]\s*([^\r\n]+)").unwrap(),
            re_profile_state: Regex::new(
                r"^(?P<profile>[A-Za-z0-9_\- ]+?)\s*(?:state\s*[:=]|[:=])\s*(?P<state>[A-Za-z0-9_ \-]+)$",
            )
            .unwrap(),
            re_client_uid: Regex::new(r"uid\s*/([\w\./:-]+)").unwrap(),
            re_client: Regex::new(r"client\s*=\s*([\w\./:-]+)").unwrap(),
            re_tag_message: Regex::new(r"\s([A-Za-z0-9_.-]+):\s(.+)$").unwrap(),
            re_set_id: Regex::new(r"set(?:=|\s)(\d+)").unwrap(),
            // `MAC (Name)` rows under a bonded-devices header.
            re_bonded_mac_first: Regex::new(
                r"^\s*([0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5})\s*(?:\(([^)]+)\)|(.+?))?$",
            )
            .unwrap(),
            re_bonded_name_addr: Regex::new(
                r"name\s*=\s*([^,]+),?\s*address\s*=\s*([0-9A-Fa-f:]{17})",
            )
            .unwrap(),
            re_bonded_addr_name: Regex::new(
                r"address\s*=\s*([0-9A-Fa-f:]{17}),?\s*name\s*=\s*([^,\n]+)",
            )
            .unwrap(),
        }
    }
}

impl BluetoothParser {
    pub fn parse_snapshot(&self, serial: &str, raw_text: &str, timestamp: f64) -> ParsedSnapshot {
        let lines: Vec<String> = raw_text
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        let lowered: Vec<String> = lines.iter().map(|line| line.to_lowercase()).collect();

        let adapter_enabled = lowered
            .iter()
            .any(|line| line.contains("state=on") || line.contains("enabled: true"));

        ParsedSnapshot {
            serial: serial.to_string(),
            timestamp,
            adapter_enabled,
            address: self.extract_address(&lines),
            scanning: self.extract_scanning(&lines, &lowered),
            advertising: self.extract_advertising(&lines, &lowered),
            profiles: self.extract_profiles(&lines),
            bonded_devices: self.extract_bonded_devices(raw_text),
            raw_text: raw_text.to_string(),
        }
    }

    /// Classify one logcat line; `None` when the line carries no bluetooth
    /// signal we track.
    pub fn parse_log_line(&self, serial: &str, line: &str, timestamp: f64) -> Option<ParsedEvent> {
        if line.trim().is_empty() {
            return None;
        }
        let lowered = line.to_lowercase();
        let event_type = classify_event(&lowered)?;
        let (tag, message) = self.split_tag_and_message(line);
        let metadata = self.extract_metadata(&lowered, &message);
        Some(ParsedEvent {
            serial: serial.to_string(),
            timestamp,
            event_type,
            message: message.trim().to_string(),
            tag,
            metadata,
            raw_line: line.to_string(),
        })
    }

    fn extract_address(&self, lines: &[String]) -> Option<String> {
        lines
            .iter()
            .find_map(|line| self.re_address.captures(line))
            .map(|caps| caps[1].to_uppercase())
    }

    fn extract_scanning(&self, lines: &[String], lowered: &[String]) -> ScanningState {
        let is_scanning = lowered.iter().any(|text| {
            SCANNING_KEYWORDS
                .iter()
                .any(|keyword| text.contains(keyword))
        });
        let mut clients = Vec::new();
        for line in lines {
            for caps in self.re_client_uid.captures_iter(line) {
                let value = format!("uid/{}", &caps[1]);
                if !clients.contains(&value) {
                    clients.push(value);
                }
            }
            for caps in self.re_client.captures_iter(line) {
                let value = caps[1].to_string();
                if !clients.contains(&value) {
                    clients.push(value);
                }
            }
        }
        ScanningState {
            is_scanning,
            clients,
        }
    }

    fn extract_advertising(&self, lines: &[String], lowered: &[String]) -> AdvertisingState {
        let is_advertising = lowered.iter().any(|text| {
            ADVERTISING_KEYWORDS
                .iter()
                .any(|keyword| text.contains(keyword))
        });
        let sets = if is_advertising {
            vec![self.build_advertising_set(lines)]
        } else {
            Vec::new()
        };
        AdvertisingState {
            is_advertising,
            sets,
        }
    }

    fn build_advertising_set(&self, lines: &[String]) -> AdvertisingSet {
        let dump = lines.join("\n");
        AdvertisingSet {
            set_id: self
                .re_set_id
                .captures(&dump)
                .and_then(|caps| caps[1].parse::<i32>().ok()),
            interval_ms: self
                .re_interval
                .captures(&dump)
                .and_then(|caps| caps[1].parse::<i32>().ok()),
            tx_power: self
                .re_tx_power
                .captures(&dump)
                .map(|caps| caps[1].to_string()),
            data_length: self
                .re_data_len
                .captures(&dump)
                .and_then(|caps| caps[1].parse::<i32>().ok())
                .unwrap_or(0),
            service_uuids: self.extract_uuids(&dump),
        }
    }

    fn extract_profiles(&self, lines: &[String]) -> BTreeMap<String, String> {
        let mut profiles = BTreeMap::new();
        for line in lines {
            if let Some(caps) = self.re_profile_state.captures(line) {
                let profile = caps["profile"].trim().to_uppercase();
                let state = caps["state"].trim().to_uppercase();
                if !profile.is_empty() && !state.is_empty() {
                    profiles.insert(profile, state);
                }
            }
        }
        profiles
    }

    /// Two bonded-device formats are recognized: `MAC (Name)` rows under a
    /// bonded header, and `name=…, address=…` pairs (either order). Anything
    /// else under a bonded header is reported at debug level and skipped.
    fn extract_bonded_devices(&self, raw_text: &str) -> Vec<BondedDevice> {
        let mut devices = Vec::new();
        let mut seen = Vec::new();
        let mut in_bonded_section = false;
        for line in raw_text.lines() {
            let stripped = line.trim();
            let lowered = stripped.to_lowercase();
            if ["bonded devices", "bonded_devices", "paired devices", "getbondeddevices"]
                .iter()
                .any(|header| lowered.contains(header))
            {
                in_bonded_section = true;
                continue;
            }
            let was_in_section = in_bonded_section;
            if in_bonded_section
                && (stripped.is_empty()
                    || (stripped.contains(':') && !self.re_bonded_mac_first.is_match(stripped)))
            {
                in_bonded_section = false;
            }
            match self.parse_bonded_line(stripped) {
                Some(device) => {
                    let addr = device.address.clone();
                    if !seen.contains(&addr) {
                        seen.push(addr);
                        devices.push(device);
                    }
                }
                None => {
                    if was_in_section && in_bonded_section && !stripped.is_empty() {
                        debug!(raw = stripped, "unrecognized bonded device line");
                    }
                }
            }
        }
        devices
    }

    fn parse_bonded_line(&self, line: &str) -> Option<BondedDevice> {
        if line.is_empty() {
            return None;
        }
        if let Some(caps) = self.re_bonded_mac_first.captures(line) {
            let address = caps[1].to_uppercase();
            let name = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().trim().to_string());
            return Some(BondedDevice {
                address,
                name,
                bond_state: BondState::Bonded,
            });
        }
        if let Some(caps) = self.re_bonded_name_addr.captures(line) {
            return Some(BondedDevice {
                name: Some(caps[1].trim().to_string()),
                address: caps[2].to_uppercase(),
                bond_state: BondState::Bonded,
            });
        }
        if let Some(caps) = self.re_bonded_addr_name.captures(line) {
            return Some(BondedDevice {
                address: caps[1].to_uppercase(),
                name: Some(caps[2].trim().to_string()),
                bond_state: BondState::Bonded,
            });
        }
        None
    }

    fn split_tag_and_message(&self, line: &str) -> (Option<String>, String) {
        if let Some(caps) = self.re_tag_message.captures(line) {
            return (Some(caps[1].to_string()), caps[2].to_string());
        }
        (None, line.trim().to_string())
    }

    fn extract_metadata(&self, lowered_line: &str, message: &str) -> Metrics {
        let mut metadata = Metrics::new();
        if let Some(caps) = self.re_set_id.captures(lowered_line) {
            if let Ok(set_id) = caps[1].parse::<i64>() {
                metadata.insert("set_id".to_string(), MetricValue::Int(set_id));
            }
        }
        if let Some(caps) = self.re_tx_power.captures(lowered_line) {
            metadata.insert(
                "tx_power".to_string(),
                MetricValue::Text(caps[1].to_uppercase()),
            );
        }
        if let Some(caps) = self.re_data_len.captures(lowered_line) {
            if let Ok(value) = caps[1].parse::<i64>() {
                metadata.insert("data_length".to_string(), MetricValue::Int(value));
            }
        }
        if let Some(caps) = self.re_client_uid.captures(message) {
            metadata.insert(
                "client".to_string(),
                MetricValue::Text(format!("uid/{}", &caps[1])),
            );
        } else if let Some(caps) = self.re_client.captures(message) {
            metadata.insert("client".to_string(), MetricValue::Text(caps[1].to_string()));
        }
        metadata
    }

    fn extract_uuids(&self, text: &str) -> Vec<String> {
        let Some(caps) = self.re_uuids.captures(text) else {
            return Vec::new();
        };
        caps.get(1)
            .map(|m| m.as_str())
            .unwrap_or("")
            .split([',', ':'])
            .filter_map(|item| {
                let trimmed = item.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_uppercase())
                }
            })
            .collect()
    }
}

/// Keyword classification, most specific category first: advertising
/// start/stop, scan result, scan start/stop, gatt connect/disconnect, then
/// the error/failed fallback.
fn classify_event(lowered_line: &str) -> Option<BluetoothEventType> {
    if ADVERTISING_KEYWORDS
        .iter()
        .any(|keyword| lowered_line.contains(keyword))
    {
        return Some(BluetoothEventType::AdvertisingStart);
    }
    if ADVERTISING_STOP_KEYWORDS
        .iter()
        .any(|keyword| lowered_line.contains(keyword))
    {
        return Some(BluetoothEventType::AdvertisingStop);
    }
    if lowered_line.contains("onscanresult") {
        return Some(BluetoothEventType::ScanResult);
    }
    if SCANNING_KEYWORDS
        .iter()
        .any(|keyword| lowered_line.contains(keyword))
    {
        return Some(BluetoothEventType::ScanStart);
    }
    if SCANNING_STOP_KEYWORDS
        .iter()
        .any(|keyword| lowered_line.contains(keyword))
    {
        return Some(BluetoothEventType::ScanStop);
    }
    if lowered_line.contains("connect") && lowered_line.contains("gatt") {
        if lowered_line.contains("disconnect") {
            return Some(BluetoothEventType::Disconnect);
        }
        return Some(BluetoothEventType::Connect);
    }
    if lowered_line.contains("error") || lowered_line.contains("failed") {
        return Some(BluetoothEventType::Error);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> BluetoothParser {
        BluetoothParser::default()
    }

    #[test]
    fn parses_enabled_snapshot_with_address_and_scanning() {
        let snapshot = parser().parse_snapshot(
            "SER",
            "State=ON\naddress: 00:11:22:33:44:55\nstartScan uid/app1\n",
            1.0,
        );
        assert!(snapshot.adapter_enabled);
        assert_eq!(snapshot.address.as_deref(), Some("00:11:22:33:44:55"));
        assert!(snapshot.scanning.is_scanning);
        assert_eq!(snapshot.scanning.clients, vec!["uid/app1"]);
    }

    #[test]
    fn disabled_adapter_is_detected() {
        let snapshot = parser().parse_snapshot("SER", "state=Off\nenabled: false\n", 1.0);
        assert!(!snapshot.adapter_enabled);
    }

    #[test]
    fn advertising_set_fields_are_extracted() {
        let raw = "enabled: true\nisAdvertising: true\nset=2 interval=320 tx power=HIGH dataLen=31\nuuids: 180D, 180F\n";
        let snapshot = parser().parse_snapshot("SER", raw, 1.0);
        assert!(snapshot.advertising.is_advertising);
        let set = &snapshot.advertising.sets[0];
        assert_eq!(set.set_id, Some(2));
        assert_eq!(set.interval_ms, Some(320));
        assert_eq!(set.tx_power.as_deref(), Some("HIGH"));
        assert_eq!(set.data_length, 31);
        assert_eq!(set.service_uuids, vec!["180D", "180F"]);
    }

    #[test]
    fn profile_states_are_uppercased() {
        let raw = "enabled: true\nA2DP state: Connected\nHEADSET: disconnected\n";
        let snapshot = parser().parse_snapshot("SER", raw, 1.0);
        assert_eq!(snapshot.profiles.get("A2DP").map(String::as_str), Some("CONNECTED"));
        assert_eq!(
            snapshot.profiles.get("HEADSET").map(String::as_str),
            Some("DISCONNECTED")
        );
    }

    #[test]
    fn bonded_devices_both_formats() {
        let raw = "Bonded devices:\n  AA:BB:CC:DD:EE:FF (Buds)\n\nname=Watch, address=11:22:33:44:55:66\n";
        let snapshot = parser().parse_snapshot("SER", raw, 1.0);
        assert_eq!(snapshot.bonded_devices.len(), 2);
        assert_eq!(snapshot.bonded_devices[0].address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(snapshot.bonded_devices[0].name.as_deref(), Some("Buds"));
        assert_eq!(snapshot.bonded_devices[1].address, "11:22:33:44:55:66");
        assert_eq!(snapshot.bonded_devices[1].name.as_deref(), Some("Watch"));
    }

    #[test]
    fn bonded_devices_deduplicate_by_address() {
        let raw = "Bonded devices:\n  AA:BB:CC:DD:EE:FF (Buds)\n  aa:bb:cc:dd:ee:ff (Buds again)\n";
        let snapshot = parser().parse_snapshot("SER", raw, 1.0);
        assert_eq!(snapshot.bonded_devices.len(), 1);
    }

    #[test]
    fn classifies_log_lines_by_specificity() {
        let cases = [
            ("startAdvertising set=0", BluetoothEventType::AdvertisingStart),
            ("onAdvertisingSetStopped", BluetoothEventType::AdvertisingStop),
            ("BluetoothGatt: onScanResult device found", BluetoothEventType::ScanResult),
            ("BluetoothLeScanner: startScan uid/app1", BluetoothEventType::ScanStart),
            ("stopScan uid/app1", BluetoothEventType::ScanStop),
            ("BluetoothGatt: connect() device", BluetoothEventType::Connect),
            ("BluetoothGatt: disconnect() device", BluetoothEventType::Disconnect),
            ("GattService: operation failed status=133", BluetoothEventType::Error),
        ];
        let parser = parser();
        for (line, expected) in cases {
            let event = parser
                .parse_log_line("SER", line, 1.0)
                .unwrap_or_else(|| panic!("no event for {line:?}"));
            assert_eq!(event.event_type, expected, "line {line:?}");
        }
    }

    #[test]
    fn uninteresting_lines_yield_no_event() {
        assert!(parser().parse_log_line("SER", "ActivityManager: idle", 1.0).is_none());
        assert!(parser().parse_log_line("SER", "   ", 1.0).is_none());
    }

    #[test]
    fn log_metadata_is_typed() {
        let event = parser()
            .parse_log_line(
                "SER",
                "BluetoothAdapter: startAdvertising set=3 tx power=MEDIUM dataLen=24",
                1.0,
            )
            .expect("event");
        assert_eq!(event.metadata.get("set_id").and_then(MetricValue::as_int), Some(3));
        assert_eq!(
            event.metadata.get("tx_power"),
            Some(&MetricValue::Text("MEDIUM".to_string()))
        );
        assert_eq!(
            event.metadata.get("data_length").and_then(MetricValue::as_int),
            Some(24)
        );
        assert_eq!(event.tag.as_deref(), Some("BluetoothAdapter"));
    }

    #[test]
    fn snapshot_parse_is_idempotent_on_rendered_fields() {
        let raw = "State=ON\naddress: 00:11:22:33:44:55\nisAdvertising: true\ninterval=160\nA2DP: CONNECTED\n";
        let parser = parser();
        let first = parser.parse_snapshot("SER", raw, 1.0);
        let second = parser.parse_snapshot("SER", &first.raw_text, 1.0);
        assert_eq!(first.adapter_enabled, second.adapter_enabled);
        assert_eq!(first.address, second.address);
        assert_eq!(first.advertising, second.advertising);
        assert_eq!(first.profiles, second.profiles);
    }
}
