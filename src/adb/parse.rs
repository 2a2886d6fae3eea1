use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

use crate::models::{ConnectionState, DeviceSummary, TriState};

/// Parse `adb devices -l` output into device summaries. Unauthorized and
/// offline rows are surfaced; callers exclude them from operations that need
/// `device` state.
pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                debug!(raw = line, "skipping malformed devices row");
                return None;
            }
            let serial = tokens[0].to_string();
            let state = ConnectionState::parse(tokens[1]);
            let mut usb = None;
            let mut product = None;
            let mut model = None;
            let mut transport_id = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("usb:") {
                    usb = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    transport_id = Some(value.to_string());
                }
            }
            Some(DeviceSummary {
                serial,
                state,
                usb,
                product,
                model,
                transport_id,
            })
        })
        .collect()
}

/// Identity/connectivity attributes read by the discovery probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProbe {
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub api_level: Option<String>,
    pub build_fingerprint: Option<String>,
    pub wifi_on: TriState,
    pub bt_on: TriState,
}

fn clean_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") {
        return None;
    }
    Some(trimmed.to_string())
}

/// Parse the `key=value` lines emitted by the combined identity probe.
pub fn parse_identity_probe(output: &str) -> DeviceProbe {
    let mut probe = DeviceProbe::default();
    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key.trim() {
            "model" => probe.model = clean_value(value),
            "android" => probe.android_version = clean_value(value),
            "api" => probe.api_level = clean_value(value),
            "fingerprint" => probe.build_fingerprint = clean_value(value),
            "wifi" => probe.wifi_on = TriState::from_bool(parse_settings_bool(value)),
            "bt" => probe.bt_on = TriState::from_bool(parse_settings_bool(value)),
            _ => {}
        }
    }
    probe
}

/// Split marker-sectioned output (`---NAME---` lines) into name → body.
pub fn parse_sectioned(output: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.len() > 6 && trimmed.starts_with("---") && trimmed.ends_with("---") {
            if let Some((name, body)) = current.take() {
                sections.insert(name, body.join("\n"));
            }
            let name = trimmed.trim_matches('-').to_string();
            current = Some((name, Vec::new()));
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current.take() {
        sections.insert(name, body.join("\n"));
    }
    sections
}

pub fn parse_battery_level(output: &str) -> Option<u8> {
    for line in output.lines() {
        if let Some(value) = line.trim().strip_prefix("level:") {
            if let Ok(level) = value.trim().parse::<u8>() {
                return Some(level);
            }
        }
    }
    None
}

pub fn parse_battery_scale(output: &str) -> Option<u32> {
    for line in output.lines() {
        if let Some(value) = line.trim().strip_prefix("scale:") {
            if let Ok(scale) = value.trim().parse::<u32>() {
                return Some(scale);
            }
        }
    }
    None
}

pub fn parse_settings_bool(output: &str) -> Option<bool> {
    let value = output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())?;
    if let Ok(num) = value.parse::<i32>() {
        return Some(num != 0);
    }
    match value.to_lowercase().as_str() {
        "true" | "on" | "enabled" => Some(true),
        "false" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// `wm size` output; an override size wins over the physical size.
pub fn parse_wm_size(output: &str) -> Option<String> {
    let mut physical: Option<String> = None;
    let mut override_size: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("override size:") {
            override_size = trimmed
                .split_once(':')
                .and_then(|item| parse_wm_size_value(item.1));
        } else if lower.starts_with("physical size:") {
            physical = trimmed
                .split_once(':')
                .and_then(|item| parse_wm_size_value(item.1));
        }
    }
    override_size.or(physical)
}

fn parse_wm_size_value(value: &str) -> Option<String> {
    let value = value.trim();
    let (w_str, h_str) = value.split_once('x').or_else(|| value.split_once('X'))?;
    let w = w_str.trim().parse::<u32>().ok()?;
    let h = h_str.trim().parse::<u32>().ok()?;
    Some(format!("{w}x{h}"))
}

pub fn parse_wm_density(output: &str) -> Option<u32> {
    for line in output.lines() {
        let trimmed = line.trim().to_ascii_lowercase();
        for prefix in ["override density:", "physical density:"] {
            if let Some(value) = trimmed.strip_prefix(prefix) {
                if let Ok(density) = value.trim().parse::<u32>() {
                    return Some(density);
                }
            }
        }
    }
    None
}

/// `cmd bluetooth_manager get-state` output: a `State: ON` style line, or on
/// some builds just the bare state token.
pub fn parse_bluetooth_manager_state(output: &str) -> Option<String> {
    let state_re = Regex::new(r"(?i)state\s*[:=]\s*([A-Za-z_]+)").ok()?;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(caps) = state_re.captures(trimmed) {
            return Some(caps[1].to_uppercase());
        }
    }
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}

/// Condense `dumpsys audio` into one `key=value | ...` summary line covering
/// mode, ringer, music activity and routing state.
pub fn parse_audio_summary(output: &str) -> Option<String> {
    let mode_re = Regex::new(r"(?i)\bmode\s*[:=]\s*([A-Za-z_]+)").ok()?;
    let ringer_re = Regex::new(r"(?i)\bringer\s+mode\s*[:=]\s*([A-Za-z_]+)").ok()?;
    let music_re = Regex::new(r"(?i)music\s+active\s*[:=]\s*([A-Za-z_]+)").ok()?;
    let device_re = Regex::new(r"(?i)device\s+(?:current\s+)?state\s*[:=]\s*(.+)").ok()?;
    let sco_re = Regex::new(r"(?i)sco\s+state\s*[:=]\s*(.+)").ok()?;

    let mut mode = None;
    let mut ringer = None;
    let mut music_active = None;
    let mut device_state = None;
    let mut sco_state = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if mode.is_none() {
            if let Some(caps) = mode_re.captures(trimmed) {
                mode = Some(caps[1].to_uppercase());
                continue;
            }
        }
        if ringer.is_none() {
            if let Some(caps) = ringer_re.captures(trimmed) {
                ringer = Some(caps[1].to_uppercase());
                continue;
            }
        }
        if music_active.is_none() {
            if let Some(caps) = music_re.captures(trimmed) {
                music_active = Some(caps[1].to_lowercase());
                continue;
            }
        }
        if device_state.is_none() {
            if let Some(caps) = device_re.captures(trimmed) {
                device_state = Some(caps[1].trim().to_string());
                continue;
            }
        }
        if sco_state.is_none() {
            if let Some(caps) = sco_re.captures(trimmed) {
                sco_state = Some(caps[1].trim().to_string());
            }
        }
        if mode.is_some()
            && ringer.is_some()
            && music_active.is_some()
            && device_state.is_some()
            && sco_state.is_some()
        {
            break;
        }
    }

    let mut parts = Vec::new();
    if let Some(mode) = mode {
        parts.push(format!("mode={mode}"));
    }
    if let Some(ringer) = ringer {
        parts.push(format!("ringer={ringer}"));
    }
    if let Some(music) = music_active {
        parts.push(format!("music_active={music}"));
    }
    if let Some(device_state) = device_state {
        parts.push(format!("device_state={device_state}"));
    }
    if let Some(sco_state) = sco_state {
        parts.push(format!("sco_state={sco_state}"));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

/// First `versionName` in a `dumpsys package` dump.
pub fn parse_dumpsys_version_name(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("versionName=") {
            return Some(value.trim_matches(['"', '\'']).to_string());
        }
        if let Some(value) = trimmed.strip_prefix("versionName:") {
            return Some(value.trim().trim_matches(['"', '\'']).to_string());
        }
        if trimmed.contains("versionName") {
            if let Some((_, tail)) = trimmed.split_once("versionName=") {
                return Some(tail.trim_matches(['"', '\'']).to_string());
            }
        }
    }
    None
}

/// Keys written into the device's extended-attrs map by the refresher.
pub const ATTR_BATTERY_LEVEL: &str = "battery_level";
pub const ATTR_BATTERY_SCALE: &str = "battery_scale";
pub const ATTR_SCREEN_SIZE: &str = "screen_size";
pub const ATTR_SCREEN_DENSITY: &str = "screen_density";
pub const ATTR_CPU_ARCH: &str = "cpu_arch";

/// Everything one refresher probe learned about a device: the open-ended
/// extended-attrs map plus the named slow-changing attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshedAttrs {
    pub extended: BTreeMap<String, String>,
    pub gms_version: Option<String>,
    pub audio_state: Option<String>,
    pub bluetooth_manager_state: Option<String>,
}

/// Parse the sectioned refresher probe.
pub fn parse_refreshed_attrs(output: &str) -> RefreshedAttrs {
    let sections = parse_sectioned(output);
    let mut attrs = BTreeMap::new();
    if let Some(battery) = sections.get("BATTERY") {
        if let Some(level) = parse_battery_level(battery) {
            attrs.insert(ATTR_BATTERY_LEVEL.to_string(), level.to_string());
        }
        if let Some(scale) = parse_battery_scale(battery) {
            attrs.insert(ATTR_BATTERY_SCALE.to_string(), scale.to_string());
        }
    }
    if let Some(size) = sections.get("SIZE").and_then(|body| parse_wm_size(body)) {
        attrs.insert(ATTR_SCREEN_SIZE.to_string(), size);
    }
    if let Some(density) = sections.get("DENSITY").and_then(|body| parse_wm_density(body)) {
        attrs.insert(ATTR_SCREEN_DENSITY.to_string(), density.to_string());
    }
    if let Some(arch) = sections.get("ARCH").and_then(|body| clean_value(body)) {
        attrs.insert(ATTR_CPU_ARCH.to_string(), arch);
    }
    RefreshedAttrs {
        extended: attrs,
        gms_version: sections
            .get("GMS")
            .and_then(|body| parse_dumpsys_version_name(body)),
        audio_state: sections
            .get("AUDIO")
            .and_then(|body| parse_audio_summary(body)),
        bluetooth_manager_state: sections
            .get("BT_STATE")
            .and_then(|body| parse_bluetooth_manager_state(body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adb_devices_output() {
        let output = "List of devices attached\n\
            0123456789ABCDEF device usb:1-4 product:panther model:Pixel_7 transport_id:1\n\
            emulator-5554 unauthorized transport_id:2\n\
            FA77V0301234 offline\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].serial, "0123456789ABCDEF");
        assert_eq!(parsed[0].state, ConnectionState::Device);
        assert_eq!(parsed[0].usb.as_deref(), Some("1-4"));
        assert_eq!(parsed[0].product.as_deref(), Some("panther"));
        assert_eq!(parsed[0].model.as_deref(), Some("Pixel_7"));
        assert_eq!(parsed[1].state, ConnectionState::Unauthorized);
        assert_eq!(parsed[2].state, ConnectionState::Offline);
    }

    #[test]
    fn skips_daemon_banner_lines() {
        let output = "* daemon not running; starting now at tcp:5037\n\
            * daemon started successfully\n\
            List of devices attached\nSER device\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].serial, "SER");
    }

    #[test]
    fn parses_identity_probe_lines() {
        let output = "model=Pixel 7\nandroid=14\napi=34\nfingerprint=google/panther\nwifi=1\nbt=0\n";
        let probe = parse_identity_probe(output);
        assert_eq!(probe.model.as_deref(), Some("Pixel 7"));
        assert_eq!(probe.android_version.as_deref(), Some("14"));
        assert_eq!(probe.api_level.as_deref(), Some("34"));
        assert_eq!(probe.wifi_on, TriState::On);
        assert_eq!(probe.bt_on, TriState::Off);
    }

    #[test]
    fn probe_treats_unreadable_settings_as_unknown() {
        let output = "model=Pixel\nwifi=null\nbt=\n";
        let probe = parse_identity_probe(output);
        assert_eq!(probe.wifi_on, TriState::Unknown);
        assert_eq!(probe.bt_on, TriState::Unknown);
    }

    #[test]
    fn parses_sectioned_probe_output() {
        let output = "---BATTERY---\nAC powered: false\nlevel: 87\nscale: 100\n\
            ---SIZE---\nPhysical size: 1080x2400\n\
            ---DENSITY---\nPhysical density: 420\n\
            ---ARCH---\narm64-v8a\n";
        let attrs = parse_refreshed_attrs(output).extended;
        assert_eq!(attrs.get(ATTR_BATTERY_LEVEL).map(String::as_str), Some("87"));
        assert_eq!(attrs.get(ATTR_BATTERY_SCALE).map(String::as_str), Some("100"));
        assert_eq!(attrs.get(ATTR_SCREEN_SIZE).map(String::as_str), Some("1080x2400"));
        assert_eq!(attrs.get(ATTR_SCREEN_DENSITY).map(String::as_str), Some("420"));
        assert_eq!(attrs.get(ATTR_CPU_ARCH).map(String::as_str), Some("arm64-v8a"));
    }

    #[test]
    fn parses_bluetooth_manager_state() {
        assert_eq!(
            parse_bluetooth_manager_state("state: ON\n").as_deref(),
            Some("ON")
        );
        // Bare token fallback for builds that print only the state.
        assert_eq!(parse_bluetooth_manager_state("12\n").as_deref(), Some("12"));
        assert_eq!(parse_bluetooth_manager_state("\n"), None);
    }

    #[test]
    fn parses_audio_summary() {
        let output = "mode: IN_COMMUNICATION\nringer mode: NORMAL\nmusic active: true\n";
        let summary = parse_audio_summary(output).expect("summary");
        assert!(summary.contains("mode=IN_COMMUNICATION"));
        assert!(summary.contains("ringer=NORMAL"));
        assert!(summary.contains("music_active=true"));
        assert_eq!(parse_audio_summary("nothing relevant\n"), None);
    }

    #[test]
    fn parses_dumpsys_version_name() {
        let output = "versionName=22.1.0\nversionCode=12345 minSdk=23\n";
        assert_eq!(parse_dumpsys_version_name(output).as_deref(), Some("22.1.0"));
        assert_eq!(parse_dumpsys_version_name("versionCode=1\n"), None);
    }

    #[test]
    fn refreshed_attrs_carry_connectivity_fields() {
        let output = "---BATTERY---\nlevel: 64\nscale: 100\n\
            ---SIZE---\nPhysical size: 1080x2400\n\
            ---DENSITY---\nPhysical density: 420\n\
            ---ARCH---\narm64-v8a\n\
            ---BT_STATE---\nstate: ON\n\
            ---AUDIO---\nmode: NORMAL\nringer mode: SILENT\n\
            ---GMS---\nversionName=24.08.12\n";
        let refreshed = parse_refreshed_attrs(output);
        assert_eq!(
            refreshed.extended.get(ATTR_BATTERY_LEVEL).map(String::as_str),
            Some("64")
        );
        assert_eq!(refreshed.bluetooth_manager_state.as_deref(), Some("ON"));
        assert_eq!(refreshed.gms_version.as_deref(), Some("24.08.12"));
        let audio = refreshed.audio_state.expect("audio summary");
        assert!(audio.contains("mode=NORMAL"));
        assert!(audio.contains("ringer=SILENT"));
    }

    #[test]
    fn wm_size_override_preferred() {
        let output = "Physical size: 1080x2400\nOverride size: 720x1600\n";
        assert_eq!(parse_wm_size(output).as_deref(), Some("720x1600"));
    }

    #[test]
    fn parses_settings_bool_variants() {
        assert_eq!(parse_settings_bool("1"), Some(true));
        assert_eq!(parse_settings_bool("0"), Some(false));
        assert_eq!(parse_settings_bool("true"), Some(true));
        assert_eq!(parse_settings_bool("disabled"), Some(false));
        assert_eq!(parse_settings_bool("null"), None);
    }
}
