use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::version::app_version;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UiSettings {
    pub theme: String,
    pub ui_scale: f32,
    pub show_console_panel: bool,
    pub single_selection: bool,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            ui_scale: 1.0,
            show_console_panel: false,
            single_selection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    /// Discovery poll interval in seconds; valid choices are 5/10/20/30/60.
    pub refresh_interval: i32,
    pub auto_refresh: bool,
    pub show_offline_devices: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            refresh_interval: 30,
            auto_refresh: true,
            show_offline_devices: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSettings {
    pub max_history_size: usize,
    pub auto_save_history: bool,
    pub command_timeout: i32,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            max_history_size: 50,
            auto_save_history: true,
            command_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenshotSettings {
    pub extra_args: String,
    pub display_id: i32,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            extra_args: String::new(),
            display_id: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenRecordSettings {
    pub bit_rate: String,
    pub size: String,
    pub use_hevc: bool,
    pub extra_args: String,
    pub display_id: i32,
}

impl Default for ScreenRecordSettings {
    fn default() -> Self {
        Self {
            bit_rate: String::new(),
            size: String::new(),
            use_hevc: false,
            extra_args: String::new(),
            display_id: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApkInstallSettings {
    pub replace_existing: bool,
    pub allow_downgrade: bool,
    pub grant_permissions: bool,
    pub allow_test_packages: bool,
    pub extra_args: String,
}

impl Default for ApkInstallSettings {
    fn default() -> Self {
        Self {
            replace_existing: true,
            allow_downgrade: true,
            grant_permissions: true,
            allow_test_packages: false,
            extra_args: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub ui: UiSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub screenshot: ScreenshotSettings,
    #[serde(default)]
    pub screen_record: ScreenRecordSettings,
    #[serde(default)]
    pub apk_install: ApkInstallSettings,
    #[serde(default)]
    pub command_history: Vec<String>,
    /// Named device groups; membership is serials, not device objects.
    #[serde(default)]
    pub device_groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub adb_path: String,
    #[serde(default)]
    pub output_path: String,
    #[serde(default)]
    pub file_gen_output_path: String,
    #[serde(default)]
    pub version: String,
    /// Keys written by newer builds survive a load/save round trip.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ui: UiSettings::default(),
            device: DeviceSettings::default(),
            command: CommandSettings::default(),
            screenshot: ScreenshotSettings::default(),
            screen_record: ScreenRecordSettings::default(),
            apk_install: ApkInstallSettings::default(),
            command_history: Vec::new(),
            device_groups: HashMap::new(),
            adb_path: String::new(),
            output_path: String::new(),
            file_gen_output_path: String::new(),
            version: app_version(),
            extra: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Resolve a device group to the subset of its serials currently known.
    /// Stale serials are silently ignored.
    pub fn resolve_group(&self, name: &str, known_serials: &[String]) -> Vec<String> {
        let Some(members) = self.device_groups.get(name) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|serial| known_serials.iter().any(|known| known == *serial))
            .cloned()
            .collect()
    }

    pub fn push_history(&mut self, command: &str) {
        if command.trim().is_empty() {
            return;
        }
        if self
            .command_history
            .last()
            .map(|last| last == command)
            .unwrap_or(false)
        {
            return;
        }
        self.command_history.push(command.to_string());
        if self.command_history.len() > self.command.max_history_size {
            let start = self
                .command_history
                .len()
                .saturating_sub(self.command.max_history_size);
            self.command_history = self.command_history.split_off(start);
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("LAZY_BLACKTEA_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".lazy_blacktea_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".lazy_blacktea_config.backup.json")
}

pub fn load_config() -> Result<AppConfig, CoreError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), CoreError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, CoreError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| CoreError::config(format!("failed to read config: {err}")))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| CoreError::config(format!("failed to parse config: {err}")))?;
    let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
    config = apply_legacy_overrides(config, &value);
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let mut stamped = config.clone();
    stamped.version = app_version();
    let payload = serde_json::to_string_pretty(&stamped)
        .map_err(|err| CoreError::config(format!("failed to serialize config: {err}")))?;
    fs::write(path, payload)
        .map_err(|err| CoreError::config(format!("failed to write config: {err}")))?;
    Ok(())
}

/// Older releases stored a handful of values as flat top-level keys.
fn apply_legacy_overrides(mut config: AppConfig, value: &serde_json::Value) -> AppConfig {
    if let Some(ui_scale) = value.get("ui_scale").and_then(|v| v.as_f64()) {
        config.ui.ui_scale = ui_scale as f32;
    }
    if let Some(refresh_interval) = value.get("refresh_interval").and_then(|v| v.as_i64()) {
        config.device.refresh_interval = refresh_interval as i32;
    }
    if let Some(output_path) = value.get("output_path").and_then(|v| v.as_str()) {
        config.output_path = output_path.to_string();
    }
    config
}

const REFRESH_INTERVAL_CHOICES: [i32; 5] = [5, 10, 20, 30, 60];

fn validate_config(mut config: AppConfig) -> AppConfig {
    if !(0.5..=3.0).contains(&config.ui.ui_scale) {
        config.ui.ui_scale = 1.0;
    }
    if !REFRESH_INTERVAL_CHOICES.contains(&config.device.refresh_interval) {
        config.device.refresh_interval = 30;
    }
    if config.command.command_timeout < 1 {
        config.command.command_timeout = 30;
    }
    if config.command.max_history_size == 0 {
        config.command.max_history_size = 50;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn preserves_unknown_keys_across_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.json");
        let backup = dir.path().join("config.backup.json");
        fs::write(
            &path,
            r#"{"output_path": "/tmp/out", "future_feature": {"enabled": true}}"#,
        )
        .expect("write fixture");

        let config = load_config_from_path(&path).expect("load");
        assert_eq!(config.output_path, "/tmp/out");
        save_config_to_path(&config, &path, &backup).expect("save");

        let reread: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(
            reread.get("future_feature").and_then(|v| v.get("enabled")),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn merges_legacy_flat_keys() {
        let value = serde_json::json!({
            "ui_scale": 2.5,
            "refresh_interval": 10,
            "output_path": "/tmp/out"
        });
        let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
        config = apply_legacy_overrides(config, &value);
        assert_eq!(config.ui.ui_scale, 2.5);
        assert_eq!(config.device.refresh_interval, 10);
        assert_eq!(config.output_path, "/tmp/out");
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.ui.ui_scale = 10.0;
        config.device.refresh_interval = 7;
        config.command.max_history_size = 0;
        let validated = validate_config(config);
        assert_eq!(validated.ui.ui_scale, 1.0);
        assert_eq!(validated.device.refresh_interval, 30);
        assert_eq!(validated.command.max_history_size, 50);
    }

    #[test]
    fn resolves_groups_ignoring_stale_serials() {
        let mut config = AppConfig::default();
        config.device_groups.insert(
            "lab".to_string(),
            vec!["A".to_string(), "GONE".to_string(), "B".to_string()],
        );
        let known = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        assert_eq!(config.resolve_group("lab", &known), vec!["A", "B"]);
        assert!(config.resolve_group("missing", &known).is_empty());
    }

    #[test]
    fn history_dedupes_trailing_and_truncates() {
        let mut config = AppConfig::default();
        config.command.max_history_size = 3;
        for cmd in ["a", "a", "b", "c", "d"] {
            config.push_history(cmd);
        }
        assert_eq!(config.command_history, vec!["b", "c", "d"]);
    }
}
