use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CoreError;

pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Connection state as reported by `adb devices -l`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Device,
    Offline,
    Unauthorized,
    Recovery,
    Bootloader,
    Sideload,
    Unknown,
}

impl ConnectionState {
    pub fn parse(token: &str) -> Self {
        match token {
            "device" => ConnectionState::Device,
            "offline" => ConnectionState::Offline,
            "unauthorized" => ConnectionState::Unauthorized,
            "recovery" => ConnectionState::Recovery,
            "bootloader" => ConnectionState::Bootloader,
            "sideload" => ConnectionState::Sideload,
            _ => ConnectionState::Unknown,
        }
    }

    /// Only devices in `device` state accept regular operations.
    pub fn is_operational(self) -> bool {
        self == ConnectionState::Device
    }
}

/// Tri-state for radios whose state may not be readable on every build.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    On,
    Off,
    #[default]
    Unknown,
}

impl TriState {
    pub fn from_bool(value: Option<bool>) -> Self {
        match value {
            Some(true) => TriState::On,
            Some(false) => TriState::Off,
            None => TriState::Unknown,
        }
    }

    pub fn is_known(self) -> bool {
        self != TriState::Unknown
    }
}

/// One row of `adb devices -l` output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: ConnectionState,
    pub usb: Option<String>,
    pub product: Option<String>,
    pub model: Option<String>,
    pub transport_id: Option<String>,
}

/// Cached view of a connected device. Identity fields are set on first
/// discovery; mutable attributes are refreshed by the poller and the
/// background attr refresher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub serial: String,
    pub usb: Option<String>,
    pub product: Option<String>,
    pub state: ConnectionState,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub api_level: Option<String>,
    pub gms_version: Option<String>,
    pub build_fingerprint: Option<String>,
    pub wifi_on: TriState,
    pub bt_on: TriState,
    pub audio_state: Option<String>,
    pub bluetooth_manager_state: Option<String>,
    /// Slow-changing attributes (battery, screen, CPU arch) keyed by name.
    pub extended: BTreeMap<String, String>,
}

impl Device {
    pub fn from_summary(summary: &DeviceSummary) -> Self {
        Self {
            serial: summary.serial.clone(),
            usb: summary.usb.clone(),
            product: summary.product.clone(),
            state: summary.state,
            model: summary.model.clone(),
            android_version: None,
            api_level: None,
            gms_version: None,
            build_fingerprint: None,
            wifi_on: TriState::Unknown,
            bt_on: TriState::Unknown,
            audio_state: None,
            bluetooth_manager_state: None,
            extended: BTreeMap::new(),
        }
    }

    pub fn display_name(&self) -> String {
        self.model.clone().unwrap_or_else(|| self.serial.clone())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Screenshot,
    Reboot,
    InstallApk,
    Recording,
    BugReport,
    ShellCommand,
    Bluetooth,
    Scrcpy,
    UiInspector,
}

impl OperationType {
    pub fn display_name(self) -> &'static str {
        match self {
            OperationType::Screenshot => "Screenshot",
            OperationType::Reboot => "Reboot",
            OperationType::InstallApk => "Install APK",
            OperationType::Recording => "Recording",
            OperationType::BugReport => "Bug Report",
            OperationType::ShellCommand => "Shell Command",
            OperationType::Bluetooth => "Bluetooth",
            OperationType::Scrcpy => "scrcpy",
            OperationType::UiInspector => "UI Inspector",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Transitions never move backwards; terminal states are final.
    pub fn rank(self) -> u8 {
        match self {
            OperationStatus::Pending => 0,
            OperationStatus::Running => 1,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled => 2,
        }
    }
}

fn new_operation_id() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    id[..8].to_string()
}

/// Status-manager entry describing one device operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationEvent {
    pub operation_id: String,
    pub device_serial: String,
    pub device_name: Option<String>,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub started_at: f64,
    pub completed_at: Option<f64>,
    /// Fractional progress in [0, 1] when the operation can estimate it.
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub error_message: Option<String>,
    pub can_cancel: bool,
}

impl OperationEvent {
    pub fn create(
        device_serial: impl Into<String>,
        operation_type: OperationType,
        device_name: Option<String>,
        message: Option<String>,
        can_cancel: bool,
    ) -> Self {
        Self {
            operation_id: new_operation_id(),
            device_serial: device_serial.into(),
            device_name,
            operation_type,
            status: OperationStatus::Pending,
            started_at: now_epoch(),
            completed_at: None,
            progress: None,
            message,
            error_message: None,
            can_cancel,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn elapsed_seconds(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(now_epoch);
        (end - self.started_at).max(0.0)
    }
}

/// Why the current recording segment ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    Internal,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordingEventType {
    SegmentCompleted,
    Error,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingProgressEvent {
    #[serde(rename = "type")]
    pub event_type: RecordingEventType,
    pub device_serial: String,
    pub device_name: Option<String>,
    pub output_path: Option<String>,
    pub segment_index: Option<u32>,
    pub segment_filename: Option<String>,
    pub duration_seconds: Option<f64>,
    pub total_duration_seconds: Option<f64>,
    pub message: Option<String>,
    pub request_origin: Option<RequestOrigin>,
}

impl RecordingProgressEvent {
    pub fn error(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: RecordingEventType::Error,
            device_serial: serial.into(),
            device_name: None,
            output_path: None,
            segment_index: None,
            segment_filename: None,
            duration_seconds: None,
            total_duration_seconds: None,
            message: Some(message.into()),
            request_origin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingSegment {
    pub index: u32,
    pub filename: String,
    pub duration_seconds: f64,
    pub total_duration_seconds: f64,
}

/// Per-device recording session bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingSession {
    pub serial: String,
    pub device_name: String,
    pub output_path: String,
    pub started_at: f64,
    pub segments: Vec<RecordingSegment>,
    pub elapsed_before_current_segment: f64,
    pub ongoing_segment_start: Option<f64>,
    pub active: bool,
    /// UI-facing elapsed counter; never regresses within a session even when
    /// segment events and heartbeats race.
    pub display_seconds: u64,
}

const MAX_RETAINED_SEGMENTS: usize = 20;

impl RecordingSession {
    pub fn new(serial: impl Into<String>, device_name: impl Into<String>, output_path: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            device_name: device_name.into(),
            output_path: output_path.into(),
            started_at: now_epoch(),
            segments: Vec::new(),
            elapsed_before_current_segment: 0.0,
            ongoing_segment_start: Some(now_epoch()),
            active: true,
            display_seconds: 0,
        }
    }

    pub fn apply_segment(&mut self, segment: RecordingSegment, origin: RequestOrigin) {
        let total = segment.total_duration_seconds;
        self.segments.push(segment);
        if self.segments.len() > MAX_RETAINED_SEGMENTS {
            let overflow = self.segments.len() - MAX_RETAINED_SEGMENTS;
            self.segments.drain(..overflow);
        }
        self.elapsed_before_current_segment = total;
        self.ongoing_segment_start = match origin {
            RequestOrigin::User => None,
            RequestOrigin::Internal => Some(now_epoch()),
        };
        self.display_seconds = self.display_seconds.max(total.floor() as u64);
    }

    pub fn observe_elapsed(&mut self, total_seconds: f64) {
        self.display_seconds = self.display_seconds.max(total_seconds.floor() as u64);
    }

    pub fn mark_inactive(&mut self) {
        self.active = false;
        self.ongoing_segment_start = None;
    }
}

/// Outcome of one shell command on one device.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandResult {
    pub serial: String,
    pub command: String,
    pub lines: Vec<String>,
    pub exit_code: Option<i32>,
    pub duration_seconds: f64,
    pub error: Option<CoreError>,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code.unwrap_or(1) == 0
    }
}

/// All per-device outcomes of one command, in stable requested order.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandBlock {
    pub command: String,
    pub results: Vec<CommandResult>,
    pub trace_id: String,
}

/// Consolidated terminal summary for a multi-device operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationSummary {
    pub operation_type: OperationType,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Per-device single-line error tails.
    pub errors: Vec<(String, String)>,
    /// Local artifacts written by the operation, if any.
    pub artifacts: Vec<String>,
    pub trace_id: String,
}

impl OperationSummary {
    pub fn new(operation_type: OperationType, trace_id: impl Into<String>) -> Self {
        Self {
            operation_type,
            total: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            errors: Vec::new(),
            artifacts: Vec::new(),
            trace_id: trace_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_six_connection_states() {
        for (token, expected) in [
            ("device", ConnectionState::Device),
            ("offline", ConnectionState::Offline),
            ("unauthorized", ConnectionState::Unauthorized),
            ("recovery", ConnectionState::Recovery),
            ("bootloader", ConnectionState::Bootloader),
            ("sideload", ConnectionState::Sideload),
        ] {
            assert_eq!(ConnectionState::parse(token), expected);
        }
        assert_eq!(ConnectionState::parse("host"), ConnectionState::Unknown);
        assert!(ConnectionState::Device.is_operational());
        assert!(!ConnectionState::Unauthorized.is_operational());
    }

    #[test]
    fn operation_event_terminal_sets_are_consistent() {
        let event = OperationEvent::create("SER", OperationType::Screenshot, None, None, false);
        assert!(event.is_active());
        assert_eq!(event.status, OperationStatus::Pending);
        assert!(OperationStatus::Cancelled.is_terminal());
        assert!(OperationStatus::Running.rank() > OperationStatus::Pending.rank());
    }

    #[test]
    fn display_seconds_never_regresses() {
        let mut session = RecordingSession::new("SER", "Pixel", "/tmp/out");
        session.apply_segment(
            RecordingSegment {
                index: 1,
                filename: "record_part01.mp4".to_string(),
                duration_seconds: 170.0,
                total_duration_seconds: 170.0,
            },
            RequestOrigin::Internal,
        );
        assert_eq!(session.display_seconds, 170);
        // A late, lower observation must not pull the counter back.
        session.observe_elapsed(12.0);
        assert_eq!(session.display_seconds, 170);
        session.apply_segment(
            RecordingSegment {
                index: 2,
                filename: "record_part02.mp4".to_string(),
                duration_seconds: 30.0,
                total_duration_seconds: 200.0,
            },
            RequestOrigin::User,
        );
        assert_eq!(session.display_seconds, 200);
        assert!(session.ongoing_segment_start.is_none());
    }

    #[test]
    fn session_caps_retained_segments() {
        let mut session = RecordingSession::new("SER", "Pixel", "/tmp/out");
        for index in 1..=25u32 {
            session.apply_segment(
                RecordingSegment {
                    index,
                    filename: format!("record_part{index:02}.mp4"),
                    duration_seconds: 170.0,
                    total_duration_seconds: 170.0 * index as f64,
                },
                RequestOrigin::Internal,
            );
        }
        assert_eq!(session.segments.len(), 20);
        assert_eq!(session.segments.first().map(|s| s.index), Some(6));
    }
}
