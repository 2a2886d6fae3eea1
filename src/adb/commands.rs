//! Pure argument-vector builders for every adb invocation the core issues.
//! Keeping them together makes the subprocess surface auditable in one place.

use serde::{Deserialize, Serialize};

use crate::config::{ApkInstallSettings, ScreenRecordSettings};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RebootMode {
    System,
    Recovery,
    Bootloader,
}

impl RebootMode {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "recovery" => RebootMode::Recovery,
            "bootloader" => RebootMode::Bootloader,
            _ => RebootMode::System,
        }
    }
}

fn with_serial(serial: &str, rest: &[&str]) -> Vec<String> {
    let mut args = vec!["-s".to_string(), serial.to_string()];
    args.extend(rest.iter().map(|item| item.to_string()));
    args
}

pub fn devices_with_details() -> Vec<String> {
    vec!["devices".to_string(), "-l".to_string()]
}

pub fn kill_server() -> Vec<String> {
    vec!["kill-server".to_string()]
}

pub fn start_server() -> Vec<String> {
    vec!["start-server".to_string()]
}

pub fn version() -> Vec<String> {
    vec!["version".to_string()]
}

/// Generic shell command wrapped in `sh -c` so pipes and quoting behave the
/// same on every device.
pub fn shell(serial: &str, command: &str) -> Vec<String> {
    with_serial(serial, &["shell", "sh", "-c", command])
}

pub fn screenshot_exec_out(serial: &str) -> Vec<String> {
    with_serial(serial, &["exec-out", "screencap", "-p"])
}

pub fn screenshot_to_remote(serial: &str, remote: &str) -> Vec<String> {
    with_serial(serial, &["shell", "screencap", "-p", remote])
}

/// `screenrecord` started with no time limit; the segment loop terminates it
/// before adb's internal 180s ceiling.
pub fn screenrecord(serial: &str, remote: &str, settings: &ScreenRecordSettings) -> Vec<String> {
    let mut args = with_serial(serial, &["shell", "screenrecord"]);
    if !settings.bit_rate.trim().is_empty() {
        args.push("--bit-rate".to_string());
        args.push(settings.bit_rate.trim().to_string());
    }
    if !settings.size.trim().is_empty() {
        args.push("--size".to_string());
        args.push(settings.size.trim().to_string());
    }
    if settings.use_hevc {
        args.push("--codec".to_string());
        args.push("hevc".to_string());
    }
    if settings.display_id >= 0 {
        args.push("--display-id".to_string());
        args.push(settings.display_id.to_string());
    }
    if !settings.extra_args.trim().is_empty() {
        args.extend(
            settings
                .extra_args
                .split_whitespace()
                .map(|item| item.to_string()),
        );
    }
    args.push(remote.to_string());
    args
}

/// SIGINT lets screenrecord finalize the MP4 moov atom before exiting.
pub fn screenrecord_interrupt(serial: &str) -> Vec<String> {
    with_serial(serial, &["shell", "pkill", "-SIGINT", "screenrecord"])
}

pub fn pull(serial: &str, remote: &str, local: &str) -> Vec<String> {
    with_serial(serial, &["pull", remote, local])
}

pub fn remove_remote(serial: &str, remote: &str) -> Vec<String> {
    with_serial(serial, &["shell", "rm", "-f", remote])
}

pub fn install(serial: &str, apk_path: &str, settings: &ApkInstallSettings) -> Vec<String> {
    let mut args = with_serial(serial, &["install"]);
    if settings.replace_existing {
        args.push("-r".to_string());
    }
    if settings.allow_downgrade {
        args.push("-d".to_string());
    }
    if settings.grant_permissions {
        args.push("-g".to_string());
    }
    if settings.allow_test_packages {
        args.push("-t".to_string());
    }
    if !settings.extra_args.trim().is_empty() {
        args.extend(
            settings
                .extra_args
                .split_whitespace()
                .map(|item| item.to_string()),
        );
    }
    args.push(apk_path.to_string());
    args
}

pub fn reboot(serial: &str, mode: RebootMode) -> Vec<String> {
    let mut args = with_serial(serial, &["reboot"]);
    match mode {
        RebootMode::Recovery => args.push("recovery".to_string()),
        RebootMode::Bootloader => args.push("bootloader".to_string()),
        RebootMode::System => {}
    }
    args
}

pub fn dumpsys(serial: &str, service: &str) -> Vec<String> {
    with_serial(serial, &["shell", "dumpsys", service])
}

pub const BLUETOOTH_SNAPSHOT_SEPARATOR: &str = "---SEPARATOR---";

/// Both bluetooth dumps in a single shell round trip; the separator line is
/// ignored by the parser, which treats the output as one blob.
pub fn bluetooth_snapshot(serial: &str) -> Vec<String> {
    shell(
        serial,
        "dumpsys bluetooth_manager && echo '---SEPARATOR---' && dumpsys bluetooth_adapter",
    )
}

pub fn logcat(serial: &str, flags: &[&str]) -> Vec<String> {
    let mut args = with_serial(serial, &["logcat"]);
    args.extend(flags.iter().map(|item| item.to_string()));
    args
}

pub fn bugreport(serial: &str, local_path: &str) -> Vec<String> {
    with_serial(serial, &["bugreport", local_path])
}

pub fn uiautomator_dump(serial: &str, remote: &str) -> Vec<String> {
    shell(serial, &format!("uiautomator dump {remote}"))
}

/// Low-cost identity/connectivity props in one shell call, emitted as
/// `key=value` lines the probe parser reads back.
pub fn identity_probe(serial: &str) -> Vec<String> {
    shell(
        serial,
        concat!(
            "echo model=$(getprop ro.product.model); ",
            "echo android=$(getprop ro.build.version.release); ",
            "echo api=$(getprop ro.build.version.sdk); ",
            "echo fingerprint=$(getprop ro.build.fingerprint); ",
            "echo wifi=$(settings get global wifi_on); ",
            "echo bt=$(settings get global bluetooth_on)",
        ),
    )
}

/// Slow-changing attributes for the background refresher, sectioned with
/// marker lines so one shell call covers the whole set: battery, screen,
/// CPU arch, bluetooth manager state, audio routing, and the GMS version.
pub fn extended_attrs_probe(serial: &str) -> Vec<String> {
    shell(
        serial,
        concat!(
            "echo '---BATTERY---'; dumpsys battery; ",
            "echo '---SIZE---'; wm size; ",
            "echo '---DENSITY---'; wm density; ",
            "echo '---ARCH---'; getprop ro.product.cpu.abi; ",
            "echo '---BT_STATE---'; cmd bluetooth_manager get-state; ",
            "echo '---AUDIO---'; dumpsys audio; ",
            "echo '---GMS---'; dumpsys package com.google.android.gms",
        ),
    )
}
