use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::adb::commands;
use crate::adb::runner::{AdbInvoker, RawInvoker, SCREENSHOT_COMMAND_TIMEOUT};
use crate::error::CoreError;
use crate::models::OperationType;
use crate::ops::fanout::{run_device_fanout, DeviceJob, DeviceTarget, FanoutDeps, FanoutHandle};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const BUG_REPORT_TIMEOUT: Duration = Duration::from_secs(120);

fn timestamp_stamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn sanitize_filename_component(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn ensure_output_dir(output_dir: &Path) -> Result<(), CoreError> {
    fs::create_dir_all(output_dir)
        .map_err(|err| CoreError::io(format!("failed to create output dir: {err}")))
}

/// Screenshot every target via `exec-out screencap -p`, falling back to a
/// device-side capture plus pull when exec-out misbehaves (some builds write
/// noise to its stdout). Artifacts land at `<output>/<timestamp>_<serial>.png`.
pub fn take_screenshot(
    deps: &FanoutDeps,
    raw: RawInvoker,
    invoker: AdbInvoker,
    targets: Vec<DeviceTarget>,
    output_dir: &Path,
) -> Result<FanoutHandle, CoreError> {
    ensure_output_dir(output_dir)?;
    let output_dir = output_dir.to_path_buf();

    let job: DeviceJob = Arc::new(move |target, token| {
        let serial = target.serial.as_str();
        let filename = format!("{}_{}.png", timestamp_stamp(), sanitize_filename_component(serial));
        let local = output_dir.join(&filename);

        let output = raw(
            &commands::screenshot_exec_out(serial),
            SCREENSHOT_COMMAND_TIMEOUT,
            token,
        )?;
        if output.exit_code == Some(0) && output.stdout.starts_with(PNG_SIGNATURE) {
            fs::write(&local, &output.stdout)
                .map_err(|err| CoreError::io(format!("failed to write screenshot: {err}")))?;
            return Ok(vec![local.to_string_lossy().to_string()]);
        }
        warn!(serial, "exec-out screencap failed; falling back to pull");
        token.checkpoint()?;

        let remote = format!("/sdcard/{filename}");
        let capture = invoker(
            &commands::screenshot_to_remote(serial, &remote),
            Duration::from_secs(10),
            token,
        )?;
        capture.require_success(&format!("adb -s {serial} shell screencap"))?;
        let pull = invoker(
            &commands::pull(serial, &remote, &local.to_string_lossy()),
            Duration::from_secs(20),
            token,
        )?;
        pull.require_success(&format!("adb -s {serial} pull {remote}"))?;
        if let Err(err) = invoker(
            &commands::remove_remote(serial, &remote),
            Duration::from_secs(10),
            token,
        ) {
            warn!(serial, error = %err, "failed to remove fallback screenshot");
        }
        Ok(vec![local.to_string_lossy().to_string()])
    });

    run_device_fanout(deps, OperationType::Screenshot, "take_screenshot", targets, job)
}

/// `adb bugreport` per device, 120s budget each, progress surfaced as
/// device-index/total on the operation rows.
pub fn generate_bug_report(
    deps: &FanoutDeps,
    invoker: AdbInvoker,
    targets: Vec<DeviceTarget>,
    output_dir: &Path,
) -> Result<FanoutHandle, CoreError> {
    ensure_output_dir(output_dir)?;
    let output_dir = output_dir.to_path_buf();

    let job: DeviceJob = Arc::new(move |target, token| {
        let serial = target.serial.as_str();
        let filename = format!(
            "bugreport_{}_{}.zip",
            sanitize_filename_component(serial),
            timestamp_stamp()
        );
        let local = output_dir.join(&filename);
        let output = invoker(
            &commands::bugreport(serial, &local.to_string_lossy()),
            BUG_REPORT_TIMEOUT,
            token,
        )?;
        output.require_success(&format!("adb -s {serial} bugreport"))?;
        Ok(vec![local.to_string_lossy().to_string()])
    });

    run_device_fanout(deps, OperationType::BugReport, "generate_bug_report", targets, job)
}

const UI_DUMP_REMOTE: &str = "/sdcard/window_dump.xml";

/// `uiautomator dump` plus a screenshot for one device. The XML is staged
/// through a scoped temp dir so aborted runs leave nothing behind; returns
/// the two final artifact paths.
pub fn dump_ui_hierarchy(
    deps: &FanoutDeps,
    raw: RawInvoker,
    invoker: AdbInvoker,
    target: DeviceTarget,
    output_dir: &Path,
) -> Result<FanoutHandle, CoreError> {
    ensure_output_dir(output_dir)?;
    let output_dir = output_dir.to_path_buf();

    let job: DeviceJob = Arc::new(move |target, token| {
        let serial = target.serial.as_str();
        let stamp = timestamp_stamp();
        let safe_serial = sanitize_filename_component(serial);

        let dump = invoker(
            &commands::uiautomator_dump(serial, UI_DUMP_REMOTE),
            Duration::from_secs(30),
            token,
        )?;
        dump.require_success(&format!("adb -s {serial} shell uiautomator dump"))?;

        let staging = tempfile::tempdir()
            .map_err(|err| CoreError::io(format!("failed to create staging dir: {err}")))?;
        let staged_xml = staging.path().join("window_dump.xml");
        let pull = invoker(
            &commands::pull(serial, UI_DUMP_REMOTE, &staged_xml.to_string_lossy()),
            Duration::from_secs(20),
            token,
        )?;
        pull.require_success(&format!("adb -s {serial} pull {UI_DUMP_REMOTE}"))?;
        if let Err(err) = invoker(
            &commands::remove_remote(serial, UI_DUMP_REMOTE),
            Duration::from_secs(10),
            token,
        ) {
            warn!(serial, error = %err, "failed to remove remote ui dump");
        }

        let xml_path: PathBuf = output_dir.join(format!("ui_dump_{safe_serial}_{stamp}.xml"));
        fs::copy(&staged_xml, &xml_path)
            .map_err(|err| CoreError::io(format!("failed to place ui dump: {err}")))?;

        token.checkpoint()?;
        let mut artifacts = vec![xml_path.to_string_lossy().to_string()];
        let screenshot = raw(
            &commands::screenshot_exec_out(serial),
            SCREENSHOT_COMMAND_TIMEOUT,
            token,
        )?;
        if screenshot.exit_code == Some(0) && screenshot.stdout.starts_with(PNG_SIGNATURE) {
            let png_path = output_dir.join(format!("ui_dump_{safe_serial}_{stamp}.png"));
            fs::write(&png_path, &screenshot.stdout)
                .map_err(|err| CoreError::io(format!("failed to write screenshot: {err}")))?;
            artifacts.push(png_path.to_string_lossy().to_string());
        } else {
            warn!(serial, "ui dump screenshot unavailable");
        }
        Ok(artifacts)
    });

    run_device_fanout(
        deps,
        OperationType::UiInspector,
        "dump_ui_hierarchy",
        vec![target],
        job,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::runner::{CommandOutput, RawOutput};
    use crate::dispatch::TaskDispatcher;
    use crate::events::EventBus;
    use crate::models::ConnectionState;
    use crate::status::StatusManager;

    fn deps() -> FanoutDeps {
        let bus = EventBus::new();
        FanoutDeps {
            dispatcher: Arc::new(TaskDispatcher::with_workers(2, 32, bus.clone())),
            status: StatusManager::spawn_with_dismiss_delay(bus.clone(), Duration::from_secs(600)),
            bus,
        }
    }

    fn ok_output() -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(1),
        }
    }

    fn png_raw() -> RawInvoker {
        Arc::new(|_args, _timeout, _token| {
            let mut bytes = PNG_SIGNATURE.to_vec();
            bytes.extend_from_slice(b"fake-image-data");
            Ok(RawOutput {
                stdout: bytes,
                stderr: Vec::new(),
                exit_code: Some(0),
            })
        })
    }

    fn ok_invoker() -> AdbInvoker {
        Arc::new(|_args, _timeout, _token| Ok(ok_output()))
    }

    fn target(serial: &str) -> DeviceTarget {
        DeviceTarget {
            serial: serial.to_string(),
            state: ConnectionState::Device,
            device_name: None,
        }
    }

    #[test]
    fn screenshot_writes_png_per_device() {
        let deps = deps();
        let out = tempfile::tempdir().expect("tempdir");
        let handle = take_screenshot(
            &deps,
            png_raw(),
            ok_invoker(),
            vec![target("S1"), target("S2")],
            out.path(),
        )
        .expect("fanout");
        let summary = handle.wait_summary(Duration::from_secs(5)).expect("summary");

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.artifacts.len(), 2);
        for artifact in &summary.artifacts {
            let bytes = fs::read(artifact).expect("artifact exists");
            assert!(bytes.starts_with(PNG_SIGNATURE));
            assert!(artifact.ends_with(".png"));
        }
        deps.status.shutdown();
    }

    #[test]
    fn screenshot_falls_back_when_exec_out_is_garbage() {
        let deps = deps();
        let out = tempfile::tempdir().expect("tempdir");
        let garbage_raw: RawInvoker = Arc::new(|_args, _timeout, _token| {
            Ok(RawOutput {
                stdout: b"adb: some warning\n".to_vec(),
                stderr: Vec::new(),
                exit_code: Some(0),
            })
        });
        let handle = take_screenshot(
            &deps,
            garbage_raw,
            ok_invoker(),
            vec![target("S1")],
            out.path(),
        )
        .expect("fanout");
        let summary = handle.wait_summary(Duration::from_secs(5)).expect("summary");
        // Fallback path (capture + pull) succeeded even though exec-out lied.
        assert_eq!(summary.succeeded, 1);
        deps.status.shutdown();
    }

    #[test]
    fn bug_report_names_artifact_after_device() {
        let deps = deps();
        let out = tempfile::tempdir().expect("tempdir");
        let handle = generate_bug_report(&deps, ok_invoker(), vec![target("SER-1")], out.path())
            .expect("fanout");
        let summary = handle.wait_summary(Duration::from_secs(5)).expect("summary");
        assert_eq!(summary.succeeded, 1);
        assert!(summary.artifacts[0].contains("bugreport_SER-1_"));
        assert!(summary.artifacts[0].ends_with(".zip"));
        deps.status.shutdown();
    }

    #[test]
    fn ui_dump_returns_xml_and_screenshot_paths() {
        let deps = deps();
        let out = tempfile::tempdir().expect("tempdir");
        // The pull lands in a staging dir; fake it by writing the file the
        // invoker was asked to create.
        let invoker: AdbInvoker = Arc::new(|args, _timeout, _token| {
            if args.contains(&"pull".to_string()) {
                let local = args.last().expect("pull target");
                fs::write(local, b"<hierarchy/>").expect("write staged xml");
            }
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                duration: Duration::from_millis(1),
            })
        });
        let handle = dump_ui_hierarchy(&deps, png_raw(), invoker, target("S1"), out.path())
            .expect("fanout");
        let summary = handle.wait_summary(Duration::from_secs(5)).expect("summary");
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.artifacts.len(), 2);
        assert!(summary.artifacts[0].ends_with(".xml"));
        assert!(summary.artifacts[1].ends_with(".png"));
        assert!(Path::new(&summary.artifacts[0]).exists());
        deps.status.shutdown();
    }
}
