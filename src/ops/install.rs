use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::adb::commands;
use crate::adb::runner::{AdbInvoker, INSTALL_COMMAND_TIMEOUT};
use crate::config::ApkInstallSettings;
use crate::error::CoreError;
use crate::models::OperationType;
use crate::ops::fanout::{run_device_fanout, DeviceJob, DeviceTarget, FanoutDeps, FanoutHandle};

/// Installer failure codes the decoder recognizes, with operator-facing
/// descriptions. Matching is by substring on the uppercased output.
const KNOWN_FAILURES: [(&str, &str); 18] = [
    ("INSTALL_FAILED_ALREADY_EXISTS", "App already installed with different signature"),
    ("INSTALL_FAILED_UPDATE_INCOMPATIBLE", "Update incompatible with existing installation"),
    ("INSTALL_FAILED_DUPLICATE_PACKAGE", "Package already exists on device"),
    ("INSTALL_FAILED_OLDER_SDK", "Device Android version too old for this APK"),
    ("INSTALL_FAILED_NEWER_SDK", "APK requires older Android version"),
    ("INSTALL_FAILED_VERSION_DOWNGRADE", "Cannot downgrade - use -d flag or uninstall first"),
    ("INSTALL_FAILED_INSUFFICIENT_STORAGE", "Not enough storage space on device"),
    ("INSTALL_FAILED_MEDIA_UNAVAILABLE", "Storage media not available"),
    ("INSTALL_FAILED_USER_RESTRICTED", "User restricted from installing apps"),
    ("INSTALL_FAILED_VERIFICATION_FAILURE", "Package verification failed"),
    ("INSTALL_PARSE_FAILED_NOT_APK", "File is not a valid APK"),
    ("INSTALL_PARSE_FAILED_BAD_MANIFEST", "Invalid AndroidManifest.xml in APK"),
    ("INSTALL_PARSE_FAILED_NO_CERTIFICATES", "APK is not signed"),
    ("INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES", "APK signature inconsistent with installed version"),
    ("INSTALL_FAILED_INVALID_APK", "APK file is corrupted or invalid"),
    ("INSTALL_FAILED_ABORTED", "Installation was aborted"),
    ("INSTALL_FAILED_NO_MATCHING_ABIS", "APK not compatible with device CPU architecture"),
    ("INSTALL_FAILED_TEST_ONLY", "Test-only APK - use -t flag to install"),
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstallOutcome {
    Success,
    Failure {
        code: String,
        description: String,
    },
    Unknown {
        raw: String,
    },
}

/// Map installer output to a known failure code. `Success` wins when the
/// output says so; unknown output is carried verbatim for diagnosis.
pub fn decode_install_output(output: &str) -> InstallOutcome {
    let upper = output.to_uppercase();
    if upper.contains("SUCCESS") {
        return InstallOutcome::Success;
    }
    for (code, description) in KNOWN_FAILURES {
        if upper.contains(code) {
            return InstallOutcome::Failure {
                code: code.to_string(),
                description: description.to_string(),
            };
        }
    }
    InstallOutcome::Unknown {
        raw: output.trim().lines().last().unwrap_or("").to_string(),
    }
}

/// Install one APK across the targets, 120s per device, decoding installer
/// output into the known failure codes.
pub fn install_apk(
    deps: &FanoutDeps,
    invoker: AdbInvoker,
    targets: Vec<DeviceTarget>,
    apk_path: &Path,
    settings: ApkInstallSettings,
) -> Result<FanoutHandle, CoreError> {
    if !apk_path.exists() {
        return Err(CoreError::config(format!(
            "APK not found: {}",
            apk_path.display()
        )));
    }
    let apk = apk_path.to_string_lossy().to_string();

    let job: DeviceJob = Arc::new(move |target, token| {
        let serial = target.serial.as_str();
        let output = invoker(
            &commands::install(serial, &apk, &settings),
            INSTALL_COMMAND_TIMEOUT,
            token,
        )?;
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        match decode_install_output(&combined) {
            InstallOutcome::Success => Ok(vec![apk.clone()]),
            InstallOutcome::Failure { code, description } => Err(CoreError::NonZeroExit {
                command: format!("adb -s {serial} install"),
                code: output.exit_code.unwrap_or(1),
                tail: format!("{code}: {description}"),
            }),
            InstallOutcome::Unknown { raw } => Err(CoreError::NonZeroExit {
                command: format!("adb -s {serial} install"),
                code: output.exit_code.unwrap_or(1),
                tail: raw,
            }),
        }
    });

    run_device_fanout(deps, OperationType::InstallApk, "install_apk", targets, job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::runner::CommandOutput;
    use crate::dispatch::TaskDispatcher;
    use crate::events::EventBus;
    use crate::models::ConnectionState;
    use crate::status::StatusManager;
    use std::time::Duration;

    #[test]
    fn decodes_success_and_known_failures() {
        assert_eq!(decode_install_output("Performing Streamed Install\nSuccess\n"), InstallOutcome::Success);
        match decode_install_output("Failure [INSTALL_FAILED_VERSION_DOWNGRADE]") {
            InstallOutcome::Failure { code, .. } => {
                assert_eq!(code, "INSTALL_FAILED_VERSION_DOWNGRADE");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            decode_install_output("something weird"),
            InstallOutcome::Unknown { .. }
        ));
    }

    #[test]
    fn install_surfaces_decoded_failure_per_device() {
        let bus = EventBus::new();
        let deps = FanoutDeps {
            dispatcher: Arc::new(TaskDispatcher::with_workers(2, 32, bus.clone())),
            status: StatusManager::spawn_with_dismiss_delay(bus.clone(), Duration::from_secs(600)),
            bus,
        };
        let apk = tempfile::NamedTempFile::new().expect("apk file");

        let invoker: AdbInvoker = Arc::new(|args, _timeout, _token| {
            let serial = args[1].clone();
            let stdout = if serial == "OLD" {
                "Failure [INSTALL_FAILED_OLDER_SDK]".to_string()
            } else {
                "Success".to_string()
            };
            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
                duration: Duration::from_millis(1),
            })
        });

        let targets = vec![
            DeviceTarget {
                serial: "NEW".to_string(),
                state: ConnectionState::Device,
                device_name: None,
            },
            DeviceTarget {
                serial: "OLD".to_string(),
                state: ConnectionState::Device,
                device_name: None,
            },
        ];
        let handle = install_apk(
            &deps,
            invoker,
            targets,
            apk.path(),
            ApkInstallSettings::default(),
        )
        .expect("fanout");
        let summary = handle.wait_summary(Duration::from_secs(5)).expect("summary");

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        let (serial, message) = &summary.errors[0];
        assert_eq!(serial, "OLD");
        assert!(message.contains("INSTALL_FAILED_OLDER_SDK"));
        deps.status.shutdown();
    }

    #[test]
    fn missing_apk_is_rejected_up_front() {
        let bus = EventBus::new();
        let deps = FanoutDeps {
            dispatcher: Arc::new(TaskDispatcher::with_workers(1, 32, bus.clone())),
            status: StatusManager::spawn_with_dismiss_delay(bus.clone(), Duration::from_secs(600)),
            bus,
        };
        let invoker: AdbInvoker = Arc::new(|_args, _timeout, _token| {
            panic!("must not be invoked");
        });
        let err = install_apk(
            &deps,
            invoker,
            vec![DeviceTarget {
                serial: "S".to_string(),
                state: ConnectionState::Device,
                device_name: None,
            }],
            Path::new("/no/such/app.apk"),
            ApkInstallSettings::default(),
        )
        .expect_err("missing apk");
        assert!(matches!(err, CoreError::Config { .. }));
        deps.status.shutdown();
    }
}
