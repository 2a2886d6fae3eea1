use std::sync::Arc;
use std::time::Duration;

use crate::adb::commands::{self, RebootMode};
use crate::adb::runner::AdbInvoker;
use crate::error::CoreError;
use crate::models::OperationType;
use crate::ops::fanout::{run_device_fanout, DeviceJob, DeviceTarget, FanoutDeps, FanoutHandle};

const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reboot each target into the requested mode. One device refusing does not
/// abort its peers.
pub fn reboot_devices(
    deps: &FanoutDeps,
    invoker: AdbInvoker,
    targets: Vec<DeviceTarget>,
    mode: RebootMode,
) -> Result<FanoutHandle, CoreError> {
    let job: DeviceJob = Arc::new(move |target, token| {
        let serial = target.serial.as_str();
        let output = invoker(&commands::reboot(serial, mode), REBOOT_TIMEOUT, token)?;
        output.require_success(&format!("adb -s {serial} reboot"))?;
        Ok(Vec::new())
    });
    run_device_fanout(deps, OperationType::Reboot, "reboot_devices", targets, job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::runner::CommandOutput;
    use crate::dispatch::TaskDispatcher;
    use crate::events::EventBus;
    use crate::models::ConnectionState;
    use crate::status::StatusManager;

    #[test]
    fn one_refusing_device_does_not_abort_peers() {
        let bus = EventBus::new();
        let deps = FanoutDeps {
            dispatcher: Arc::new(TaskDispatcher::with_workers(2, 32, bus.clone())),
            status: StatusManager::spawn_with_dismiss_delay(bus.clone(), Duration::from_secs(600)),
            bus,
        };
        let invoker: AdbInvoker = Arc::new(|args, _timeout, _token| {
            let serial = args[1].clone();
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: if serial == "STUCK" {
                    "error: closed".to_string()
                } else {
                    String::new()
                },
                exit_code: Some(if serial == "STUCK" { 1 } else { 0 }),
                duration: Duration::from_millis(1),
            })
        });

        let targets = vec![
            DeviceTarget {
                serial: "OK".to_string(),
                state: ConnectionState::Device,
                device_name: None,
            },
            DeviceTarget {
                serial: "STUCK".to_string(),
                state: ConnectionState::Device,
                device_name: None,
            },
        ];
        let handle =
            reboot_devices(&deps, invoker, targets, RebootMode::System).expect("fanout");
        let summary = handle.wait_summary(Duration::from_secs(5)).expect("summary");
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].0, "STUCK");
        deps.status.shutdown();
    }
}
