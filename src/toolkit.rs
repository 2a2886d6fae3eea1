use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::adb::commands::{self, RebootMode};
use crate::adb::locator::{check_adb, resolve_adb_program, AdbInfo};
use crate::adb::runner::{adb_invoker, raw_invoker, run_streaming, AdbInvoker, RawInvoker};
use crate::bluetooth::service::{start_adb_bluetooth_monitor, BluetoothMonitorHandle};
use crate::config::{save_config, AppConfig};
use crate::device::battery::{start_attr_refresher, AdbAttrSource, AttrRefresherHandle,
    DEFAULT_REFRESH_PASS_INTERVAL};
use crate::device::discovery::{start_discovery, AdbDiscoverySource, DiscoveryHandle};
use crate::device::registry::DeviceRegistry;
use crate::dispatch::TaskDispatcher;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::models::{Device, RecordingSession};
use crate::ops::fanout::{DeviceTarget, FanoutDeps, FanoutHandle};
use crate::ops::{filegen, install, reboot};
use crate::recording::{AdbRecorderBackend, RecordingCoordinator, RecordingTarget};
use crate::shell::{BatchRunHandle, ShellExecutor, ShellRunHandle, ShellTarget};
use crate::status::StatusManager;

pub const SHUTDOWN_TIMEOUT_MS: u64 = 700;

/// Exit codes for a wrapper CLI around the headless core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    StartupFailure,
    NoDevices,
    PartialFailure,
    UserCancelled,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::StartupFailure => 1,
            ExitCode::NoDevices => 2,
            ExitCode::PartialFailure => 3,
            ExitCode::UserCancelled => 4,
        }
    }
}

struct LogcatSession {
    stop_flag: Arc<AtomicBool>,
    child_slot: Arc<Mutex<Option<std::process::Child>>>,
    join: Option<JoinHandle<()>>,
}

impl LogcatSession {
    fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.child_slot.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Composition root. Builds the bus, dispatcher, registry, status manager,
/// recording coordinator and executors, and owns every background service
/// handle. Front-ends hold one of these and consume `subscribe()`.
pub struct DeviceToolkit {
    config: Mutex<AppConfig>,
    persist_config: bool,
    adb_program: String,
    bus: EventBus,
    dispatcher: Arc<TaskDispatcher>,
    registry: Arc<DeviceRegistry>,
    status: Arc<StatusManager>,
    recording: Arc<RecordingCoordinator>,
    shell: ShellExecutor,
    invoker: AdbInvoker,
    raw: RawInvoker,
    discovery: Mutex<Option<DiscoveryHandle>>,
    battery: Mutex<Option<AttrRefresherHandle>>,
    bluetooth: Mutex<HashMap<String, BluetoothMonitorHandle>>,
    logcats: Mutex<HashMap<String, LogcatSession>>,
    started: AtomicBool,
}

impl DeviceToolkit {
    pub fn new(config: AppConfig) -> Self {
        Self::build(config, true)
    }

    /// In-memory variant for embedding and tests: never touches the config
    /// file on disk.
    pub fn new_ephemeral(config: AppConfig) -> Self {
        Self::build(config, false)
    }

    fn build(config: AppConfig, persist_config: bool) -> Self {
        let adb_program = resolve_adb_program(&config.adb_path);
        let bus = EventBus::new();
        let dispatcher = Arc::new(TaskDispatcher::new(bus.clone()));
        let registry = Arc::new(DeviceRegistry::new(bus.clone()));
        let status = StatusManager::spawn(bus.clone());
        let invoker = adb_invoker(adb_program.clone());
        let raw = raw_invoker(adb_program.clone());
        let recording = Arc::new(RecordingCoordinator::new(
            Arc::new(AdbRecorderBackend::new(
                adb_program.clone(),
                config.screen_record.clone(),
            )),
            bus.clone(),
            Arc::clone(&status),
        ));
        let shell = ShellExecutor::new(
            Arc::clone(&dispatcher),
            bus.clone(),
            Arc::clone(&status),
            Arc::clone(&invoker),
        );
        Self {
            config: Mutex::new(config),
            persist_config,
            adb_program,
            bus,
            dispatcher,
            registry,
            status,
            recording,
            shell,
            invoker,
            raw,
            discovery: Mutex::new(None),
            battery: Mutex::new(None),
            bluetooth: Mutex::new(HashMap::new()),
            logcats: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Gate on a working adb, then spin up the discovery poller and the attr
    /// refresher. Fails without side effects when adb is missing.
    pub fn start(&self) -> Result<AdbInfo, CoreError> {
        let adb_info = check_adb(&self.adb_program)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(adb_info);
        }
        info!(adb = %self.adb_program, "starting device toolkit");

        let (interval, auto_refresh) = {
            let config = self.config.lock().expect("config poisoned");
            (
                config.device.refresh_interval.max(1) as u64,
                config.device.auto_refresh,
            )
        };
        let discovery = start_discovery(
            Arc::new(AdbDiscoverySource::new(self.adb_program.clone())),
            Arc::clone(&self.registry),
            interval,
            auto_refresh,
        );
        *self.discovery.lock().expect("discovery slot poisoned") = Some(discovery);

        let battery = start_attr_refresher(
            Arc::new(AdbAttrSource::new(self.adb_program.clone())),
            Arc::clone(&self.registry),
            DEFAULT_REFRESH_PASS_INTERVAL,
        );
        *self.battery.lock().expect("battery slot poisoned") = Some(battery);
        Ok(adb_info)
    }

    /// Stop pollers, recordings, monitors and the dispatcher, waiting up to
    /// `timeout_ms` (default 700) for in-flight work.
    pub fn shutdown(&self, timeout_ms: Option<u64>) {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(SHUTDOWN_TIMEOUT_MS));
        info!("shutting down device toolkit");
        self.started.store(false, Ordering::SeqCst);

        if let Some(discovery) = self.discovery.lock().expect("discovery slot poisoned").take() {
            discovery.stop();
        }
        if let Some(battery) = self.battery.lock().expect("battery slot poisoned").take() {
            battery.stop();
        }
        for (_, monitor) in self
            .bluetooth
            .lock()
            .expect("bluetooth monitors poisoned")
            .drain()
        {
            monitor.stop(true);
        }
        for (_, session) in self.logcats.lock().expect("logcat sessions poisoned").drain() {
            session.stop();
        }
        self.recording.shutdown(timeout);
        self.dispatcher.shutdown(timeout);
        self.status.shutdown();
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.bus.subscribe()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.registry.devices()
    }

    pub fn force_refresh(&self) {
        if let Some(discovery) = self.discovery.lock().expect("discovery slot poisoned").as_ref() {
            discovery.force_refresh();
        }
    }

    pub fn set_auto_refresh(&self, enabled: bool) {
        if let Some(discovery) = self.discovery.lock().expect("discovery slot poisoned").as_ref() {
            discovery.set_auto_refresh(enabled);
        }
        self.update_config(|config| config.device.auto_refresh = enabled);
    }

    pub fn set_refresh_interval(&self, seconds: u64) {
        if let Some(discovery) = self.discovery.lock().expect("discovery slot poisoned").as_ref() {
            discovery.set_interval_seconds(seconds);
        }
        self.update_config(|config| config.device.refresh_interval = seconds as i32);
    }

    pub fn status_manager(&self) -> Arc<StatusManager> {
        Arc::clone(&self.status)
    }

    pub fn cancel_operation(&self, operation_id: &str) -> bool {
        self.status.cancel(operation_id)
    }

    pub fn clear_completed(&self, serial: Option<&str>) -> usize {
        self.status.clear_completed(serial)
    }

    fn shell_targets(&self, serials: &[String]) -> Vec<ShellTarget> {
        serials
            .iter()
            .map(|serial| match self.registry.device(serial) {
                Some(device) => ShellTarget {
                    serial: device.serial.clone(),
                    state: device.state,
                    device_name: Some(device.display_name()),
                },
                None => ShellTarget {
                    serial: serial.clone(),
                    state: crate::models::ConnectionState::Unknown,
                    device_name: None,
                },
            })
            .collect()
    }

    fn device_targets(&self, serials: &[String]) -> Vec<DeviceTarget> {
        serials
            .iter()
            .map(|serial| match self.registry.device(serial) {
                Some(device) => DeviceTarget {
                    serial: device.serial.clone(),
                    state: device.state,
                    device_name: Some(device.display_name()),
                },
                None => DeviceTarget {
                    serial: serial.clone(),
                    state: crate::models::ConnectionState::Unknown,
                    device_name: None,
                },
            })
            .collect()
    }

    fn fanout_deps(&self) -> FanoutDeps {
        FanoutDeps {
            dispatcher: Arc::clone(&self.dispatcher),
            bus: self.bus.clone(),
            status: Arc::clone(&self.status),
        }
    }

    pub fn run_shell(
        &self,
        serials: &[String],
        command: &str,
    ) -> Result<ShellRunHandle, CoreError> {
        let timeout = {
            let config = self.config.lock().expect("config poisoned");
            Duration::from_secs(config.command.command_timeout.max(1) as u64)
        };
        let handle = self
            .shell
            .run_command(&self.shell_targets(serials), command, timeout)?;
        self.remember_command(command);
        Ok(handle)
    }

    pub fn run_shell_batch(&self, serials: &[String], script: &str) -> BatchRunHandle {
        let timeout = {
            let config = self.config.lock().expect("config poisoned");
            Duration::from_secs(config.command.command_timeout.max(1) as u64)
        };
        self.shell
            .run_batch(self.shell_targets(serials), script, timeout)
    }

    /// Start segmented recordings. Devices that are not operational are
    /// dropped with a warning; the call errors only when nothing is left.
    pub fn start_recording(
        &self,
        serials: &[String],
        output_dir: &Path,
    ) -> Result<Vec<String>, CoreError> {
        let mut targets = Vec::new();
        for target in self.device_targets(serials) {
            if target.state.is_operational() {
                targets.push(RecordingTarget {
                    serial: target.serial.clone(),
                    device_name: target.display_name(),
                });
            } else {
                warn!(serial = %target.serial, state = ?target.state, "skipping recording target");
                self.bus.publish(CoreEvent::Warning {
                    message: format!("{} is not ready for recording", target.serial),
                });
            }
        }
        if targets.is_empty() {
            return Err(CoreError::config("no recordable devices selected"));
        }
        self.recording.start(&targets, output_dir)
    }

    pub fn stop_recording(&self, serials: Option<&[String]>) -> Result<Vec<String>, CoreError> {
        self.recording.stop(serials)
    }

    pub fn recording_session(&self, serial: &str) -> Option<RecordingSession> {
        self.recording.session(serial)
    }

    pub fn is_recording(&self, serial: &str) -> bool {
        self.recording.is_recording(serial)
    }

    pub fn take_screenshot(
        &self,
        serials: &[String],
        output_dir: &Path,
    ) -> Result<FanoutHandle, CoreError> {
        filegen::take_screenshot(
            &self.fanout_deps(),
            Arc::clone(&self.raw),
            Arc::clone(&self.invoker),
            self.device_targets(serials),
            output_dir,
        )
    }

    pub fn generate_bug_report(
        &self,
        serials: &[String],
        output_dir: &Path,
    ) -> Result<FanoutHandle, CoreError> {
        filegen::generate_bug_report(
            &self.fanout_deps(),
            Arc::clone(&self.invoker),
            self.device_targets(serials),
            output_dir,
        )
    }

    pub fn dump_ui_hierarchy(
        &self,
        serial: &str,
        output_dir: &Path,
    ) -> Result<FanoutHandle, CoreError> {
        let target = match self.registry.device(serial) {
            Some(device) => DeviceTarget {
                serial: device.serial.clone(),
                state: device.state,
                device_name: Some(device.display_name()),
            },
            None => DeviceTarget {
                serial: serial.to_string(),
                state: crate::models::ConnectionState::Unknown,
                device_name: None,
            },
        };
        filegen::dump_ui_hierarchy(
            &self.fanout_deps(),
            Arc::clone(&self.raw),
            Arc::clone(&self.invoker),
            target,
            output_dir,
        )
    }

    pub fn install_apk(
        &self,
        serials: &[String],
        apk_path: &Path,
    ) -> Result<FanoutHandle, CoreError> {
        let settings = {
            let config = self.config.lock().expect("config poisoned");
            config.apk_install.clone()
        };
        install::install_apk(
            &self.fanout_deps(),
            Arc::clone(&self.invoker),
            self.device_targets(serials),
            apk_path,
            settings,
        )
    }

    pub fn reboot(&self, serials: &[String], mode: RebootMode) -> Result<FanoutHandle, CoreError> {
        reboot::reboot_devices(
            &self.fanout_deps(),
            Arc::clone(&self.invoker),
            self.device_targets(serials),
            mode,
        )
    }

    /// One monitor per serial; starting twice is a no-op.
    pub fn start_bluetooth_monitor(&self, serial: &str) {
        let mut monitors = self.bluetooth.lock().expect("bluetooth monitors poisoned");
        if monitors.contains_key(serial) {
            return;
        }
        let handle =
            start_adb_bluetooth_monitor(self.adb_program.clone(), serial, self.bus.clone());
        monitors.insert(serial.to_string(), handle);
    }

    pub fn stop_bluetooth_monitor(&self, serial: &str, wait: bool) {
        let handle = self
            .bluetooth
            .lock()
            .expect("bluetooth monitors poisoned")
            .remove(serial);
        if let Some(handle) = handle {
            handle.stop(wait);
        }
    }

    /// Stream `logcat` lines for a device onto the bus as `LogLine` events.
    pub fn start_logcat(&self, serial: &str) -> Result<(), CoreError> {
        let mut sessions = self.logcats.lock().expect("logcat sessions poisoned");
        if sessions.contains_key(serial) {
            return Ok(());
        }
        let stream = run_streaming(
            &self.adb_program,
            &commands::logcat(serial, &["-v", "time"]),
        )?;
        let child_slot = stream.child_slot();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop_flag);
        let bus = self.bus.clone();
        let serial_owned = serial.to_string();
        let join = thread::spawn(move || {
            while !stop_thread.load(Ordering::Relaxed) {
                let Some(line) = stream.next_line(Duration::from_millis(200)) else {
                    continue;
                };
                bus.publish(CoreEvent::LogLine {
                    serial: serial_owned.clone(),
                    line,
                });
            }
        });
        sessions.insert(
            serial.to_string(),
            LogcatSession {
                stop_flag,
                child_slot,
                join: Some(join),
            },
        );
        Ok(())
    }

    pub fn stop_logcat(&self, serial: &str) {
        let session = self
            .logcats
            .lock()
            .expect("logcat sessions poisoned")
            .remove(serial);
        if let Some(session) = session {
            session.stop();
        }
    }

    pub fn config(&self) -> AppConfig {
        self.config.lock().expect("config poisoned").clone()
    }

    pub fn update_config(&self, mutate: impl FnOnce(&mut AppConfig)) {
        let snapshot = {
            let mut config = self.config.lock().expect("config poisoned");
            mutate(&mut config);
            config.clone()
        };
        if self.persist_config {
            if let Err(err) = save_config(&snapshot) {
                warn!(error = %err, "failed to persist config");
            }
        }
    }

    pub fn save_device_group(&self, name: &str, serials: Vec<String>) {
        self.update_config(|config| {
            config.device_groups.insert(name.to_string(), serials);
        });
    }

    pub fn delete_device_group(&self, name: &str) {
        self.update_config(|config| {
            config.device_groups.remove(name);
        });
    }

    /// Resolve a group to currently-known serials; stale members are
    /// silently skipped.
    pub fn resolve_device_group(&self, name: &str) -> Vec<String> {
        let known = self.registry.serials();
        self.config
            .lock()
            .expect("config poisoned")
            .resolve_group(name, &known)
    }

    fn remember_command(&self, command: &str) {
        let auto_save = {
            let config = self.config.lock().expect("config poisoned");
            config.command.auto_save_history
        };
        if auto_save {
            self.update_config(|config| config.push_history(command));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registry::DiscoveredDevice;
    use crate::models::{ConnectionState, DeviceSummary};

    fn toolkit() -> DeviceToolkit {
        let mut config = AppConfig::default();
        config.adb_path = "/definitely/not/a/real/adb".to_string();
        DeviceToolkit::new_ephemeral(config)
    }

    #[test]
    fn start_fails_cleanly_without_adb() {
        let toolkit = toolkit();
        let err = toolkit.start().expect_err("adb is absent");
        assert!(matches!(err, CoreError::AdbMissing { .. }));
        // Nothing was spun up.
        assert!(toolkit.discovery.lock().unwrap().is_none());
        toolkit.shutdown(Some(100));
    }

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::StartupFailure.code(), 1);
        assert_eq!(ExitCode::NoDevices.code(), 2);
        assert_eq!(ExitCode::PartialFailure.code(), 3);
        assert_eq!(ExitCode::UserCancelled.code(), 4);
    }

    #[test]
    fn group_round_trip_resolves_against_registry() {
        let toolkit = toolkit();
        toolkit.registry.apply_discovery(vec![DiscoveredDevice {
            summary: DeviceSummary {
                serial: "A".to_string(),
                state: ConnectionState::Device,
                usb: None,
                product: None,
                model: None,
                transport_id: None,
            },
            probe: None,
        }]);
        toolkit.save_device_group("lab", vec!["A".to_string(), "GONE".to_string()]);
        assert_eq!(toolkit.resolve_device_group("lab"), vec!["A"]);
        toolkit.delete_device_group("lab");
        assert!(toolkit.resolve_device_group("lab").is_empty());
        toolkit.shutdown(Some(100));
    }

    #[test]
    fn run_shell_records_history() {
        let toolkit = toolkit();
        // Unknown serial: the block carries a DeviceUnavailable outcome but
        // the command still lands in history.
        let handle = toolkit
            .run_shell(&["GHOST".to_string()], "getprop ro.serialno")
            .expect("run");
        let block = handle.wait_block(Duration::from_secs(5)).expect("block");
        assert_eq!(block.results.len(), 1);
        assert!(matches!(
            block.results[0].error,
            Some(CoreError::DeviceUnavailable { .. })
        ));
        assert_eq!(
            toolkit.config().command_history,
            vec!["getprop ro.serialno".to_string()]
        );
        toolkit.shutdown(Some(100));
    }
}
