use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::adb::commands;
use crate::adb::parse::{parse_adb_devices, parse_identity_probe, DeviceProbe};
use crate::adb::runner::{run_adb_with_server_recovery, run_command_with_timeout};
use crate::device::registry::{DeviceRegistry, DiscoveredDevice};
use crate::error::CoreError;
use crate::models::DeviceSummary;

pub const REFRESH_INTERVAL_CHOICES_S: [u64; 5] = [5, 10, 20, 30, 60];
pub const DEFAULT_REFRESH_INTERVAL_S: u64 = 30;

/// Where discovery reads from. The adb-backed source is the production
/// implementation; tests substitute a scripted one.
pub trait DiscoverySource: Send + Sync + 'static {
    fn list_devices(&self) -> Result<Vec<DeviceSummary>, CoreError>;
    fn probe(&self, serial: &str) -> Option<DeviceProbe>;
}

pub struct AdbDiscoverySource {
    adb_program: String,
}

impl AdbDiscoverySource {
    pub fn new(adb_program: impl Into<String>) -> Self {
        Self {
            adb_program: adb_program.into(),
        }
    }
}

impl DiscoverySource for AdbDiscoverySource {
    fn list_devices(&self) -> Result<Vec<DeviceSummary>, CoreError> {
        // A dead adb server gets one implicit restart before we give up.
        let output = run_adb_with_server_recovery(
            &self.adb_program,
            &commands::devices_with_details(),
            Duration::from_secs(30),
        )?;
        output.require_success("adb devices -l")?;
        Ok(parse_adb_devices(&output.stdout))
    }

    fn probe(&self, serial: &str) -> Option<DeviceProbe> {
        let output = run_command_with_timeout(
            &self.adb_program,
            &commands::identity_probe(serial),
            Duration::from_secs(10),
        );
        match output {
            Ok(output) if output.exit_code == Some(0) => {
                Some(parse_identity_probe(&output.stdout))
            }
            Ok(output) => {
                debug!(serial, exit_code = ?output.exit_code, "identity probe failed");
                None
            }
            Err(err) => {
                debug!(serial, error = %err, "identity probe errored");
                None
            }
        }
    }
}

pub struct DiscoveryHandle {
    stop_flag: Arc<AtomicBool>,
    poll_now: Arc<AtomicBool>,
    interval_s: Arc<AtomicU64>,
    auto_refresh: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DiscoveryHandle {
    pub fn set_interval_seconds(&self, seconds: u64) {
        let valid = if REFRESH_INTERVAL_CHOICES_S.contains(&seconds) {
            seconds
        } else {
            DEFAULT_REFRESH_INTERVAL_S
        };
        self.interval_s.store(valid, Ordering::Relaxed);
    }

    pub fn set_auto_refresh(&self, enabled: bool) {
        self.auto_refresh.store(enabled, Ordering::Relaxed);
    }

    /// Request an immediate poll regardless of the auto-refresh cadence.
    pub fn force_refresh(&self) {
        self.poll_now.store(true, Ordering::Relaxed);
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Periodic device enumeration feeding the registry. One tick = one
/// `adb devices -l` plus an identity probe per operational device.
pub fn start_discovery(
    source: Arc<dyn DiscoverySource>,
    registry: Arc<DeviceRegistry>,
    interval_seconds: u64,
    auto_refresh: bool,
) -> DiscoveryHandle {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let poll_now = Arc::new(AtomicBool::new(true));
    let interval_s = Arc::new(AtomicU64::new(
        if REFRESH_INTERVAL_CHOICES_S.contains(&interval_seconds) {
            interval_seconds
        } else {
            DEFAULT_REFRESH_INTERVAL_S
        },
    ));
    let auto = Arc::new(AtomicBool::new(auto_refresh));

    let stop_thread = Arc::clone(&stop_flag);
    let poll_thread = Arc::clone(&poll_now);
    let interval_thread = Arc::clone(&interval_s);
    let auto_thread = Arc::clone(&auto);

    let join = thread::spawn(move || {
        let mut last_poll: Option<Instant> = None;
        while !stop_thread.load(Ordering::Relaxed) {
            let interval = Duration::from_secs(interval_thread.load(Ordering::Relaxed).max(1));
            let due = last_poll
                .map(|at| at.elapsed() >= interval)
                .unwrap_or(true);
            let forced = poll_thread.swap(false, Ordering::Relaxed);

            if forced || (auto_thread.load(Ordering::Relaxed) && due) {
                last_poll = Some(Instant::now());
                run_tick(source.as_ref(), &registry);
            } else {
                // Keep pending debounced change events moving between polls.
                registry.flush_changes();
            }
            thread::sleep(Duration::from_millis(100));
        }
    });

    DiscoveryHandle {
        stop_flag,
        poll_now,
        interval_s,
        auto_refresh: auto,
        join: Some(join),
    }
}

fn run_tick(source: &dyn DiscoverySource, registry: &DeviceRegistry) {
    let summaries = match source.list_devices() {
        Ok(summaries) => summaries,
        Err(err) => {
            warn!(error = %err, "device discovery failed");
            return;
        }
    };
    let snapshot = summaries
        .into_iter()
        .map(|summary| {
            let probe = if summary.state.is_operational() {
                source.probe(&summary.serial)
            } else {
                None
            };
            DiscoveredDevice { summary, probe }
        })
        .collect();
    registry.apply_discovery(snapshot);
}
