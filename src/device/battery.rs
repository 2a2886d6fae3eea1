use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::adb::commands;
use crate::adb::parse::{parse_refreshed_attrs, RefreshedAttrs};
use crate::adb::runner::run_command_with_timeout;
use crate::device::registry::DeviceRegistry;

pub const DEFAULT_REFRESH_PASS_INTERVAL: Duration = Duration::from_secs(60);

/// Fetches the slow attribute set for one device. Production implementation
/// goes through adb; tests inject a table.
pub trait AttrSource: Send + Sync + 'static {
    fn fetch(&self, serial: &str) -> Option<RefreshedAttrs>;
}

pub struct AdbAttrSource {
    adb_program: String,
}

impl AdbAttrSource {
    pub fn new(adb_program: impl Into<String>) -> Self {
        Self {
            adb_program: adb_program.into(),
        }
    }
}

impl AttrSource for AdbAttrSource {
    fn fetch(&self, serial: &str) -> Option<RefreshedAttrs> {
        let output = run_command_with_timeout(
            &self.adb_program,
            &commands::extended_attrs_probe(serial),
            Duration::from_secs(15),
        );
        match output {
            Ok(output) if output.exit_code == Some(0) => {
                Some(parse_refreshed_attrs(&output.stdout))
            }
            Ok(output) => {
                debug!(serial, exit_code = ?output.exit_code, "extended attr probe failed");
                None
            }
            Err(err) => {
                debug!(serial, error = %err, "extended attr probe errored");
                None
            }
        }
    }
}

pub struct AttrRefresherHandle {
    stop_flag: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl AttrRefresherHandle {
    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Background refresher for battery/screen/CPU attributes. A single thread
/// runs full passes, so two passes never overlap.
pub fn start_attr_refresher(
    source: Arc<dyn AttrSource>,
    registry: Arc<DeviceRegistry>,
    pass_interval: Duration,
) -> AttrRefresherHandle {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_thread = Arc::clone(&stop_flag);

    let join = thread::spawn(move || {
        let mut last_pass: Option<Instant> = None;
        while !stop_thread.load(Ordering::Relaxed) {
            let due = last_pass
                .map(|at| at.elapsed() >= pass_interval)
                .unwrap_or(true);
            if due {
                last_pass = Some(Instant::now());
                for serial in registry.operational_serials() {
                    if stop_thread.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Some(refreshed) = source.fetch(&serial) {
                        registry.apply_refreshed_attrs(&serial, refreshed);
                    }
                }
            }
            thread::sleep(Duration::from_millis(100));
        }
    });

    AttrRefresherHandle {
        stop_flag,
        join: Some(join),
    }
}
