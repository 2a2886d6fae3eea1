use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::adb::commands;
use crate::adb::runner::{run_command_with_timeout, run_streaming, StreamingChild};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::models::now_epoch;

use super::parser::BluetoothParser;
use super::state_machine::{BluetoothStateMachine, StateUpdate};

pub const DEFAULT_INTERVAL_S: f64 = 5.0;
pub const MIN_INTERVAL_S: f64 = 2.0;
pub const MAX_INTERVAL_S: f64 = 10.0;
pub const IDLE_THRESHOLD_S: f64 = 30.0;
const JOIN_BUDGET: Duration = Duration::from_secs(2);

pub type SnapshotRunner = Box<dyn Fn() -> Result<String, CoreError> + Send>;

/// Interruptible line source for the logcat loop.
pub trait LogcatStream: Send {
    fn next_line(&mut self, timeout: Duration) -> Option<String>;
    fn stop(&mut self);
}

pub type LogcatFactory = Box<dyn FnOnce() -> Result<Box<dyn LogcatStream>, CoreError> + Send>;

struct AdbLogcatStream {
    child: StreamingChild,
}

impl LogcatStream for AdbLogcatStream {
    fn next_line(&mut self, timeout: Duration) -> Option<String> {
        self.child.next_line(timeout)
    }

    fn stop(&mut self) {
        self.child.cancel();
    }
}

pub struct BluetoothMonitorHandle {
    serial: String,
    stop_flag: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl BluetoothMonitorHandle {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Signal both loops; with `wait`, join each within the 2s budget.
    pub fn stop(mut self, wait: bool) {
        info!(serial = %self.serial, "stopping bluetooth monitor");
        self.stop_flag.store(true, Ordering::Relaxed);
        if !wait {
            return;
        }
        for join in self.threads.drain(..) {
            let deadline = Instant::now() + JOIN_BUDGET;
            while !join.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if join.is_finished() {
                let _ = join.join();
            } else {
                warn!(serial = %self.serial, "bluetooth monitor thread exceeded join budget");
            }
        }
    }
}

/// Per-device monitor: a snapshot poller with adaptive cadence plus a logcat
/// consumer, both feeding one shared state machine and publishing on the bus.
pub fn start_bluetooth_monitor(
    serial: impl Into<String>,
    bus: EventBus,
    snapshot_runner: SnapshotRunner,
    logcat_factory: LogcatFactory,
) -> BluetoothMonitorHandle {
    let serial = serial.into();
    info!(serial = %serial, "starting bluetooth monitor");
    let stop_flag = Arc::new(AtomicBool::new(false));
    let machine = Arc::new(Mutex::new(BluetoothStateMachine::default()));
    let parser = Arc::new(BluetoothParser::default());
    let mut threads = Vec::new();

    {
        let serial = serial.clone();
        let bus = bus.clone();
        let stop = Arc::clone(&stop_flag);
        let machine = Arc::clone(&machine);
        let parser = Arc::clone(&parser);
        threads.push(thread::spawn(move || {
            snapshot_loop(&serial, &bus, &stop, &machine, &parser, snapshot_runner);
        }));
    }
    {
        let serial = serial.clone();
        let bus = bus.clone();
        let stop = Arc::clone(&stop_flag);
        threads.push(thread::spawn(move || {
            logcat_loop(&serial, &bus, &stop, &machine, &parser, logcat_factory);
        }));
    }

    BluetoothMonitorHandle {
        serial,
        stop_flag,
        threads,
    }
}

/// Production monitor wired to adb: combined dumpsys snapshots and a
/// `logcat -b all` stream.
pub fn start_adb_bluetooth_monitor(
    adb_program: impl Into<String>,
    serial: impl Into<String>,
    bus: EventBus,
) -> BluetoothMonitorHandle {
    let adb_program = adb_program.into();
    let serial = serial.into();
    let snapshot_program = adb_program.clone();
    let snapshot_serial = serial.clone();
    let snapshot_runner: SnapshotRunner = Box::new(move || {
        let output = run_command_with_timeout(
            &snapshot_program,
            &commands::bluetooth_snapshot(&snapshot_serial),
            Duration::from_secs(5),
        )?;
        Ok(output.stdout)
    });
    let logcat_serial = serial.clone();
    let logcat_factory: LogcatFactory = Box::new(move || {
        let child = run_streaming(&adb_program, &commands::logcat(&logcat_serial, &["-b", "all"]))?;
        Ok(Box::new(AdbLogcatStream { child }) as Box<dyn LogcatStream>)
    });
    start_bluetooth_monitor(serial, bus, snapshot_runner, logcat_factory)
}

fn snapshot_loop(
    serial: &str,
    bus: &EventBus,
    stop: &AtomicBool,
    machine: &Mutex<BluetoothStateMachine>,
    parser: &BluetoothParser,
    snapshot_runner: SnapshotRunner,
) {
    let mut current_interval = DEFAULT_INTERVAL_S;
    let mut last_activity: Option<Instant> = None;
    let mut last_snapshot_hash: Option<u64> = None;

    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();
        match snapshot_runner() {
            Ok(raw) if !raw.trim().is_empty() => {
                let hash = content_hash(&raw);
                let changed = last_snapshot_hash.map(|prev| prev != hash).unwrap_or(true);
                last_snapshot_hash = Some(hash);
                if changed {
                    last_activity = Some(Instant::now());
                }

                let snapshot = parser.parse_snapshot(serial, &raw, now_epoch());
                let update = {
                    let mut guard = machine.lock().expect("state machine poisoned");
                    guard.apply_snapshot(&snapshot)
                };
                bus.publish(CoreEvent::BluetoothSnapshotParsed { snapshot });
                publish_state(bus, update);

                current_interval = adjust_interval(current_interval, last_activity, Instant::now());
            }
            Ok(_) => {}
            Err(err) => {
                warn!(serial, error = %err, "bluetooth snapshot failed");
                bus.publish(CoreEvent::BluetoothError {
                    serial: serial.to_string(),
                    message: format!("snapshot collector error: {err}"),
                });
            }
        }

        let elapsed = started.elapsed();
        let budget = Duration::from_secs_f64(current_interval).saturating_sub(elapsed);
        let sleep_deadline = Instant::now() + budget;
        while Instant::now() < sleep_deadline {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

fn logcat_loop(
    serial: &str,
    bus: &EventBus,
    stop: &AtomicBool,
    machine: &Mutex<BluetoothStateMachine>,
    parser: &BluetoothParser,
    logcat_factory: LogcatFactory,
) {
    let mut stream = match logcat_factory() {
        Ok(stream) => stream,
        Err(err) => {
            warn!(serial, error = %err, "failed to start bluetooth logcat");
            bus.publish(CoreEvent::BluetoothError {
                serial: serial.to_string(),
                message: format!("log monitor error: {err}"),
            });
            return;
        }
    };

    while !stop.load(Ordering::Relaxed) {
        let Some(line) = stream.next_line(Duration::from_millis(200)) else {
            continue;
        };
        let Some(event) = parser.parse_log_line(serial, &line, now_epoch()) else {
            continue;
        };
        let update = {
            let mut guard = machine.lock().expect("state machine poisoned");
            guard.apply_event(&event)
        };
        bus.publish(CoreEvent::BluetoothEventParsed { event });
        publish_state(bus, update);
    }
    stream.stop();
}

fn publish_state(bus: &EventBus, update: StateUpdate) {
    // Unchanged summaries are still published, flagged so subscribers may
    // skip no-op redraws.
    bus.publish(CoreEvent::BluetoothStateUpdated {
        summary: update.summary,
        changed: update.changed,
    });
}

fn content_hash(input: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish()
}

/// Adaptive cadence: recent activity resets straight to the base rate,
/// regardless of how far the interval had drifted; past the idle threshold
/// it slows linearly up to `MAX_INTERVAL_S`.
fn adjust_interval(current: f64, last_activity: Option<Instant>, now: Instant) -> f64 {
    let Some(last) = last_activity else {
        return current;
    };
    let idle_time = now.duration_since(last).as_secs_f64();
    if idle_time < IDLE_THRESHOLD_S {
        DEFAULT_INTERVAL_S.max(MIN_INTERVAL_S)
    } else {
        let slowdown = (1.0 + (idle_time - IDLE_THRESHOLD_S) / 60.0).min(2.0);
        (DEFAULT_INTERVAL_S * slowdown).min(MAX_INTERVAL_S)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::models::BluetoothState;
    use std::sync::mpsc::{channel, Receiver, Sender};

    #[test]
    fn interval_reaches_cap_when_idle_and_resets_on_change() {
        let t0 = Instant::now();
        // Long idle stretch: slowdown saturates at the cap.
        let idle = adjust_interval(
            DEFAULT_INTERVAL_S,
            Some(t0),
            t0 + Duration::from_secs(400),
        );
        assert_eq!(idle, MAX_INTERVAL_S);

        // Fresh activity resets to the base rate no matter where the
        // interval drifted, mid-ramp values included.
        let active = adjust_interval(idle, Some(t0), t0 + Duration::from_secs(1));
        assert_eq!(active, DEFAULT_INTERVAL_S);
        let mid_ramp = adjust_interval(3.0, Some(t0), t0 + Duration::from_secs(1));
        assert_eq!(mid_ramp, DEFAULT_INTERVAL_S);
    }

    #[test]
    fn interval_is_unchanged_before_any_activity() {
        assert_eq!(
            adjust_interval(DEFAULT_INTERVAL_S, None, Instant::now()),
            DEFAULT_INTERVAL_S
        );
    }

    struct ScriptedStream {
        rx: Receiver<String>,
    }

    impl LogcatStream for ScriptedStream {
        fn next_line(&mut self, timeout: Duration) -> Option<String> {
            self.rx.recv_timeout(timeout).ok()
        }

        fn stop(&mut self) {}
    }

    fn scripted_monitor(
        bus: EventBus,
        snapshots: Vec<String>,
    ) -> (BluetoothMonitorHandle, Sender<String>) {
        let snapshots = Mutex::new(snapshots);
        let runner: SnapshotRunner = Box::new(move || {
            let mut guard = snapshots.lock().expect("snapshots");
            if guard.is_empty() {
                Ok(String::new())
            } else {
                Ok(guard.remove(0))
            }
        });
        let (tx, rx) = channel();
        let factory: LogcatFactory =
            Box::new(move || Ok(Box::new(ScriptedStream { rx }) as Box<dyn LogcatStream>));
        (start_bluetooth_monitor("SER", bus, runner, factory), tx)
    }

    #[test]
    fn monitor_publishes_snapshot_and_event_updates() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let (handle, log_tx) = scripted_monitor(
            bus,
            vec!["State=ON\nstartScan uid/app1\n".to_string()],
        );

        // Snapshot side: wait for the scanning state to surface.
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut saw_scanning = false;
        let mut saw_snapshot = false;
        while Instant::now() < deadline && !(saw_scanning && saw_snapshot) {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(CoreEvent::BluetoothSnapshotParsed { snapshot }) => {
                    assert_eq!(snapshot.serial, "SER");
                    saw_snapshot = true;
                }
                Ok(CoreEvent::BluetoothStateUpdated { summary, changed }) => {
                    if changed && summary.active_states.contains(&BluetoothState::Scanning) {
                        saw_scanning = true;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_snapshot && saw_scanning);

        // Logcat side: a stop event flips the machine back to idle.
        log_tx.send("stopScan uid/app1".to_string()).expect("send");
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut saw_idle = false;
        while Instant::now() < deadline && !saw_idle {
            if let Ok(CoreEvent::BluetoothStateUpdated { summary, changed }) =
                rx.recv_timeout(Duration::from_millis(100))
            {
                if changed && summary.active_states.contains(&BluetoothState::Idle) {
                    saw_idle = true;
                }
            }
        }
        assert!(saw_idle);

        handle.stop(true);
    }

    #[test]
    fn stop_joins_within_budget() {
        let bus = EventBus::new();
        let (handle, _log_tx) = scripted_monitor(bus, Vec::new());
        let started = Instant::now();
        handle.stop(true);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
