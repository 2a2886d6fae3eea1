use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{CoreError, MacroOperation};
use crate::events::{CoreEvent, EventBus};
use crate::models::{
    OperationEvent, OperationType, RecordingEventType, RecordingProgressEvent, RecordingSegment,
    RecordingSession, RequestOrigin,
};
use crate::recording::backend::{RecorderBackend, SegmentProcess};
use crate::status::{OperationPatch, StatusManager};

/// Segment cap deliberately below adb's 180s hard ceiling so every segment is
/// shut down cleanly instead of being killed mid-write.
pub const SEGMENT_DURATION: Duration = Duration::from_secs(170);
pub const SEGMENT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const START_RETRY_COUNT: u32 = 2;
pub const START_RETRY_DELAY: Duration = Duration::from_millis(1000);
pub const STOP_RETRY_COUNT: u32 = 3;
pub const STOP_RETRY_DELAY: Duration = Duration::from_millis(1500);
pub const FILE_PULL_RETRY_COUNT: u32 = 3;
pub const FILE_PULL_RETRY_DELAY: Duration = Duration::from_millis(1000);

const HEARTBEAT_EVERY_POLLS: u32 = 10;

#[derive(Debug, Clone)]
pub struct RecordingTuning {
    pub segment_duration: Duration,
    pub poll_interval: Duration,
    pub start_retry_count: u32,
    pub start_retry_delay: Duration,
    pub stop_retry_count: u32,
    pub stop_retry_delay: Duration,
    pub pull_retry_count: u32,
    pub pull_retry_delay: Duration,
    /// How long one stop attempt waits for the recorder to exit.
    pub stop_wait_timeout: Duration,
    /// Post-exit settle time before pulling, letting the device flush.
    pub flush_wait: Duration,
}

impl Default for RecordingTuning {
    fn default() -> Self {
        Self {
            segment_duration: SEGMENT_DURATION,
            poll_interval: SEGMENT_POLL_INTERVAL,
            start_retry_count: START_RETRY_COUNT,
            start_retry_delay: START_RETRY_DELAY,
            stop_retry_count: STOP_RETRY_COUNT,
            stop_retry_delay: STOP_RETRY_DELAY,
            pull_retry_count: FILE_PULL_RETRY_COUNT,
            pull_retry_delay: FILE_PULL_RETRY_DELAY,
            stop_wait_timeout: Duration::from_secs(5),
            flush_wait: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingTarget {
    pub serial: String,
    pub device_name: String,
}

struct Worker {
    stop_flag: Arc<AtomicBool>,
    session: Arc<Mutex<RecordingSession>>,
    operation_id: String,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    fn is_recording(&self) -> bool {
        self.session.lock().map(|s| s.active).unwrap_or(false)
    }
}

/// Keeps one segmented recording session per device alive past adb's
/// per-invocation limit by chaining segments and pulling each one on its
/// boundary.
pub struct RecordingCoordinator {
    backend: Arc<dyn RecorderBackend>,
    bus: EventBus,
    status: Arc<StatusManager>,
    tuning: RecordingTuning,
    workers: Mutex<HashMap<String, Worker>>,
    start_inflight: Mutex<Vec<String>>,
    stop_inflight: Mutex<Vec<String>>,
}

impl RecordingCoordinator {
    pub fn new(
        backend: Arc<dyn RecorderBackend>,
        bus: EventBus,
        status: Arc<StatusManager>,
    ) -> Self {
        Self::with_tuning(backend, bus, status, RecordingTuning::default())
    }

    pub fn with_tuning(
        backend: Arc<dyn RecorderBackend>,
        bus: EventBus,
        status: Arc<StatusManager>,
        tuning: RecordingTuning,
    ) -> Self {
        Self {
            backend,
            bus,
            status,
            tuning,
            workers: Mutex::new(HashMap::new()),
            start_inflight: Mutex::new(Vec::new()),
            stop_inflight: Mutex::new(Vec::new()),
        }
    }

    pub fn is_recording(&self, serial: &str) -> bool {
        let guard = self.workers.lock().expect("recording workers poisoned");
        guard
            .get(serial)
            .map(|worker| worker.is_recording())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        let guard = self.workers.lock().expect("recording workers poisoned");
        guard.values().filter(|worker| worker.is_recording()).count()
    }

    pub fn active_serials(&self) -> Vec<String> {
        let guard = self.workers.lock().expect("recording workers poisoned");
        let mut serials: Vec<String> = guard
            .iter()
            .filter(|(_, worker)| worker.is_recording())
            .map(|(serial, _)| serial.clone())
            .collect();
        serials.sort();
        serials
    }

    pub fn session(&self, serial: &str) -> Option<RecordingSession> {
        let guard = self.workers.lock().expect("recording workers poisoned");
        guard
            .get(serial)
            .and_then(|worker| worker.session.lock().ok().map(|s| s.clone()))
    }

    /// Start one session per target. The whole batch is rejected when a start
    /// macro-operation is already running or any target is already recording.
    pub fn start(
        &self,
        targets: &[RecordingTarget],
        output_dir: &Path,
    ) -> Result<Vec<String>, CoreError> {
        {
            let mut inflight = self.start_inflight.lock().expect("start guard poisoned");
            if !inflight.is_empty() {
                return Err(CoreError::OperationInProgress {
                    kind: MacroOperation::RecordingStart,
                    serials: inflight.clone(),
                });
            }
            *inflight = targets.iter().map(|t| t.serial.clone()).collect();
        }
        let result = self.start_locked(targets, output_dir);
        self.start_inflight
            .lock()
            .expect("start guard poisoned")
            .clear();
        result
    }

    fn start_locked(
        &self,
        targets: &[RecordingTarget],
        output_dir: &Path,
    ) -> Result<Vec<String>, CoreError> {
        let already: Vec<String> = targets
            .iter()
            .filter(|t| self.is_recording(&t.serial))
            .map(|t| t.serial.clone())
            .collect();
        if !already.is_empty() {
            return Err(CoreError::OperationInProgress {
                kind: MacroOperation::RecordingStart,
                serials: already,
            });
        }

        let mut operation_ids = Vec::with_capacity(targets.len());
        for target in targets {
            let session_dir = output_dir.join(sanitize_path_component(&target.serial));
            fs::create_dir_all(&session_dir)
                .map_err(|err| CoreError::io(format!("failed to create output dir: {err}")))?;

            let stop_flag = Arc::new(AtomicBool::new(false));
            let event = OperationEvent::create(
                target.serial.clone(),
                OperationType::Recording,
                Some(target.device_name.clone()),
                Some("Starting recording...".to_string()),
                true,
            );
            let cancel_flag = Arc::clone(&stop_flag);
            let operation_id = self.status.add(
                event,
                Some(Box::new(move || {
                    cancel_flag.store(true, Ordering::Relaxed);
                    true
                })),
            );

            let session = Arc::new(Mutex::new(RecordingSession::new(
                target.serial.clone(),
                target.device_name.clone(),
                session_dir.to_string_lossy().to_string(),
            )));

            let join = spawn_segment_worker(SegmentWorkerArgs {
                backend: Arc::clone(&self.backend),
                bus: self.bus.clone(),
                status: Arc::clone(&self.status),
                tuning: self.tuning.clone(),
                target: target.clone(),
                session_dir,
                stop_flag: Arc::clone(&stop_flag),
                session: Arc::clone(&session),
                operation_id: operation_id.clone(),
            });

            info!(serial = %target.serial, "recording session started");
            let mut guard = self.workers.lock().expect("recording workers poisoned");
            guard.insert(
                target.serial.clone(),
                Worker {
                    stop_flag,
                    session,
                    operation_id: operation_id.clone(),
                    join: Some(join),
                },
            );
            operation_ids.push(operation_id);
        }
        Ok(operation_ids)
    }

    /// Signal the worker(s) to finish their in-flight segment and exit.
    /// `None` stops every active session. Serials that are not recording are
    /// a warned no-op. Sessions stay active until the final segment is
    /// flushed and pulled.
    pub fn stop(&self, serials: Option<&[String]>) -> Result<Vec<String>, CoreError> {
        {
            let mut inflight = self.stop_inflight.lock().expect("stop guard poisoned");
            if !inflight.is_empty() {
                return Err(CoreError::OperationInProgress {
                    kind: MacroOperation::RecordingStop,
                    serials: inflight.clone(),
                });
            }
            *inflight = serials
                .map(|list| list.to_vec())
                .unwrap_or_else(|| self.active_serials());
        }

        let targets = serials
            .map(|list| list.to_vec())
            .unwrap_or_else(|| self.active_serials());
        let mut stopped = Vec::new();
        {
            let guard = self.workers.lock().expect("recording workers poisoned");
            for serial in &targets {
                match guard.get(serial) {
                    Some(worker) if worker.is_recording() => {
                        worker.stop_flag.store(true, Ordering::Relaxed);
                        stopped.push(serial.clone());
                    }
                    _ => {
                        warn!(serial = %serial, "stop requested for device that is not recording");
                        self.bus.publish(CoreEvent::Warning {
                            message: format!("{serial} is not recording; stop ignored"),
                        });
                    }
                }
            }
        }

        self.stop_inflight
            .lock()
            .expect("stop guard poisoned")
            .clear();
        Ok(stopped)
    }

    pub fn operation_id(&self, serial: &str) -> Option<String> {
        let guard = self.workers.lock().expect("recording workers poisoned");
        guard.get(serial).map(|worker| worker.operation_id.clone())
    }

    /// Stop everything and join workers, bounded by `timeout`.
    pub fn shutdown(&self, timeout: Duration) {
        {
            let guard = self.workers.lock().expect("recording workers poisoned");
            for worker in guard.values() {
                worker.stop_flag.store(true, Ordering::Relaxed);
            }
        }
        let deadline = Instant::now() + timeout;
        let joins: Vec<(String, JoinHandle<()>)> = {
            let mut guard = self.workers.lock().expect("recording workers poisoned");
            guard
                .iter_mut()
                .filter_map(|(serial, worker)| {
                    worker.join.take().map(|join| (serial.clone(), join))
                })
                .collect()
        };
        for (serial, join) in joins {
            while !join.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if join.is_finished() {
                let _ = join.join();
            } else {
                warn!(serial = %serial, "recording worker did not stop within shutdown budget");
            }
        }
    }
}

fn sanitize_path_component(raw: &str) -> String {
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

fn segment_filename(index: u32) -> String {
    format!("record_part{index:02}.mp4")
}

struct SegmentWorkerArgs {
    backend: Arc<dyn RecorderBackend>,
    bus: EventBus,
    status: Arc<StatusManager>,
    tuning: RecordingTuning,
    target: RecordingTarget,
    session_dir: PathBuf,
    stop_flag: Arc<AtomicBool>,
    session: Arc<Mutex<RecordingSession>>,
    operation_id: String,
}

/// Why the polling loop handed the segment back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentEnd {
    CapReached,
    UserStop,
    ProcessExited,
}

/// Pure decision used by the polling loop; the boundary condition lives here
/// so it can be checked in isolation.
fn classify_segment_end(
    elapsed: Duration,
    cap: Duration,
    stop_requested: bool,
    process_exited: bool,
) -> Option<SegmentEnd> {
    if process_exited {
        return Some(SegmentEnd::ProcessExited);
    }
    if stop_requested {
        return Some(SegmentEnd::UserStop);
    }
    if elapsed >= cap {
        return Some(SegmentEnd::CapReached);
    }
    None
}

fn spawn_segment_worker(args: SegmentWorkerArgs) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("record-{}", args.target.serial))
        .spawn(move || run_segment_loop(args))
        .expect("failed to spawn recording worker")
}

fn run_segment_loop(args: SegmentWorkerArgs) {
    let SegmentWorkerArgs {
        backend,
        bus,
        status,
        tuning,
        target,
        session_dir,
        stop_flag,
        session,
        operation_id,
    } = args;
    let serial = target.serial.as_str();
    let output_path = session_dir.to_string_lossy().to_string();

    let mut segment_index: u32 = 1;
    let mut total_duration = 0.0f64;

    loop {
        if stop_flag.load(Ordering::Relaxed) && segment_index == 1 {
            // Stopped before the first segment ever started.
            finish_session(&status, &session, &operation_id, total_duration);
            return;
        }

        let filename = segment_filename(segment_index);
        let remote = format!("/sdcard/{filename}");

        // Start the segment within the retry budget.
        let mut process: Option<Box<dyn SegmentProcess>> = None;
        for attempt in 1..=tuning.start_retry_count {
            match backend.start_segment(serial, &remote) {
                Ok(proc) => {
                    process = Some(proc);
                    break;
                }
                Err(err) => {
                    warn!(serial, attempt, error = %err, "failed to start segment");
                    if attempt < tuning.start_retry_count {
                        thread::sleep(tuning.start_retry_delay);
                    } else {
                        fail_session(
                            &bus,
                            &status,
                            &session,
                            &operation_id,
                            &target,
                            format!("failed to start recording: {}", err.summary_line()),
                        );
                        return;
                    }
                }
            }
        }
        let mut process = process.expect("segment process after successful start");
        status.update(
            &operation_id,
            OperationPatch::running(format!("Recording segment {segment_index:02}")),
        );

        // Poll segment liveness until the cap, a user stop, or an exit.
        let segment_start = Instant::now();
        let mut polls: u32 = 0;
        let end = loop {
            let exited = process.try_finished();
            let stop_requested = stop_flag.load(Ordering::Relaxed);
            if let Some(end) = classify_segment_end(
                segment_start.elapsed(),
                tuning.segment_duration,
                stop_requested,
                exited,
            ) {
                break end;
            }
            thread::sleep(tuning.poll_interval);
            polls += 1;
            if polls % HEARTBEAT_EVERY_POLLS == 0 {
                let elapsed_total = total_duration + segment_start.elapsed().as_secs_f64();
                if let Ok(mut guard) = session.lock() {
                    guard.observe_elapsed(elapsed_total);
                }
                bus.publish(CoreEvent::RecordingProgress {
                    progress: RecordingProgressEvent {
                        event_type: RecordingEventType::Heartbeat,
                        device_serial: serial.to_string(),
                        device_name: Some(target.device_name.clone()),
                        output_path: Some(output_path.clone()),
                        segment_index: Some(segment_index),
                        segment_filename: Some(filename.clone()),
                        duration_seconds: Some(segment_start.elapsed().as_secs_f64()),
                        total_duration_seconds: Some(elapsed_total),
                        message: None,
                        request_origin: None,
                    },
                });
            }
        };

        let segment_elapsed = segment_start.elapsed();
        let died_early = end == SegmentEnd::ProcessExited && segment_elapsed < Duration::from_secs(2);
        if died_early {
            fail_session(
                &bus,
                &status,
                &session,
                &operation_id,
                &target,
                format!("screenrecord exited immediately on segment {segment_index:02}"),
            );
            return;
        }

        // Shut the recorder down cleanly and wait for the flush.
        if end != SegmentEnd::ProcessExited {
            let mut exited = false;
            for attempt in 1..=tuning.stop_retry_count {
                if let Err(err) = backend.signal_stop(serial) {
                    warn!(serial, attempt, error = %err, "failed to signal segment stop");
                }
                let wait_deadline = Instant::now() + tuning.stop_wait_timeout;
                while Instant::now() < wait_deadline {
                    if process.try_finished() {
                        exited = true;
                        break;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                if exited {
                    break;
                }
                if attempt < tuning.stop_retry_count {
                    thread::sleep(tuning.stop_retry_delay);
                }
            }
            if !exited {
                warn!(serial, "segment did not stop cleanly; killing child");
                process.kill();
            }
        }
        thread::sleep(tuning.flush_wait);

        // Retrieve the artifact, then drop the device-side copy.
        let local = session_dir.join(&filename);
        let mut pulled = false;
        let mut last_error: Option<CoreError> = None;
        for attempt in 1..=tuning.pull_retry_count {
            match backend.pull_segment(serial, &remote, &local) {
                Ok(()) => {
                    pulled = true;
                    break;
                }
                Err(err) => {
                    warn!(serial, attempt, error = %err, "segment pull failed");
                    last_error = Some(err);
                    if attempt < tuning.pull_retry_count {
                        thread::sleep(tuning.pull_retry_delay);
                    }
                }
            }
        }
        if !pulled {
            let reason = last_error
                .map(|err| err.summary_line())
                .unwrap_or_else(|| "pull failed".to_string());
            fail_session(
                &bus,
                &status,
                &session,
                &operation_id,
                &target,
                format!("failed to retrieve segment {segment_index:02}: {reason}"),
            );
            return;
        }
        backend.remove_remote(serial, &remote);

        let user_stop = end == SegmentEnd::UserStop || stop_flag.load(Ordering::Relaxed);
        let duration_seconds = segment_elapsed.as_secs_f64();
        total_duration += duration_seconds;
        let origin = if user_stop {
            RequestOrigin::User
        } else {
            RequestOrigin::Internal
        };

        if let Ok(mut guard) = session.lock() {
            guard.apply_segment(
                RecordingSegment {
                    index: segment_index,
                    filename: filename.clone(),
                    duration_seconds,
                    total_duration_seconds: total_duration,
                },
                origin,
            );
        }
        bus.publish(CoreEvent::RecordingProgress {
            progress: RecordingProgressEvent {
                event_type: RecordingEventType::SegmentCompleted,
                device_serial: serial.to_string(),
                device_name: Some(target.device_name.clone()),
                output_path: Some(output_path.clone()),
                segment_index: Some(segment_index),
                segment_filename: Some(filename),
                duration_seconds: Some(duration_seconds),
                total_duration_seconds: Some(total_duration),
                message: None,
                request_origin: Some(origin),
            },
        });

        if user_stop {
            finish_session(&status, &session, &operation_id, total_duration);
            return;
        }
        segment_index += 1;
    }
}

fn finish_session(
    status: &StatusManager,
    session: &Mutex<RecordingSession>,
    operation_id: &str,
    total_duration: f64,
) {
    if let Ok(mut guard) = session.lock() {
        guard.mark_inactive();
    }
    status.complete(
        operation_id,
        Some(format!("Recording saved ({total_duration:.1}s)")),
    );
}

fn fail_session(
    bus: &EventBus,
    status: &StatusManager,
    session: &Mutex<RecordingSession>,
    operation_id: &str,
    target: &RecordingTarget,
    message: String,
) {
    if let Ok(mut guard) = session.lock() {
        guard.mark_inactive();
    }
    let mut event = RecordingProgressEvent::error(target.serial.clone(), message.clone());
    event.device_name = Some(target.device_name.clone());
    bus.publish(CoreEvent::RecordingProgress { progress: event });
    status.fail(operation_id, message);
}
