use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::dispatch::{CancelToken, TaskContext, TaskDispatcher};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::logging::new_trace_id;
use crate::models::{
    ConnectionState, OperationEvent, OperationStatus, OperationSummary, OperationType,
};
use crate::status::{OperationPatch, StatusManager};

#[derive(Debug, Clone)]
pub struct DeviceTarget {
    pub serial: String,
    pub state: ConnectionState,
    pub device_name: Option<String>,
}

impl DeviceTarget {
    pub fn display_name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| self.serial.clone())
    }
}

/// A per-device job body: returns the local artifacts it wrote.
pub type DeviceJob =
    Arc<dyn Fn(&DeviceTarget, &CancelToken) -> Result<Vec<String>, CoreError> + Send + Sync>;

pub struct FanoutHandle {
    token: CancelToken,
    summary_rx: Receiver<OperationSummary>,
    collector: Option<JoinHandle<()>>,
    pub operation_ids: Vec<String>,
}

impl std::fmt::Debug for FanoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutHandle")
            .field("operation_ids", &self.operation_ids)
            .finish()
    }
}

impl FanoutHandle {
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn wait_summary(&self, timeout: Duration) -> Option<OperationSummary> {
        self.summary_rx.recv_timeout(timeout).ok()
    }
}

impl Drop for FanoutHandle {
    fn drop(&mut self) {
        if let Some(join) = self.collector.take() {
            let _ = join.join();
        }
    }
}

pub struct FanoutDeps {
    pub dispatcher: Arc<TaskDispatcher>,
    pub bus: EventBus,
    pub status: Arc<StatusManager>,
}

/// Fan a job across targets with per-device isolation: each device gets its
/// own operation row; failures on one device never abort its peers. A
/// consolidated summary event closes the batch.
pub fn run_device_fanout(
    deps: &FanoutDeps,
    operation_type: OperationType,
    task_name: &str,
    targets: Vec<DeviceTarget>,
    job: DeviceJob,
) -> Result<FanoutHandle, CoreError> {
    if targets.is_empty() {
        return Err(CoreError::config("no devices selected"));
    }

    let trace_id = new_trace_id();
    let token = CancelToken::new();
    let total = targets.len();
    let outcomes: Arc<Mutex<Vec<Option<Result<Vec<String>, CoreError>>>>> =
        Arc::new(Mutex::new(vec![None; total]));
    let mut waiters = Vec::new();
    let mut operation_ids = Vec::with_capacity(total);

    for (index, target) in targets.iter().enumerate() {
        let event = OperationEvent::create(
            target.serial.clone(),
            operation_type,
            target.device_name.clone(),
            Some(format!("{} queued", operation_type.display_name())),
            true,
        );
        let cancel_token = token.clone();
        let operation_id = deps.status.add(
            event,
            Some(Box::new(move || {
                cancel_token.cancel();
                true
            })),
        );
        operation_ids.push(operation_id.clone());

        if !target.state.is_operational() {
            let error = CoreError::DeviceUnavailable {
                serial: target.serial.clone(),
                state: target.state,
            };
            deps.status.fail(&operation_id, error.summary_line());
            outcomes.lock().expect("fanout outcomes poisoned")[index] = Some(Err(error));
            continue;
        }

        let target_owned = target.clone();
        let job = Arc::clone(&job);
        let status = Arc::clone(&deps.status);
        let outcomes_clone = Arc::clone(&outcomes);
        let op_id = operation_id.clone();
        let progress_label = format!("{} ({}/{})", operation_type.display_name(), index + 1, total);

        let handle = deps.dispatcher.submit_with_token(
            TaskContext::for_device(task_name, "device_ops", target.serial.clone()),
            token.clone(),
            move |token| {
                status.update(&op_id, OperationPatch::running(progress_label));
                let outcome = job(&target_owned, token);
                match &outcome {
                    Ok(artifacts) => {
                        status.update(
                            &op_id,
                            OperationPatch {
                                status: Some(OperationStatus::Completed),
                                progress: Some(1.0),
                                message: artifacts.first().cloned(),
                                ..OperationPatch::default()
                            },
                        );
                    }
                    Err(CoreError::Cancelled) => {
                        status.update(&op_id, OperationPatch::status(OperationStatus::Cancelled));
                    }
                    Err(err) => {
                        status.fail(&op_id, err.summary_line());
                    }
                }
                outcomes_clone.lock().expect("fanout outcomes poisoned")[index] = Some(outcome);
                Ok(())
            },
        )?;
        waiters.push((index, operation_id.clone(), target.serial.clone(), handle));
    }

    let bus = deps.bus.clone();
    let status = Arc::clone(&deps.status);
    let targets_owned = targets;
    let (summary_tx, summary_rx) = channel();
    let trace_owned = trace_id.clone();

    let collector = thread::spawn(move || {
        for (index, operation_id, serial, handle) in waiters {
            match handle.wait() {
                Ok(()) => {}
                Err(CoreError::Cancelled) => {
                    status.update(&operation_id, OperationPatch::status(OperationStatus::Cancelled));
                    outcomes.lock().expect("fanout outcomes poisoned")[index]
                        .get_or_insert(Err(CoreError::Cancelled));
                }
                Err(err) => {
                    warn!(serial = %serial, error = %err, "device job errored");
                    outcomes.lock().expect("fanout outcomes poisoned")[index]
                        .get_or_insert(Err(err));
                }
            }
        }

        let mut summary = OperationSummary::new(operation_type, trace_owned);
        summary.total = total;
        {
            let guard = outcomes.lock().expect("fanout outcomes poisoned");
            for (index, outcome) in guard.iter().enumerate() {
                match outcome {
                    Some(Ok(artifacts)) => {
                        summary.succeeded += 1;
                        summary.artifacts.extend(artifacts.iter().cloned());
                    }
                    Some(Err(CoreError::Cancelled)) => {
                        summary.cancelled += 1;
                    }
                    Some(Err(err)) => {
                        summary.failed += 1;
                        summary
                            .errors
                            .push((targets_owned[index].serial.clone(), err.summary_line()));
                    }
                    None => {
                        summary.failed += 1;
                        summary.errors.push((
                            targets_owned[index].serial.clone(),
                            "no outcome recorded".to_string(),
                        ));
                    }
                }
            }
        }
        bus.publish(CoreEvent::OperationSummaryReady {
            summary: summary.clone(),
        });
        let _ = summary_tx.send(summary);
    });

    Ok(FanoutHandle {
        token,
        summary_rx,
        collector: Some(collector),
        operation_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps() -> FanoutDeps {
        let bus = EventBus::new();
        FanoutDeps {
            dispatcher: Arc::new(TaskDispatcher::with_workers(4, 32, bus.clone())),
            status: StatusManager::spawn_with_dismiss_delay(bus.clone(), Duration::from_secs(600)),
            bus,
        }
    }

    fn target(serial: &str, state: ConnectionState) -> DeviceTarget {
        DeviceTarget {
            serial: serial.to_string(),
            state,
            device_name: None,
        }
    }

    #[test]
    fn per_device_failures_are_isolated() {
        let deps = deps();
        let job: DeviceJob = Arc::new(|target, _token| {
            if target.serial == "BAD" {
                Err(CoreError::io("boom"))
            } else {
                Ok(vec![format!("/tmp/{}.png", target.serial)])
            }
        });
        let handle = run_device_fanout(
            &deps,
            OperationType::Screenshot,
            "screenshot",
            vec![
                target("GOOD", ConnectionState::Device),
                target("BAD", ConnectionState::Device),
                target("LOCKED", ConnectionState::Unauthorized),
            ],
            job,
        )
        .expect("fanout");
        let summary = handle.wait_summary(Duration::from_secs(5)).expect("summary");

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.artifacts, vec!["/tmp/GOOD.png".to_string()]);
        assert_eq!(summary.errors.len(), 2);
        deps.status.shutdown();
    }

    #[test]
    fn summary_event_is_published_on_the_bus() {
        let deps = deps();
        let rx = deps.bus.subscribe();
        let job: DeviceJob = Arc::new(|_, _| Ok(Vec::new()));
        let handle = run_device_fanout(
            &deps,
            OperationType::Reboot,
            "reboot",
            vec![target("S1", ConnectionState::Device)],
            job,
        )
        .expect("fanout");
        handle.wait_summary(Duration::from_secs(5)).expect("summary");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut saw_summary = false;
        while std::time::Instant::now() < deadline && !saw_summary {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
                saw_summary = matches!(event, CoreEvent::OperationSummaryReady { .. });
            }
        }
        assert!(saw_summary);
        deps.status.shutdown();
    }

    #[test]
    fn cancel_all_cancels_in_flight_jobs() {
        let deps = deps();
        let job: DeviceJob = Arc::new(|_, token| {
            token.sleep(Duration::from_secs(10));
            token.checkpoint()?;
            Ok(Vec::new())
        });
        let handle = run_device_fanout(
            &deps,
            OperationType::BugReport,
            "bug_report",
            vec![target("S1", ConnectionState::Device)],
            job,
        )
        .expect("fanout");
        thread::sleep(Duration::from_millis(100));
        handle.cancel_all();
        let summary = handle.wait_summary(Duration::from_secs(5)).expect("summary");
        assert_eq!(summary.cancelled, 1);
        deps.status.shutdown();
    }
}
