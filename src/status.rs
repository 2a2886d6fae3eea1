use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::events::{CoreEvent, EventBus};
use crate::models::{now_epoch, OperationEvent, OperationStatus, OperationType};

pub const AUTO_DISMISS_DELAY: Duration = Duration::from_millis(3000);
pub const MAX_TERMINAL_OPERATIONS: usize = 50;

pub type CancelCallback = Box<dyn FnMut() -> bool + Send>;

/// Field updates applied to an existing operation.
#[derive(Debug, Default, Clone)]
pub struct OperationPatch {
    pub status: Option<OperationStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub error_message: Option<String>,
}

impl OperationPatch {
    pub fn status(status: OperationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn running(message: impl Into<String>) -> Self {
        Self {
            status: Some(OperationStatus::Running),
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

struct StatusInner {
    operations: HashMap<String, OperationEvent>,
    device_index: HashMap<String, Vec<String>>,
    cancel_callbacks: HashMap<String, CancelCallback>,
    dismiss_deadlines: HashMap<String, Instant>,
}

/// Canonical registry of in-flight and recently-terminal operations.
/// Add/update/remove are serialized under one lock; emitted events reflect
/// the post-state.
pub struct StatusManager {
    inner: Mutex<StatusInner>,
    bus: EventBus,
    dismiss_delay: Duration,
    sweeper_stop: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StatusManager {
    pub fn spawn(bus: EventBus) -> Arc<Self> {
        Self::spawn_with_dismiss_delay(bus, AUTO_DISMISS_DELAY)
    }

    pub fn spawn_with_dismiss_delay(bus: EventBus, dismiss_delay: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            inner: Mutex::new(StatusInner {
                operations: HashMap::new(),
                device_index: HashMap::new(),
                cancel_callbacks: HashMap::new(),
                dismiss_deadlines: HashMap::new(),
            }),
            bus,
            dismiss_delay,
            sweeper_stop: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
        });

        let weak: Weak<StatusManager> = Arc::downgrade(&manager);
        let stop = Arc::clone(&manager.sweeper_stop);
        let sweeper = thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(25));
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                manager.dismiss_due(Instant::now());
            }
        });
        *manager.sweeper.lock().expect("sweeper slot poisoned") = Some(sweeper);
        manager
    }

    pub fn shutdown(&self) {
        self.sweeper_stop.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(join) = guard.take() {
                let _ = join.join();
            }
        }
    }

    /// Register an operation. For RECORDING, an active recording event on the
    /// same serial is updated in place and its id returned (coalescing).
    pub fn add(&self, event: OperationEvent, cancel_callback: Option<CancelCallback>) -> String {
        if event.operation_type == OperationType::Recording {
            let existing = {
                let guard = self.inner.lock().expect("status registry poisoned");
                guard
                    .device_index
                    .get(&event.device_serial)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| guard.operations.get(id))
                    .find(|op| op.operation_type == OperationType::Recording && op.is_active())
                    .map(|op| op.operation_id.clone())
            };
            if let Some(existing_id) = existing {
                self.update(
                    &existing_id,
                    OperationPatch {
                        status: Some(event.status),
                        progress: event.progress,
                        message: event.message,
                        error_message: event.error_message,
                    },
                );
                return existing_id;
            }
        }

        let op_id = event.operation_id.clone();
        let serial = event.device_serial.clone();
        {
            let mut guard = self.inner.lock().expect("status registry poisoned");
            guard
                .device_index
                .entry(serial.clone())
                .or_default()
                .push(op_id.clone());
            if let Some(callback) = cancel_callback {
                if event.can_cancel {
                    guard.cancel_callbacks.insert(op_id.clone(), callback);
                }
            }
            guard.operations.insert(op_id.clone(), event.clone());
        }
        debug!(
            operation_id = %op_id,
            serial = %serial,
            operation_type = ?event.operation_type,
            "operation added"
        );
        self.bus.publish(CoreEvent::OperationAdded { operation: event });
        self.bus.publish(CoreEvent::DeviceStatusChanged { serial });
        op_id
    }

    /// Apply a patch. Terminal operations are final: patches against them are
    /// ignored and the stored event is returned unchanged.
    pub fn update(&self, operation_id: &str, patch: OperationPatch) -> Option<OperationEvent> {
        let (updated, serial, became_terminal) = {
            let mut guard = self.inner.lock().expect("status registry poisoned");
            let inner = &mut *guard;
            let event = match inner.operations.get_mut(operation_id) {
                Some(event) => event,
                None => {
                    warn!(operation_id, "cannot update unknown operation");
                    return None;
                }
            };
            if event.is_terminal() {
                return Some(event.clone());
            }

            if let Some(progress) = patch.progress {
                event.progress = Some(progress.clamp(0.0, 1.0));
            }
            if let Some(message) = patch.message {
                event.message = Some(message);
            }
            if let Some(error_message) = patch.error_message {
                event.error_message = Some(error_message);
            }
            let mut became_terminal = false;
            if let Some(status) = patch.status {
                // Monotonic: never step back to a lower-ranked status.
                if status.rank() >= event.status.rank() {
                    event.status = status;
                    if status.is_terminal() {
                        event.completed_at = Some(now_epoch());
                        became_terminal = true;
                    }
                }
            }
            let updated = event.clone();
            let serial = updated.device_serial.clone();
            if became_terminal {
                inner.cancel_callbacks.remove(operation_id);
                inner
                    .dismiss_deadlines
                    .insert(operation_id.to_string(), Instant::now() + self.dismiss_delay);
            }
            (updated, serial, became_terminal)
        };

        self.bus.publish(CoreEvent::OperationUpdated {
            operation: updated.clone(),
        });
        self.bus.publish(CoreEvent::DeviceStatusChanged { serial });

        if became_terminal {
            self.evict_terminal_overflow();
        }
        Some(updated)
    }

    pub fn complete(&self, operation_id: &str, message: Option<String>) -> Option<OperationEvent> {
        self.update(
            operation_id,
            OperationPatch {
                status: Some(OperationStatus::Completed),
                message,
                ..OperationPatch::default()
            },
        )
    }

    pub fn fail(&self, operation_id: &str, error_message: impl Into<String>) -> Option<OperationEvent> {
        self.update(
            operation_id,
            OperationPatch {
                status: Some(OperationStatus::Failed),
                error_message: Some(error_message.into()),
                ..OperationPatch::default()
            },
        )
    }

    /// Attempt to cancel. Returns false for unknown, terminal, or
    /// non-cancellable operations; otherwise CANCELLED is always recorded,
    /// even when the callback is absent or reports failure.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let callback = {
            let mut guard = self.inner.lock().expect("status registry poisoned");
            let Some(event) = guard.operations.get(operation_id) else {
                return false;
            };
            if event.is_terminal() || !event.can_cancel {
                return false;
            }
            guard.cancel_callbacks.remove(operation_id)
        };

        let acknowledged = match callback {
            Some(mut callback) => callback(),
            None => false,
        };
        if !acknowledged {
            warn!(
                operation_id,
                "cancel callback absent or ineffective; recording CANCELLED anyway"
            );
        }
        self.update(operation_id, OperationPatch::status(OperationStatus::Cancelled));
        true
    }

    pub fn remove(&self, operation_id: &str) {
        let serial = {
            let mut guard = self.inner.lock().expect("status registry poisoned");
            let Some(event) = guard.operations.remove(operation_id) else {
                return;
            };
            let now_empty = match guard.device_index.get_mut(&event.device_serial) {
                Some(ids) => {
                    ids.retain(|id| id != operation_id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                guard.device_index.remove(&event.device_serial);
            }
            guard.cancel_callbacks.remove(operation_id);
            guard.dismiss_deadlines.remove(operation_id);
            event.device_serial
        };
        self.bus.publish(CoreEvent::OperationRemoved {
            operation_id: operation_id.to_string(),
        });
        self.bus.publish(CoreEvent::DeviceStatusChanged { serial });
    }

    pub fn get(&self, operation_id: &str) -> Option<OperationEvent> {
        let guard = self.inner.lock().expect("status registry poisoned");
        guard.operations.get(operation_id).cloned()
    }

    pub fn device_operations(&self, serial: &str) -> Vec<OperationEvent> {
        let guard = self.inner.lock().expect("status registry poisoned");
        guard
            .device_index
            .get(serial)
            .into_iter()
            .flatten()
            .filter_map(|id| guard.operations.get(id))
            .cloned()
            .collect()
    }

    pub fn active_operations(&self) -> Vec<OperationEvent> {
        let guard = self.inner.lock().expect("status registry poisoned");
        guard
            .operations
            .values()
            .filter(|op| op.is_active())
            .cloned()
            .collect()
    }

    pub fn all_operations(&self) -> Vec<OperationEvent> {
        let guard = self.inner.lock().expect("status registry poisoned");
        guard.operations.values().cloned().collect()
    }

    pub fn has_active(&self, serial: Option<&str>) -> bool {
        let guard = self.inner.lock().expect("status registry poisoned");
        match serial {
            Some(serial) => guard
                .device_index
                .get(serial)
                .into_iter()
                .flatten()
                .filter_map(|id| guard.operations.get(id))
                .any(|op| op.is_active()),
            None => guard.operations.values().any(|op| op.is_active()),
        }
    }

    /// Remove all terminal operations, optionally scoped to one serial.
    /// Returns the number removed; calling twice removes nothing the second
    /// time.
    pub fn clear_completed(&self, serial: Option<&str>) -> usize {
        let ids: Vec<String> = {
            let guard = self.inner.lock().expect("status registry poisoned");
            guard
                .operations
                .values()
                .filter(|op| op.is_terminal())
                .filter(|op| serial.map(|s| op.device_serial == s).unwrap_or(true))
                .map(|op| op.operation_id.clone())
                .collect()
        };
        let removed = ids.len();
        for id in ids {
            self.remove(&id);
        }
        removed
    }

    fn dismiss_due(&self, now: Instant) {
        let due: Vec<String> = {
            let guard = self.inner.lock().expect("status registry poisoned");
            guard
                .dismiss_deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in due {
            self.remove(&id);
        }
    }

    /// Oldest terminal entries are evicted immediately once the retention
    /// cap is exceeded, FIFO on completion time.
    fn evict_terminal_overflow(&self) {
        loop {
            let victim = {
                let guard = self.inner.lock().expect("status registry poisoned");
                let mut terminal: Vec<&OperationEvent> = guard
                    .operations
                    .values()
                    .filter(|op| op.is_terminal())
                    .collect();
                if terminal.len() <= MAX_TERMINAL_OPERATIONS {
                    None
                } else {
                    terminal.sort_by(|a, b| {
                        a.completed_at
                            .unwrap_or(0.0)
                            .partial_cmp(&b.completed_at.unwrap_or(0.0))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    terminal.first().map(|op| op.operation_id.clone())
                }
            };
            match victim {
                Some(id) => self.remove(&id),
                None => break,
            }
        }
    }
}

impl Drop for StatusManager {
    fn drop(&mut self) {
        self.sweeper_stop.store(true, Ordering::Relaxed);
    }
}
