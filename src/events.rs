use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::bluetooth::models::{ParsedEvent, ParsedSnapshot, StateSummary};
use crate::models::{
    CommandBlock, Device, OperationEvent, OperationSummary, RecordingProgressEvent,
};

/// Every observable state change in the core flows through this enum. Front
/// ends subscribe once and dispatch on the variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum CoreEvent {
    DeviceAdded {
        device: Device,
    },
    DeviceRemoved {
        serial: String,
    },
    DeviceChanged {
        device: Device,
        fields_changed: Vec<String>,
    },
    OperationAdded {
        operation: OperationEvent,
    },
    OperationUpdated {
        operation: OperationEvent,
    },
    OperationRemoved {
        operation_id: String,
    },
    DeviceStatusChanged {
        serial: String,
    },
    OperationSummaryReady {
        summary: OperationSummary,
    },
    RecordingProgress {
        progress: RecordingProgressEvent,
    },
    BluetoothSnapshotParsed {
        snapshot: ParsedSnapshot,
    },
    BluetoothEventParsed {
        event: ParsedEvent,
    },
    BluetoothStateUpdated {
        summary: StateSummary,
        changed: bool,
    },
    BluetoothError {
        serial: String,
        message: String,
    },
    CommandBlockReady {
        block: CommandBlock,
    },
    LogLine {
        serial: String,
        line: String,
    },
    QueueSaturated {
        queued: usize,
        soft_limit: usize,
    },
    Warning {
        message: String,
    },
}

/// Fan-out bus over plain mpsc channels. Each subscriber gets its own
/// receiver; senders whose receiver was dropped are pruned on publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<CoreEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        let (tx, rx) = channel();
        self.subscribers
            .lock()
            .expect("event bus subscribers poisoned")
            .push(tx);
        rx
    }

    pub fn publish(&self, event: CoreEvent) {
        let mut guard = self
            .subscribers
            .lock()
            .expect("event bus subscribers poisoned");
        guard.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus subscribers poisoned")
            .len()
    }
}
