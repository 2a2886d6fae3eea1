pub mod models;
pub mod parser;
pub mod service;
pub mod state_machine;

pub use models::{BluetoothEventType, BluetoothState, MetricValue, StateSummary};
pub use parser::BluetoothParser;
pub use service::{start_adb_bluetooth_monitor, BluetoothMonitorHandle};
pub use state_machine::{BluetoothStateMachine, StateUpdate};
