//! Headless multi-device ADB orchestration core.
//!
//! The toolkit supervises a fleet of locally attached Android devices:
//! discovery with a diffing registry, a bounded task dispatcher, segmented
//! screen recordings that outlive adb's per-invocation limit, Bluetooth
//! monitoring fused from dumpsys snapshots and logcat events, and batched
//! shell/file operations. Front-ends drive [`toolkit::DeviceToolkit`] and
//! consume its typed event stream; no UI code lives here.

pub mod adb;
pub mod bluetooth;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod ops;
pub mod recording;
pub mod shell;
pub mod status;
pub mod toolkit;
pub mod version;

pub use error::CoreError;
pub use events::{CoreEvent, EventBus};
pub use toolkit::{DeviceToolkit, ExitCode};
