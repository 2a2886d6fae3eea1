pub mod fanout;
pub mod filegen;
pub mod install;
pub mod reboot;

pub use fanout::{DeviceTarget, FanoutDeps, FanoutHandle};
