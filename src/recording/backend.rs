use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use crate::adb::commands;
use crate::adb::runner::run_command_with_timeout;
use crate::config::ScreenRecordSettings;
use crate::error::CoreError;

/// Handle to one on-device `screenrecord` invocation.
pub trait SegmentProcess: Send {
    /// Non-blocking: has the child exited?
    fn try_finished(&mut self) -> bool;
    fn kill(&mut self);
}

/// The subprocess surface the segment loop drives. Split from the loop so the
/// coordinator's scheduling and retry behavior is testable without devices.
pub trait RecorderBackend: Send + Sync + 'static {
    fn start_segment(
        &self,
        serial: &str,
        remote: &str,
    ) -> Result<Box<dyn SegmentProcess>, CoreError>;

    /// Ask the on-device recorder to finish the current file cleanly.
    fn signal_stop(&self, serial: &str) -> Result<(), CoreError>;

    fn pull_segment(&self, serial: &str, remote: &str, local: &Path) -> Result<(), CoreError>;

    fn remove_remote(&self, serial: &str, remote: &str);
}

struct AdbSegmentProcess {
    child: Child,
}

impl SegmentProcess for AdbSegmentProcess {
    fn try_finished(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct AdbRecorderBackend {
    adb_program: String,
    settings: ScreenRecordSettings,
}

impl AdbRecorderBackend {
    pub fn new(adb_program: impl Into<String>, settings: ScreenRecordSettings) -> Self {
        Self {
            adb_program: adb_program.into(),
            settings,
        }
    }
}

impl RecorderBackend for AdbRecorderBackend {
    fn start_segment(
        &self,
        serial: &str,
        remote: &str,
    ) -> Result<Box<dyn SegmentProcess>, CoreError> {
        let args = commands::screenrecord(serial, remote, &self.settings);
        debug!(serial, remote, "starting screenrecord segment");
        let child = Command::new(&self.adb_program)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| CoreError::io(format!("failed to start screenrecord: {err}")))?;
        Ok(Box::new(AdbSegmentProcess { child }))
    }

    fn signal_stop(&self, serial: &str) -> Result<(), CoreError> {
        // SIGINT lets screenrecord finalize the MP4 before exiting.
        let output = run_command_with_timeout(
            &self.adb_program,
            &commands::screenrecord_interrupt(serial),
            Duration::from_secs(5),
        )?;
        debug!(serial, exit_code = ?output.exit_code, "sent screenrecord interrupt");
        Ok(())
    }

    fn pull_segment(&self, serial: &str, remote: &str, local: &Path) -> Result<(), CoreError> {
        let local_str = local.to_string_lossy().to_string();
        let output = run_command_with_timeout(
            &self.adb_program,
            &commands::pull(serial, remote, &local_str),
            Duration::from_secs(60),
        )?;
        output.require_success(&format!("adb -s {serial} pull {remote}"))
    }

    fn remove_remote(&self, serial: &str, remote: &str) {
        let result = run_command_with_timeout(
            &self.adb_program,
            &commands::remove_remote(serial, remote),
            Duration::from_secs(10),
        );
        if let Err(err) = result {
            warn!(serial, remote, error = %err, "failed to remove remote segment");
        }
    }
}
