pub mod backend;
pub mod coordinator;

pub use backend::{AdbRecorderBackend, RecorderBackend, SegmentProcess};
pub use coordinator::{
    RecordingCoordinator, RecordingTarget, RecordingTuning, SEGMENT_DURATION,
    SEGMENT_POLL_INTERVAL,
};
