/// Default number of frames between two processed frames.
pub const DEFAULT_FRAME_INTERVAL: usize = 30;

/// Whether the frame at `frame_index` is sent to the detector.
///
/// `interval` must be at least 1; `RunConfig::validate` guarantees it for
/// configured runs. An interval of 0 is treated as 1.
pub fn should_process(frame_index: usize, interval: usize) -> bool {
    frame_index % interval.max(1) == 0
}

/// Fixed-stride frame selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSampler {
    interval: usize,
}

impl FrameSampler {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn should_process(&self, frame_index: usize) -> bool {
        should_process(frame_index, self.interval)
    }
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL)
    }
}
