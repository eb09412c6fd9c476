use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Counters for one video, or summed over a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Frames decoded, sampled or not.
    pub frames_processed: usize,
    /// Frames handed to the detector.
    pub frames_sampled: usize,
    /// Faces that survived normalization.
    pub faces_detected: usize,
    /// Faces whose artifacts and record were written.
    pub faces_saved: usize,
    pub faces_failed: usize,
    pub detection_failures: usize,
    pub elapsed_seconds: f64,
}

impl RunStats {
    pub fn frames_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.frames_processed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.frames_processed += other.frames_processed;
        self.frames_sampled += other.frames_sampled;
        self.faces_detected += other.faces_detected;
        self.faces_saved += other.faces_saved;
        self.faces_failed += other.faces_failed;
        self.detection_failures += other.detection_failures;
        self.elapsed_seconds += other.elapsed_seconds;
    }
}

/// Contents of a video's `run_stats.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub video: PathBuf,
    pub total_frames: Option<u64>,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub frame_interval: usize,
    pub stats: RunStats,
}

/// Outcome of a dataset run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub videos_processed: usize,
    /// Videos left untouched because a previous run completed them.
    pub videos_skipped: usize,
    pub failures: Vec<(PathBuf, String)>,
    /// Set when the run stopped before visiting every video.
    pub cancelled: bool,
    pub totals: RunStats,
}

impl BatchReport {
    pub fn record_success(&mut self, stats: &RunStats) {
        self.videos_processed += 1;
        self.totals.merge(stats);
    }

    pub fn record_failure(&mut self, video: PathBuf, reason: String) {
        self.failures.push((video, reason));
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.videos_processed += other.videos_processed;
        self.videos_skipped += other.videos_skipped;
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
        self.totals.merge(&other.totals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput() {
        let stats = RunStats {
            frames_processed: 300,
            elapsed_seconds: 12.0,
            ..Default::default()
        };
        assert_eq!(stats.frames_per_second(), 25.0);
        assert_eq!(RunStats::default().frames_per_second(), 0.0);
    }

    #[test]
    fn reports_merge() {
        let mut a = BatchReport::default();
        a.record_success(&RunStats {
            frames_processed: 10,
            faces_saved: 2,
            ..Default::default()
        });
        let mut b = BatchReport::default();
        b.record_failure("bad.avi".into(), "cannot open".into());
        b.cancelled = true;

        a.merge(b);
        assert_eq!(a.videos_processed, 1);
        assert_eq!(a.failures.len(), 1);
        assert!(a.cancelled);
        assert_eq!(a.totals.faces_saved, 2);
    }
}
