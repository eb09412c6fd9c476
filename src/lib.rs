pub mod analysis;
pub mod bridge;
pub mod config;
pub mod detector;
pub mod driver;
pub mod error;
pub mod normalize;
pub mod persist;
pub mod pipeline;
pub mod record;
pub mod restore;
pub mod sampler;
pub mod stats;
pub mod video;

// Re-export commonly used items
pub use config::RunConfig;
pub use detector::{FaceDetector, FacePixels, RawDetection, create_detector};
pub use driver::{CancelToken, VideoJob, discover_dataset, process_dataset, process_video};
pub use error::{ExtractError, ExtractResult};
pub use normalize::DetectedFace;
pub use persist::{Layout, VideoOutput};
pub use pipeline::{FacePipeline, ModelSet};
pub use record::FaceRecord;
pub use stats::{BatchReport, RunStats};
pub use video::{Frame, FrameSource, open_video};
