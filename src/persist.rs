//! Writing artifacts to disk.
//!
//! Two layouts are supported:
//!
//! * [`Layout::Batch`]: one directory per video holding
//!   `frame_<n>_face_<i>.png` files and a `faces_info.json` list.
//! * [`Layout::FrameDirs`]: one `frame_<n:05>` directory per processed
//!   frame holding `frame.png`, `original_face_<i:03>.png`,
//!   `restored_face_<i:03>.png`, `face_<i:03>.png` and `face_<i:03>_info.json`.
//!
//! Every video directory gets a `run_stats.json` written last; its presence
//! marks the directory as complete.

use crate::error::{ExtractError, ExtractResult};
use image::RgbImage;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::Builder;

pub const FACES_INFO_FILE: &str = "faces_info.json";
pub const RUN_STATS_FILE: &str = "run_stats.json";

/// Directory layout of a video's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    #[default]
    Batch,
    FrameDirs,
}

/// Creates `path` and its parents; succeeds if it already exists.
pub fn ensure_dir(path: &Path) -> ExtractResult<()> {
    std::fs::create_dir_all(path).map_err(|e| ExtractError::persistence(path, e))
}

/// Writes `image` as PNG, creating the parent directory if needed.
pub fn write_image(path: &Path, image: &RgbImage) -> ExtractResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| ExtractError::persistence(path, e))
}

/// Writes `value` as UTF-8 JSON indented by four spaces.
///
/// The document is written to a hidden file next to `path` and renamed
/// into place, so readers never see a half-written file.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> ExtractResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;

    let mut file = Builder::new()
        .prefix(".partial_")
        .suffix(".json")
        .tempfile_in(parent)
        .map_err(|e| ExtractError::persistence(path, e))?;

    {
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut ser = Serializer::with_formatter(&mut file, formatter);
        value
            .serialize(&mut ser)
            .map_err(|e| ExtractError::persistence(path, e))?;
    }
    file.write_all(b"\n")
        .and_then(|_| file.flush())
        .map_err(|e| ExtractError::persistence(path, e))?;

    file.persist(path)
        .map_err(|e| ExtractError::persistence(path, e.error))?;
    Ok(())
}

/// Paths of every artifact produced for one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOutput {
    root: PathBuf,
    layout: Layout,
}

impl VideoOutput {
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Directory that receives a frame's artifacts.
    pub fn frame_dir(&self, frame: usize) -> PathBuf {
        match self.layout {
            Layout::Batch => self.root.clone(),
            Layout::FrameDirs => self.root.join(format!("frame_{:05}", frame)),
        }
    }

    /// The full frame, only kept in the frame-directory layout.
    pub fn frame_image(&self, frame: usize) -> Option<PathBuf> {
        match self.layout {
            Layout::Batch => None,
            Layout::FrameDirs => Some(self.frame_dir(frame).join("frame.png")),
        }
    }

    pub fn face_image(&self, frame: usize, face: usize) -> PathBuf {
        match self.layout {
            Layout::Batch => self.root.join(format!("frame_{}_face_{}.png", frame, face)),
            Layout::FrameDirs => self.frame_dir(frame).join(format!("face_{:03}.png", face)),
        }
    }

    /// Copy of the detected face kept next to its restored version.
    pub fn original_face_image(&self, frame: usize, face: usize) -> Option<PathBuf> {
        match self.layout {
            Layout::Batch => None,
            Layout::FrameDirs => Some(
                self.frame_dir(frame)
                    .join(format!("original_face_{:03}.png", face)),
            ),
        }
    }

    pub fn restored_face_image(&self, frame: usize, face: usize) -> PathBuf {
        match self.layout {
            Layout::Batch => self
                .root
                .join(format!("frame_{}_face_{}_restored.png", frame, face)),
            Layout::FrameDirs => self
                .frame_dir(frame)
                .join(format!("restored_face_{:03}.png", face)),
        }
    }

    /// Full restorer output with faces pasted back.
    pub fn restored_full_image(&self, frame: usize, face: usize) -> Option<PathBuf> {
        match self.layout {
            Layout::Batch => None,
            Layout::FrameDirs => Some(
                self.frame_dir(frame)
                    .join(format!("restored_img_{:03}.png", face)),
            ),
        }
    }

    /// Per-face JSON sidecar, only written in the frame-directory layout.
    pub fn face_sidecar(&self, frame: usize, face: usize) -> Option<PathBuf> {
        match self.layout {
            Layout::Batch => None,
            Layout::FrameDirs => Some(
                self.frame_dir(frame)
                    .join(format!("face_{:03}_info.json", face)),
            ),
        }
    }

    /// The per-video face list, only written in the batch layout.
    pub fn faces_info(&self) -> Option<PathBuf> {
        match self.layout {
            Layout::Batch => Some(self.root.join(FACES_INFO_FILE)),
            Layout::FrameDirs => None,
        }
    }

    pub fn run_stats(&self) -> PathBuf {
        self.root.join(RUN_STATS_FILE)
    }

    /// Whether a previous run finished this video.
    pub fn is_complete(&self) -> bool {
        self.run_stats().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FaceRecord, FaceSidecar};
    use tempfile::TempDir;

    #[test]
    fn ensure_dir_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("Robbery").join("Robbery034_x264");
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn batch_naming() {
        let out = VideoOutput::new("/out/Robbery/Robbery034_x264", Layout::Batch);
        assert_eq!(
            out.face_image(120, 2),
            PathBuf::from("/out/Robbery/Robbery034_x264/frame_120_face_2.png")
        );
        assert_eq!(
            out.faces_info(),
            Some(PathBuf::from("/out/Robbery/Robbery034_x264/faces_info.json"))
        );
        assert_eq!(out.face_sidecar(120, 2), None);
        assert_eq!(out.frame_image(120), None);
    }

    #[test]
    fn frame_dir_naming() {
        let out = VideoOutput::new("/out", Layout::FrameDirs);
        let dir = PathBuf::from("/out/frame_00007");
        assert_eq!(out.frame_dir(7), dir);
        assert_eq!(out.frame_image(7), Some(dir.join("frame.png")));
        assert_eq!(out.original_face_image(7, 1), Some(dir.join("original_face_001.png")));
        assert_eq!(out.restored_face_image(7, 1), dir.join("restored_face_001.png"));
        assert_eq!(out.restored_full_image(7, 1), Some(dir.join("restored_img_001.png")));
        assert_eq!(out.face_image(7, 1), dir.join("face_001.png"));
        assert_eq!(out.face_sidecar(7, 1), Some(dir.join("face_001_info.json")));
        assert_eq!(out.faces_info(), None);
    }

    #[test]
    fn json_is_pretty_and_keeps_unicode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("info.json");
        write_json(&path, &serde_json::json!({"classe": "Agressão"})).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n    \"classe\": \"Agressão\"\n}\n");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".partial_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let record = FaceRecord {
            frame: 3,
            face_index: 0,
            confidence: 0.75,
            facial_area: [1, 2, 3, 4],
            demographics: None,
        };
        let path = dir.path().join("face_000_info.json");
        write_json(&path, &record.sidecar()).unwrap();

        let back: FaceSidecar =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, record.sidecar());
    }

    #[test]
    fn write_image_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frame_00000").join("face_000.png");
        write_image(&path, &RgbImage::new(3, 3)).unwrap();
        assert_eq!(image::open(&path).unwrap().to_rgb8().dimensions(), (3, 3));
    }
}
