#![allow(dead_code)]

use anyhow::{Result, bail};
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use video_face_extract::analysis::{Attribute, Demographics, DemographicsAnalyzer};
use video_face_extract::detector::{FaceDetector, FacePixels, ImageInput, InputKind, RawDetection};
use video_face_extract::restore::{FaceRestorer, RestoreOutput};
use video_face_extract::{Layout, RunConfig};

/// Frames whose pixels all hold their own index, so a detector can tell them apart.
pub fn numbered_frames(count: usize) -> Vec<RgbImage> {
    (0..count)
        .map(|i| RgbImage::from_pixel(16, 12, Rgb([i as u8; 3])))
        .collect()
}

pub fn face(value: u8) -> RawDetection {
    RawDetection::Record {
        face: FacePixels::from(RgbImage::from_pixel(8, 8, Rgb([value, value, value]))),
        confidence: Some(0.9),
        facial_area: Some([1, 2, 8, 8]),
    }
}

pub fn test_config(scratch: &Path, layout: Layout) -> RunConfig {
    RunConfig {
        frame_interval: 1,
        layout,
        inference_retries: 0,
        show_progress: false,
        scratch_dir: scratch.to_path_buf(),
        ..Default::default()
    }
}

/// Detector returning canned detections per frame marker.
pub struct ScriptedDetector {
    pub faces: HashMap<u8, Vec<RawDetection>>,
    pub kind: InputKind,
    pub fail_on: Option<u8>,
    pub seen: Arc<Mutex<Vec<u8>>>,
    pub paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl ScriptedDetector {
    pub fn new(faces: Vec<(u8, Vec<RawDetection>)>) -> Self {
        Self {
            faces: faces.into_iter().collect::<HashMap<_, _>>(),
            kind: InputKind::Buffer,
            fail_on: None,
            seen: Arc::default(),
            paths: Arc::default(),
        }
    }
}

impl FaceDetector for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn input_kind(&self) -> InputKind {
        self.kind
    }

    fn detect(&mut self, input: ImageInput<'_>) -> Result<Vec<RawDetection>> {
        let marker = input.image().get_pixel(0, 0)[0];
        if let ImageInput::Path { path, .. } = input {
            assert!(path.exists(), "scratch frame should exist during detection");
            self.paths.lock().unwrap().push(path.to_path_buf());
        }
        self.seen.lock().unwrap().push(marker);
        if self.fail_on == Some(marker) {
            bail!("detector crashed on frame marker {}", marker);
        }
        Ok(self.faces.get(&marker).cloned().unwrap_or_default())
    }
}

/// Analyzer recording the size of each image it is given.
pub struct RecordingAnalyzer {
    pub sizes: Arc<Mutex<Vec<(u32, u32)>>>,
    pub fail_on_call: Option<usize>,
}

impl RecordingAnalyzer {
    pub fn new() -> Self {
        Self {
            sizes: Arc::default(),
            fail_on_call: None,
        }
    }
}

impl DemographicsAnalyzer for RecordingAnalyzer {
    fn name(&self) -> &str {
        "recording"
    }

    fn analyze(&mut self, face: &RgbImage) -> Result<Option<Demographics>> {
        let mut sizes = self.sizes.lock().unwrap();
        let call = sizes.len();
        sizes.push(face.dimensions());
        if self.fail_on_call == Some(call) {
            bail!("analyzer out of memory");
        }
        Ok(Some(Demographics {
            age: 33.0,
            gender: Attribute::Label("Woman".into()),
            race: Attribute::Label("asian".into()),
            dominant_gender: Some("Woman".into()),
            dominant_race: Some("asian".into()),
        }))
    }
}

/// Restorer that never finds a face.
pub struct EmptyRestorer;

impl FaceRestorer for EmptyRestorer {
    fn name(&self) -> &str {
        "empty"
    }

    fn restore(&mut self, _image: &RgbImage) -> Result<RestoreOutput> {
        Ok(RestoreOutput::default())
    }
}

/// Restorer that always fails.
pub struct FailingRestorer;

impl FaceRestorer for FailingRestorer {
    fn name(&self) -> &str {
        "failing"
    }

    fn restore(&mut self, _image: &RgbImage) -> Result<RestoreOutput> {
        bail!("restoration model crashed")
    }
}

/// Restorer returning a restored crop plus the whole image.
pub struct PasteBackRestorer;

impl FaceRestorer for PasteBackRestorer {
    fn name(&self) -> &str {
        "paste-back"
    }

    fn restore(&mut self, image: &RgbImage) -> Result<RestoreOutput> {
        Ok(RestoreOutput {
            faces: vec![RgbImage::new(32, 32)],
            full_image: Some(image.clone()),
        })
    }
}

/// Files directly under `dir` whose names start with `prefix`.
pub fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with(prefix))
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// Restorer recording the size of each input and returning it unchanged.
pub struct RecordingRestorer {
    pub inputs: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl RecordingRestorer {
    pub fn new() -> Self {
        Self {
            inputs: Arc::default(),
        }
    }
}

impl FaceRestorer for RecordingRestorer {
    fn name(&self) -> &str {
        "recording"
    }

    fn restore(&mut self, image: &RgbImage) -> Result<RestoreOutput> {
        self.inputs.lock().unwrap().push(image.dimensions());
        Ok(RestoreOutput {
            faces: vec![image.clone()],
            full_image: None,
        })
    }
}
