use crate::analysis::Demographics;
use crate::normalize::DetectedFace;
use serde::{Deserialize, Serialize};

/// Metadata persisted for one face.
///
/// Serializes as an entry of `faces_info.json`; demographics are only
/// written when analysis ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub frame: usize,
    pub face_index: usize,
    pub confidence: f64,
    pub facial_area: [i32; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demographics: Option<Demographics>,
}

impl FaceRecord {
    pub fn new(frame: usize, face: &DetectedFace, demographics: Option<Demographics>) -> Self {
        Self {
            frame,
            face_index: face.face_index,
            confidence: face.confidence,
            facial_area: face.facial_area,
            demographics,
        }
    }

    pub fn sidecar(&self) -> FaceSidecar {
        FaceSidecar {
            face_index: self.face_index,
            confidence: self.confidence,
            facial_area: self.facial_area,
            demographics: self.demographics.clone(),
        }
    }
}

/// The per-face `face_NNN_info.json` document; `demographics` is `null` when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSidecar {
    pub face_index: usize,
    pub confidence: f64,
    pub facial_area: [i32; 4],
    pub demographics: Option<Demographics>,
}
