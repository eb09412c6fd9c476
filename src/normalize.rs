//! Turns whatever a detector returned into uniform [`DetectedFace`] values.
//!
//! This is the only place that looks at the shape of a [`RawDetection`].

use crate::detector::{ChannelOrder, FacePixels, RawDetection};
use crate::error::NormalizeError;
use image::RgbImage;
use log::warn;

pub const DEFAULT_CONFIDENCE: f64 = 1.0;
pub const DEFAULT_FACIAL_AREA: [i32; 4] = [0, 0, 0, 0];

/// A face ready for restoration, analysis and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    /// Position in the frame's detection list, counting dropped entries.
    pub face_index: usize,
    /// RGB pixels, never zero-sized.
    pub image: RgbImage,
    pub confidence: f64,
    /// `[x, y, w, h]` in frame coordinates.
    pub facial_area: [i32; 4],
}

/// Normalizes one detection.
pub fn normalize_detection(
    raw: RawDetection,
    face_index: usize,
    order: ChannelOrder,
) -> Result<DetectedFace, NormalizeError> {
    let (pixels, confidence, facial_area) = match raw {
        RawDetection::Record {
            face,
            confidence,
            facial_area,
        } => (face, confidence, facial_area),
        RawDetection::Pair(face, _aux) => (face, None, None),
        RawDetection::Bare(face) => (face, None, None),
    };

    let mut image = to_rgb8(pixels)?;
    if order == ChannelOrder::Bgr {
        swap_red_blue(&mut image);
    }

    Ok(DetectedFace {
        face_index,
        image,
        confidence: confidence
            .filter(|c| c.is_finite())
            .unwrap_or(DEFAULT_CONFIDENCE),
        facial_area: facial_area.unwrap_or(DEFAULT_FACIAL_AREA),
    })
}

/// Normalizes every detection of a frame, dropping the ones that fail.
pub fn normalize_all(
    raw: Vec<RawDetection>,
    order: ChannelOrder,
    frame_index: usize,
) -> Vec<DetectedFace> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(face_index, detection)| {
            match normalize_detection(detection, face_index, order) {
                Ok(face) => Some(face),
                Err(err) => {
                    warn!(
                        "Skipping face {} of frame {}: {}",
                        face_index, frame_index, err
                    );
                    None
                }
            }
        })
        .collect()
}

/// Coerces a backend pixel buffer to 8-bit RGB.
///
/// Float buffers whose magnitudes all stay within 1.0 are treated as
/// normalized and scaled by 255; anything larger is taken as already being
/// in the 0-255 range. Both are rounded and clamped.
pub fn to_rgb8(pixels: FacePixels) -> Result<RgbImage, NormalizeError> {
    let (width, height, channels, bytes) = match pixels {
        FacePixels::U8 {
            width,
            height,
            channels,
            data,
        } => {
            check_shape(width, height, channels, data.len())?;
            (width, height, channels, data)
        }
        FacePixels::F32 {
            width,
            height,
            channels,
            data,
        } => {
            check_shape(width, height, channels, data.len())?;
            (width, height, channels, rescale_to_u8(&data)?)
        }
    };

    let rgb = match channels {
        3 => bytes,
        1 => bytes.iter().flat_map(|&v| [v, v, v]).collect(),
        4 => bytes
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        other => return Err(NormalizeError::UnsupportedChannels(other)),
    };

    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(NormalizeError::ShapeMismatch {
        expected: width as usize * height as usize * 3,
        actual,
    })
}

fn check_shape(width: u32, height: u32, channels: u8, len: usize) -> Result<(), NormalizeError> {
    if width == 0 || height == 0 || len == 0 {
        return Err(NormalizeError::EmptyFace);
    }
    if !matches!(channels, 1 | 3 | 4) {
        return Err(NormalizeError::UnsupportedChannels(channels));
    }
    let expected = width as usize * height as usize * channels as usize;
    if len != expected {
        return Err(NormalizeError::ShapeMismatch {
            expected,
            actual: len,
        });
    }
    Ok(())
}

fn rescale_to_u8(data: &[f32]) -> Result<Vec<u8>, NormalizeError> {
    if data.iter().any(|v| !v.is_finite()) {
        return Err(NormalizeError::NonFinite);
    }

    let max = data.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    let scale = if max <= 1.0 { 255.0 } else { 1.0 };

    Ok(data
        .iter()
        .map(|v| (v * scale).round().clamp(0.0, 255.0) as u8)
        .collect())
}

fn swap_red_blue(image: &mut RgbImage) {
    for px in image.pixels_mut() {
        px.0.swap(0, 2);
    }
}
