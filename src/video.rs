//! Video frame sources.
//!
//! Decoding is delegated to the `ffmpeg` command line tool, which streams
//! packed RGB24 frames on stdout; `ffprobe` supplies the stream metadata.
//! Tests and embedders can feed already-decoded frames through
//! [`MemorySource`].

use crate::bridge::ExternalTool;
use crate::error::{ExtractError, ExtractResult};
use image::RgbImage;
use log::{debug, warn};
use serde::Deserialize;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One decoded frame and its 0-based position in the stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub image: RgbImage,
}

/// Stream properties reported when a video is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub path: PathBuf,
    /// Frame count as reported by the container, when it reports one.
    pub total_frames: Option<u64>,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// A sequence of frames read front to back.
///
/// Implementations release their decoder in `close`, which must be safe to
/// call more than once; dropping a source closes it as well.
pub trait FrameSource {
    fn metadata(&self) -> &VideoMetadata;

    /// Next frame, or `None` at end of stream.
    fn read_next(&mut self) -> ExtractResult<Option<Frame>>;

    fn close(&mut self);
}

/// Opens the video at `path` with the ffmpeg-backed source.
pub fn open_video(path: &Path) -> ExtractResult<Box<dyn FrameSource>> {
    Ok(Box::new(FfmpegSource::open(path)?))
}

/// The programs used to probe and decode videos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderTools {
    pub ffprobe: ExternalTool,
    pub ffmpeg: ExternalTool,
}

impl Default for DecoderTools {
    fn default() -> Self {
        Self {
            ffprobe: ExternalTool::new("ffprobe"),
            ffmpeg: ExternalTool::new("ffmpeg"),
        }
    }
}

/// Frame source backed by an `ffmpeg` child process.
///
/// End of stream is only reported once ffmpeg has exited successfully; a
/// failed or truncated decode surfaces as [`ExtractError::Decode`] with
/// ffmpeg's stderr.
pub struct FfmpegSource {
    metadata: VideoMetadata,
    child: Option<Child>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<File>,
    next_index: usize,
}

impl FfmpegSource {
    pub fn open(path: &Path) -> ExtractResult<Self> {
        Self::open_with(path, &DecoderTools::default())
    }

    pub fn open_with(path: &Path, tools: &DecoderTools) -> ExtractResult<Self> {
        if !path.is_file() {
            return Err(ExtractError::SourceOpen {
                path: path.to_path_buf(),
                reason: "file does not exist".to_string(),
            });
        }

        let metadata = probe(&tools.ffprobe, path)?;
        if metadata.width == 0 || metadata.height == 0 {
            return Err(ExtractError::SourceOpen {
                path: path.to_path_buf(),
                reason: "video stream reports zero resolution".to_string(),
            });
        }

        let open_err = |reason: String| ExtractError::SourceOpen {
            path: path.to_path_buf(),
            reason,
        };
        // stderr is spooled to a file and read back only when decoding fails.
        let stderr = tempfile::tempfile()
            .map_err(|e| open_err(format!("failed to create stderr spool: {}", e)))?;
        let stderr_sink = stderr
            .try_clone()
            .map_err(|e| open_err(format!("failed to create stderr spool: {}", e)))?;

        let mut child = Command::new(&tools.ffmpeg.program)
            .args(&tools.ffmpeg.args)
            .args(decode_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr_sink))
            .spawn()
            .map_err(|e| open_err(format!("failed to spawn ffmpeg: {}", e)))?;

        let stdout = child.stdout.take().map(BufReader::new);
        if stdout.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(open_err("ffmpeg stdout unavailable".to_string()));
        }

        debug!("Started ffmpeg decoder for {:?}", path);

        Ok(Self {
            metadata,
            child: Some(child),
            stdout,
            stderr: Some(stderr),
            next_index: 0,
        })
    }

    fn frame_len(&self) -> usize {
        rgb24_frame_len(self.metadata.width, self.metadata.height)
    }

    fn decode_error(&self, reason: String) -> ExtractError {
        ExtractError::Decode {
            path: self.metadata.path.clone(),
            frame: self.next_index,
            reason,
        }
    }

    /// Waits for ffmpeg after its output ran dry and checks how it exited.
    fn finish(&mut self) -> ExtractResult<()> {
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|e| self.decode_error(format!("failed to wait for ffmpeg: {}", e)))?;
        if status.success() {
            debug!("ffmpeg finished decoding {:?}", self.metadata.path);
            return Ok(());
        }

        let stderr = self.stderr_text();
        Err(self.decode_error(if stderr.is_empty() {
            format!("ffmpeg exited with {}", status)
        } else {
            format!("ffmpeg exited with {}: {}", status, stderr)
        }))
    }

    fn stderr_text(&mut self) -> String {
        let Some(file) = self.stderr.as_mut() else {
            return String::new();
        };
        let mut bytes = Vec::new();
        if let Err(err) = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut bytes))
        {
            warn!("Could not read ffmpeg stderr: {}", err);
        }
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

/// ffmpeg arguments streaming `path` as packed RGB24 on stdout.
///
/// Autorotation is disabled so frames keep the coded size that ffprobe reports.
fn decode_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        "-noautorotate",
        "-i",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(path.as_os_str().to_os_string());
    args.extend(
        ["-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
            .into_iter()
            .map(OsString::from),
    );
    args
}

impl FrameSource for FfmpegSource {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn read_next(&mut self) -> ExtractResult<Option<Frame>> {
        let len = self.frame_len();
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; len];
        let filled = read_full(stdout, &mut buf)
            .map_err(|e| self.decode_error(e.to_string()))?;

        if filled < len {
            // Output ran dry: only a clean ffmpeg exit counts as end of stream.
            self.finish()?;
            if filled == 0 {
                return Ok(None);
            }
            return Err(self.decode_error(format!(
                "truncated frame: {} of {} bytes",
                filled, len
            )));
        }

        let image = RgbImage::from_raw(self.metadata.width, self.metadata.height, buf)
            .ok_or_else(|| self.decode_error("frame buffer does not match resolution".to_string()))?;

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame { index, image }))
    }

    fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Ok(None) | Err(_) = child.try_wait() {
                // Stopped before end of stream.
                let _ = child.kill();
            }
            let _ = child.wait();
            debug!("Released decoder for {:?}", self.metadata.path);
        }
        self.stderr = None;
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Frame source over frames that are already decoded.
pub struct MemorySource {
    metadata: VideoMetadata,
    frames: std::vec::IntoIter<RgbImage>,
    next_index: usize,
    released: Arc<AtomicBool>,
}

impl MemorySource {
    pub fn new(name: impl Into<PathBuf>, frames: Vec<RgbImage>, fps: f64) -> Self {
        let (width, height) = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
        Self {
            metadata: VideoMetadata {
                path: name.into(),
                total_frames: Some(frames.len() as u64),
                fps,
                width,
                height,
            },
            frames: frames.into_iter(),
            next_index: 0,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that flips to `true` once the source has been closed.
    pub fn release_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

impl FrameSource for MemorySource {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn read_next(&mut self) -> ExtractResult<Option<Frame>> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.frames.next().map(|image| {
            let index = self.next_index;
            self.next_index += 1;
            Frame { index, image }
        }))
    }

    fn close(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn probe(ffprobe: &ExternalTool, path: &Path) -> ExtractResult<VideoMetadata> {
    let output = Command::new(&ffprobe.program)
        .args(&ffprobe.args)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames:format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ExtractError::SourceOpen {
            path: path.to_path_buf(),
            reason: format!("failed to run ffprobe: {}", e),
        })?;

    if !output.status.success() {
        return Err(ExtractError::SourceOpen {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe(path, &output.stdout)
}

/// Builds metadata from ffprobe's JSON output.
fn parse_probe(path: &Path, json: &[u8]) -> ExtractResult<VideoMetadata> {
    let open_err = |reason: String| ExtractError::SourceOpen {
        path: path.to_path_buf(),
        reason,
    };

    let probe: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| open_err(format!("bad ffprobe output: {}", e)))?;
    let stream = probe
        .streams
        .first()
        .ok_or_else(|| open_err("no video stream found".to_string()))?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());

    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| match duration {
            Some(d) if fps > 0.0 => Some((d * fps).round() as u64),
            _ => None,
        });

    Ok(VideoMetadata {
        path: path.to_path_buf(),
        total_frames,
        fps,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
    })
}

/// Parses a rate like "30000/1001" or "25".
fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.parse().ok()?,
    };
    (rate > 0.0).then_some(rate)
}

fn rgb24_frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffprobe_json() {
        let json = br#"{
            "programs": [],
            "streams": [{
                "width": 320, "height": 240,
                "r_frame_rate": "30/1", "avg_frame_rate": "30000/1001",
                "nb_frames": "900"
            }],
            "format": {"duration": "30.030000"}
        }"#;
        let meta = parse_probe(Path::new("v.mp4"), json).unwrap();
        assert_eq!((meta.width, meta.height), (320, 240));
        assert_eq!(meta.total_frames, Some(900));
        assert!((meta.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn estimates_frame_count_from_duration() {
        let json = br#"{"streams": [{"width": 64, "height": 48, "avg_frame_rate": "0/0", "r_frame_rate": "25/1"}],
                        "format": {"duration": "4.0"}}"#;
        let meta = parse_probe(Path::new("v.avi"), json).unwrap();
        assert_eq!(meta.fps, 25.0);
        assert_eq!(meta.total_frames, Some(100));
    }

    #[test]
    fn missing_stream_is_an_open_error() {
        let err = parse_probe(Path::new("audio.mp4"), br#"{"streams": []}"#).unwrap_err();
        assert!(matches!(err, ExtractError::SourceOpen { .. }));
    }

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn read_full_reports_partial_frames() {
        let data = vec![7u8; 10];
        let mut buf = vec![0u8; 12];
        let n = read_full(&mut data.as_slice(), &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(rgb24_frame_len(2, 2), 12);
    }

    #[test]
    fn decoder_keeps_coded_orientation() {
        let args = decode_args(Path::new("clip.mp4"));
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert!(pos("-noautorotate") < pos("-i"));
        assert_eq!(args[pos("-i") + 1], "clip.mp4");
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = FfmpegSource::open(Path::new("/definitely/not/here.mp4"))
            .err()
            .unwrap();
        assert!(matches!(err, ExtractError::SourceOpen { .. }));
    }

    #[test]
    fn memory_source_yields_indexed_frames_and_releases() {
        let frames = vec![RgbImage::new(4, 2); 3];
        let mut source = MemorySource::new("mem", frames, 30.0);
        let released = source.release_flag();
        assert_eq!(source.metadata().total_frames, Some(3));

        let first = source.read_next().unwrap().unwrap();
        let second = source.read_next().unwrap().unwrap();
        assert_eq!((first.index, second.index), (0, 1));

        drop(source);
        assert!(released.load(Ordering::SeqCst));
    }
}
