//! Bridges to collaborators that only accept file paths.
//!
//! Images handed to an external tool are written to scratch files named
//! `temp_<tag>_XXXXXX.png` inside a scratch directory. The file is removed
//! when the [`ScratchImage`] is dropped, whether or not the tool succeeded.

use anyhow::{Context, Result, anyhow};
use image::RgbImage;
use log::debug;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::{Builder, NamedTempFile, TempPath};

/// Prefix shared by every scratch file this crate creates.
pub const TEMP_PREFIX: &str = "temp_";

/// An image written to a uniquely named scratch file for the lifetime of the value.
pub struct ScratchImage {
    file: NamedTempFile,
}

impl ScratchImage {
    /// Writes `image` as PNG under `dir`, e.g. `temp_frame_00012_a8Xk2p.png`.
    pub fn write(dir: &Path, tag: &str, image: &RgbImage) -> Result<Self> {
        let file = scratch_file(dir, tag, ".png")?;
        image
            .save_with_format(file.path(), image::ImageFormat::Png)
            .with_context(|| format!("Failed to write scratch image {:?}", file.path()))?;
        debug!("Wrote scratch image {:?}", file.path());
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Reserves a scratch path for a tool to write into; removed on drop.
pub fn scratch_output(dir: &Path, tag: &str, suffix: &str) -> Result<TempPath> {
    Ok(scratch_file(dir, tag, suffix)?.into_temp_path())
}

fn scratch_file(dir: &Path, tag: &str, suffix: &str) -> Result<NamedTempFile> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create scratch directory {:?}", dir))?;
    Builder::new()
        .prefix(&format!("{}{}_", TEMP_PREFIX, tag))
        .suffix(suffix)
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create scratch file in {:?}", dir))
}

/// Whether `path` names a scratch file created by this module.
pub fn is_scratch_file(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

/// An external program invoked once per image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ExternalTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Runs the tool with its fixed arguments followed by `extra`, returning stdout.
    pub fn run<I, S>(&self, extra: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to spawn {:?}", self.program))?;

        if !output.status.success() {
            return Err(anyhow!(
                "{:?} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(output.stdout)
    }
}
