//! Demographic analysis of face crops.
//!
//! Analyzer output is converted into [`Demographics`] before it reaches a
//! sidecar, so every persisted value is a plain JSON number, string or map.

use crate::bridge::{ExternalTool, ScratchImage};
use anyhow::{Context, Result, anyhow};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// A gender or race estimate: a single label or per-label scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribute {
    Label(String),
    Scores(BTreeMap<String, f64>),
}

/// Age, gender and race estimates for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub age: f64,
    pub gender: Attribute,
    pub race: Attribute,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_race: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum DemographicsError {
    #[error("analyzer result is not an object")]
    NotAnObject,

    #[error("analyzer result has no {0}")]
    Missing(&'static str),

    #[error("{field} is not a number: {value}")]
    InvalidNumber { field: String, value: String },

    #[error("{0} is not finite")]
    NonFinite(String),
}

impl Demographics {
    /// Reads one analyzer record, coercing numeric strings to numbers.
    pub fn from_value(value: &Value) -> Result<Self, DemographicsError> {
        let obj = value.as_object().ok_or(DemographicsError::NotAnObject)?;

        let age = obj.get("age").ok_or(DemographicsError::Missing("age"))?;
        let age = number("age", age)?;

        let dominant_gender = obj
            .get("dominant_gender")
            .and_then(Value::as_str)
            .map(str::to_string);
        let dominant_race = obj
            .get("dominant_race")
            .and_then(Value::as_str)
            .map(str::to_string);

        let gender = attribute("gender", obj.get("gender"), dominant_gender.as_deref())?;
        let race = attribute("race", obj.get("race"), dominant_race.as_deref())?;

        Ok(Self {
            age,
            gender,
            race,
            dominant_gender,
            dominant_race,
        })
    }
}

/// Picks the first face of an analyzer response; `None` when it found none.
pub fn first_demographics(value: &Value) -> Result<Option<Demographics>, DemographicsError> {
    match value {
        Value::Array(items) => items.first().map(Demographics::from_value).transpose(),
        Value::Null => Ok(None),
        other => Demographics::from_value(other).map(Some),
    }
}

fn number(field: &str, value: &Value) -> Result<f64, DemographicsError> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| DemographicsError::InvalidNumber {
        field: field.to_string(),
        value: value.to_string(),
    })?;

    if !n.is_finite() {
        return Err(DemographicsError::NonFinite(field.to_string()));
    }
    Ok(n)
}

fn attribute(
    field: &'static str,
    value: Option<&Value>,
    dominant: Option<&str>,
) -> Result<Attribute, DemographicsError> {
    match value {
        Some(Value::String(label)) => Ok(Attribute::Label(label.clone())),
        Some(Value::Object(scores)) => scores
            .iter()
            .map(|(label, score)| {
                number(&format!("{}.{}", field, label), score).map(|n| (label.clone(), n))
            })
            .collect::<Result<BTreeMap<String, f64>, DemographicsError>>()
            .map(Attribute::Scores),
        _ => dominant
            .map(|d| Attribute::Label(d.to_string()))
            .ok_or(DemographicsError::Missing(field)),
    }
}

/// Trait for demographic analysis backends.
pub trait DemographicsAnalyzer {
    fn name(&self) -> &str;

    /// Estimates demographics for the face; `Ok(None)` when the model sees no face.
    fn analyze(&mut self, face: &RgbImage) -> Result<Option<Demographics>>;
}

/// Analyzer that runs an external model program on a scratch copy of the face.
///
/// The program gets the image path as its last argument and prints either a
/// JSON object or an array of objects with `age`, `gender`, `race` and
/// optionally `dominant_gender` / `dominant_race`.
pub struct CommandAnalyzer {
    tool: ExternalTool,
    scratch_dir: PathBuf,
}

impl CommandAnalyzer {
    pub fn new(tool: ExternalTool, scratch_dir: PathBuf) -> Self {
        Self { tool, scratch_dir }
    }
}

impl DemographicsAnalyzer for CommandAnalyzer {
    fn name(&self) -> &str {
        "command"
    }

    fn analyze(&mut self, face: &RgbImage) -> Result<Option<Demographics>> {
        let scratch = ScratchImage::write(&self.scratch_dir, "face", face)?;
        let stdout = self.tool.run([scratch.path()])?;
        let value: Value =
            serde_json::from_slice(&stdout).context("Analyzer printed invalid JSON")?;
        Ok(first_demographics(&value)?)
    }
}

pub fn create_analyzer(
    program: Option<ExternalTool>,
    scratch_dir: PathBuf,
) -> Result<Box<dyn DemographicsAnalyzer>> {
    let tool = program.ok_or_else(|| anyhow!("Demographic analysis needs an analyzer program"))?;
    Ok(Box::new(CommandAnalyzer::new(tool, scratch_dir)))
}
