//! A stand-in engine that replays the recorded outputs of a case.
//!
//! The model file is a JSON [`ModelInfo`] document. Two extra keys let a
//! corpus script engine behavior: `unsupported` (a reason) makes loading fail
//! as not implemented, restricted to `unsupported_backends` when that list is
//! non-empty.

use crate::backend::BackendKind;
use crate::case::{load_sample_sets, SampleSet};
use crate::engine::{Engine, EngineError, EngineResult, ModelInfo, Session};
use crate::matrix::RunConfiguration;
use crate::tensor::NamedTensors;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ReplayModel {
  #[serde(flatten)]
  info: ModelInfo,
  #[serde(default)]
  unsupported: Option<String>,
  #[serde(default)]
  unsupported_backends: Vec<BackendKind>,
}

impl ReplayModel {
  fn read(path: &Path) -> EngineResult<Self> {
    let raw = fs::read_to_string(path)
      .map_err(|err| EngineError::other(format!("read {}: {err}", path.display())))?;
    serde_json::from_str(&raw)
      .map_err(|err| EngineError::other(format!("parse {}: {err}", path.display())))
  }

  fn unsupported_on(&self, backend: BackendKind) -> Option<&str> {
    let reason = self.unsupported.as_deref()?;
    (self.unsupported_backends.is_empty() || self.unsupported_backends.contains(&backend))
      .then_some(reason)
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayEngine;

impl ReplayEngine {
  pub fn new() -> Self {
    Self
  }
}

impl Engine for ReplayEngine {
  fn describe_model(&self, model: &Path) -> EngineResult<ModelInfo> {
    ReplayModel::read(model).map(|replay| replay.info)
  }

  fn load_model(&self, model: &Path, config: &RunConfiguration) -> EngineResult<Box<dyn Session>> {
    let replay = ReplayModel::read(model)?;
    if let Some(reason) = replay.unsupported_on(config.backend) {
      return Err(EngineError::unsupported(reason));
    }

    let dir = model.parent().unwrap_or_else(|| Path::new(""));
    let samples = load_sample_sets(dir).map_err(|err| EngineError::other(err.to_string()))?;
    Ok(Box::new(ReplaySession { samples }))
  }
}

struct ReplaySession {
  samples: Vec<SampleSet>,
}

impl Session for ReplaySession {
  fn run(&self, inputs: &NamedTensors) -> EngineResult<NamedTensors> {
    self
      .samples
      .iter()
      .find(|sample| sample.inputs == *inputs)
      .map(|sample| sample.expected.clone())
      .ok_or_else(|| EngineError::other("no recorded sample set has these inputs"))
  }
}

/// The engine used when no other is linked in.
pub fn default_engine() -> Box<dyn Engine> {
  Box::new(ReplayEngine::new())
}
