//! The boundary to the engine under test.
//!
//! The runner never computes results itself: it asks an [`Engine`] to
//! describe and load models, then drives the returned [`Session`]. Dropping a
//! session releases the model handle.

use crate::matrix::RunConfiguration;
use crate::tensor::{ElementType, NamedTensors};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Operator domains that only training pipelines consume.
pub const TRAINING_DOMAINS: &[&str] = &["ai.onnx.training", "ai.onnx.preview.training"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
  /// The backend does not implement something the model needs.
  Unsupported,
  Other,
}

impl fmt::Display for EngineErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      EngineErrorKind::Unsupported => "not implemented",
      EngineErrorKind::Other => "engine failure",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
  pub kind: EngineErrorKind,
  pub message: String,
}

impl EngineError {
  pub fn unsupported(message: impl Into<String>) -> Self {
    Self {
      kind: EngineErrorKind::Unsupported,
      message: message.into(),
    }
  }

  pub fn other(message: impl Into<String>) -> Self {
    Self {
      kind: EngineErrorKind::Other,
      message: message.into(),
    }
  }

  pub fn is_unsupported(&self) -> bool {
    self.kind == EngineErrorKind::Unsupported
  }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// The opset a model nominally targets.
///
/// `Unknown` matches every opset-conditioned exclusion: a model whose version
/// cannot be read cannot be proven to sit outside a broken range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpsetVersion {
  Known(u32),
  Unknown,
}

impl From<Option<u32>> for OpsetVersion {
  fn from(value: Option<u32>) -> Self {
    value.map_or(OpsetVersion::Unknown, OpsetVersion::Known)
  }
}

impl fmt::Display for OpsetVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OpsetVersion::Known(version) => write!(f, "{version}"),
      OpsetVersion::Unknown => f.write_str("unknown"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
  Fixed(usize),
  Symbolic(String),
}

/// Declared metadata of a graph output, independent of any expected tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub elem_type: Option<ElementType>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub shape: Option<Vec<Dim>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
  #[serde(default)]
  pub opset: Option<u32>,
  #[serde(default)]
  pub domains: BTreeSet<String>,
  /// Set when the model consists of a single operator node.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node_name: Option<String>,
  #[serde(default)]
  pub outputs: Vec<ValueInfo>,
}

impl ModelInfo {
  pub fn nominal_opset(&self) -> OpsetVersion {
    self.opset.into()
  }

  pub fn is_single_node(&self) -> bool {
    self.node_name.as_deref().is_some_and(|name| !name.is_empty())
  }

  pub fn has_training_domain(&self) -> bool {
    TRAINING_DOMAINS
      .iter()
      .any(|domain| self.domains.contains(*domain))
  }

  pub fn output_info(&self, name: &str) -> Option<&ValueInfo> {
    self.outputs.iter().find(|info| info.name == name)
  }
}

pub trait Engine: Send + Sync {
  /// Reads model metadata without creating a session.
  fn describe_model(&self, model: &Path) -> EngineResult<ModelInfo>;

  /// Creates a session for `model` under `config`. The session is dropped,
  /// releasing the model, once every sample set of the configuration ran.
  fn load_model(&self, model: &Path, config: &RunConfiguration) -> EngineResult<Box<dyn Session>>;
}

/// A loaded model. Sessions are shared by the concurrent sample-set tasks of
/// one configuration and by nothing else.
pub trait Session: Send + Sync {
  fn run(&self, inputs: &NamedTensors) -> EngineResult<NamedTensors>;
}
