use crate::discover::DiscoveredCase;
use crate::engine::ModelInfo;
use crate::tensor::{read_tensor_file, NamedTensors};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PER_SAMPLE_TOLERANCE: f64 = 1e-3;
pub const DEFAULT_RELATIVE_PER_SAMPLE_TOLERANCE: f64 = 1e-3;
pub const SAMPLE_DIR_PREFIX: &str = "test_data_set_";
const CASE_CONFIG_FILE: &str = "config.toml";
const INPUT_PREFIX: &str = "input_";
const OUTPUT_PREFIX: &str = "output_";
const TENSOR_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
  pub absolute: f64,
  pub relative: f64,
}

impl Default for Tolerance {
  fn default() -> Self {
    Self {
      absolute: DEFAULT_PER_SAMPLE_TOLERANCE,
      relative: DEFAULT_RELATIVE_PER_SAMPLE_TOLERANCE,
    }
  }
}

impl Tolerance {
  pub fn new(absolute: f64, relative: f64) -> Self {
    Self { absolute, relative }
  }

  /// `|actual - expected| <= absolute + relative * |expected|`
  pub fn allows(&self, actual: f64, expected: f64) -> bool {
    (actual - expected).abs() <= self.absolute + self.relative * expected.abs()
  }

  pub(crate) fn validate(&self) -> std::result::Result<(), String> {
    for (label, value) in [("absolute", self.absolute), ("relative", self.relative)] {
      if !value.is_finite() || value < 0.0 {
        return Err(format!("{label} tolerance must be a non-negative number, got {value}"));
      }
    }
    Ok(())
  }
}

/// Optional per-case overrides read from `config.toml` next to the model.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseConfig {
  pub per_sample_tolerance: Option<f64>,
  pub relative_per_sample_tolerance: Option<f64>,
  #[serde(default)]
  pub post_processing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
  pub index: usize,
  pub inputs: NamedTensors,
  pub expected: NamedTensors,
}

#[derive(Debug, Clone)]
pub struct TestCase {
  pub name: String,
  pub dir_name: String,
  pub model: PathBuf,
  pub info: ModelInfo,
  pub samples: Vec<SampleSet>,
  pub config: CaseConfig,
}

impl TestCase {
  /// Loads the sample sets and overrides of a discovered case. Every problem
  /// with the on-disk layout is reported as [`Error::Configuration`].
  pub fn load(discovered: &DiscoveredCase, info: ModelInfo) -> Result<Self> {
    let dir = discovered.case_dir();
    let invalid = |message: String| Error::configuration(&discovered.name, message);

    let config = read_case_config(dir).map_err(invalid)?;
    let samples = read_sample_sets(dir).map_err(invalid)?;

    Ok(Self {
      name: discovered.name.clone(),
      dir_name: discovered.dir_name.clone(),
      model: discovered.model.clone(),
      info,
      samples,
      config,
    })
  }

  pub fn is_single_node(&self) -> bool {
    self.info.is_single_node()
  }

  pub fn post_processing(&self) -> bool {
    self.config.post_processing
  }

  /// Case overrides win over `fallback`, which carries backend overrides or
  /// the defaults.
  pub fn tolerance(&self, fallback: Tolerance) -> Tolerance {
    Tolerance {
      absolute: self.config.per_sample_tolerance.unwrap_or(fallback.absolute),
      relative: self
        .config
        .relative_per_sample_tolerance
        .unwrap_or(fallback.relative),
    }
  }
}

/// Loads every `test_data_set_<k>` directory under `case_dir`, ordered by `k`.
pub fn load_sample_sets(case_dir: &Path) -> Result<Vec<SampleSet>> {
  read_sample_sets(case_dir).map_err(|message| Error::configuration(case_dir.display().to_string(), message))
}

fn read_case_config(dir: &Path) -> std::result::Result<CaseConfig, String> {
  let path = dir.join(CASE_CONFIG_FILE);
  if !path.is_file() {
    return Ok(CaseConfig::default());
  }

  let raw = fs::read_to_string(&path).map_err(|err| format!("read {}: {err}", path.display()))?;
  let config: CaseConfig =
    toml::from_str(&raw).map_err(|err| format!("parse {}: {err}", path.display()))?;

  let effective = Tolerance {
    absolute: config.per_sample_tolerance.unwrap_or(DEFAULT_PER_SAMPLE_TOLERANCE),
    relative: config
      .relative_per_sample_tolerance
      .unwrap_or(DEFAULT_RELATIVE_PER_SAMPLE_TOLERANCE),
  };
  effective
    .validate()
    .map_err(|err| format!("{}: {err}", path.display()))?;

  Ok(config)
}

fn read_sample_sets(dir: &Path) -> std::result::Result<Vec<SampleSet>, String> {
  let mut found = numbered_entries(dir, SAMPLE_DIR_PREFIX, |path, name| {
    path.is_dir() && !name.contains('.')
  })?;
  if found.is_empty() {
    return Err(format!(
      "no `{SAMPLE_DIR_PREFIX}*` directories in {}",
      dir.display()
    ));
  }
  found.sort_by_key(|(index, _)| *index);

  found
    .into_iter()
    .map(|(index, path)| read_sample_set(index, &path))
    .collect()
}

fn read_sample_set(index: usize, dir: &Path) -> std::result::Result<SampleSet, String> {
  // Graphs that only produce constants take no inputs.
  let inputs = read_tensor_group(dir, INPUT_PREFIX)?;
  let expected = read_tensor_group(dir, OUTPUT_PREFIX)?;
  if expected.is_empty() {
    return Err(format!(
      "sample set {} has no `{OUTPUT_PREFIX}*.{TENSOR_EXTENSION}` files",
      dir.display()
    ));
  }

  Ok(SampleSet {
    index,
    inputs,
    expected,
  })
}

fn read_tensor_group(dir: &Path, prefix: &str) -> std::result::Result<NamedTensors, String> {
  let mut files = numbered_entries(dir, prefix, |path, name| {
    path.is_file() && name.ends_with(&format!(".{TENSOR_EXTENSION}"))
  })?;
  files.sort_by_key(|(index, _)| *index);

  let mut tensors = NamedTensors::new();
  for (_, path) in files {
    let (name, tensor) = read_tensor_file(&path).map_err(|err| err.to_string())?;
    if tensors.insert(name.clone(), tensor).is_some() {
      return Err(format!(
        "tensor `{name}` appears twice in {}",
        dir.display()
      ));
    }
  }
  Ok(tensors)
}

/// Lists `<prefix><n>[.ext]` entries of `dir` accepted by `keep`, parsing `n`.
fn numbered_entries(
  dir: &Path,
  prefix: &str,
  keep: impl Fn(&Path, &str) -> bool,
) -> std::result::Result<Vec<(usize, PathBuf)>, String> {
  let entries = fs::read_dir(dir).map_err(|err| format!("read {}: {err}", dir.display()))?;

  let mut out = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|err| format!("read {}: {err}", dir.display()))?;
    let path = entry.path();
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
      continue;
    };
    let Some(rest) = name.strip_prefix(prefix) else {
      continue;
    };
    if !keep(&path, name) {
      continue;
    }
    let number = rest.split('.').next().unwrap_or(rest);
    let index = number
      .parse::<usize>()
      .map_err(|_| format!("`{name}` in {} has a non-numeric suffix", dir.display()))?;
    out.push((index, path));
  }
  Ok(out)
}
