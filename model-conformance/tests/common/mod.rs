#![allow(dead_code)]

use model_conformance::{
  write_tensor_file, BackendKind, BackendRegistry, CorpusRoots, ElementType, Engine, EngineError, EngineResult,
  ModelInfo, NamedTensors, Policy, ProfileSettings, ReplayEngine, RunConfiguration, RunnerOptions,
  Session, Tensor, TensorData,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn scalar(value: f64) -> Tensor {
  Tensor::new(ElementType::Float32, vec![1], TensorData::Float(vec![value])).unwrap()
}

/// Writes `<root>/opset<opset>/<dir_name>` with a JSON model document and one
/// sample set per `(input, expected)` pair. Returns the model path.
pub fn write_case(
  root: &Path,
  opset: u32,
  dir_name: &str,
  model: Value,
  samples: &[(f64, f64)],
) -> PathBuf {
  let dir = root.join(format!("opset{opset}")).join(dir_name);
  fs::create_dir_all(&dir).unwrap();
  let model_path = dir.join("model.onnx");
  fs::write(&model_path, model.to_string()).unwrap();

  for (k, (input, expected)) in samples.iter().enumerate() {
    let set = dir.join(format!("test_data_set_{k}"));
    fs::create_dir_all(&set).unwrap();
    write_tensor_file(&set.join("input_0.json"), "x", &scalar(*input)).unwrap();
    write_tensor_file(&set.join("output_0.json"), "y", &scalar(*expected)).unwrap();
  }
  model_path
}

pub fn single_node(opset: u32) -> Value {
  serde_json::json!({"opset": opset, "node_name": "n0"})
}

pub fn whole_model(opset: u32) -> Value {
  serde_json::json!({"opset": opset})
}

pub fn options(node_root: &Path) -> RunnerOptions {
  RunnerOptions {
    name: "test-run".to_string(),
    roots: CorpusRoots {
      node: vec![node_root.to_path_buf()],
      model: Vec::new(),
    },
    jobs: 2,
    ..RunnerOptions::default()
  }
}

pub fn registry(policy: &str, kinds: &[BackendKind]) -> BackendRegistry {
  let policy = Policy::from_str(policy).unwrap();
  BackendRegistry::build(&policy, kinds, &ProfileSettings::default()).unwrap()
}

/// Replays recorded outputs, shifted by a per-test offset, and records every
/// call the runner makes.
#[derive(Default)]
pub struct ScriptedEngine {
  inner: ReplayEngine,
  offsets: BTreeMap<String, f64>,
  load_failures: BTreeMap<String, EngineError>,
  pub described: Mutex<Vec<PathBuf>>,
  pub loaded: Mutex<Vec<String>>,
}

impl ScriptedEngine {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every output of `test` is off by `offset`.
  pub fn with_offset(mut self, test: &str, offset: f64) -> Self {
    self.offsets.insert(test.to_string(), offset);
    self
  }

  /// Loading fails with `err` for the configuration labelled `label`.
  pub fn failing_load(mut self, label: &str, err: EngineError) -> Self {
    self.load_failures.insert(label.to_string(), err);
    self
  }

  pub fn loaded_labels(&self) -> Vec<String> {
    self.loaded.lock().unwrap().clone()
  }

  pub fn described_names(&self) -> Vec<String> {
    self
      .described
      .lock()
      .unwrap()
      .iter()
      .map(|path| {
        path
          .parent()
          .and_then(|dir| dir.file_name())
          .and_then(|name| name.to_str())
          .unwrap_or_default()
          .to_string()
      })
      .collect()
  }
}

impl Engine for ScriptedEngine {
  fn describe_model(&self, model: &Path) -> EngineResult<ModelInfo> {
    self.described.lock().unwrap().push(model.to_path_buf());
    self.inner.describe_model(model)
  }

  fn load_model(&self, model: &Path, config: &RunConfiguration) -> EngineResult<Box<dyn Session>> {
    self
      .loaded
      .lock()
      .unwrap()
      .push(format!("{}:{}", config.log_id, config.label()));
    if let Some(err) = self.load_failures.get(&config.label()) {
      return Err(err.clone());
    }
    let session = self.inner.load_model(model, config)?;
    Ok(match self.offsets.get(&config.log_id) {
      Some(offset) => Box::new(Offset {
        inner: session,
        offset: *offset,
      }),
      None => session,
    })
  }
}

struct Offset {
  inner: Box<dyn Session>,
  offset: f64,
}

impl Session for Offset {
  fn run(&self, inputs: &NamedTensors) -> EngineResult<NamedTensors> {
    let mut outputs = self.inner.run(inputs)?;
    for tensor in outputs.values_mut() {
      if let TensorData::Float(values) = &mut tensor.data {
        values.iter_mut().for_each(|value| *value += self.offset);
      }
    }
    Ok(outputs)
  }
}
