use crate::backend::{BackendKind, BackendProfile};
use crate::case::TestCase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
  Sequential,
  Parallel,
}

impl ExecutionMode {
  pub fn as_str(self) -> &'static str {
    match self {
      ExecutionMode::Sequential => "sequential",
      ExecutionMode::Parallel => "parallel",
    }
  }
}

impl fmt::Display for ExecutionMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingMode {
  /// Sessions share the run-wide thread pools.
  MultiThread,
  /// One intra-op thread per session.
  SingleThreadIntraOp,
}

impl ThreadingMode {
  pub fn as_str(self) -> &'static str {
    match self {
      ThreadingMode::MultiThread => "multi_thread",
      ThreadingMode::SingleThreadIntraOp => "single_thread_intra_op",
    }
  }
}

impl fmt::Display for ThreadingMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One cell of the matrix. Carries everything needed to reproduce a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfiguration {
  pub backend: BackendKind,
  pub execution_mode: ExecutionMode,
  pub threading: ThreadingMode,
  /// Session log id; the test name.
  pub log_id: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub options: BTreeMap<String, String>,
}

impl RunConfiguration {
  /// `backend/execution_mode/threading`, unique within one test case.
  pub fn label(&self) -> String {
    format!("{}/{}/{}", self.backend, self.execution_mode, self.threading)
  }
}

impl fmt::Display for RunConfiguration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.label())
  }
}

pub fn build_configurations(case: &TestCase, profile: &BackendProfile) -> Vec<RunConfiguration> {
  expand(&case.name, case.is_single_node(), profile)
}

/// Threading mode is the outer loop and execution mode the inner one.
pub(crate) fn expand(
  name: &str,
  single_node: bool,
  profile: &BackendProfile,
) -> Vec<RunConfiguration> {
  let default_backend = profile.kind().is_default();

  let mut execution_modes = vec![ExecutionMode::Sequential];
  if default_backend && !single_node {
    execution_modes.push(ExecutionMode::Parallel);
  }

  let mut threading_modes = vec![ThreadingMode::MultiThread];
  if default_backend && single_node {
    threading_modes.push(ThreadingMode::SingleThreadIntraOp);
  }

  let mut configurations = Vec::with_capacity(execution_modes.len() * threading_modes.len());
  for threading in &threading_modes {
    for execution_mode in &execution_modes {
      configurations.push(RunConfiguration {
        backend: profile.kind(),
        execution_mode: *execution_mode,
        threading: *threading,
        log_id: name.to_string(),
        options: profile.options().clone(),
      });
    }
  }
  configurations
}
