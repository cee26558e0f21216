//! Conformance runner for numerical model-execution engines.
//!
//! The runner discovers test corpora on disk, filters them through a
//! per-backend exclusion policy, expands each surviving case into a matrix of
//! run configurations, executes every configuration against an [`Engine`] and
//! verifies the produced tensors against the recorded expectations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub mod backend;
pub mod case;
pub mod compare;
pub mod discover;
pub mod engine;
pub mod matrix;
pub mod policy;
#[cfg(feature = "replay_engine")]
pub mod replay;
pub mod report;
pub mod runner;
pub mod tensor;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("{}: {}", .path.display(), .source)]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("invalid policy: {0}")]
  Policy(String),
  #[error("invalid test case {case}: {message}")]
  Configuration { case: String, message: String },
  #[error("invalid tensor file {}: {}", .path.display(), .message)]
  Tensor { path: PathBuf, message: String },
  #[error("invalid filter '{0}'")]
  InvalidFilter(String),
  #[error("report: {0}")]
  Report(String),
  #[error("create worker pool: {0}")]
  Pool(String),
}

impl Error {
  pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
    Error::Io {
      path: path.into(),
      source,
    }
  }

  pub(crate) fn configuration(case: impl Into<String>, message: impl Into<String>) -> Self {
    Error::Configuration {
      case: case.into(),
      message: message.into(),
    }
  }
}

pub use backend::{BackendEnv, BackendKind, BackendProfile, BackendRegistry, ProfileSettings, DEVICE_ID_ENV};
pub use case::{load_sample_sets, CaseConfig, SampleSet, TestCase, Tolerance};
pub use compare::{compare, compare_outputs, verify_value_info, ComparisonResult, OutputComparison, PostProcess, Verdict};
pub use discover::{build_filter, canonical_test_name, Corpus, CorpusRoots, DiscoveredCase, Filter};
pub use engine::{Dim, Engine, EngineError, EngineErrorKind, EngineResult, ModelInfo, OpsetVersion, Session, ValueInfo};
pub use matrix::{build_configurations, ExecutionMode, RunConfiguration, ThreadingMode};
pub use policy::{BrokenTest, Exclusion, ExclusionRule, Policy};
#[cfg(feature = "replay_engine")]
pub use replay::{default_engine, ReplayEngine};
pub use report::{
  compare_reports, read_report, report_key, write_json_report, CaseError, ExecutionOutcome, RecordId, Report,
  ReportComparison, ResultSet, RunRecord, SkipReason, SkippedCase, Summary, REPORT_SCHEMA_VERSION,
};
pub use runner::{
  plan_cases, run_conformance, run_configuration, CasePlan, CaseSettings, PlannedCase, RunnerOptions, SampleOutcome,
};
pub use tensor::{read_tensor_file, write_tensor_file, ElementType, NamedTensors, Tensor, TensorData};
