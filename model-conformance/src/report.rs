use crate::backend::BackendKind;
use crate::compare::OutputComparison;
use crate::matrix::RunConfiguration;
use crate::policy::Exclusion;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// `<backend>_<test name>`.
pub fn report_key(backend: BackendKind, test: &str) -> String {
  format!("{backend}_{test}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
  Success,
  ComparisonMismatch,
  /// The backend does not implement something the model needs. A skip.
  EngineUnsupported,
  EngineError,
}

impl ExecutionOutcome {
  pub fn is_failure(self) -> bool {
    matches!(
      self,
      ExecutionOutcome::ComparisonMismatch | ExecutionOutcome::EngineError
    )
  }
}

impl fmt::Display for ExecutionOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ExecutionOutcome::Success => "success",
      ExecutionOutcome::ComparisonMismatch => "comparison_mismatch",
      ExecutionOutcome::EngineUnsupported => "engine_unsupported",
      ExecutionOutcome::EngineError => "engine_error",
    })
  }
}

/// Outcome of one sample set under one configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
  pub key: String,
  pub test: String,
  pub model: PathBuf,
  pub configuration: RunConfiguration,
  pub sample: usize,
  pub outcome: ExecutionOutcome,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub comparisons: Vec<OutputComparison>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub diagnostic: Option<String>,
}

impl RunRecord {
  pub fn backend(&self) -> BackendKind {
    self.configuration.backend
  }

  /// Identity of the record within a report.
  pub fn id(&self) -> RecordId {
    RecordId {
      key: self.key.clone(),
      model: self.model.clone(),
      configuration: self.configuration.label(),
      sample: self.sample,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
  pub key: String,
  pub model: PathBuf,
  pub configuration: String,
  pub sample: usize,
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} [{}] {}#{}",
      self.key,
      self.model.display(),
      self.configuration,
      self.sample
    )
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
  Excluded(Exclusion),
  TrainingDomain,
  /// The engine cannot describe the model at all on this backend.
  Unsupported { message: String },
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::Excluded(exclusion) => write!(f, "excluded ({exclusion})"),
      SkipReason::TrainingDomain => f.write_str("uses a training-only domain"),
      SkipReason::Unsupported { message } => write!(f, "unsupported ({message})"),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedCase {
  pub key: String,
  pub test: String,
  pub model: PathBuf,
  pub reason: SkipReason,
}

/// A malformed corpus entry. The case is not run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaseError {
  pub key: String,
  pub test: String,
  pub model: PathBuf,
  pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Summary {
  pub total: usize,
  pub success: usize,
  pub comparison_mismatch: usize,
  pub engine_unsupported: usize,
  pub engine_error: usize,
  pub skipped: usize,
  pub configuration_errors: usize,
}

impl Summary {
  /// Unsupported outcomes and skipped cases never fail a run.
  pub fn is_green(&self) -> bool {
    self.comparison_mismatch == 0 && self.engine_error == 0 && self.configuration_errors == 0
  }
}

/// Named collection of everything a run produced.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
  name: String,
  records: Vec<RunRecord>,
  skipped: Vec<SkippedCase>,
  errors: Vec<CaseError>,
}

impl ResultSet {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Self::default()
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn record(&mut self, record: RunRecord) {
    self.records.push(record);
  }

  pub fn skip(&mut self, skipped: SkippedCase) {
    self.skipped.push(skipped);
  }

  pub fn configuration_error(&mut self, error: CaseError) {
    self.errors.push(error);
  }

  pub fn records(&self) -> &[RunRecord] {
    &self.records
  }

  pub fn skipped(&self) -> &[SkippedCase] {
    &self.skipped
  }

  pub fn errors(&self) -> &[CaseError] {
    &self.errors
  }

  pub fn group_by<K, F>(&self, project: F) -> BTreeMap<K, Vec<&RunRecord>>
  where
    K: Ord,
    F: Fn(&RunRecord) -> K,
  {
    let mut groups: BTreeMap<K, Vec<&RunRecord>> = BTreeMap::new();
    for record in &self.records {
      groups.entry(project(record)).or_default().push(record);
    }
    groups
  }

  pub fn group_by_key(&self) -> BTreeMap<String, Vec<&RunRecord>> {
    self.group_by(|record| record.key.clone())
  }

  pub fn failures(&self) -> impl Iterator<Item = &RunRecord> {
    self.records.iter().filter(|record| record.outcome.is_failure())
  }

  pub fn summarize(&self) -> Summary {
    let mut summary = Summary {
      total: self.records.len(),
      skipped: self.skipped.len(),
      configuration_errors: self.errors.len(),
      ..Summary::default()
    };
    for record in &self.records {
      match record.outcome {
        ExecutionOutcome::Success => summary.success += 1,
        ExecutionOutcome::ComparisonMismatch => summary.comparison_mismatch += 1,
        ExecutionOutcome::EngineUnsupported => summary.engine_unsupported += 1,
        ExecutionOutcome::EngineError => summary.engine_error += 1,
      }
    }
    summary
  }

  pub fn is_green(&self) -> bool {
    self.summarize().is_green()
  }

  /// Deterministically ordered report.
  pub fn into_report(self) -> Report {
    let summary = self.summarize();
    let ResultSet {
      name,
      mut records,
      mut skipped,
      mut errors,
    } = self;
    records.sort_by_cached_key(RunRecord::id);
    skipped.sort_by(|a, b| (&a.key, &a.model).cmp(&(&b.key, &b.model)));
    errors.sort_by(|a, b| (&a.key, &a.model).cmp(&(&b.key, &b.model)));

    Report {
      schema_version: REPORT_SCHEMA_VERSION,
      name,
      summary,
      results: records,
      skipped,
      errors,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
  pub schema_version: u32,
  pub name: String,
  pub summary: Summary,
  pub results: Vec<RunRecord>,
  #[serde(default)]
  pub skipped: Vec<SkippedCase>,
  #[serde(default)]
  pub errors: Vec<CaseError>,
}

/// Writes the report as pretty JSON to `path`, or to stdout when `None`.
pub fn write_json_report(report: &Report, path: Option<&Path>) -> Result<()> {
  let json = serde_json::to_string_pretty(report).map_err(|err| Error::Report(err.to_string()))?;
  match path {
    Some(path) => {
      if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
      }
      fs::write(path, format!("{json}\n")).map_err(|err| Error::io(path, err))
    }
    None => {
      let mut stdout = io::stdout().lock();
      writeln!(stdout, "{json}").map_err(|err| Error::io("<stdout>", err))
    }
  }
}

pub fn read_report(path: &Path) -> Result<Report> {
  let raw = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
  let report: Report = serde_json::from_str(&raw)
    .map_err(|err| Error::Report(format!("parse report JSON {}: {err}", path.display())))?;
  if report.schema_version != REPORT_SCHEMA_VERSION {
    return Err(Error::Report(format!(
      "unsupported report schema_version {} (expected {REPORT_SCHEMA_VERSION})",
      report.schema_version
    )));
  }
  Ok(report)
}

/// A record whose outcome flipped between success and failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeChange {
  pub id: RecordId,
  pub baseline: ExecutionOutcome,
  pub current: ExecutionOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportComparison {
  pub regressions: Vec<OutcomeChange>,
  pub improvements: Vec<OutcomeChange>,
  pub new_records: Vec<RecordId>,
  pub removed_records: Vec<RecordId>,
  /// Records present on both sides whose outcome did not cross the
  /// success/failure line.
  pub unchanged: usize,
}

impl ReportComparison {
  pub fn has_regressions(&self) -> bool {
    !self.regressions.is_empty()
  }
}

/// Matches records by [`RecordId`]. Moving between two failure classes, or
/// between success and unsupported, is neither a regression nor an
/// improvement.
pub fn compare_reports(baseline: &Report, current: &Report) -> Result<ReportComparison> {
  if baseline.schema_version != current.schema_version {
    return Err(Error::Report(format!(
      "cannot compare schema_version {} against {}",
      baseline.schema_version, current.schema_version
    )));
  }

  let before = index_results("baseline", &baseline.results)?;
  let mut after = index_results("current", &current.results)?;

  let mut comparison = ReportComparison::default();
  for (id, was) in before {
    let Some(now) = after.remove(&id) else {
      comparison.removed_records.push(id);
      continue;
    };
    let change = OutcomeChange {
      id,
      baseline: was,
      current: now,
    };
    match (was, now) {
      (ExecutionOutcome::Success, now) if now.is_failure() => comparison.regressions.push(change),
      (was, ExecutionOutcome::Success) if was.is_failure() => comparison.improvements.push(change),
      _ => comparison.unchanged += 1,
    }
  }
  comparison.new_records = after.into_keys().collect();

  Ok(comparison)
}

fn index_results(label: &str, results: &[RunRecord]) -> Result<BTreeMap<RecordId, ExecutionOutcome>> {
  let mut map = BTreeMap::new();
  for record in results {
    let id = record.id();
    if map.insert(id.clone(), record.outcome).is_some() {
      return Err(Error::Report(format!(
        "{label} report contains duplicate record `{id}`"
      )));
    }
  }
  Ok(map)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::matrix::{ExecutionMode, ThreadingMode};
  use crate::policy::ExclusionRule;
  use tempfile::tempdir;

  fn record(test: &str, mode: ExecutionMode, sample: usize, outcome: ExecutionOutcome) -> RunRecord {
    RunRecord {
      key: report_key(BackendKind::Cpu, test),
      test: test.to_string(),
      model: PathBuf::from(format!("opset13/test_{test}/model.onnx")),
      configuration: RunConfiguration {
        backend: BackendKind::Cpu,
        execution_mode: mode,
        threading: ThreadingMode::MultiThread,
        log_id: test.to_string(),
        options: BTreeMap::new(),
      },
      sample,
      outcome,
      comparisons: Vec::new(),
      diagnostic: None,
    }
  }

  fn report(records: Vec<RunRecord>) -> Report {
    let mut set = ResultSet::new("run");
    for record in records {
      set.record(record);
    }
    set.into_report()
  }

  #[test]
  fn unsupported_outcomes_and_skips_stay_green() {
    let mut set = ResultSet::new("cpu");
    set.record(record("abs", ExecutionMode::Sequential, 0, ExecutionOutcome::Success));
    set.record(record(
      "conv",
      ExecutionMode::Sequential,
      0,
      ExecutionOutcome::EngineUnsupported,
    ));
    set.skip(SkippedCase {
      key: report_key(BackendKind::Cpu, "add_broadcast"),
      test: "add_broadcast".to_string(),
      model: PathBuf::from("m.onnx"),
      reason: SkipReason::Excluded(Exclusion::new(ExclusionRule::Permanent, "old")),
    });

    let summary = set.summarize();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.engine_unsupported, 1);
    assert_eq!(summary.skipped, 1);
    assert!(set.is_green());

    set.configuration_error(CaseError {
      key: report_key(BackendKind::Cpu, "broken"),
      test: "broken".to_string(),
      model: PathBuf::from("b.onnx"),
      message: "no outputs".to_string(),
    });
    assert!(!set.is_green());
  }

  #[test]
  fn groups_by_key_and_projection() {
    let mut set = ResultSet::new("cpu");
    set.record(record("abs", ExecutionMode::Sequential, 0, ExecutionOutcome::Success));
    set.record(record("abs", ExecutionMode::Parallel, 0, ExecutionOutcome::ComparisonMismatch));
    set.record(record("relu", ExecutionMode::Sequential, 1, ExecutionOutcome::Success));

    let by_key = set.group_by_key();
    assert_eq!(by_key["cpu_abs"].len(), 2);
    assert_eq!(by_key["cpu_relu"].len(), 1);

    let by_mode = set.group_by(|record| record.configuration.execution_mode);
    assert_eq!(by_mode[&ExecutionMode::Sequential].len(), 2);
    assert_eq!(set.failures().count(), 1);
  }

  #[test]
  fn report_is_sorted_and_reads_back() {
    let report = report(vec![
      record("relu", ExecutionMode::Sequential, 1, ExecutionOutcome::Success),
      record("relu", ExecutionMode::Sequential, 0, ExecutionOutcome::Success),
      record("abs", ExecutionMode::Sequential, 0, ExecutionOutcome::Success),
    ]);
    let order: Vec<_> = report
      .results
      .iter()
      .map(|r| (r.test.as_str(), r.sample))
      .collect();
    assert_eq!(order, vec![("abs", 0), ("relu", 0), ("relu", 1)]);

    let temp = tempdir().unwrap();
    let path = temp.path().join("nested/report.json");
    write_json_report(&report, Some(&path)).unwrap();
    assert_eq!(read_report(&path).unwrap(), report);
  }

  #[test]
  fn compare_reports_classifies_deltas() {
    let baseline = report(vec![
      record("a", ExecutionMode::Sequential, 0, ExecutionOutcome::Success),
      record("b", ExecutionMode::Sequential, 0, ExecutionOutcome::EngineError),
      record("c", ExecutionMode::Sequential, 0, ExecutionOutcome::Success),
      record("e", ExecutionMode::Sequential, 0, ExecutionOutcome::Success),
    ]);
    let current = report(vec![
      record("a", ExecutionMode::Sequential, 0, ExecutionOutcome::ComparisonMismatch),
      record("b", ExecutionMode::Sequential, 0, ExecutionOutcome::Success),
      record("c", ExecutionMode::Sequential, 0, ExecutionOutcome::EngineUnsupported),
      record("d", ExecutionMode::Sequential, 0, ExecutionOutcome::Success),
    ]);

    let comparison = compare_reports(&baseline, &current).unwrap();
    let keys = |ids: Vec<&RecordId>| ids.into_iter().map(|id| id.key.clone()).collect::<Vec<_>>();
    assert_eq!(keys(comparison.regressions.iter().map(|c| &c.id).collect()), vec!["cpu_a"]);
    assert_eq!(keys(comparison.improvements.iter().map(|c| &c.id).collect()), vec!["cpu_b"]);
    assert_eq!(keys(comparison.new_records.iter().collect()), vec!["cpu_d"]);
    assert_eq!(keys(comparison.removed_records.iter().collect()), vec!["cpu_e"]);
    assert_eq!(comparison.unchanged, 1);
    assert!(comparison.has_regressions());
  }

  #[test]
  fn compare_reports_rejects_schema_mismatch_and_duplicates() {
    let baseline = report(vec![record("a", ExecutionMode::Sequential, 0, ExecutionOutcome::Success)]);
    let mut current = baseline.clone();
    current.schema_version += 1;
    assert!(compare_reports(&baseline, &current).is_err());

    let mut duplicated = baseline.clone();
    duplicated.results.push(duplicated.results[0].clone());
    let err = compare_reports(&duplicated, &baseline).unwrap_err();
    assert!(err.to_string().contains("duplicate"), "{err}");
  }
}
