#![cfg(feature = "replay_engine")]

mod common;

use common::{options, registry, single_node, whole_model, write_case, ScriptedEngine};
use model_conformance::{
  build_filter, plan_cases, run_conformance, BackendKind, CasePlan, EngineError, ExclusionRule,
  ExecutionMode, ExecutionOutcome, ReplayEngine, SkipReason, ThreadingMode,
};
use serde_json::json;
use std::fs;
use tempfile::tempdir;

const POLICY: &str = r#"
permanent = ["test_add_broadcast"]
parallel = ["resnet50"]

[[broken]]
name = "resize"
reason = "expected data regenerated"
opsets = [11]

[backends.cpu]
opsets = [11, 13]

[backends.cuda]
opsets = [13]
"#;

#[test]
fn permanently_excluded_case_is_never_described_or_run() {
  let temp = tempdir().unwrap();
  write_case(temp.path(), 13, "test_add_broadcast", single_node(13), &[(1.0, 1.0)]);

  let engine = ScriptedEngine::new();
  let registry = registry(POLICY, &[BackendKind::Cpu, BackendKind::Cuda]);
  let results = run_conformance(&engine, &registry, &options(temp.path())).unwrap();

  assert!(results.records().is_empty());
  let keys: Vec<_> = results.skipped().iter().map(|s| s.key.as_str()).collect();
  assert_eq!(keys, vec!["cpu_add_broadcast", "cuda_add_broadcast"]);
  for skipped in results.skipped() {
    let SkipReason::Excluded(exclusion) = &skipped.reason else {
      panic!("unexpected skip reason {:?}", skipped.reason);
    };
    assert_eq!(exclusion.rule, ExclusionRule::Permanent);
  }
  assert!(engine.described.lock().unwrap().is_empty());
  assert!(engine.loaded.lock().unwrap().is_empty());
  assert!(results.is_green());
}

#[test]
fn single_node_case_on_cpu_runs_two_configurations() {
  let temp = tempdir().unwrap();
  write_case(temp.path(), 13, "test_abs", single_node(13), &[(-2.0, 2.0)]);

  let engine = ScriptedEngine::new();
  let registry = registry(POLICY, &[BackendKind::Cpu]);
  let results = run_conformance(&engine, &registry, &options(temp.path())).unwrap();

  let cells: Vec<_> = results
    .records()
    .iter()
    .map(|r| (r.configuration.execution_mode, r.configuration.threading, r.outcome))
    .collect();
  assert_eq!(
    cells,
    vec![
      (ExecutionMode::Sequential, ThreadingMode::MultiThread, ExecutionOutcome::Success),
      (
        ExecutionMode::Sequential,
        ThreadingMode::SingleThreadIntraOp,
        ExecutionOutcome::Success
      ),
    ]
  );
  assert_eq!(results.records()[0].key, "cpu_abs");
  assert!(results.is_green());
}

#[test]
fn unsupported_configuration_is_recorded_but_stays_green() {
  let temp = tempdir().unwrap();
  write_case(
    temp.path(),
    13,
    "test_conv3d",
    json!({"opset": 13, "unsupported": "3-D convolution", "unsupported_backends": ["cuda"]}),
    &[(1.0, 1.0), (2.0, 2.0)],
  );

  let engine = ScriptedEngine::new();
  let registry = registry(POLICY, &[BackendKind::Cuda]);
  let results = run_conformance(&engine, &registry, &options(temp.path())).unwrap();

  assert_eq!(results.records().len(), 2);
  for record in results.records() {
    assert_eq!(record.outcome, ExecutionOutcome::EngineUnsupported);
    assert!(record.comparisons.is_empty());
  }
  let summary = results.summarize();
  assert_eq!(summary.engine_unsupported, 2);
  assert!(summary.is_green());
}

#[test]
fn failing_configuration_leaves_its_sibling_untouched() {
  let temp = tempdir().unwrap();
  write_case(temp.path(), 13, "test_abs", single_node(13), &[(1.0, 1.0), (2.0, 2.0)]);
  let registry = registry(POLICY, &[BackendKind::Cpu]);

  for (err, outcome, green) in [
    (EngineError::other("device lost"), ExecutionOutcome::EngineError, false),
    (EngineError::unsupported("intra-op pinning"), ExecutionOutcome::EngineUnsupported, true),
  ] {
    let engine = ScriptedEngine::new().failing_load("cpu/sequential/single_thread_intra_op", err);
    let results = run_conformance(&engine, &registry, &options(temp.path())).unwrap();

    assert_eq!(
      engine.loaded_labels(),
      vec![
        "abs:cpu/sequential/multi_thread".to_string(),
        "abs:cpu/sequential/single_thread_intra_op".to_string(),
      ]
    );
    let by_threading = results.group_by(|r| r.configuration.threading);
    let outcomes = |mode: ThreadingMode| -> Vec<_> {
      by_threading[&mode].iter().map(|r| (r.sample, r.outcome)).collect()
    };
    assert_eq!(
      outcomes(ThreadingMode::MultiThread),
      vec![(0, ExecutionOutcome::Success), (1, ExecutionOutcome::Success)]
    );
    assert_eq!(
      outcomes(ThreadingMode::SingleThreadIntraOp),
      vec![(0, outcome), (1, outcome)]
    );
    assert_eq!(results.is_green(), green);
  }
}

#[test]
fn value_mismatch_fails_the_run_with_a_reproducible_record() {
  let temp = tempdir().unwrap();
  write_case(temp.path(), 13, "test_relu", single_node(13), &[(1.0, 1.0)]);

  let engine = ScriptedEngine::new().with_offset("relu", 0.5);
  let registry = registry(POLICY, &[BackendKind::Cuda]);
  let results = run_conformance(&engine, &registry, &options(temp.path())).unwrap();

  let failures: Vec<_> = results.failures().collect();
  assert_eq!(failures.len(), 1);
  let failure = failures[0];
  assert_eq!(failure.key, "cuda_relu");
  assert_eq!(failure.outcome, ExecutionOutcome::ComparisonMismatch);
  assert_eq!(failure.configuration.backend, BackendKind::Cuda);
  assert_eq!(failure.sample, 0);
  assert!(failure.model.ends_with("opset13/test_relu/model.onnx"));
  let diagnostic = failure.diagnostic.as_deref().unwrap();
  assert!(diagnostic.starts_with("output `y`: value_mismatch"), "{diagnostic}");
  assert!(!results.is_green());
}

#[test]
fn training_domain_and_broken_entries_are_skipped_after_describe() {
  let temp = tempdir().unwrap();
  write_case(
    temp.path(),
    13,
    "test_adagrad",
    json!({"opset": 13, "domains": ["ai.onnx.preview.training"], "node_name": "n0"}),
    &[(1.0, 1.0)],
  );
  write_case(temp.path(), 11, "test_resize", single_node(11), &[(1.0, 1.0)]);
  write_case(temp.path(), 13, "test_resize", single_node(13), &[(1.0, 1.0)]);

  let engine = ScriptedEngine::new();
  let registry = registry(POLICY, &[BackendKind::Cpu]);
  let results = run_conformance(&engine, &registry, &options(temp.path())).unwrap();

  let reasons: Vec<_> = results
    .skipped()
    .iter()
    .map(|s| (s.test.as_str(), s.reason.clone()))
    .collect();
  assert_eq!(reasons.len(), 2);
  assert!(reasons.contains(&("adagrad", SkipReason::TrainingDomain)));
  assert!(reasons
    .iter()
    .any(|(test, reason)| *test == "resize"
      && matches!(reason, SkipReason::Excluded(e) if e.rule == ExclusionRule::Broken)));

  let ran: Vec<_> = results
    .records()
    .iter()
    .map(|r| r.model.parent().unwrap().parent().unwrap().file_name().unwrap().to_owned())
    .collect();
  assert!(!ran.is_empty());
  assert!(ran.iter().all(|opset| opset == "opset13"));
  assert!(engine.described_names().contains(&"test_adagrad".to_string()));
}

#[test]
fn malformed_case_is_a_configuration_error() {
  let temp = tempdir().unwrap();
  let model = write_case(temp.path(), 13, "test_sigmoid", single_node(13), &[(1.0, 1.0)]);
  fs::remove_file(model.parent().unwrap().join("test_data_set_0/output_0.json")).unwrap();

  let engine = ScriptedEngine::new();
  let registry = registry(POLICY, &[BackendKind::Cpu]);
  let results = run_conformance(&engine, &registry, &options(temp.path())).unwrap();

  assert!(results.records().is_empty());
  assert_eq!(results.errors().len(), 1);
  assert_eq!(results.errors()[0].key, "cpu_sigmoid");
  assert!(engine.loaded.lock().unwrap().is_empty());
  assert!(!results.is_green());
}

#[test]
fn parallel_eligible_case_attributes_every_sample_set() {
  let temp = tempdir().unwrap();
  let samples: Vec<_> = (0..6).map(|k| (k as f64, k as f64 * 2.0)).collect();
  write_case(temp.path(), 13, "test_resnet50", whole_model(13), &samples);

  let engine = ReplayEngine::new();
  let registry = registry(POLICY, &[BackendKind::Cpu]);
  let mut opts = options(temp.path());
  opts.repeat = 2;
  let results = run_conformance(&engine, &registry, &opts).unwrap();

  let by_mode = results.group_by(|r| r.configuration.execution_mode);
  for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
    let samples: Vec<_> = by_mode[&mode].iter().map(|r| r.sample).collect();
    assert_eq!(samples, vec![0, 1, 2, 3, 4, 5]);
  }
  assert!(results.is_green());
  assert_eq!(results.summarize().success, 12);
}

#[test]
fn filter_applies_to_report_keys_and_planning_is_lazy() {
  let temp = tempdir().unwrap();
  write_case(temp.path(), 13, "test_abs", single_node(13), &[(1.0, 1.0)]);
  write_case(temp.path(), 13, "test_relu", single_node(13), &[(1.0, 1.0)]);

  let engine = ScriptedEngine::new();
  let registry = registry(POLICY, &[BackendKind::Cpu]);
  let mut opts = options(temp.path());
  opts.filter = build_filter(Some("cpu_rel*")).unwrap();

  let profile = registry.get(BackendKind::Cpu).unwrap();
  let mut plans = plan_cases(&engine, &registry, profile, &opts);
  assert!(engine.described.lock().unwrap().is_empty());

  let planned = plans.next().unwrap();
  assert_eq!(planned.key, "cpu_relu");
  let CasePlan::Run { configurations, .. } = planned.plan else {
    panic!("expected a runnable plan");
  };
  assert_eq!(configurations.len(), 2);
  assert!(plans.next().is_none());
  assert_eq!(engine.described_names(), vec!["test_relu".to_string()]);
}
