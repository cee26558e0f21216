//! Run orchestration.
//!
//! For every selected backend the corpus is scanned, each discovered case is
//! planned (excluded, rejected, or expanded into configurations), and every
//! configuration is executed against one session of the engine. Sample sets of
//! parallel-eligible cases are dispatched onto a shared rayon pool; everything
//! else runs on the calling thread in stored order.

use crate::backend::{BackendProfile, BackendRegistry};
use crate::case::{SampleSet, TestCase, Tolerance};
use crate::compare::{compare_outputs, OutputComparison, PostProcess};
use crate::discover::{CorpusRoots, DiscoveredCase, Filter};
use crate::engine::{Engine, EngineError, Session};
use crate::matrix::{build_configurations, RunConfiguration};
use crate::report::{
  report_key, CaseError, ExecutionOutcome, ResultSet, RunRecord, SkipReason, SkippedCase,
};
use crate::{Error, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RunnerOptions {
  /// Name of the produced result set.
  pub name: String,
  pub roots: CorpusRoots,
  /// Applied to report keys (`<backend>_<test>`).
  pub filter: Filter,
  pub jobs: usize,
  /// Runs of each sample set on the concurrent path.
  pub repeat: usize,
  pub post_process: PostProcess,
  pub report_all_outputs: bool,
}

impl Default for RunnerOptions {
  fn default() -> Self {
    Self {
      name: "model-conformance".to_string(),
      roots: CorpusRoots::standard(),
      filter: Filter::All,
      jobs: 1,
      repeat: 1,
      post_process: PostProcess::default(),
      report_all_outputs: false,
    }
  }
}

/// How the sample sets of one case are executed and judged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaseSettings {
  pub tolerance: Tolerance,
  /// `Some` only when the case asks for post-processing.
  pub post_process: Option<PostProcess>,
  pub report_all_outputs: bool,
  /// Dispatch sample sets onto the pool instead of running them in order.
  pub concurrent: bool,
  pub repeat: usize,
}

#[derive(Debug)]
pub enum CasePlan {
  Skip(SkipReason),
  /// Malformed corpus entry.
  Error(String),
  Run {
    case: TestCase,
    configurations: Vec<RunConfiguration>,
    settings: CaseSettings,
  },
}

#[derive(Debug)]
pub struct PlannedCase {
  pub key: String,
  pub discovered: DiscoveredCase,
  pub plan: CasePlan,
}

/// Lazily plans every case of `profile`'s corpus that passes the filter.
pub fn plan_cases<'a>(
  engine: &'a dyn Engine,
  registry: &'a BackendRegistry,
  profile: &'a BackendProfile,
  options: &'a RunnerOptions,
) -> impl Iterator<Item = PlannedCase> + 'a {
  profile
    .corpus(&options.roots)
    .scan()
    .filter_map(move |discovered| {
      let key = report_key(profile.kind(), &discovered.name);
      if !options.filter.matches(&key) {
        return None;
      }
      let plan = plan_case(engine, registry, profile, options, &discovered);
      Some(PlannedCase {
        key,
        discovered,
        plan,
      })
    })
}

fn plan_case(
  engine: &dyn Engine,
  registry: &BackendRegistry,
  profile: &BackendProfile,
  options: &RunnerOptions,
  discovered: &DiscoveredCase,
) -> CasePlan {
  let name = discovered.name.as_str();
  if let Some(exclusion) = profile.static_exclusion(name) {
    return CasePlan::Skip(SkipReason::Excluded(exclusion));
  }

  let info = match engine.describe_model(&discovered.model) {
    Ok(info) => info,
    Err(err) if err.is_unsupported() => {
      return CasePlan::Skip(SkipReason::Unsupported {
        message: err.message,
      })
    }
    Err(err) => return CasePlan::Error(format!("describe {}: {err}", discovered.model.display())),
  };

  if info.has_training_domain() {
    return CasePlan::Skip(SkipReason::TrainingDomain);
  }
  if let Some(exclusion) = profile.broken_exclusion(name, info.nominal_opset()) {
    return CasePlan::Skip(SkipReason::Excluded(exclusion));
  }

  let case = match TestCase::load(discovered, info) {
    Ok(case) => case,
    Err(err) => return CasePlan::Error(err.to_string()),
  };

  let settings = CaseSettings {
    tolerance: case.tolerance(profile.base_tolerance(&case.dir_name)),
    post_process: case.post_processing().then_some(options.post_process),
    report_all_outputs: options.report_all_outputs,
    concurrent: case.samples.len() > 1
      && registry.is_parallel_eligible(&case.name, &case.dir_name),
    repeat: options.repeat.max(1),
  };
  let configurations = build_configurations(&case, profile);

  CasePlan::Run {
    case,
    configurations,
    settings,
  }
}

/// Outcome of one sample set, before it is attributed to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleOutcome {
  pub sample: usize,
  pub outcome: ExecutionOutcome,
  pub comparisons: Vec<OutputComparison>,
  pub diagnostic: Option<String>,
}

impl SampleOutcome {
  fn new(sample: usize, outcome: ExecutionOutcome, diagnostic: Option<String>) -> Self {
    Self {
      sample,
      outcome,
      comparisons: Vec::new(),
      diagnostic,
    }
  }

  fn from_engine_error(sample: usize, err: &EngineError) -> Self {
    let outcome = if err.is_unsupported() {
      ExecutionOutcome::EngineUnsupported
    } else {
      ExecutionOutcome::EngineError
    };
    Self::new(sample, outcome, Some(err.to_string()))
  }

  fn is_fatal(&self) -> bool {
    matches!(
      self.outcome,
      ExecutionOutcome::EngineUnsupported | ExecutionOutcome::EngineError
    )
  }
}

/// Sample set that was not attempted because an earlier one aborted the
/// configuration.
fn aborted(sample: usize, class: ExecutionOutcome, origin: usize) -> SampleOutcome {
  SampleOutcome::new(
    sample,
    class,
    Some(format!("configuration aborted by sample set {origin}")),
  )
}

/// Runs every sample set of `case` under `config`, one outcome per sample set
/// in stored order.
///
/// The model is loaded once and the session dropped on return. An
/// unsupported or failing load or run aborts the remaining sample sets with
/// the same outcome class.
pub fn run_configuration(
  engine: &dyn Engine,
  pool: &ThreadPool,
  case: &TestCase,
  config: &RunConfiguration,
  settings: &CaseSettings,
) -> Vec<SampleOutcome> {
  let session = match engine.load_model(&case.model, config) {
    Ok(session) => session,
    Err(err) => {
      let first = SampleOutcome::from_engine_error(0, &err);
      return case
        .samples
        .iter()
        .map(|sample| SampleOutcome {
          sample: sample.index,
          diagnostic: Some(format!("load model: {err}")),
          ..first.clone()
        })
        .collect();
    }
  };

  let outcomes = if settings.concurrent {
    run_concurrent(pool, session.as_ref(), case, settings)
  } else {
    run_sequential(session.as_ref(), case, settings)
  };
  drop(session);
  outcomes
}

fn run_sequential(session: &dyn Session, case: &TestCase, settings: &CaseSettings) -> Vec<SampleOutcome> {
  let mut outcomes = Vec::with_capacity(case.samples.len());
  let mut abort: Option<(ExecutionOutcome, usize)> = None;
  for sample in &case.samples {
    if let Some((class, origin)) = abort {
      outcomes.push(aborted(sample.index, class, origin));
      continue;
    }
    let outcome = run_sample(session, case, sample, settings);
    if outcome.is_fatal() {
      abort = Some((outcome.outcome, sample.index));
    }
    outcomes.push(outcome);
  }
  outcomes
}

fn run_concurrent(
  pool: &ThreadPool,
  session: &dyn Session,
  case: &TestCase,
  settings: &CaseSettings,
) -> Vec<SampleOutcome> {
  let abort: OnceLock<(ExecutionOutcome, usize)> = OnceLock::new();
  pool.install(|| {
    case
      .samples
      .par_iter()
      .map(|sample| {
        if let Some(&(class, origin)) = abort.get() {
          return aborted(sample.index, class, origin);
        }
        let mut outcome = run_sample(session, case, sample, settings);
        for _ in 1..settings.repeat {
          if outcome.outcome != ExecutionOutcome::Success {
            break;
          }
          outcome = run_sample(session, case, sample, settings);
        }
        if outcome.is_fatal() {
          let _ = abort.set((outcome.outcome, sample.index));
        }
        outcome
      })
      .collect()
  })
}

fn run_sample(
  session: &dyn Session,
  case: &TestCase,
  sample: &SampleSet,
  settings: &CaseSettings,
) -> SampleOutcome {
  let actual = match session.run(&sample.inputs) {
    Ok(actual) => actual,
    Err(err) => return SampleOutcome::from_engine_error(sample.index, &err),
  };

  let comparisons = match compare_outputs(
    &actual,
    &sample.expected,
    &case.info,
    settings.tolerance,
    settings.post_process,
    settings.report_all_outputs,
  ) {
    Ok(comparisons) => comparisons,
    Err(message) => {
      return SampleOutcome::new(sample.index, ExecutionOutcome::EngineError, Some(message))
    }
  };

  let diagnostic = comparisons
    .iter()
    .find(|comparison| !comparison.result.is_match())
    .map(|comparison| {
      format!(
        "output `{}`: {}: {}",
        comparison.output, comparison.result.verdict, comparison.result.diagnostic
      )
    });
  let outcome = if diagnostic.is_some() {
    ExecutionOutcome::ComparisonMismatch
  } else {
    ExecutionOutcome::Success
  };

  SampleOutcome {
    sample: sample.index,
    outcome,
    comparisons,
    diagnostic,
  }
}

/// Runs every backend of `registry` over its corpus.
pub fn run_conformance(
  engine: &dyn Engine,
  registry: &BackendRegistry,
  options: &RunnerOptions,
) -> Result<ResultSet> {
  let pool = ThreadPoolBuilder::new()
    .num_threads(options.jobs.max(1))
    .build()
    .map_err(|err| Error::Pool(err.to_string()))?;

  let mut results = ResultSet::new(options.name.clone());
  for profile in registry.profiles() {
    info!(backend = profile.name(), opsets = ?profile.opsets(), "running backend");
    for planned in plan_cases(engine, registry, profile, options) {
      record_case(engine, &pool, planned, &mut results);
    }
  }

  let summary = results.summarize();
  info!(
    total = summary.total,
    success = summary.success,
    comparison_mismatch = summary.comparison_mismatch,
    engine_unsupported = summary.engine_unsupported,
    engine_error = summary.engine_error,
    skipped = summary.skipped,
    configuration_errors = summary.configuration_errors,
    "run finished"
  );
  Ok(results)
}

fn record_case(engine: &dyn Engine, pool: &ThreadPool, planned: PlannedCase, results: &mut ResultSet) {
  let PlannedCase {
    key,
    discovered,
    plan,
  } = planned;

  match plan {
    CasePlan::Skip(reason) => {
      debug!(key = %key, reason = %reason, "skipping case");
      results.skip(SkippedCase {
        key,
        test: discovered.name,
        model: discovered.model,
        reason,
      });
    }
    CasePlan::Error(message) => {
      warn!(key = %key, "{message}");
      results.configuration_error(CaseError {
        key,
        test: discovered.name,
        model: discovered.model,
        message,
      });
    }
    CasePlan::Run {
      case,
      configurations,
      settings,
    } => {
      for config in configurations {
        debug!(
          key = %key,
          configuration = %config,
          samples = case.samples.len(),
          concurrent = settings.concurrent,
          "running configuration"
        );
        for outcome in run_configuration(engine, pool, &case, &config, &settings) {
          if outcome.outcome.is_failure() {
            warn!(
              key = %key,
              configuration = %config,
              sample = outcome.sample,
              outcome = %outcome.outcome,
              "{}",
              outcome.diagnostic.as_deref().unwrap_or_default()
            );
          }
          results.record(RunRecord {
            key: key.clone(),
            test: case.name.clone(),
            model: case.model.clone(),
            configuration: config.clone(),
            sample: outcome.sample,
            outcome: outcome.outcome,
            comparisons: outcome.comparisons,
            diagnostic: outcome.diagnostic,
          });
        }
      }
    }
  }
}
