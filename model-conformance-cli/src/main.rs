use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use model_conformance::{
  build_filter, default_engine, plan_cases, run_conformance, write_json_report, BackendEnv, BackendKind,
  BackendRegistry, CasePlan, CorpusRoots, Policy, PostProcess, ProfileSettings, ResultSet, RunnerOptions,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

mod report;

#[derive(Parser, Debug)]
#[command(author, version, about = "Model execution conformance runner", long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the conformance corpus against the selected backends
  Run(RunArgs),
  /// Print every discovered case and what a run would do with it
  List(CorpusArgs),
  /// Work with JSON report artifacts
  Report(ReportArgs),
}

#[derive(Args, Debug)]
struct ReportArgs {
  #[command(subcommand)]
  command: ReportCommand,
}

#[derive(Subcommand, Debug)]
enum ReportCommand {
  /// Compare two JSON reports (baseline vs current)
  Compare(report::CompareArgs),
}

#[derive(Args, Debug)]
struct CorpusArgs {
  /// Backend to run; repeat for several
  #[arg(long = "backend", value_name = "NAME", default_value = "cpu")]
  backends: Vec<BackendKind>,

  /// Override the node test root
  #[arg(long, value_name = "DIR")]
  node_root: Option<PathBuf>,

  /// Whole-model test root; repeat for several
  #[arg(long = "model-root", value_name = "DIR")]
  model_roots: Vec<PathBuf>,

  /// Exclusion policy (TOML or JSON) replacing the built-in one
  #[arg(long, value_name = "PATH")]
  policy: Option<PathBuf>,

  /// Glob or regex matched against `<backend>_<test>`
  #[arg(long)]
  filter: Option<String>,

  /// Exclude tests of traditional-ML operators
  #[arg(long)]
  disable_ml_ops: bool,

  /// Device id passed to GPU backends
  #[arg(long, value_name = "ID")]
  device_id: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
  #[command(flatten)]
  corpus: CorpusArgs,

  /// Worker threads for concurrent sample sets
  #[arg(long, default_value_t = default_jobs())]
  jobs: usize,

  /// Runs of each sample set on the concurrent path
  #[arg(long, default_value_t = 1)]
  repeat: usize,

  /// Post-processing applied to cases that request it
  #[arg(long, value_enum, default_value_t = PostProcessArg::Saturate)]
  post_process: PostProcessArg,

  /// Compare every output instead of stopping at the first mismatch
  #[arg(long)]
  report_all_outputs: bool,

  /// Name of the result set
  #[arg(long, default_value = "model-conformance")]
  name: String,

  /// Emit the JSON report instead of the human summary
  #[arg(long)]
  json: bool,

  /// Write the JSON report to this path
  #[arg(long, value_name = "PATH")]
  report_out: Option<PathBuf>,

  /// Enable tracing output
  #[arg(long)]
  trace: bool,

  /// Enable tracing output as JSON lines
  #[arg(long)]
  trace_json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PostProcessArg {
  Saturate,
  Argmax,
}

impl From<PostProcessArg> for PostProcess {
  fn from(arg: PostProcessArg) -> Self {
    match arg {
      PostProcessArg::Saturate => PostProcess::Saturate,
      PostProcessArg::Argmax => PostProcess::Argmax,
    }
  }
}

fn main() -> ExitCode {
  match try_main() {
    Ok(code) => code,
    Err(err) => {
      eprintln!("error: {err:#}");
      ExitCode::FAILURE
    }
  }
}

fn try_main() -> Result<ExitCode> {
  let cli = Cli::parse();
  match cli.command {
    Command::Run(args) => run(args),
    Command::List(args) => list(args),
    Command::Report(args) => match args.command {
      ReportCommand::Compare(args) => report::run_cli(args),
    },
  }
}

fn init_tracing(enable: bool, json: bool) {
  if !enable && !json {
    return;
  }

  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);
  let result = if json {
    builder.json().try_init()
  } else {
    builder.try_init()
  };
  if let Err(err) = result {
    eprintln!("failed to install tracing subscriber: {err}");
  }
}

impl CorpusArgs {
  fn roots(&self) -> CorpusRoots {
    let mut roots = CorpusRoots::standard();
    if let Some(node) = &self.node_root {
      roots.node = vec![node.clone()];
    }
    if !self.model_roots.is_empty() {
      roots.model = self.model_roots.clone();
    }
    roots
  }

  fn registry(&self) -> Result<BackendRegistry> {
    let policy = match &self.policy {
      Some(path) => {
        info!(path = %path.display(), "loading exclusion policy");
        Policy::from_path(path)?
      }
      None => Policy::builtin().context("load built-in exclusion policy")?,
    };

    let mut env = BackendEnv::from_env();
    if let Some(device_id) = &self.device_id {
      env.device_id = device_id.clone();
    }
    let settings = ProfileSettings {
      disable_ml_ops: self.disable_ml_ops,
      env,
      ..ProfileSettings::default()
    };
    Ok(BackendRegistry::build(&policy, &self.backends, &settings)?)
  }

  fn options(&self) -> Result<RunnerOptions> {
    Ok(RunnerOptions {
      roots: self.roots(),
      filter: build_filter(self.filter.as_deref())?,
      ..RunnerOptions::default()
    })
  }
}

fn run(args: RunArgs) -> Result<ExitCode> {
  init_tracing(args.trace, args.trace_json);

  let registry = args.corpus.registry()?;
  let options = RunnerOptions {
    name: args.name.clone(),
    jobs: args.jobs,
    repeat: args.repeat,
    post_process: args.post_process.into(),
    report_all_outputs: args.report_all_outputs,
    ..args.corpus.options()?
  };

  let engine = default_engine();
  let results = run_conformance(engine.as_ref(), &registry, &options)?;
  let green = results.is_green();

  if !args.json {
    print_summary(&results);
  }
  if args.json || args.report_out.is_some() {
    let report = results.into_report();
    if let Some(path) = &args.report_out {
      write_json_report(&report, Some(path))?;
    }
    if args.json {
      write_json_report(&report, None)?;
    }
  }

  Ok(if green {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

fn print_summary(results: &ResultSet) {
  let summary = results.summarize();
  println!("{}: ran {} record(s)", results.name(), summary.total);
  println!(
    "  success: {}, mismatch: {}, unsupported: {}, engine error: {}",
    summary.success, summary.comparison_mismatch, summary.engine_unsupported, summary.engine_error
  );
  println!(
    "  skipped cases: {}, configuration errors: {}",
    summary.skipped, summary.configuration_errors
  );

  for record in results.failures() {
    println!(
      "FAIL {} ({}): {}",
      record.id(),
      record.outcome,
      record.diagnostic.as_deref().unwrap_or_default()
    );
  }
  for error in results.errors() {
    println!("ERROR {} [{}]: {}", error.key, error.model.display(), error.message);
  }
}

fn list(args: CorpusArgs) -> Result<ExitCode> {
  let registry = args.registry()?;
  let options = args.options()?;
  let engine = default_engine();

  for profile in registry.profiles() {
    for planned in plan_cases(engine.as_ref(), &registry, profile, &options) {
      let status = match &planned.plan {
        CasePlan::Run { configurations, .. } => configurations
          .iter()
          .map(|config| config.label())
          .collect::<Vec<_>>()
          .join(","),
        CasePlan::Skip(reason) => format!("skip: {reason}"),
        CasePlan::Error(message) => format!("error: {message}"),
      };
      println!("{}\t{}\t{status}", planned.key, planned.discovered.model.display());
    }
  }
  Ok(ExitCode::SUCCESS)
}

fn default_jobs() -> usize {
  num_cpus::get().max(1)
}
