use anyhow::{Context, Result};
use clap::Args;
use model_conformance::{compare_reports, read_report, ReportComparison};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Args, Debug)]
pub struct CompareArgs {
  /// Path to the baseline JSON report.
  #[arg(long, value_name = "PATH")]
  pub baseline: PathBuf,

  /// Path to the current JSON report.
  #[arg(long, value_name = "PATH")]
  pub current: PathBuf,

  /// Exit with a non-zero code when regressions are detected.
  #[arg(long)]
  pub fail_on_regression: bool,
}

pub fn run_cli(args: CompareArgs) -> Result<ExitCode> {
  let load = |role: &str, path: &PathBuf| {
    read_report(path).with_context(|| format!("load {role} report {}", path.display()))
  };
  let baseline = load("baseline", &args.baseline)?;
  let current = load("current", &args.current)?;

  let comparison = compare_reports(&baseline, &current)?;
  println!(
    "{} -> {}: {} regressed, {} improved, {} new, {} removed, {} unchanged",
    baseline.name,
    current.name,
    comparison.regressions.len(),
    comparison.improvements.len(),
    comparison.new_records.len(),
    comparison.removed_records.len(),
    comparison.unchanged
  );
  print_changes(&comparison);

  Ok(if args.fail_on_regression && comparison.has_regressions() {
    ExitCode::FAILURE
  } else {
    ExitCode::SUCCESS
  })
}

/// One line per record, grouped by report key.
fn print_changes(comparison: &ReportComparison) {
  let mut lines: BTreeMap<&str, Vec<String>> = BTreeMap::new();
  for (tag, changes) in [("-", &comparison.regressions), ("+", &comparison.improvements)] {
    for change in changes {
      lines.entry(change.id.key.as_str()).or_default().push(format!(
        "{tag} {} sample {} [{}]: {} -> {}",
        change.id.configuration,
        change.id.sample,
        change.id.model.display(),
        change.baseline,
        change.current
      ));
    }
  }
  for (tag, ids) in [("new", &comparison.new_records), ("gone", &comparison.removed_records)] {
    for id in ids {
      lines.entry(id.key.as_str()).or_default().push(format!(
        "{tag} {} sample {} [{}]",
        id.configuration,
        id.sample,
        id.model.display()
      ));
    }
  }

  for (key, entries) in lines {
    println!("{key}");
    for entry in entries {
      println!("  {entry}");
    }
  }
}
