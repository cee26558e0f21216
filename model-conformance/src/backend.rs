use crate::case::Tolerance;
use crate::discover::{canonical_test_name, Corpus, CorpusRoots};
use crate::engine::OpsetVersion;
use crate::policy::{BrokenTest, Exclusion, ExclusionRule, Policy, ToleranceOverride};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fmt;
use std::str::FromStr;

/// Supplies the device id of GPU backends.
pub const DEVICE_ID_ENV: &str = "MODEL_CONFORMANCE_GPU_DEVICE_ID";
const DEFAULT_DEVICE_ID: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
  /// The default in-process backend.
  Cpu,
  Cuda,
  Rocm,
  Tensorrt,
  Migraphx,
  Openvino,
  Dnnl,
  Dml,
  Nnapi,
  Vsinpu,
  Rknpu,
  Acl,
  Armnn,
  Xnnpack,
}

impl BackendKind {
  pub const ALL: [BackendKind; 14] = [
    BackendKind::Cpu,
    BackendKind::Cuda,
    BackendKind::Rocm,
    BackendKind::Tensorrt,
    BackendKind::Migraphx,
    BackendKind::Openvino,
    BackendKind::Dnnl,
    BackendKind::Dml,
    BackendKind::Nnapi,
    BackendKind::Vsinpu,
    BackendKind::Rknpu,
    BackendKind::Acl,
    BackendKind::Armnn,
    BackendKind::Xnnpack,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      BackendKind::Cpu => "cpu",
      BackendKind::Cuda => "cuda",
      BackendKind::Rocm => "rocm",
      BackendKind::Tensorrt => "tensorrt",
      BackendKind::Migraphx => "migraphx",
      BackendKind::Openvino => "openvino",
      BackendKind::Dnnl => "dnnl",
      BackendKind::Dml => "dml",
      BackendKind::Nnapi => "nnapi",
      BackendKind::Vsinpu => "vsinpu",
      BackendKind::Rknpu => "rknpu",
      BackendKind::Acl => "acl",
      BackendKind::Armnn => "armnn",
      BackendKind::Xnnpack => "xnnpack",
    }
  }

  pub fn is_default(self) -> bool {
    self == BackendKind::Cpu
  }

  /// Backend-specific session options.
  pub fn options(self, env: &BackendEnv) -> BTreeMap<String, String> {
    let pairs: Vec<(&str, &str)> = match self {
      BackendKind::Cuda => vec![("device_id", env.device_id.as_str()), ("use_tf32", "0")],
      BackendKind::Tensorrt => vec![
        ("device_id", env.device_id.as_str()),
        ("use_tf32", "0"),
        ("cuda_fallback", "1"),
      ],
      BackendKind::Dnnl => vec![("use_arena", "0")],
      BackendKind::Acl => vec![("enable_fast_math", "0")],
      BackendKind::Nnapi => vec![("flags", "0")],
      _ => Vec::new(),
    };
    pairs
      .into_iter()
      .map(|(key, value)| (key.to_string(), value.to_string()))
      .collect()
  }
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for BackendKind {
  type Err = String;

  fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
    BackendKind::ALL
      .into_iter()
      .find(|kind| kind.as_str() == raw)
      .ok_or_else(|| {
        let known: Vec<_> = BackendKind::ALL.iter().map(|kind| kind.as_str()).collect();
        format!("unknown backend `{raw}` (expected one of {})", known.join(", "))
      })
  }
}

/// Process environment consulted while building profiles. Read once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEnv {
  pub device_id: String,
}

impl Default for BackendEnv {
  fn default() -> Self {
    Self {
      device_id: DEFAULT_DEVICE_ID.to_string(),
    }
  }
}

impl BackendEnv {
  pub fn from_env() -> Self {
    match env::var(DEVICE_ID_ENV) {
      Ok(value) if !value.trim().is_empty() => Self {
        device_id: value.trim().to_string(),
      },
      _ => Self::default(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ProfileSettings {
  pub disable_ml_ops: bool,
  pub env: BackendEnv,
  /// Compared against `arch` / `arch_not` of platform rules.
  pub target_arch: String,
}

impl Default for ProfileSettings {
  fn default() -> Self {
    Self {
      disable_ml_ops: false,
      env: BackendEnv::default(),
      target_arch: env::consts::ARCH.to_string(),
    }
  }
}

/// Everything the runner needs to know about one backend, resolved once from
/// the policy. Read-only after construction.
#[derive(Debug, Clone)]
pub struct BackendProfile {
  kind: BackendKind,
  opsets: Vec<u32>,
  node_tests: bool,
  permanent: BTreeSet<String>,
  /// Disabled name to the reason it was disabled.
  disabled: BTreeMap<String, String>,
  keywords: Vec<String>,
  ml_op_prefixes: Vec<String>,
  broken: Vec<BrokenTest>,
  tolerances: Vec<ToleranceOverride>,
  options: BTreeMap<String, String>,
}

impl BackendProfile {
  pub fn new(policy: &Policy, kind: BackendKind, settings: &ProfileSettings) -> Self {
    let section = policy.backend(kind);

    let mut disabled = BTreeMap::new();
    for name in &section.disabled {
      disabled
        .entry(name.clone())
        .or_insert_with(|| format!("disabled for {kind}"));
    }
    for name in &policy.always {
      disabled
        .entry(name.clone())
        .or_insert_with(|| "disabled for every backend".to_string());
    }
    for rule in &policy.platform {
      if !rule.condition.holds_for(&settings.target_arch) {
        continue;
      }
      for name in &rule.tests {
        disabled.entry(name.clone()).or_insert_with(|| {
          format!("{} on {}", rule.reason, settings.target_arch)
        });
      }
    }

    let ml_op_prefixes = if settings.disable_ml_ops {
      policy.ml_op_prefixes.clone()
    } else {
      Vec::new()
    };

    let mut broken = policy.broken.clone();
    broken.extend(section.broken);

    Self {
      kind,
      opsets: section.opsets,
      node_tests: section.node_tests,
      permanent: policy.permanent.clone(),
      disabled,
      keywords: section.keywords,
      ml_op_prefixes,
      broken,
      tolerances: section.tolerances,
      options: kind.options(&settings.env),
    }
  }

  pub fn kind(&self) -> BackendKind {
    self.kind
  }

  pub fn name(&self) -> &'static str {
    self.kind.as_str()
  }

  pub fn opsets(&self) -> &[u32] {
    &self.opsets
  }

  pub fn options(&self) -> &BTreeMap<String, String> {
    &self.options
  }

  /// Rules that only need the name. Checked before the model is described.
  pub fn static_exclusion(&self, name: &str) -> Option<Exclusion> {
    if self.permanent.contains(name) {
      return Some(Exclusion::new(
        ExclusionRule::Permanent,
        "operator set older than the engine minimum",
      ));
    }
    if let Some(reason) = self.disabled.get(name) {
      return Some(Exclusion::new(ExclusionRule::Disabled, reason.clone()));
    }
    if let Some(keyword) = self.keywords.iter().find(|keyword| name.contains(keyword.as_str())) {
      return Some(Exclusion::new(
        ExclusionRule::Keyword,
        format!("name contains `{keyword}`"),
      ));
    }
    if let Some(prefix) = self
      .ml_op_prefixes
      .iter()
      .find(|prefix| name.starts_with(prefix.as_str()))
    {
      return Some(Exclusion::new(
        ExclusionRule::MlOpPrefix,
        format!("ML operators are disabled (`{prefix}`)"),
      ));
    }
    None
  }

  /// Broken entries, which depend on the nominal opset of the model.
  pub fn broken_exclusion(&self, name: &str, opset: OpsetVersion) -> Option<Exclusion> {
    self
      .broken
      .iter()
      .find(|entry| entry.name == name && entry.applies_to(opset))
      .map(|entry| {
        let reason = if entry.reason.is_empty() {
          format!("broken at opset {opset}")
        } else {
          entry.reason.clone()
        };
        Exclusion::new(ExclusionRule::Broken, reason)
      })
  }

  pub fn exclusion(&self, name: &str, opset: OpsetVersion) -> Option<Exclusion> {
    self
      .static_exclusion(name)
      .or_else(|| self.broken_exclusion(name, opset))
  }

  pub fn is_excluded(&self, name: &str, opset: OpsetVersion) -> bool {
    self.exclusion(name, opset).is_some()
  }

  /// Tolerance before case overrides: the first override whose keyword occurs
  /// in the case directory name, else the defaults.
  pub fn base_tolerance(&self, dir_name: &str) -> Tolerance {
    self
      .tolerances
      .iter()
      .find(|entry| dir_name.contains(entry.keyword.as_str()))
      .map(|entry| entry.tolerance)
      .unwrap_or_default()
  }

  /// `opset<N>` buckets of `roots` this backend scans, node tests first.
  pub fn corpus(&self, roots: &CorpusRoots) -> Corpus {
    let mut dirs = Vec::new();
    if self.node_tests {
      for root in &roots.node {
        dirs.extend(self.opsets.iter().map(|opset| root.join(format!("opset{opset}"))));
      }
    }
    for opset in &self.opsets {
      dirs.extend(roots.model.iter().map(|root| root.join(format!("opset{opset}"))));
    }
    Corpus::new(dirs)
  }
}

/// Profiles of the backends selected for a run, in selection order.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
  profiles: Vec<BackendProfile>,
  parallel: BTreeSet<String>,
}

impl BackendRegistry {
  pub fn build(policy: &Policy, kinds: &[BackendKind], settings: &ProfileSettings) -> Result<Self> {
    if kinds.is_empty() {
      return Err(Error::Policy("no backend selected".to_string()));
    }

    let mut seen = BTreeSet::new();
    let profiles = kinds
      .iter()
      .filter(|kind| seen.insert(**kind))
      .map(|kind| BackendProfile::new(policy, *kind, settings))
      .collect();

    Ok(Self {
      profiles,
      parallel: policy.parallel.clone(),
    })
  }

  pub fn profiles(&self) -> &[BackendProfile] {
    &self.profiles
  }

  pub fn get(&self, kind: BackendKind) -> Option<&BackendProfile> {
    self.profiles.iter().find(|profile| profile.kind == kind)
  }

  pub fn is_parallel_eligible(&self, name: &str, dir_name: &str) -> bool {
    self.parallel.contains(name) || self.parallel.contains(canonical_test_name(dir_name))
  }
}
