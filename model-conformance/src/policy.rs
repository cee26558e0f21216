//! Declarative exclusion policy.
//!
//! Every exclusion table lives in a manifest (TOML, or JSON as a fallback)
//! rather than in code. A [`Policy`] is parsed once, normalized, and then
//! folded into one [`BackendProfile`](crate::BackendProfile) per selected
//! backend; nothing here is mutated after parsing.

use crate::backend::BackendKind;
use crate::case::Tolerance;
use crate::discover::canonical_test_name;
use crate::engine::OpsetVersion;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

const BUILTIN_POLICY: &str = include_str!("../policy/default.toml");

/// A known-bad test, optionally only for some operator-set versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenTest {
  pub name: String,
  pub reason: String,
  /// Empty means every version.
  pub opsets: BTreeSet<u32>,
}

impl BrokenTest {
  pub fn applies_to(&self, opset: OpsetVersion) -> bool {
    match opset {
      _ if self.opsets.is_empty() => true,
      OpsetVersion::Unknown => true,
      OpsetVersion::Known(version) => self.opsets.contains(&version),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionRule {
  Permanent,
  Disabled,
  Keyword,
  MlOpPrefix,
  Broken,
}

impl ExclusionRule {
  pub fn as_str(self) -> &'static str {
    match self {
      ExclusionRule::Permanent => "permanent",
      ExclusionRule::Disabled => "disabled",
      ExclusionRule::Keyword => "keyword",
      ExclusionRule::MlOpPrefix => "ml_op_prefix",
      ExclusionRule::Broken => "broken",
    }
  }
}

/// Why a test is not attempted on a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
  pub rule: ExclusionRule,
  pub reason: String,
}

impl Exclusion {
  pub(crate) fn new(rule: ExclusionRule, reason: impl Into<String>) -> Self {
    Self {
      rule,
      reason: reason.into(),
    }
  }
}

impl fmt::Display for Exclusion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.rule.as_str(), self.reason)
  }
}

/// Target-architecture condition of a platform rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchCondition {
  Only(BTreeSet<String>),
  Except(BTreeSet<String>),
}

impl ArchCondition {
  pub fn holds_for(&self, arch: &str) -> bool {
    match self {
      ArchCondition::Only(archs) => archs.contains(arch),
      ArchCondition::Except(archs) => !archs.contains(arch),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRule {
  pub reason: String,
  pub condition: ArchCondition,
  pub tests: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceOverride {
  pub keyword: String,
  pub tolerance: Tolerance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendPolicy {
  pub opsets: Vec<u32>,
  pub node_tests: bool,
  pub disabled: BTreeSet<String>,
  pub keywords: Vec<String>,
  pub broken: Vec<BrokenTest>,
  pub tolerances: Vec<ToleranceOverride>,
}

impl Default for BackendPolicy {
  fn default() -> Self {
    Self {
      opsets: Vec::new(),
      node_tests: true,
      disabled: BTreeSet::new(),
      keywords: Vec::new(),
      broken: Vec::new(),
      tolerances: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
  pub permanent: BTreeSet<String>,
  pub always: BTreeSet<String>,
  pub parallel: BTreeSet<String>,
  pub ml_op_prefixes: Vec<String>,
  pub platform: Vec<PlatformRule>,
  pub broken: Vec<BrokenTest>,
  pub backends: BTreeMap<BackendKind, BackendPolicy>,
}

impl Policy {
  /// The manifest compiled into the crate.
  pub fn builtin() -> Result<Self> {
    Self::from_str(BUILTIN_POLICY)
  }

  pub fn from_path(path: &Path) -> Result<Self> {
    let raw = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
    Self::from_str(&raw).map_err(|err| match err {
      Error::Policy(message) => Error::Policy(format!("{}: {message}", path.display())),
      other => other,
    })
  }

  pub fn from_str(raw: &str) -> Result<Self> {
    let manifest = match toml::from_str::<RawPolicy>(raw) {
      Ok(manifest) => manifest,
      Err(toml_err) => serde_json::from_str::<RawPolicy>(raw).map_err(|json_err| {
        Error::Policy(format!(
          "failed to parse manifest as TOML ({toml_err}) or JSON ({json_err})"
        ))
      })?,
    };

    Self::from_manifest(manifest)
  }

  /// Returns the per-backend section, or an empty one when the manifest has
  /// none for `kind`.
  pub fn backend(&self, kind: BackendKind) -> BackendPolicy {
    self.backends.get(&kind).cloned().unwrap_or_default()
  }

  fn from_manifest(manifest: RawPolicy) -> Result<Self> {
    let ml_op_prefixes = non_empty_patterns("ml_op_prefixes", manifest.ml_op_prefixes)?;

    let platform = manifest
      .platform
      .into_iter()
      .map(RawPlatform::into_rule)
      .collect::<Result<Vec<_>>>()?;

    let broken = manifest
      .broken
      .into_iter()
      .map(RawBroken::into_broken)
      .collect::<Result<Vec<_>>>()?;

    let mut backends = BTreeMap::new();
    for (name, raw) in manifest.backends {
      let kind: BackendKind = name
        .parse()
        .map_err(|err: String| Error::Policy(format!("[backends.{name}]: {err}")))?;
      let section = raw
        .into_policy()
        .map_err(|err| match err {
          Error::Policy(message) => Error::Policy(format!("[backends.{name}]: {message}")),
          other => other,
        })?;
      backends.insert(kind, section);
    }

    Ok(Self {
      permanent: normalize_names(manifest.permanent),
      always: normalize_names(manifest.always),
      parallel: normalize_names(manifest.parallel),
      ml_op_prefixes,
      platform,
      broken,
      backends,
    })
  }
}

fn normalize_name(name: &str) -> String {
  canonical_test_name(name.trim()).to_string()
}

fn normalize_names(names: Vec<String>) -> BTreeSet<String> {
  names.iter().map(|name| normalize_name(name)).collect()
}

// An empty substring would match every test.
fn non_empty_patterns(field: &str, patterns: Vec<String>) -> Result<Vec<String>> {
  if patterns.iter().any(|pattern| pattern.is_empty()) {
    return Err(Error::Policy(format!("`{field}` contains an empty pattern")));
  }
  Ok(patterns)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
  #[serde(default)]
  permanent: Vec<String>,
  #[serde(default)]
  always: Vec<String>,
  #[serde(default)]
  parallel: Vec<String>,
  #[serde(default)]
  ml_op_prefixes: Vec<String>,
  #[serde(default)]
  platform: Vec<RawPlatform>,
  #[serde(default)]
  broken: Vec<RawBroken>,
  #[serde(default)]
  backends: BTreeMap<String, RawBackend>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlatform {
  reason: String,
  #[serde(default)]
  arch: Vec<String>,
  #[serde(default)]
  arch_not: Vec<String>,
  #[serde(default)]
  tests: Vec<String>,
}

impl RawPlatform {
  fn into_rule(self) -> Result<PlatformRule> {
    let condition = match (self.arch.is_empty(), self.arch_not.is_empty()) {
      (false, true) => ArchCondition::Only(self.arch.into_iter().collect()),
      (true, false) => ArchCondition::Except(self.arch_not.into_iter().collect()),
      _ => {
        return Err(Error::Policy(format!(
          "platform rule `{}` needs exactly one of `arch` or `arch_not`",
          self.reason
        )))
      }
    };

    Ok(PlatformRule {
      reason: self.reason,
      condition,
      tests: normalize_names(self.tests),
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBroken {
  name: String,
  #[serde(default)]
  reason: String,
  #[serde(default)]
  opsets: Vec<u32>,
}

impl RawBroken {
  fn into_broken(self) -> Result<BrokenTest> {
    let name = normalize_name(&self.name);
    if name.is_empty() {
      return Err(Error::Policy("broken entry with an empty name".to_string()));
    }
    Ok(BrokenTest {
      name,
      reason: self.reason,
      opsets: self.opsets.into_iter().collect(),
    })
  }
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBackend {
  #[serde(default)]
  opsets: Vec<u32>,
  #[serde(default = "default_true")]
  node_tests: bool,
  #[serde(default)]
  disabled: Vec<String>,
  #[serde(default)]
  keywords: Vec<String>,
  #[serde(default)]
  broken: Vec<RawBroken>,
  #[serde(default)]
  tolerance: Vec<RawTolerance>,
}

impl RawBackend {
  fn into_policy(self) -> Result<BackendPolicy> {
    let mut opsets = self.opsets;
    opsets.sort_unstable();
    opsets.dedup();

    let tolerances = self
      .tolerance
      .into_iter()
      .map(|raw| {
        let tolerance = Tolerance::new(raw.absolute, raw.relative);
        tolerance
          .validate()
          .map_err(|err| Error::Policy(format!("tolerance for `{}`: {err}", raw.keyword)))?;
        if raw.keyword.is_empty() {
          return Err(Error::Policy("tolerance override with an empty keyword".to_string()));
        }
        Ok(ToleranceOverride {
          keyword: raw.keyword,
          tolerance,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(BackendPolicy {
      opsets,
      node_tests: self.node_tests,
      disabled: normalize_names(self.disabled),
      keywords: non_empty_patterns("keywords", self.keywords)?,
      broken: self
        .broken
        .into_iter()
        .map(RawBroken::into_broken)
        .collect::<Result<Vec<_>>>()?,
      tolerances,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTolerance {
  keyword: String,
  absolute: f64,
  relative: f64,
}
