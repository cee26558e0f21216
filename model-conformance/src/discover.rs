use crate::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, FilterEntry, WalkDir};

pub const MODEL_EXTENSION: &str = "onnx";
pub const TEST_DIR_PREFIX: &str = "test_";
const HIDDEN_MARKER: char = '.';

/// Strips the conventional `test_` directory prefix from a case name.
pub fn canonical_test_name(dir_name: &str) -> &str {
  dir_name.strip_prefix(TEST_DIR_PREFIX).unwrap_or(dir_name)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DiscoveredCase {
  /// Directory name without the `test_` prefix.
  pub name: String,
  pub dir_name: String,
  pub model: PathBuf,
}

impl DiscoveredCase {
  pub fn case_dir(&self) -> &Path {
    self.model.parent().unwrap_or_else(|| Path::new(""))
  }
}

/// Root directories searched for test cases, before opset buckets are
/// appended.
#[derive(Debug, Clone, Default)]
pub struct CorpusRoots {
  /// Operator-level tests (one node per model).
  pub node: Vec<PathBuf>,
  /// Whole-model tests, including model-zoo checkouts.
  pub model: Vec<PathBuf>,
}

impl CorpusRoots {
  /// Where CI machines keep the preloaded corpora.
  pub fn standard() -> Self {
    let node = if cfg!(windows) {
      PathBuf::from(r"c:\local\data\onnx")
    } else {
      PathBuf::from("/data/onnx")
    };
    let models = PathBuf::from("..").join("models");
    Self {
      node: vec![node],
      model: vec![models.clone(), models.join("zoo")],
    }
  }
}

/// A fixed set of scan roots. Every call to [`Corpus::scan`] starts over, so
/// a corpus can be walked once per backend without re-resolving its roots.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
  roots: Vec<PathBuf>,
}

impl Corpus {
  pub fn new(roots: Vec<PathBuf>) -> Self {
    Self { roots }
  }

  pub fn roots(&self) -> &[PathBuf] {
    &self.roots
  }

  pub fn scan(&self) -> CorpusScan {
    CorpusScan {
      pending: self.roots.clone().into_iter(),
      current: None,
      unreadable: Vec::new(),
    }
  }
}

/// Lazy depth-first walk over every root of a [`Corpus`].
///
/// Roots that are missing or not directories are skipped: which roots exist
/// depends on the machine the run happens on. Entries inside a root that
/// cannot be read are logged and listed by [`CorpusScan::unreadable`].
pub struct CorpusScan {
  pending: std::vec::IntoIter<PathBuf>,
  current: Option<FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>>,
  unreadable: Vec<PathBuf>,
}

impl CorpusScan {
  pub fn unreadable(&self) -> &[PathBuf] {
    &self.unreadable
  }
}

impl Iterator for CorpusScan {
  type Item = DiscoveredCase;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if let Some(walk) = self.current.as_mut() {
        for entry in walk.by_ref() {
          let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
              let path = err.path().map(Path::to_path_buf).unwrap_or_default();
              warn!(path = %path.display(), error = %err, "skipping unreadable corpus entry");
              self.unreadable.push(path);
              continue;
            }
          };
          if !entry.file_type().is_file() {
            continue;
          }
          if let Some(case) = case_from_model_path(entry.path()) {
            return Some(case);
          }
        }
        self.current = None;
      }

      let root = self.pending.next()?;
      if !root.is_dir() {
        continue;
      }
      self.current = Some(
        WalkDir::new(root)
          .sort_by_file_name()
          .into_iter()
          .filter_entry(is_visible as fn(&DirEntry) -> bool),
      );
    }
  }
}

fn is_visible(entry: &DirEntry) -> bool {
  entry.depth() == 0
    || !entry
      .file_name()
      .to_str()
      .is_some_and(|name| name.starts_with(HIDDEN_MARKER))
}

fn case_from_model_path(path: &Path) -> Option<DiscoveredCase> {
  if path.extension().and_then(|ext| ext.to_str()) != Some(MODEL_EXTENSION) {
    return None;
  }
  let dir_name = path.parent()?.file_name()?.to_str()?.to_string();
  Some(DiscoveredCase {
    name: canonical_test_name(&dir_name).to_string(),
    dir_name,
    model: path.to_path_buf(),
  })
}

#[derive(Debug, Clone)]
pub enum Filter {
  All,
  Glob(GlobSet),
  Regex(Regex),
}

/// Interprets `pattern` as a glob when it parses as one, else as a regex.
pub fn build_filter(pattern: Option<&str>) -> Result<Filter> {
  match pattern {
    None => Ok(Filter::All),
    Some(raw) => {
      if let Ok(glob) = Glob::new(raw) {
        let mut builder = GlobSetBuilder::new();
        builder.add(glob);
        let set = builder
          .build()
          .map_err(|err| Error::InvalidFilter(err.to_string()))?;
        return Ok(Filter::Glob(set));
      }

      let regex = Regex::new(raw).map_err(|err| Error::InvalidFilter(err.to_string()))?;
      Ok(Filter::Regex(regex))
    }
  }
}

impl Filter {
  pub fn matches(&self, id: &str) -> bool {
    match self {
      Filter::All => true,
      Filter::Glob(set) => set.is_match(id),
      Filter::Regex(re) => re.is_match(id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "").unwrap();
  }

  #[test]
  fn scan_strips_prefix_and_skips_hidden_and_foreign_files() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("opset13");
    touch(&root.join("test_abs/model.onnx"));
    touch(&root.join("test_abs/test_data_set_0/input_0.json"));
    touch(&root.join("squeezenet/model.onnx"));
    touch(&root.join("test_relu/.model.onnx"));
    touch(&root.join(".cache/test_hidden/model.onnx"));
    touch(&root.join("test_notes/README.md"));

    let cases: Vec<_> = Corpus::new(vec![root]).scan().collect();
    let names: Vec<_> = cases.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["squeezenet", "abs"]);
    assert_eq!(cases[1].dir_name, "test_abs");
  }

  #[test]
  fn missing_and_file_roots_are_skipped() {
    let temp = tempdir().unwrap();
    let file_root = temp.path().join("not_a_dir");
    fs::write(&file_root, "").unwrap();
    let real = temp.path().join("real");
    touch(&real.join("test_add/model.onnx"));

    let corpus = Corpus::new(vec![temp.path().join("missing"), file_root, real]);
    let names: Vec<_> = corpus.scan().map(|c| c.name).collect();
    assert_eq!(names, vec!["add"]);
  }

  #[test]
  fn unreadable_directories_are_recorded() {
    let temp = tempdir().unwrap();
    touch(&temp.path().join("a_case/model.onnx"));
    touch(&temp.path().join("z_dir/test_late/model.onnx"));

    let corpus = Corpus::new(vec![temp.path().to_path_buf()]);
    let mut scan = corpus.scan();
    assert_eq!(scan.next().unwrap().name, "a_case");

    // Listed with its parent but not opened yet.
    fs::remove_dir_all(temp.path().join("z_dir")).unwrap();
    assert!(scan.next().is_none());
    assert_eq!(scan.unreadable(), &[temp.path().join("z_dir")]);
  }

  #[test]
  fn rescanning_yields_the_same_cases() {
    let temp = tempdir().unwrap();
    for name in ["test_b", "test_a", "nested/test_c"] {
      touch(&temp.path().join(name).join("model.onnx"));
    }

    let corpus = Corpus::new(vec![temp.path().to_path_buf()]);
    let first: Vec<_> = corpus.scan().collect();
    let second: Vec<_> = corpus.scan().collect();
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
  }

  #[test]
  fn filter_matches_globs_and_defaults_to_all() {
    let glob = build_filter(Some("cpu_conv*")).unwrap();
    assert!(glob.matches("cpu_conv_1d"));
    assert!(!glob.matches("cuda_conv_1d"));

    assert!(build_filter(None).unwrap().matches("anything"));
  }
}
