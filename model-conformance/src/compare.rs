//! Output verification.
//!
//! Checks run in a fixed order: element type, then shape, then values. The
//! first failing check decides the verdict.

use crate::case::Tolerance;
use crate::engine::{Dim, ModelInfo, ValueInfo};
use crate::tensor::{element_count, ElementType, NamedTensors, Tensor, TensorData};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
  Match,
  ValueMismatch,
  ShapeMismatch,
  TypeMismatch,
}

impl fmt::Display for Verdict {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Verdict::Match => "match",
      Verdict::ValueMismatch => "value_mismatch",
      Verdict::ShapeMismatch => "shape_mismatch",
      Verdict::TypeMismatch => "type_mismatch",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
  pub verdict: Verdict,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub diagnostic: String,
}

impl ComparisonResult {
  pub fn matched() -> Self {
    Self {
      verdict: Verdict::Match,
      diagnostic: String::new(),
    }
  }

  fn mismatch(verdict: Verdict, diagnostic: String) -> Self {
    Self {
      verdict,
      diagnostic,
    }
  }

  pub fn is_match(&self) -> bool {
    self.verdict == Verdict::Match
  }
}

/// Verdict for one named output of a sample set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputComparison {
  pub output: String,
  #[serde(flatten)]
  pub result: ComparisonResult,
}

/// Transform applied to floating outputs of cases that ask for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcess {
  /// Clamp to `[0, 255]` and round, as image outputs are consumed.
  #[default]
  Saturate,
  /// Index of the maximum along the last axis.
  Argmax,
}

impl PostProcess {
  fn apply<'a>(self, tensor: &'a Tensor) -> Cow<'a, Tensor> {
    let TensorData::Float(values) = &tensor.data else {
      return Cow::Borrowed(tensor);
    };
    match self {
      PostProcess::Saturate => Cow::Owned(Tensor {
        elem_type: tensor.elem_type,
        shape: tensor.shape.clone(),
        data: TensorData::Float(values.iter().map(|v| v.clamp(0.0, 255.0).round()).collect()),
      }),
      PostProcess::Argmax => Cow::Owned(argmax_last_axis(&tensor.shape, values)),
    }
  }
}

fn argmax_last_axis(shape: &[usize], values: &[f64]) -> Tensor {
  let (outer_shape, inner) = match shape.split_last() {
    Some((last, rest)) => (rest.to_vec(), *last),
    None => (Vec::new(), 1),
  };
  let outer = element_count(&outer_shape);

  let indices = (0..outer)
    .map(|row| {
      let start = row * inner;
      let slice = values.get(start..start + inner).unwrap_or(&[]);
      let mut best = 0usize;
      for (idx, value) in slice.iter().enumerate() {
        if *value > slice[best] || (slice[best].is_nan() && !value.is_nan()) {
          best = idx;
        }
      }
      best as i64
    })
    .collect();

  Tensor {
    elem_type: ElementType::Int64,
    shape: outer_shape,
    data: TensorData::Int(indices),
  }
}

/// Compares one produced tensor against its expectation.
///
/// `post_process` is applied to both tensors after the type and shape checks
/// and only to floating data.
pub fn compare(
  actual: &Tensor,
  expected: &Tensor,
  tolerance: Tolerance,
  post_process: Option<PostProcess>,
) -> ComparisonResult {
  if actual.elem_type != expected.elem_type {
    return ComparisonResult::mismatch(
      Verdict::TypeMismatch,
      format!(
        "expected element type {}, got {}",
        expected.elem_type, actual.elem_type
      ),
    );
  }

  if actual.shape != expected.shape {
    return ComparisonResult::mismatch(
      Verdict::ShapeMismatch,
      format!("expected shape {:?}, got {:?}", expected.shape, actual.shape),
    );
  }
  if let Some(result) = check_storage("produced", actual).or_else(|| check_storage("expected", expected)) {
    return result;
  }

  let (actual, expected) = match post_process {
    Some(transform) => (transform.apply(actual), transform.apply(expected)),
    None => (Cow::Borrowed(actual), Cow::Borrowed(expected)),
  };

  match (&actual.data, &expected.data) {
    (TensorData::Float(a), TensorData::Float(e)) => compare_floats(a, e, tolerance),
    (TensorData::Int(a), TensorData::Int(e)) => compare_exact(a, e),
    (TensorData::Uint(a), TensorData::Uint(e)) => compare_exact(a, e),
    (TensorData::Bool(a), TensorData::Bool(e)) => compare_exact(a, e),
    (TensorData::String(a), TensorData::String(e)) => compare_exact(a, e),
    _ => ComparisonResult::mismatch(
      Verdict::TypeMismatch,
      "tensor storage disagrees with its element type".to_string(),
    ),
  }
}

// Engine outputs are built field by field and never pass `Tensor::new`.
fn check_storage(role: &str, tensor: &Tensor) -> Option<ComparisonResult> {
  let required = element_count(&tensor.shape);
  (tensor.data.len() != required).then(|| {
    ComparisonResult::mismatch(
      Verdict::ShapeMismatch,
      format!(
        "{role} tensor of shape {:?} holds {} elements, shape requires {required}",
        tensor.shape,
        tensor.data.len()
      ),
    )
  })
}

fn floats_match(actual: f64, expected: f64, tolerance: Tolerance) -> bool {
  if actual.is_nan() || expected.is_nan() {
    return actual.is_nan() && expected.is_nan();
  }
  if actual.is_infinite() || expected.is_infinite() {
    return actual == expected;
  }
  tolerance.allows(actual, expected)
}

fn compare_floats(actual: &[f64], expected: &[f64], tolerance: Tolerance) -> ComparisonResult {
  let mut first = None;
  let mut differing = 0usize;
  let mut max_diff = 0.0f64;

  for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
    if floats_match(*a, *e, tolerance) {
      continue;
    }
    differing += 1;
    first.get_or_insert(idx);
    let diff = (a - e).abs();
    max_diff = if diff.is_nan() { f64::INFINITY } else { max_diff.max(diff) };
  }

  match first {
    None => ComparisonResult::matched(),
    Some(idx) => ComparisonResult::mismatch(
      Verdict::ValueMismatch,
      format!(
        "{differing} of {} elements differ; first at index {idx}: expected {}, got {}; \
         max difference {max_diff} (absolute tolerance {}, relative tolerance {})",
        expected.len(),
        expected[idx],
        actual[idx],
        tolerance.absolute,
        tolerance.relative
      ),
    ),
  }
}

fn compare_exact<T: PartialEq + fmt::Debug>(actual: &[T], expected: &[T]) -> ComparisonResult {
  let mut differing = actual.iter().zip(expected).enumerate().filter(|(_, (a, e))| a != e);
  let Some((idx, (a, e))) = differing.next() else {
    return ComparisonResult::matched();
  };
  let count = 1 + differing.count();
  ComparisonResult::mismatch(
    Verdict::ValueMismatch,
    format!(
      "{count} of {} elements differ; first at index {idx}: expected {e:?}, got {a:?}",
      expected.len()
    ),
  )
}

/// Checks a produced tensor against the output metadata the model declares.
pub fn verify_value_info(info: &ValueInfo, actual: &Tensor) -> ComparisonResult {
  if let Some(declared) = info.elem_type {
    if declared != actual.elem_type {
      return ComparisonResult::mismatch(
        Verdict::TypeMismatch,
        format!(
          "output `{}` is declared {declared}, got {}",
          info.name, actual.elem_type
        ),
      );
    }
  }

  if let Some(dims) = &info.shape {
    if dims.len() != actual.rank() {
      return ComparisonResult::mismatch(
        Verdict::ShapeMismatch,
        format!(
          "output `{}` is declared with rank {}, got shape {:?}",
          info.name,
          dims.len(),
          actual.shape
        ),
      );
    }
    for (axis, (dim, size)) in dims.iter().zip(&actual.shape).enumerate() {
      if let Dim::Fixed(declared) = dim {
        if declared != size {
          return ComparisonResult::mismatch(
            Verdict::ShapeMismatch,
            format!(
              "output `{}` declares {declared} at axis {axis}, got shape {:?}",
              info.name, actual.shape
            ),
          );
        }
      }
    }
  }

  check_storage("produced", actual).unwrap_or_else(ComparisonResult::matched)
}

/// Compares every expected output of a sample set.
///
/// Stops at the first mismatch unless `report_all` is set. An expected output
/// the engine did not produce is an engine contract violation and returned
/// as `Err`.
pub fn compare_outputs(
  actual: &NamedTensors,
  expected: &NamedTensors,
  info: &ModelInfo,
  tolerance: Tolerance,
  post_process: Option<PostProcess>,
  report_all: bool,
) -> Result<Vec<OutputComparison>, String> {
  let mut comparisons = Vec::with_capacity(expected.len());
  for (name, expected_tensor) in expected {
    let actual_tensor = actual
      .get(name)
      .ok_or_else(|| format!("engine did not produce expected output `{name}`"))?;

    let mut result = compare(actual_tensor, expected_tensor, tolerance, post_process);
    if result.is_match() {
      if let Some(declared) = info.output_info(name) {
        result = verify_value_info(declared, actual_tensor);
      }
    }

    let failed = !result.is_match();
    comparisons.push(OutputComparison {
      output: name.clone(),
      result,
    });
    if failed && !report_all {
      break;
    }
  }
  Ok(comparisons)
}
