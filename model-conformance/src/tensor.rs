use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Tensors keyed by graph input/output name.
pub type NamedTensors = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
  Float16,
  Bfloat16,
  Float32,
  Float64,
  Int8,
  Int16,
  Int32,
  Int64,
  Uint8,
  Uint16,
  Uint32,
  Uint64,
  Bool,
  String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataKind {
  Float,
  Int,
  Uint,
  Bool,
  String,
}

impl ElementType {
  pub fn as_str(self) -> &'static str {
    match self {
      ElementType::Float16 => "float16",
      ElementType::Bfloat16 => "bfloat16",
      ElementType::Float32 => "float32",
      ElementType::Float64 => "float64",
      ElementType::Int8 => "int8",
      ElementType::Int16 => "int16",
      ElementType::Int32 => "int32",
      ElementType::Int64 => "int64",
      ElementType::Uint8 => "uint8",
      ElementType::Uint16 => "uint16",
      ElementType::Uint32 => "uint32",
      ElementType::Uint64 => "uint64",
      ElementType::Bool => "bool",
      ElementType::String => "string",
    }
  }

  fn kind(self) -> DataKind {
    match self {
      ElementType::Float16 | ElementType::Bfloat16 | ElementType::Float32 | ElementType::Float64 => {
        DataKind::Float
      }
      ElementType::Int8 | ElementType::Int16 | ElementType::Int32 | ElementType::Int64 => DataKind::Int,
      ElementType::Uint8 | ElementType::Uint16 | ElementType::Uint32 | ElementType::Uint64 => {
        DataKind::Uint
      }
      ElementType::Bool => DataKind::Bool,
      ElementType::String => DataKind::String,
    }
  }
}

impl fmt::Display for ElementType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Flat element storage. Floating types of every width are widened to `f64`
/// and integers to 64 bits; the precise type lives on [`Tensor::elem_type`].
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  Float(Vec<f64>),
  Int(Vec<i64>),
  Uint(Vec<u64>),
  Bool(Vec<bool>),
  String(Vec<String>),
}

impl TensorData {
  pub fn len(&self) -> usize {
    match self {
      TensorData::Float(values) => values.len(),
      TensorData::Int(values) => values.len(),
      TensorData::Uint(values) => values.len(),
      TensorData::Bool(values) => values.len(),
      TensorData::String(values) => values.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn kind(&self) -> DataKind {
    match self {
      TensorData::Float(_) => DataKind::Float,
      TensorData::Int(_) => DataKind::Int,
      TensorData::Uint(_) => DataKind::Uint,
      TensorData::Bool(_) => DataKind::Bool,
      TensorData::String(_) => DataKind::String,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  pub elem_type: ElementType,
  pub shape: Vec<usize>,
  pub data: TensorData,
}

impl Tensor {
  /// Builds a tensor, checking that the storage kind agrees with `elem_type`
  /// and that the element count agrees with `shape`.
  pub fn new(
    elem_type: ElementType,
    shape: Vec<usize>,
    data: TensorData,
  ) -> std::result::Result<Self, String> {
    if elem_type.kind() != data.kind() {
      return Err(format!(
        "{elem_type} tensor cannot hold {:?} data",
        data.kind()
      ));
    }

    let expected = element_count(&shape);
    if data.len() != expected {
      return Err(format!(
        "shape {shape:?} requires {expected} elements, found {}",
        data.len()
      ));
    }

    Ok(Self {
      elem_type,
      shape,
      data,
    })
  }

  pub fn element_count(&self) -> usize {
    self.data.len()
  }

  pub fn rank(&self) -> usize {
    self.shape.len()
  }
}

pub fn element_count(shape: &[usize]) -> usize {
  shape.iter().product()
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorFile {
  name: String,
  elem_type: ElementType,
  #[serde(default)]
  shape: Vec<usize>,
  data: Vec<Value>,
}

/// Reads a JSON tensor file, returning the tensor together with its name.
pub fn read_tensor_file(path: &Path) -> Result<(String, Tensor)> {
  let raw = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
  let invalid = |message: String| Error::Tensor {
    path: path.to_path_buf(),
    message,
  };

  let file: TensorFile = serde_json::from_str(&raw).map_err(|err| invalid(err.to_string()))?;
  let data = decode_data(file.elem_type, &file.data).map_err(invalid)?;
  let tensor = Tensor::new(file.elem_type, file.shape, data).map_err(invalid)?;
  Ok((file.name, tensor))
}

pub fn write_tensor_file(path: &Path, name: &str, tensor: &Tensor) -> Result<()> {
  let file = TensorFile {
    name: name.to_string(),
    elem_type: tensor.elem_type,
    shape: tensor.shape.clone(),
    data: encode_data(&tensor.data),
  };
  let json = serde_json::to_string_pretty(&file).map_err(|err| Error::Tensor {
    path: path.to_path_buf(),
    message: err.to_string(),
  })?;
  fs::write(path, json).map_err(|err| Error::io(path, err))
}

fn decode_data(elem_type: ElementType, values: &[Value]) -> std::result::Result<TensorData, String> {
  let bad = |idx: usize, value: &Value| format!("element {idx} ({value}) is not a valid {elem_type}");

  let data = match elem_type.kind() {
    DataKind::Float => TensorData::Float(
      values
        .iter()
        .enumerate()
        .map(|(idx, value)| decode_float(value).ok_or_else(|| bad(idx, value)))
        .collect::<std::result::Result<_, _>>()?,
    ),
    DataKind::Int => TensorData::Int(
      values
        .iter()
        .enumerate()
        .map(|(idx, value)| value.as_i64().ok_or_else(|| bad(idx, value)))
        .collect::<std::result::Result<_, _>>()?,
    ),
    DataKind::Uint => TensorData::Uint(
      values
        .iter()
        .enumerate()
        .map(|(idx, value)| value.as_u64().ok_or_else(|| bad(idx, value)))
        .collect::<std::result::Result<_, _>>()?,
    ),
    DataKind::Bool => TensorData::Bool(
      values
        .iter()
        .enumerate()
        .map(|(idx, value)| value.as_bool().ok_or_else(|| bad(idx, value)))
        .collect::<std::result::Result<_, _>>()?,
    ),
    DataKind::String => TensorData::String(
      values
        .iter()
        .enumerate()
        .map(|(idx, value)| {
          value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| bad(idx, value))
        })
        .collect::<std::result::Result<_, _>>()?,
    ),
  };
  Ok(data)
}

// JSON has no NaN or infinity literals, so those travel as strings.
fn decode_float(value: &Value) -> Option<f64> {
  match value {
    Value::Number(number) => number.as_f64(),
    Value::String(raw) => match raw.to_ascii_lowercase().as_str() {
      "nan" => Some(f64::NAN),
      "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
      "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
      _ => None,
    },
    _ => None,
  }
}

fn encode_float(value: f64) -> Value {
  match Number::from_f64(value) {
    Some(number) => Value::Number(number),
    None if value.is_nan() => Value::String("nan".to_string()),
    None if value > 0.0 => Value::String("inf".to_string()),
    None => Value::String("-inf".to_string()),
  }
}

fn encode_data(data: &TensorData) -> Vec<Value> {
  match data {
    TensorData::Float(values) => values.iter().copied().map(encode_float).collect(),
    TensorData::Int(values) => values.iter().map(|v| Value::from(*v)).collect(),
    TensorData::Uint(values) => values.iter().map(|v| Value::from(*v)).collect(),
    TensorData::Bool(values) => values.iter().map(|v| Value::Bool(*v)).collect(),
    TensorData::String(values) => values.iter().map(|v| Value::String(v.clone())).collect(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn reads_floats_with_non_finite_markers() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("output_0.json");
    fs::write(
      &path,
      r#"{"name": "y", "elem_type": "float32", "shape": [2, 2], "data": [1.5, "nan", "inf", "-inf"]}"#,
    )
    .unwrap();

    let (name, tensor) = read_tensor_file(&path).unwrap();
    assert_eq!(name, "y");
    assert_eq!(tensor.shape, vec![2, 2]);
    let TensorData::Float(values) = &tensor.data else {
      panic!("expected float data, got {:?}", tensor.data);
    };
    assert_eq!(values[0], 1.5);
    assert!(values[1].is_nan());
    assert_eq!(values[2], f64::INFINITY);
    assert_eq!(values[3], f64::NEG_INFINITY);
  }

  #[test]
  fn scalar_shape_holds_one_element() {
    let tensor = Tensor::new(ElementType::Int64, vec![], TensorData::Int(vec![7])).unwrap();
    assert_eq!(tensor.rank(), 0);
    assert_eq!(tensor.element_count(), 1);
  }

  #[test]
  fn rejects_element_count_disagreeing_with_shape() {
    let err = Tensor::new(ElementType::Float32, vec![3], TensorData::Float(vec![1.0])).unwrap_err();
    assert!(err.contains("requires 3 elements"), "{err}");
  }

  #[test]
  fn rejects_data_of_the_wrong_kind() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("input_0.json");
    fs::write(
      &path,
      r#"{"name": "x", "elem_type": "int32", "shape": [1], "data": [true]}"#,
    )
    .unwrap();

    let err = read_tensor_file(&path).unwrap_err();
    assert!(err.to_string().contains("not a valid int32"), "{err}");
  }

  #[test]
  fn written_files_keep_non_finite_values() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("output_0.json");
    let tensor = Tensor::new(
      ElementType::Float64,
      vec![3],
      TensorData::Float(vec![f64::NAN, f64::NEG_INFINITY, 0.25]),
    )
    .unwrap();

    write_tensor_file(&path, "z", &tensor).unwrap();
    let (name, loaded) = read_tensor_file(&path).unwrap();
    assert_eq!(name, "z");
    let TensorData::Float(values) = &loaded.data else {
      panic!("expected float data");
    };
    assert!(values[0].is_nan());
    assert_eq!(values[1], f64::NEG_INFINITY);
    assert_eq!(values[2], 0.25);
  }
}
