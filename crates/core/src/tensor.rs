use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

/// Largest integer a JSON consumer can hold in a double without losing precision.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Element type of a tensor, spelled the way the WebNN API spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    Int8,
    Uint8,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Int4,
    Uint4,
}

/// Represents a type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDescriptor {
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    pub shape: Vec<usize>,
}

/// A tensor as it travels over the wire: a descriptor plus flat element values.
///
/// 64-bit integer elements are decimal strings and non-finite floats are the
/// strings `"NaN"`, `"Infinity"` and `"-Infinity"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeTensor {
    pub descriptor: TensorDescriptor,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown data type '{0}'")]
pub struct UnknownDataType(pub String);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    #[error("Data length mismatch: shape {shape:?} holds {expected} elements, got {actual}")]
    DataLength {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid {data_type} element: {value}")]
    InvalidElement { data_type: DataType, value: Value },

    #[error("{value} is out of range for {data_type}")]
    OutOfRange { data_type: DataType, value: String },

    #[error("Shape {0:?} holds too many elements")]
    TooLarge(Vec<usize>),
}

impl DataType {
    pub const ALL: [DataType; 10] = [
        DataType::Float32,
        DataType::Float16,
        DataType::Int8,
        DataType::Uint8,
        DataType::Int32,
        DataType::Uint32,
        DataType::Int64,
        DataType::Uint64,
        DataType::Int4,
        DataType::Uint4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float16 => "float16",
            DataType::Int8 => "int8",
            DataType::Uint8 => "uint8",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Int64 => "int64",
            DataType::Uint64 => "uint64",
            DataType::Int4 => "int4",
            DataType::Uint4 => "uint4",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float16)
    }

    pub fn is_64bit_int(&self) -> bool {
        matches!(self, Self::Int64 | Self::Uint64)
    }

    /// Inclusive value range of an integer type. `None` for floating types.
    pub fn int_range(&self) -> Option<(i128, i128)> {
        match self {
            DataType::Float32 | DataType::Float16 => None,
            DataType::Int8 => Some((i8::MIN as i128, i8::MAX as i128)),
            DataType::Uint8 => Some((0, u8::MAX as i128)),
            DataType::Int32 => Some((i32::MIN as i128, i32::MAX as i128)),
            DataType::Uint32 => Some((0, u32::MAX as i128)),
            DataType::Int64 => Some((i64::MIN as i128, i64::MAX as i128)),
            DataType::Uint64 => Some((0, u64::MAX as i128)),
            DataType::Int4 => Some((-8, 7)),
            DataType::Uint4 => Some((0, 15)),
        }
    }
}

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| UnknownDataType(s.to_string()))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TensorDescriptor {
    pub fn new(data_type: DataType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            data_type,
            shape: shape.into(),
        }
    }

    pub fn element_count(&self) -> Option<usize> {
        element_count(&self.shape)
    }

    /// The element count, rejecting shapes above `MAX_ELEMENTS`.
    pub fn checked_element_count(&self) -> Result<usize, TensorError> {
        self.element_count()
            .filter(|&n| n <= MAX_ELEMENTS)
            .ok_or_else(|| TensorError::TooLarge(self.shape.clone()))
    }
}

/// Largest tensor the harness materializes.
pub const MAX_ELEMENTS: usize = 1 << 24;

/// Number of elements a tensor of `shape` holds, `None` on overflow. A
/// 0-dimensional tensor holds one.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

impl RuntimeTensor {
    /// Creates a tensor, re-encoding every element for the descriptor's type.
    pub fn new(descriptor: TensorDescriptor, data: Vec<Value>) -> Result<Self, TensorError> {
        let expected = descriptor.checked_element_count()?;
        if data.len() != expected {
            return Err(TensorError::DataLength {
                shape: descriptor.shape,
                expected,
                actual: data.len(),
            });
        }
        let data = data
            .iter()
            .map(|v| encode_element(descriptor.data_type, v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { descriptor, data })
    }

    pub fn from_f32(shape: impl Into<Vec<usize>>, data: &[f32]) -> Result<Self, TensorError> {
        Self::new(
            TensorDescriptor::new(DataType::Float32, shape),
            data.iter().map(|&x| encode_f64(x as f64)).collect(),
        )
    }

    pub fn from_i64(shape: impl Into<Vec<usize>>, data: &[i64]) -> Result<Self, TensorError> {
        Self::new(
            TensorDescriptor::new(DataType::Int64, shape),
            data.iter().map(|&x| encode_i64(x)).collect(),
        )
    }

    pub fn data_type(&self) -> DataType {
        self.descriptor.data_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.descriptor.shape
    }

    pub fn verify(&self) -> bool {
        self.descriptor.element_count() == Some(self.data.len())
    }
}

pub fn encode_i64(value: i64) -> Value {
    Value::String(value.to_string())
}

pub fn encode_u64(value: u64) -> Value {
    Value::String(value.to_string())
}

pub fn decode_i64(value: &Value) -> Result<i64, TensorError> {
    let wide = decode_int(DataType::Int64, value)?;
    i64::try_from(wide).map_err(|_| TensorError::OutOfRange {
        data_type: DataType::Int64,
        value: wide.to_string(),
    })
}

pub fn decode_u64(value: &Value) -> Result<u64, TensorError> {
    let wide = decode_int(DataType::Uint64, value)?;
    u64::try_from(wide).map_err(|_| TensorError::OutOfRange {
        data_type: DataType::Uint64,
        value: wide.to_string(),
    })
}

/// Reads an integer element given either as a JSON number or as a decimal string.
pub fn decode_int(data_type: DataType, value: &Value) -> Result<i128, TensorError> {
    let invalid = || TensorError::InvalidElement {
        data_type,
        value: value.clone(),
    };
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i as i128)
            } else if let Some(u) = n.as_u64() {
                Ok(u as i128)
            } else {
                let f = n.as_f64().ok_or_else(invalid)?;
                if f.fract() == 0.0 && f.abs() < 1.7e38 {
                    Ok(f as i128)
                } else {
                    Err(invalid())
                }
            }
        }
        Value::String(s) => s.trim().parse::<i128>().map_err(|_| invalid()),
        Value::Bool(b) => Ok(*b as i128),
        _ => Err(invalid()),
    }
}

/// Encodes a floating value the way the backend expects it.
pub fn encode_f64(value: f64) -> Value {
    if value.is_nan() {
        Value::String("NaN".to_string())
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            Value::String("Infinity".to_string())
        } else {
            Value::String("-Infinity".to_string())
        }
    } else if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

pub fn decode_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.trim() {
            "NaN" => Some(f64::NAN),
            "Infinity" | "+Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            other => other.parse::<f64>().ok(),
        },
        Value::Bool(b) => Some(*b as u8 as f64),
        _ => None,
    }
}

/// Converts one element into its wire form for `data_type`.
pub fn encode_element(data_type: DataType, value: &Value) -> Result<Value, TensorError> {
    if data_type.is_64bit_int() {
        let wide = decode_int(data_type, value)?;
        check_range(data_type, wide)?;
        return Ok(Value::String(wide.to_string()));
    }

    let x = decode_f64(value).ok_or_else(|| TensorError::InvalidElement {
        data_type,
        value: value.clone(),
    })?;
    if !data_type.is_float() && x.is_finite() && x.fract() == 0.0 {
        check_range(data_type, x as i128)?;
    }
    Ok(encode_f64(x))
}

fn check_range(data_type: DataType, value: i128) -> Result<(), TensorError> {
    match data_type.int_range() {
        Some((lo, hi)) if value < lo || value > hi => Err(TensorError::OutOfRange {
            data_type,
            value: value.to_string(),
        }),
        _ => Ok(()),
    }
}

impl fmt::Display for RuntimeTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX_ELEMS: usize = 10;

        write!(
            f,
            "RuntimeTensor({:?}, {}, ",
            self.descriptor.shape, self.descriptor.data_type
        )?;
        let data = &self.data;
        if data.len() > MAX_ELEMS {
            write!(f, "[")?;
            for e in data[0..MAX_ELEMS / 2].iter() {
                write!(f, "{e}, ")?;
            }
            write!(f, "...")?;
            for e in data[data.len() - MAX_ELEMS / 2..].iter() {
                write!(f, ", {e}")?;
            }
            write!(f, "]")?;
        } else {
            write!(f, "[")?;
            for (i, e) in data.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{e}")?;
            }
            write!(f, "]")?;
        }
        write!(f, ")")
    }
}

#[test]
fn test_data_type_names() {
    for ty in DataType::ALL {
        assert_eq!(ty.as_str().parse::<DataType>().unwrap(), ty);
        assert_eq!(
            serde_json::to_value(ty).unwrap(),
            Value::String(ty.as_str().to_string())
        );
    }
    assert!("bool".parse::<DataType>().is_err());
    assert!(DataType::Float16.is_float());
    assert!(!DataType::Int4.is_float());
    assert!(DataType::Uint64.is_64bit_int());
    assert!(!DataType::Int32.is_64bit_int());
}

#[test]
fn test_element_count() {
    assert_eq!(element_count(&[]), Some(1));
    assert_eq!(element_count(&[2, 3, 4]), Some(24));
    assert_eq!(element_count(&[2, 0]), Some(0));
    assert_eq!(element_count(&[usize::MAX, 2, 1]), None);

    let huge = TensorDescriptor::new(DataType::Float32, vec![usize::MAX, 2, 1]);
    assert_eq!(
        RuntimeTensor::new(huge, vec![]),
        Err(TensorError::TooLarge(vec![usize::MAX, 2, 1]))
    );
    let big = TensorDescriptor::new(DataType::Float32, vec![MAX_ELEMENTS + 1]);
    assert!(big.element_count().is_some());
    assert!(big.checked_element_count().is_err());
}

#[test]
fn create_tensors() {
    let t = RuntimeTensor::from_f32(vec![2, 2], &[1.0, 2.5, -3.0, 4.0]).unwrap();
    assert!(t.verify());
    assert_eq!(t.data[0], Value::from(1));
    assert_eq!(t.data[1], Value::from(2.5));

    let err = RuntimeTensor::from_f32(vec![2, 2], &[1.0]).unwrap_err();
    assert!(matches!(
        err,
        TensorError::DataLength {
            expected: 4,
            actual: 1,
            ..
        }
    ));

    let scalar = RuntimeTensor::from_f32(Vec::<usize>::new(), &[7.0]).unwrap();
    assert!(scalar.verify());
}

#[test]
fn test_int64_elements_are_strings() {
    let t = RuntimeTensor::from_i64(vec![3], &[i64::MIN, 0, i64::MAX]).unwrap();
    assert_eq!(t.data[0], Value::String("-9223372036854775808".into()));
    assert_eq!(t.data[2], Value::String("9223372036854775807".into()));
    assert_eq!(decode_i64(&t.data[0]).unwrap(), i64::MIN);
    assert_eq!(decode_u64(&encode_u64(u64::MAX)).unwrap(), u64::MAX);
}

#[test]
fn test_non_finite_encoding() {
    assert_eq!(encode_f64(f64::NAN), Value::String("NaN".into()));
    assert_eq!(encode_f64(f64::NEG_INFINITY), Value::String("-Infinity".into()));
    assert!(decode_f64(&encode_f64(f64::NAN)).unwrap().is_nan());
    assert_eq!(
        decode_f64(&Value::String("Infinity".into())),
        Some(f64::INFINITY)
    );
}

#[test]
fn test_integer_range_checks() {
    let desc = TensorDescriptor::new(DataType::Int8, vec![2]);
    assert!(RuntimeTensor::new(desc.clone(), vec![Value::from(-128), Value::from(127)]).is_ok());
    assert!(matches!(
        RuntimeTensor::new(desc, vec![Value::from(0), Value::from(128)]),
        Err(TensorError::OutOfRange { .. })
    ));
    let desc = TensorDescriptor::new(DataType::Uint4, vec![1]);
    assert!(RuntimeTensor::new(desc, vec![Value::from(16)]).is_err());
}

#[test]
fn dump_tensor() {
    let t = RuntimeTensor::from_f32(vec![12], &[0.5; 12]).unwrap();
    assert_eq!(
        t.to_string(),
        "RuntimeTensor([12], float32, [0.5, 0.5, 0.5, 0.5, 0.5, ..., 0.5, 0.5, 0.5, 0.5, 0.5])"
    );
}
