use std::{borrow::Cow, collections::BTreeMap, fmt};

use serde_json::Value;
use thiserror::Error;

use crate::{
    normalize::NormalizedGraph,
    tensor::{decode_f64, decode_int, DataType, RuntimeTensor},
    tolerance::{tolerance_for, Tolerance},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerificationError {
    #[error("Data length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Value mismatch at {0}")]
    ValueMismatch(Mismatch),

    #[error("Invalid element at index {index}: {value}")]
    InvalidElement { index: usize, value: Value },

    #[error("Missing output '{0}'")]
    MissingOutput(String),

    #[error("Output '{name}': {source}")]
    Output {
        name: String,
        #[source]
        source: Box<VerificationError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    Int(i128),
    Float(f64),
}

/// A single element outside its budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub index: usize,
    pub expected: Element,
    pub actual: Element,
    pub abs_diff: f64,
    pub ulp_distance: f64,
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Int(i) => write!(f, "{i}"),
            Element::Float(x) if x.is_nan() => write!(f, "NaN"),
            Element::Float(x) if x.is_infinite() => {
                write!(f, "{}Infinity", if *x < 0.0 { "-" } else { "" })
            }
            Element::Float(x) => write!(f, "{x}"),
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index {}: expected {}, got {} (abs diff {:e}, ulp distance {})",
            self.index, self.expected, self.actual, self.abs_diff, self.ulp_distance
        )
    }
}

/// Checks `actual` against `expected` for operator `op`, stopping at the first
/// violation. Length is checked before shape and shape before values.
pub fn verify(
    op: &str,
    expected: &RuntimeTensor,
    actual: &RuntimeTensor,
) -> Result<(), VerificationError> {
    check_layout(expected, actual)?;
    let data_type = expected.data_type();
    let tolerance = tolerance_for(op, data_type);
    for (index, (e, a)) in expected.data.iter().zip(actual.data.iter()).enumerate() {
        if let Some(mismatch) = compare(index, data_type, tolerance, e, a)? {
            return Err(VerificationError::ValueMismatch(mismatch));
        }
    }
    Ok(())
}

/// Like [`verify`] but gathers every element mismatch instead of stopping at the first.
pub fn collect_mismatches(
    op: &str,
    expected: &RuntimeTensor,
    actual: &RuntimeTensor,
) -> Result<Vec<Mismatch>, VerificationError> {
    check_layout(expected, actual)?;
    let data_type = expected.data_type();
    let tolerance = tolerance_for(op, data_type);
    let mut mismatches = vec![];
    for (index, (e, a)) in expected.data.iter().zip(actual.data.iter()).enumerate() {
        if let Some(mismatch) = compare(index, data_type, tolerance, e, a)? {
            mismatches.push(mismatch);
        }
    }
    Ok(mismatches)
}

/// Verifies every expected output of `graph`. Each output is judged with the
/// budget of the operator that produces it.
pub fn verify_outputs(
    graph: &NormalizedGraph,
    actual: &BTreeMap<String, RuntimeTensor>,
) -> Result<(), VerificationError> {
    for (name, expected) in &graph.expected_outputs {
        let actual = actual
            .get(name)
            .ok_or_else(|| VerificationError::MissingOutput(name.clone()))?;
        let op = graph.operator_for_output(name).unwrap_or("identity");
        let actual = expand_compact(expected, actual);
        verify(op, expected, &actual).map_err(|source| VerificationError::Output {
            name: name.clone(),
            source: Box::new(source),
        })?;
    }
    Ok(())
}

/// Backends may answer a uniform output with a single element. Such an
/// answer stands for the whole tensor when its shape matches.
fn expand_compact<'a>(expected: &RuntimeTensor, actual: &'a RuntimeTensor) -> Cow<'a, RuntimeTensor> {
    match actual.data.as_slice() {
        [value] if expected.data.len() > 1 && expected.shape() == actual.shape() => {
            Cow::Owned(RuntimeTensor {
                descriptor: actual.descriptor.clone(),
                data: vec![value.clone(); expected.data.len()],
            })
        }
        _ => Cow::Borrowed(actual),
    }
}

fn check_layout(expected: &RuntimeTensor, actual: &RuntimeTensor) -> Result<(), VerificationError> {
    if expected.data.len() != actual.data.len() {
        return Err(VerificationError::LengthMismatch {
            expected: expected.data.len(),
            actual: actual.data.len(),
        });
    }
    if expected.shape() != actual.shape() {
        return Err(VerificationError::ShapeMismatch {
            expected: expected.shape().to_vec(),
            actual: actual.shape().to_vec(),
        });
    }
    Ok(())
}

fn compare(
    index: usize,
    data_type: DataType,
    tolerance: Tolerance,
    expected: &Value,
    actual: &Value,
) -> Result<Option<Mismatch>, VerificationError> {
    let invalid = |value: &Value| VerificationError::InvalidElement {
        index,
        value: value.clone(),
    };

    // A ULP budget only means something for floating types.
    if !data_type.is_float() {
        let e = decode_int(data_type, expected).map_err(|_| invalid(expected))?;
        let a = decode_int(data_type, actual).map_err(|_| invalid(actual))?;
        if e == a {
            return Ok(None);
        }
        return Ok(Some(Mismatch {
            index,
            expected: Element::Int(e),
            actual: Element::Int(a),
            abs_diff: (e - a).abs() as f64,
            ulp_distance: f64::INFINITY,
        }));
    }

    let e = decode_f64(expected).ok_or_else(|| invalid(expected))?;
    let a = decode_f64(actual).ok_or_else(|| invalid(actual))?;
    if within(e, a, tolerance) {
        return Ok(None);
    }
    Ok(Some(Mismatch {
        index,
        expected: Element::Float(e),
        actual: Element::Float(a),
        abs_diff: (a - e).abs(),
        ulp_distance: ulp_distance(a as f32, e as f32),
    }))
}

fn within(expected: f64, actual: f64, tolerance: Tolerance) -> bool {
    if expected.is_nan() || actual.is_nan() {
        return expected.is_nan() && actual.is_nan();
    }
    if !expected.is_finite() || !actual.is_finite() {
        return expected == actual;
    }
    (actual - expected).abs() <= tolerance.abs
        || ulp_distance(actual as f32, expected as f32) <= tolerance.ulp as f64
}

/// Distance between `a` and `b` in units of the last place of an `f32`.
/// Adjacent representable values are 1 apart and `-0.0` equals `0.0`.
///
/// Infinite when either side is NaN or exactly one side is non-finite.
pub fn ulp_distance(a: f32, b: f32) -> f64 {
    if a.is_nan() || b.is_nan() || a.is_finite() != b.is_finite() {
        return f64::INFINITY;
    }
    (ordered_bits(a) - ordered_bits(b)).abs() as f64
}

fn ordered_bits(x: f32) -> i64 {
    let bits = x.to_bits();
    if bits & 0x8000_0000 != 0 {
        -((bits & 0x7fff_ffff) as i64)
    } else {
        bits as i64
    }
}

#[cfg(test)]
fn f32_tensor(shape: &[usize], data: &[f32]) -> RuntimeTensor {
    RuntimeTensor::from_f32(shape, data).unwrap()
}

#[test]
fn add_within_one_ulp() {
    let expected = f32_tensor(&[1], &[1.0]);
    assert!(verify("add", &expected, &f32_tensor(&[1], &[1.000_000_1])).is_ok());
    assert!(matches!(
        verify("add", &expected, &f32_tensor(&[1], &[1.001])),
        Err(VerificationError::ValueMismatch(Mismatch { index: 0, .. }))
    ));
}

#[test]
fn shape_checked_before_values() {
    let expected = f32_tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let actual = f32_tensor(&[4], &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(
        verify("relu", &expected, &actual),
        Err(VerificationError::ShapeMismatch {
            expected: vec![2, 2],
            actual: vec![4]
        })
    );

    let actual = f32_tensor(&[3], &[9.0, 9.0, 9.0]);
    assert_eq!(
        verify("relu", &expected, &actual),
        Err(VerificationError::LengthMismatch {
            expected: 4,
            actual: 3
        })
    );
}

#[test]
fn exact_match_passes_for_every_type() {
    use crate::tensor::TensorDescriptor;

    for ty in DataType::ALL {
        let data = vec![Value::from(0), Value::from(1), Value::from(7)];
        let t = RuntimeTensor::new(TensorDescriptor::new(ty, vec![3]), data).unwrap();
        assert!(verify("relu", &t, &t.clone()).is_ok(), "{ty}");
    }
}

#[test]
fn non_finite_values() {
    let expected = f32_tensor(&[3], &[f32::NAN, f32::INFINITY, 1.0]);
    assert!(verify("exp", &expected, &expected.clone()).is_ok());

    let actual = f32_tensor(&[3], &[f32::NAN, f32::NEG_INFINITY, 1.0]);
    let err = verify("exp", &expected, &actual).unwrap_err();
    assert!(matches!(
        err,
        VerificationError::ValueMismatch(Mismatch { index: 1, .. })
    ));

    let actual = f32_tensor(&[3], &[0.0, f32::INFINITY, 1.0]);
    assert!(verify("exp", &expected, &actual).is_err());
}

#[test]
fn int64_requires_exact_equality() {
    let expected = RuntimeTensor::from_i64(vec![2], &[i64::MAX, 1]).unwrap();
    let actual = RuntimeTensor::from_i64(vec![2], &[i64::MAX - 1, 1]).unwrap();
    match verify("add", &expected, &actual) {
        Err(VerificationError::ValueMismatch(m)) => {
            assert_eq!(m.expected, Element::Int(i64::MAX as i128));
            assert_eq!(m.abs_diff, 1.0);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn integers_require_exact_equality() {
    use crate::tensor::TensorDescriptor;

    let tensor = |ty, v: u64| {
        RuntimeTensor::new(TensorDescriptor::new(ty, vec![1]), vec![Value::from(v)]).unwrap()
    };
    for (ty, e, a) in [
        (DataType::Int32, 16_777_216, 16_777_217),
        (DataType::Int32, 16_777_214, 16_777_215),
        (DataType::Uint32, 4_000_000_000, 4_000_000_200),
        (DataType::Uint8, 200, 201),
    ] {
        assert_eq!(
            verify("add", &tensor(ty, e), &tensor(ty, a)),
            Err(VerificationError::ValueMismatch(Mismatch {
                index: 0,
                expected: Element::Int(e as i128),
                actual: Element::Int(a as i128),
                abs_diff: (a - e) as f64,
                ulp_distance: f64::INFINITY,
            })),
            "{ty}"
        );
    }
}

#[test]
fn collect_every_mismatch() {
    let expected = f32_tensor(&[4], &[1.0, 2.0, 3.0, 4.0]);
    let actual = f32_tensor(&[4], &[1.5, 2.0, 3.5, 4.0]);
    let mismatches = collect_mismatches("relu", &expected, &actual).unwrap();
    assert_eq!(
        mismatches.iter().map(|m| m.index).collect::<Vec<_>>(),
        vec![0, 2]
    );
    assert_eq!(mismatches[0].abs_diff, 0.5);
}

#[test]
fn test_ulp_distance() {
    assert_eq!(ulp_distance(1.0, 1.0), 0.0);
    assert_eq!(ulp_distance(0.0, -0.0), 0.0);
    assert_eq!(ulp_distance(1.0, f32::from_bits(1.0f32.to_bits() + 1)), 1.0);
    assert_eq!(ulp_distance(f32::from_bits(1), -f32::from_bits(1)), 2.0);
    assert_eq!(ulp_distance(f32::INFINITY, 1.0), f64::INFINITY);
    assert_eq!(ulp_distance(f32::NAN, f32::NAN), f64::INFINITY);
}

#[test]
fn compact_outputs_expand() {
    let expected = f32_tensor(&[2, 2], &[0.5; 4]);
    let compact = RuntimeTensor {
        descriptor: expected.descriptor.clone(),
        data: vec![serde_json::json!(0.5)],
    };
    assert!(matches!(
        expand_compact(&expected, &compact),
        Cow::Owned(ref t) if verify("relu", &expected, t).is_ok()
    ));

    let flat = f32_tensor(&[1], &[0.5]);
    assert!(matches!(expand_compact(&expected, &flat), Cow::Borrowed(_)));
}

#[test]
fn mismatch_display() {
    let m = Mismatch {
        index: 3,
        expected: Element::Float(1.0),
        actual: Element::Float(f64::NEG_INFINITY),
        abs_diff: f64::INFINITY,
        ulp_distance: f64::INFINITY,
    };
    assert_eq!(
        m.to_string(),
        "index 3: expected 1, got -Infinity (abs diff inf, ulp distance inf)"
    );
}
