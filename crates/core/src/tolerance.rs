use crate::tensor::DataType;

pub const DEFAULT_ABS_TOLERANCE: f64 = 1e-4;
pub const DEFAULT_ULP_BUDGET: u64 = 4;

/// Precision budget for one operator. An element passes when it is within
/// `abs` OR within `ulp` units in the last place of the expected value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub abs: f64,
    pub ulp: u64,
}

struct Entry {
    op: &'static str,
    abs: Option<f64>,
    ulp: u64,
}

const fn ulp(op: &'static str, ulp: u64) -> Entry {
    Entry { op, abs: None, ulp }
}

const fn abs(op: &'static str, abs: f64, ulp: u64) -> Entry {
    Entry {
        op,
        abs: Some(abs),
        ulp,
    }
}

#[rustfmt::skip]
const TABLE: &[Entry] = &[
    // Data movement and selection are exact.
    ulp("abs", 0), ulp("neg", 0), ulp("relu", 0), ulp("max", 0), ulp("min", 0),
    ulp("reshape", 0), ulp("transpose", 0), ulp("concat", 0), ulp("slice", 0),
    ulp("split", 0), ulp("gather", 0), ulp("expand", 0), ulp("pad", 0),
    ulp("identity", 0), ulp("clamp", 0), ulp("ceil", 0), ulp("floor", 0),
    ulp("roundEven", 0), ulp("tile", 0), ulp("reverse", 0), ulp("sign", 0),
    ulp("where", 0),

    ulp("add", 1), ulp("sub", 1), ulp("mul", 1), ulp("div", 2),
    ulp("sqrt", 1), ulp("reciprocal", 2), ulp("exp", 32), ulp("sigmoid", 34),
    ulp("softplus", 18), ulp("elu", 18), ulp("hardSigmoid", 2), ulp("hardSwish", 4),
    ulp("leakyRelu", 1), ulp("prelu", 1), ulp("pow", 32),

    abs("tanh", 1e-3, 16), abs("log", 1e-3, 8), abs("erf", 1e-3, 8),
    abs("sin", 1e-3, 8), abs("cos", 1e-3, 8), abs("tan", 1e-3, 16),
    abs("gelu", 1e-3, 18), abs("softmax", 1e-3, 16),
    abs("matmul", 1e-3, 16), abs("gemm", 1e-3, 16), abs("linear", 1e-3, 8),
    abs("conv2d", 1e-3, 16), abs("convTranspose2d", 1e-3, 16),
    abs("averagePool2d", 1e-3, 8), abs("l2Pool2d", 1e-3, 8),
    abs("batchNormalization", 1e-3, 8), abs("instanceNormalization", 1e-3, 8),
    abs("layerNormalization", 1e-3, 8), abs("reduceMean", 1e-3, 8),
    abs("reduceSum", 1e-3, 8), abs("reduceL2", 1e-3, 8),
    abs("reduceLogSumExp", 1e-3, 8),
];

/// Returns the budget `op` gets for elements of type `data_type`.
///
/// Non-floating types never get an absolute tolerance.
pub fn tolerance_for(op: &str, data_type: DataType) -> Tolerance {
    let entry = TABLE.iter().find(|e| e.op == op);
    let ulp = entry.map_or(DEFAULT_ULP_BUDGET, |e| e.ulp);
    let abs = if data_type.is_float() {
        entry.and_then(|e| e.abs).unwrap_or(DEFAULT_ABS_TOLERANCE)
    } else {
        0.0
    };
    Tolerance { abs, ulp }
}

#[test]
fn test_tolerance_table() {
    assert_eq!(
        tolerance_for("add", DataType::Float32),
        Tolerance { abs: 1e-4, ulp: 1 }
    );
    assert_eq!(tolerance_for("relu", DataType::Float16).ulp, 0);
    assert_eq!(tolerance_for("matmul", DataType::Float32).abs, 1e-3);
    assert_eq!(
        tolerance_for("cumulativeSum", DataType::Float32),
        Tolerance {
            abs: DEFAULT_ABS_TOLERANCE,
            ulp: DEFAULT_ULP_BUDGET
        }
    );
    assert_eq!(tolerance_for("matmul", DataType::Int32).abs, 0.0);

    let unique = TABLE
        .iter()
        .map(|e| e.op)
        .collect::<rustc_hash::FxHashSet<_>>();
    assert_eq!(unique.len(), TABLE.len());
    assert!(TABLE.iter().all(|e| crate::op::is_known_operator(e.op)));
}
