/// Operators the graph builder accepts, by their WebNN method name.
///
/// <https://www.w3.org/TR/webnn/#api-mlgraphbuilder>
pub const KNOWN_OPERATORS: &[&str] = &[
    "abs",
    "add",
    "argMax",
    "argMin",
    "averagePool2d",
    "batchNormalization",
    "cast",
    "ceil",
    "clamp",
    "concat",
    "conv2d",
    "convTranspose2d",
    "cos",
    "cumulativeSum",
    "dequantizeLinear",
    "div",
    "elu",
    "equal",
    "erf",
    "exp",
    "expand",
    "floor",
    "gather",
    "gatherElements",
    "gatherND",
    "gelu",
    "gemm",
    "greater",
    "greaterOrEqual",
    "gru",
    "gruCell",
    "hardSigmoid",
    "hardSwish",
    "identity",
    "instanceNormalization",
    "isInfinite",
    "isNaN",
    "l2Pool2d",
    "layerNormalization",
    "leakyRelu",
    "lesser",
    "lesserOrEqual",
    "linear",
    "log",
    "logicalAnd",
    "logicalNot",
    "logicalOr",
    "logicalXor",
    "lstm",
    "lstmCell",
    "matmul",
    "max",
    "maxPool2d",
    "min",
    "mul",
    "neg",
    "notEqual",
    "pad",
    "pow",
    "prelu",
    "quantizeLinear",
    "reciprocal",
    "reduceL1",
    "reduceL2",
    "reduceLogSum",
    "reduceLogSumExp",
    "reduceMax",
    "reduceMean",
    "reduceMin",
    "reduceProduct",
    "reduceSum",
    "reduceSumSquare",
    "relu",
    "resample2d",
    "reshape",
    "reverse",
    "roundEven",
    "scatterElements",
    "scatterND",
    "sigmoid",
    "sign",
    "sin",
    "slice",
    "softmax",
    "softplus",
    "softsign",
    "split",
    "sqrt",
    "sub",
    "tan",
    "tanh",
    "tile",
    "transpose",
    "triangular",
    "where",
];

pub fn is_known_operator(name: &str) -> bool {
    KNOWN_OPERATORS.contains(&name)
}

#[test]
fn test_known_operators() {
    use rustc_hash::FxHashSet;

    let unique = KNOWN_OPERATORS.iter().collect::<FxHashSet<_>>();
    assert_eq!(unique.len(), KNOWN_OPERATORS.len());
    assert!(is_known_operator("conv2d"));
    assert!(is_known_operator("where"));
    assert!(!is_known_operator("Conv2d"));
    assert!(!is_known_operator("build"));
}
