use serde_json::{Map, Value};

/// One argument of an operator invocation before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// A single operand reference.
    Operand(String),
    /// A list-valued operand reference, e.g. the inputs of `concat`.
    Operands(Vec<String>),
    /// An options bag.
    Options(Map<String, Value>),
    /// A keyed argument as written in a fixture (`{"axis": 1}` or `{"input": "x"}`).
    /// Whether it is an operand reference is decided by the normalizer.
    Keyed(String, Value),
}

/// An operator invocation as recorded by the builder or read from a fixture.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    pub op: String,
    pub arguments: Vec<Argument>,
    pub outputs: Vec<String>,
}

impl OperatorNode {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            arguments: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: Argument) -> Self {
        self.arguments.push(arg);
        self
    }

    pub fn with_in(self, name: impl Into<String>) -> Self {
        self.with_arg(Argument::Operand(name.into()))
    }

    pub fn with_ins(self, names: Vec<String>) -> Self {
        self.with_arg(Argument::Operands(names))
    }

    pub fn with_options(self, options: Map<String, Value>) -> Self {
        self.with_arg(Argument::Options(options))
    }

    pub fn with_out(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Renames every reference to operand `from`, both as an argument and as an output.
    pub fn rename_operand(&mut self, from: &str, to: &str) {
        for arg in &mut self.arguments {
            match arg {
                Argument::Operand(name) if name == from => *name = to.to_string(),
                Argument::Operands(names) => {
                    for name in names.iter_mut().filter(|name| *name == from) {
                        *name = to.to_string();
                    }
                }
                _ => {}
            }
        }
        for output in self.outputs.iter_mut().filter(|output| *output == from) {
            *output = to.to_string();
        }
    }
}

#[test]
fn test_rename_operand() {
    let mut node = OperatorNode::new("concat")
        .with_ins(vec!["a".into(), "b".into(), "a".into()])
        .with_in("a")
        .with_out("concat_0");
    node.rename_operand("a", "x");
    node.rename_operand("concat_0", "out");
    assert_eq!(
        node.arguments,
        vec![
            Argument::Operands(vec!["x".into(), "b".into(), "x".into()]),
            Argument::Operand("x".into()),
        ]
    );
    assert_eq!(node.outputs, vec!["out".to_string()]);
}
