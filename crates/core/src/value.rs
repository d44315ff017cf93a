use std::ops::{Index, IndexMut};

use id_arena::{Arena, Id};

use crate::tensor::TensorDescriptor;

/// Handle to an operand created by a [`GraphBuilder`](crate::builder::GraphBuilder).
///
/// Only meaningful for the builder session that allocated it.
pub type OperandId = Id<Operand>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Input,
    Constant,
    /// Produced by an operator. Its type and shape stay unresolved until the
    /// backend computes them.
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operand {
    pub name: String,
    pub descriptor: Option<TensorDescriptor>,
    pub kind: OperandKind,
}

#[derive(Debug, Default, Clone)]
pub struct OperandArena(Arena<Operand>);

impl OperandArena {
    pub fn new_input(&mut self, name: impl Into<String>, descriptor: TensorDescriptor) -> OperandId {
        self.0.alloc(Operand {
            name: name.into(),
            descriptor: Some(descriptor),
            kind: OperandKind::Input,
        })
    }

    pub fn new_constant(
        &mut self,
        name: impl Into<String>,
        descriptor: TensorDescriptor,
    ) -> OperandId {
        self.0.alloc(Operand {
            name: name.into(),
            descriptor: Some(descriptor),
            kind: OperandKind::Constant,
        })
    }

    pub fn new_output(&mut self, name: impl Into<String>) -> OperandId {
        self.0.alloc(Operand {
            name: name.into(),
            descriptor: None,
            kind: OperandKind::Output,
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub fn inner(&self) -> &Arena<Operand> {
        &self.0
    }
}

impl Index<OperandId> for OperandArena {
    type Output = Operand;

    fn index(&self, index: OperandId) -> &Self::Output {
        &self.0[index]
    }
}

impl IndexMut<OperandId> for OperandArena {
    fn index_mut(&mut self, index: OperandId) -> &mut Self::Output {
        &mut self.0[index]
    }
}
