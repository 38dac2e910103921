pub mod matmul;
pub mod transpose;

use self::transpose::Perm;
use crate::shape::{display_comma, Shape, ShapeError};
use crate::tensor::TensorId;
use std::fmt::{Debug, Formatter};

// handle into a graph's operator table; like TensorId, never reused
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl Debug for OpId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

// opcode plus its payload; infer_shape dispatches on the variant
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    MatMul { trans_a: bool, trans_b: bool },
    Transpose { perm: Perm },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::MatMul { .. } => "MatMul",
            OpKind::Transpose { .. } => "Transpose",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            OpKind::MatMul { .. } => 2,
            OpKind::Transpose { .. } => 1,
        }
    }

    pub fn infer_shape(&self, inputs: &[&Shape]) -> Result<Vec<Shape>, ShapeError> {
        match self {
            OpKind::MatMul { trans_a, trans_b } => {
                matmul::infer(inputs[0], inputs[1], *trans_a, *trans_b).map(|s| vec![s])
            }
            OpKind::Transpose { perm } => transpose::infer(inputs[0], perm).map(|s| vec![s]),
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::MatMul { trans_a, trans_b } => write!(
                f,
                "MatMul({}, {})",
                if *trans_a { "A^T" } else { "A" },
                if *trans_b { "B^T" } else { "B" },
            ),
            OpKind::Transpose { perm } => write!(f, "Transpose([{}])", display_comma(perm)),
        }
    }
}

pub struct Operator {
    uid: usize,
    pub kind: OpKind,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) predecessors: Vec<OpId>,
    pub(crate) successors: Vec<OpId>,
}

impl Operator {
    pub(crate) fn new(uid: usize, kind: OpKind, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Operator {
        Operator {
            uid,
            kind,
            inputs,
            outputs,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn uid(&self) -> usize {
        self.uid
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn output(&self) -> TensorId {
        self.outputs[0]
    }

    pub fn predecessors(&self) -> &[OpId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[OpId] {
        &self.successors
    }

    pub(crate) fn add_predecessor(&mut self, op: OpId) {
        if !self.predecessors.contains(&op) {
            self.predecessors.push(op);
        }
    }

    pub(crate) fn add_successor(&mut self, op: OpId) {
        if !self.successors.contains(&op) {
            self.successors.push(op);
        }
    }

    pub(crate) fn remove_predecessor(&mut self, op: OpId) {
        self.predecessors.retain(|p| *p != op);
    }

    pub(crate) fn remove_successor(&mut self, op: OpId) {
        self.successors.retain(|s| *s != op);
    }
}

impl Debug for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "op{} {}, in {:?}, out {:?}",
            self.uid, self.kind, self.inputs, self.outputs
        )
    }
}
