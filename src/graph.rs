pub mod rewrite;

use crate::error::Error;
use crate::memory::Allocator;
use crate::ops::transpose::Perm;
use crate::ops::{OpId, OpKind, Operator};
use crate::runtime::Runtime;
use crate::shape::Shape;
use crate::tensor::{DataType, Storage, Tensor, TensorId};
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug, Eq, PartialEq)]
pub enum GraphError {
    #[error("operator dependencies contain a cycle")]
    CycleDetected,

    #[error("graph invariant violated: {}", .which)]
    InvariantViolated { which: String },

    #[error("no tensor with fuid {}", .fuid)]
    UnknownTensor { fuid: usize },

    #[error("no {} kernel for {}", .op, .dtype)]
    UnsupportedKernel { op: &'static str, dtype: DataType },
}

// tensors and operators live in id-keyed slot tables and reference each
// other only through ids resolved here; slots are never reused, so the
// slot index doubles as the node's uid
pub struct Graph {
    runtime: Rc<dyn Runtime>,
    pub(crate) allocator: Allocator,
    tensors: Vec<Option<Tensor>>,
    ops: Vec<Option<Operator>>,
    pub(crate) op_order: Vec<OpId>,
    outputs: Vec<TensorId>,
    pub(crate) sorted: bool,
    next_fuid: usize,
}

impl Graph {
    pub fn new(runtime: Rc<dyn Runtime>) -> Graph {
        Graph {
            allocator: Allocator::new(Rc::clone(&runtime)),
            runtime,
            tensors: Vec::new(),
            ops: Vec::new(),
            op_order: Vec::new(),
            outputs: Vec::new(),
            sorted: true,
            next_fuid: 0,
        }
    }

    pub fn runtime(&self) -> &Rc<dyn Runtime> {
        &self.runtime
    }

    // ******************************** Accessors ******************************** //

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        self.tensors[id.0].as_ref().expect("tensor was removed")
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        self.tensors[id.0].as_mut().expect("tensor was removed")
    }

    pub fn op(&self, id: OpId) -> &Operator {
        self.ops[id.0].as_ref().expect("operator was removed")
    }

    pub(crate) fn op_mut(&mut self, id: OpId) -> &mut Operator {
        self.ops[id.0].as_mut().expect("operator was removed")
    }

    pub fn contains_tensor(&self, id: TensorId) -> bool {
        self.tensors.get(id.0).map_or(false, Option::is_some)
    }

    pub fn contains_op(&self, id: OpId) -> bool {
        self.ops.get(id.0).map_or(false, Option::is_some)
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.iter().flatten()
    }

    pub fn tensor_ids(&self) -> Vec<TensorId> {
        (0..self.tensors.len())
            .filter(|i| self.tensors[*i].is_some())
            .map(TensorId)
            .collect()
    }

    pub fn ops_in_order(&self) -> impl Iterator<Item = &Operator> {
        self.op_order.iter().map(|id| self.op(*id))
    }

    pub fn op_order(&self) -> &[OpId] {
        &self.op_order
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.iter().flatten().count()
    }

    pub fn op_count(&self) -> usize {
        self.op_order.len()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    // tensors no operator produces
    pub fn input_ids(&self) -> Vec<TensorId> {
        self.tensor_ids()
            .into_iter()
            .filter(|id| self.tensor(*id).source().is_none())
            .collect()
    }

    // first tensor carrying this forwarded id, in insertion order
    pub fn get_tensor(&self, fuid: usize) -> Option<TensorId> {
        self.tensor_ids()
            .into_iter()
            .find(|id| self.tensor(*id).fuid() == fuid)
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn mem_used(&self) -> usize {
        self.allocator.mem_used()
    }

    pub fn mem_peak(&self) -> usize {
        self.allocator.mem_peak()
    }

    // ******************************** Mutation ******************************** //

    pub fn add_tensor<S>(&mut self, shape: S, dtype: DataType) -> TensorId
    where
        S: Into<Shape>,
    {
        let id = TensorId(self.tensors.len());
        let fuid = self.next_fuid;
        self.next_fuid += 1;
        self.tensors
            .push(Some(Tensor::new(id.0, fuid, shape.into(), dtype)));
        id
    }

    // marked tensors survive planning even after their last in-graph reader
    pub fn mark_output(&mut self, id: TensorId) {
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
    }

    // the single place edge maintenance is written; every operator
    // constructor funnels through here
    fn add_operator_and_connect(&mut self, op: Operator) -> OpId {
        self.sorted = false;
        let id = OpId(op.uid());
        let inputs = op.inputs().to_vec();
        let outputs = op.outputs().to_vec();
        self.ops.push(Some(op));
        self.op_order.push(id);

        for input in inputs {
            self.tensor_mut(input).add_target(id);
            if let Some(pred) = self.tensor(input).source() {
                self.op_mut(pred).add_successor(id);
                self.op_mut(id).add_predecessor(pred);
            }
        }
        for output in outputs {
            self.tensor_mut(output).source = Some(id);
            for succ in self.tensor(output).targets().to_vec() {
                self.op_mut(succ).add_predecessor(id);
                self.op_mut(id).add_successor(succ);
            }
        }
        id
    }

    pub(crate) fn new_op(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> OpId {
        let op = Operator::new(self.ops.len(), kind, inputs, outputs);
        self.add_operator_and_connect(op)
    }

    // with output absent, a fresh output tensor is created, sized by the
    // operator's shape rule
    pub fn add_op(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        output: Option<TensorId>,
    ) -> Result<OpId, Error> {
        debug_assert_eq!(inputs.len(), kind.arity());
        let output = match output {
            Some(id) => id,
            None => {
                let shapes: Vec<Shape> = inputs
                    .iter()
                    .map(|id| self.tensor(*id).shape.clone())
                    .collect();
                let refs: Vec<&Shape> = shapes.iter().collect();
                let mut inferred = kind.infer_shape(&refs).map_err(Error::Shape)?;
                let dtype = self.tensor(inputs[0]).dtype;
                self.add_tensor(inferred.remove(0), dtype)
            }
        };
        Ok(self.new_op(kind, inputs.to_vec(), vec![output]))
    }

    pub fn add_transpose<P>(
        &mut self,
        input: TensorId,
        output: Option<TensorId>,
        perm: P,
    ) -> Result<OpId, Error>
    where
        P: IntoIterator<Item = usize>,
    {
        let perm: Perm = perm.into_iter().collect();
        self.add_op(OpKind::Transpose { perm }, &[input], output)
    }

    pub fn add_matmul(
        &mut self,
        a: TensorId,
        b: TensorId,
        output: Option<TensorId>,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<OpId, Error> {
        self.add_op(OpKind::MatMul { trans_a, trans_b }, &[a, b], output)
    }

    // unwires every edge that mentions the operator; tensors are left in
    // place, removing those is remove_tensor's job
    pub fn remove_operator(&mut self, id: OpId) {
        let op = match self.ops[id.0].take() {
            Some(op) => op,
            None => return,
        };
        self.op_order.retain(|o| *o != id);

        for input in op.inputs() {
            if let Some(t) = self.tensors[input.0].as_mut() {
                t.remove_target(id);
            }
        }
        for output in op.outputs() {
            if let Some(t) = self.tensors[output.0].as_mut() {
                if t.source == Some(id) {
                    t.source = None;
                }
            }
        }
        for pred in op.predecessors() {
            if let Some(p) = self.ops[pred.0].as_mut() {
                p.remove_successor(id);
            }
        }
        for succ in op.successors() {
            if let Some(s) = self.ops[succ.0].as_mut() {
                s.remove_predecessor(id);
            }
        }
    }

    // a well-formed caller detaches the tensor first; any stale mention in
    // an input/output list is scrubbed anyway
    pub fn remove_tensor(&mut self, id: TensorId) {
        if self.tensors[id.0].take().is_none() {
            return;
        }
        for op in self.ops.iter_mut().flatten() {
            op.inputs.retain(|t| *t != id);
            op.outputs.retain(|t| *t != id);
        }
        self.outputs.retain(|t| *t != id);
    }

    // ******************************** Sorting ******************************** //

    // Kahn-style layered scan; idempotent, rewrites the operator sequence
    // into admission order on success
    pub fn topo_sort(&mut self) -> Result<(), Error> {
        if self.sorted {
            return Ok(());
        }
        let mut admitted: HashSet<OpId> = HashSet::with_capacity(self.op_order.len());
        let mut order: Vec<OpId> = Vec::with_capacity(self.op_order.len());

        while order.len() < self.op_order.len() {
            let mut modified = false;
            for &id in &self.op_order {
                if admitted.contains(&id) {
                    continue;
                }
                let ready = self.op(id).inputs().iter().all(|t| {
                    match self.tensor(*t).source() {
                        None => true,
                        Some(src) => admitted.contains(&src),
                    }
                });
                if ready {
                    admitted.insert(id);
                    order.push(id);
                    modified = true;
                }
            }
            if !modified {
                return Err(Error::Graph(GraphError::CycleDetected));
            }
        }
        self.op_order = order;
        self.sorted = true;
        Ok(())
    }

    // ******************************** Shape inference ******************************** //

    // re-derives output shapes in sequence order; the caller sorts first
    pub fn shape_infer(&mut self) -> Result<(), Error> {
        for op_id in self.op_order.clone() {
            let op = self.op(op_id);
            let inputs: Vec<Shape> = op
                .inputs()
                .iter()
                .map(|t| self.tensor(*t).shape.clone())
                .collect();
            let refs: Vec<&Shape> = inputs.iter().collect();
            let inferred = op.kind.infer_shape(&refs).map_err(Error::Shape)?;

            let outputs = op.outputs().to_vec();
            if inferred.len() != outputs.len() {
                return Err(Error::Shape(crate::shape::ShapeError::OutputArity(
                    inferred.len(),
                    outputs.len(),
                )));
            }
            for (out, shape) in outputs.into_iter().zip(inferred) {
                if self.tensor(out).shape != shape {
                    let fuid = self.tensor(out).fuid();
                    let id = self
                        .get_tensor(fuid)
                        .ok_or(Error::Graph(GraphError::UnknownTensor { fuid }))?;
                    self.tensor_mut(id).shape = shape;
                }
            }
        }
        Ok(())
    }

    // ******************************** Memory planning ******************************** //

    // assigns every tensor a pool offset, reusing buffers whose last
    // in-graph reader has passed, then materializes the pool; a repeat
    // call after success is a no-op and the addresses stand
    pub fn data_malloc(&mut self) -> Result<(), Error> {
        self.topo_sort()?;
        if self.allocator.is_sealed() {
            return Ok(());
        }

        let mut off: HashMap<TensorId, usize> = HashMap::new();

        // graph inputs live from the start
        for id in self.input_ids() {
            let bytes = self.tensor(id).bytes();
            off.insert(id, self.allocator.alloc(bytes).map_err(Error::Memory)?);
        }

        let mut refs: HashMap<TensorId, usize> = HashMap::new();
        for &op_id in &self.op_order {
            for input in self.op(op_id).inputs() {
                *refs.entry(*input).or_insert(0) += 1;
            }
        }

        for op_id in self.op_order.clone() {
            for out in self.op(op_id).outputs().to_vec() {
                if !off.contains_key(&out) {
                    let bytes = self.tensor(out).bytes();
                    off.insert(out, self.allocator.alloc(bytes).map_err(Error::Memory)?);
                }
            }
            for input in self.op(op_id).inputs().to_vec() {
                let count = refs.get_mut(&input).expect("counted above");
                *count -= 1;
                if *count == 0 && !self.outputs.contains(&input) {
                    let bytes = self.tensor(input).bytes();
                    self.allocator
                        .free(off[&input], bytes)
                        .map_err(Error::Memory)?;
                }
            }
        }

        let pool = self.allocator.get_ptr().map_err(Error::Memory)?;
        for (id, offset) in off {
            self.tensor_mut(id).storage = Some(Storage {
                pool: Rc::clone(&pool),
                offset,
            });
        }
        Ok(())
    }

    // ******************************** Validation ******************************** //

    // checks every structural invariant, reporting the first breach
    pub fn check_valid(&self) -> Result<(), Error> {
        fn violated(which: String) -> Error {
            Error::Graph(GraphError::InvariantViolated { which })
        }

        for t in self.tensors() {
            if t.source().is_none() && t.targets().is_empty() {
                return Err(violated(format!(
                    "tensor t{} has neither source nor targets",
                    t.uid()
                )));
            }
            for target in t.targets() {
                if !self.contains_op(*target) || !self.op_order.contains(target) {
                    return Err(violated(format!(
                        "tensor t{} targets {:?}, which is not in the graph",
                        t.uid(),
                        target
                    )));
                }
                if !self.op(*target).inputs().contains(&TensorId(t.uid())) {
                    return Err(violated(format!(
                        "tensor t{} targets {:?}, which does not read it",
                        t.uid(),
                        target
                    )));
                }
            }
            if let Some(src) = t.source() {
                if !self.contains_op(src) || !self.op_order.contains(&src) {
                    return Err(violated(format!(
                        "tensor t{} is sourced by {:?}, which is not in the graph",
                        t.uid(),
                        src
                    )));
                }
                if !self.op(src).outputs().contains(&TensorId(t.uid())) {
                    return Err(violated(format!(
                        "tensor t{} is sourced by {:?}, which does not produce it",
                        t.uid(),
                        src
                    )));
                }
            }
        }

        for &op_id in &self.op_order {
            let op = self.op(op_id);
            for input in op.inputs() {
                if !self.contains_tensor(*input) {
                    return Err(violated(format!(
                        "{:?} reads {:?}, which is not in the graph",
                        op_id, input
                    )));
                }
            }
            for output in op.outputs() {
                if !self.contains_tensor(*output) {
                    return Err(violated(format!(
                        "{:?} writes {:?}, which is not in the graph",
                        op_id, output
                    )));
                }
            }
            for pred in op.predecessors() {
                if !self.contains_op(*pred) || !self.op_order.contains(pred) {
                    return Err(violated(format!(
                        "{:?} has predecessor {:?} outside the graph",
                        op_id, pred
                    )));
                }
            }
            for succ in op.successors() {
                if !self.contains_op(*succ) || !self.op_order.contains(succ) {
                    return Err(violated(format!(
                        "{:?} has successor {:?} outside the graph",
                        op_id, succ
                    )));
                }
            }
        }

        let mut fuids = HashSet::new();
        for t in self.tensors() {
            if !fuids.insert(t.fuid()) {
                return Err(violated(format!("duplicate fuid {}", t.fuid())));
            }
        }

        if self.sorted {
            let position: HashMap<OpId, usize> = self
                .op_order
                .iter()
                .enumerate()
                .map(|(i, id)| (*id, i))
                .collect();
            for (i, &op_id) in self.op_order.iter().enumerate() {
                for input in self.op(op_id).inputs() {
                    if let Some(src) = self.tensor(*input).source() {
                        if position[&src] >= i {
                            return Err(violated(format!(
                                "sorted, but {:?} precedes its producer {:?}",
                                op_id, src
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph tensors:")?;
        for t in self.tensors() {
            writeln!(f, "  {:?}", t)?;
        }
        writeln!(f, "graph operators:")?;
        for op in self.ops_in_order() {
            writeln!(
                f,
                "  {:?}, pred {:?}, succ {:?}",
                op,
                op.predecessors(),
                op.successors()
            )?;
        }
        write!(f, "{}", self.allocator)
    }
}
