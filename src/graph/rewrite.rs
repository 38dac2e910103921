// graph rewrites: transpose fusion, matmul flag absorption, identity removal

use super::Graph;
use crate::ops::transpose::{compose, is_identity, is_last_two_swap, Perm};
use crate::ops::{OpId, OpKind};

impl Graph {
    // rules are tried in order and the scan restarts after every rewrite,
    // so each pattern is matched against a settled neighborhood
    pub fn optimize(&mut self) {
        loop {
            if self.fuse_transpose_chains()
                || self.fuse_transpose_into_matmul()
                || self.eliminate_identity_transpose()
            {
                self.sorted = false;
                continue;
            }
            break;
        }
    }

    fn transpose_perm(&self, id: OpId) -> Option<&Perm> {
        match &self.op(id).kind {
            OpKind::Transpose { perm } => Some(perm),
            _ => None,
        }
    }

    // first transpose matching perm_ok whose fanout is non-empty and
    // consists entirely of succ_ok successors, in sequence order
    fn match_transpose(
        &self,
        perm_ok: impl Fn(&[usize]) -> bool,
        succ_ok: impl Fn(OpId) -> bool,
    ) -> Option<OpId> {
        self.op_order.iter().copied().find(|&id| {
            self.transpose_perm(id).map_or(false, |p| perm_ok(p))
                && !self.op(id).successors().is_empty()
                && self.op(id).successors().iter().all(|s| succ_ok(*s))
        })
    }

    // rule 1: a transpose feeding only transposes folds into each consumer
    fn fuse_transpose_chains(&mut self) -> bool {
        let t = match self.match_transpose(|_| true, |s| self.transpose_perm(s).is_some()) {
            Some(t) => t,
            None => return false,
        };
        let p = self.transpose_perm(t).expect("matched a transpose").clone();
        let t_in = self.op(t).inputs()[0];
        let t_out = self.op(t).output();

        for succ in self.op(t).successors().to_vec() {
            let q = self.transpose_perm(succ).expect("all successors are transposes").clone();
            let out = self.op(succ).output();
            let fused = self.new_op(
                OpKind::Transpose {
                    perm: compose(&p, &q),
                },
                vec![t_in],
                vec![out],
            );
            self.remove_operator(succ);
            self.tensor_mut(out).source = Some(fused);
        }
        // the intermediate buffer has no reader left
        self.remove_tensor(t_out);
        self.remove_operator(t);
        true
    }

    // rule 2: a last-two-axis swap feeding only matmuls becomes a flag flip
    fn fuse_transpose_into_matmul(&mut self) -> bool {
        let t = match self.match_transpose(is_last_two_swap, |s| {
            matches!(self.op(s).kind, OpKind::MatMul { .. })
        }) {
            Some(t) => t,
            None => return false,
        };
        let t_in = self.op(t).inputs()[0];
        let t_out = self.op(t).output();

        for succ in self.op(t).successors().to_vec() {
            let (mut trans_a, mut trans_b) = match self.op(succ).kind {
                OpKind::MatMul { trans_a, trans_b } => (trans_a, trans_b),
                _ => continue,
            };
            let (mut a, mut b) = (self.op(succ).inputs()[0], self.op(succ).inputs()[1]);
            let out = self.op(succ).output();
            if a == t_out {
                a = t_in;
                trans_a = !trans_a;
            }
            if b == t_out {
                b = t_in;
                trans_b = !trans_b;
            }
            let fused = self.new_op(OpKind::MatMul { trans_a, trans_b }, vec![a, b], vec![out]);
            self.remove_operator(succ);
            self.tensor_mut(out).source = Some(fused);
        }
        self.remove_tensor(t_out);
        self.remove_operator(t);
        true
    }

    // rule 3: an identity transpose is spliced out entirely
    fn eliminate_identity_transpose(&mut self) -> bool {
        let t = match self.op_order.iter().copied().find(|&id| {
            self.transpose_perm(id).map_or(false, |p| is_identity(p))
        }) {
            Some(t) => t,
            None => return false,
        };
        let t_in = self.op(t).inputs()[0];
        let t_out = self.op(t).output();

        for succ in self.op(t).successors().to_vec() {
            for input in self.op_mut(succ).inputs.iter_mut() {
                if *input == t_out {
                    *input = t_in;
                }
            }
            self.tensor_mut(t_out).remove_target(succ);
            self.tensor_mut(t_in).add_target(succ);
            self.op_mut(succ).remove_predecessor(t);
            self.op_mut(t).remove_successor(succ);
            if let Some(pred) = self.tensor(t_in).source() {
                self.op_mut(pred).add_successor(succ);
                self.op_mut(succ).add_predecessor(pred);
            }
        }
        self.remove_tensor(t_out);
        self.remove_operator(t);
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::exec;
    use crate::graph::Graph;
    use crate::ops::OpKind;
    use crate::runtime::CpuRuntime;
    use crate::tensor::DataType;
    use std::rc::Rc;

    fn graph() -> Graph {
        Graph::new(Rc::new(CpuRuntime::new()))
    }

    #[test]
    fn test_chain_of_four_collapses() {
        // four cycles of [1, 2, 3, 0] compose to the identity; the whole
        // chain folds away and only the input buffer remains
        let mut g = graph();
        let x0 = g.add_tensor([1, 2, 3, 4], DataType::F32);
        let mut x = x0;
        for _ in 0..4 {
            let op = g.add_transpose(x, None, [1, 2, 3, 0]).unwrap();
            x = g.op(op).output();
        }

        g.optimize();
        // the graph degenerates to the lone input tensor
        assert_eq!(g.op_count(), 0);
        assert_eq!(g.tensor_count(), 1);

        // the surviving tensor is the chain's value, untouched in place
        g.data_malloc().unwrap();
        exec::fill_incremental(&g, x0);
        exec::run(&g).unwrap();
        let expect: Vec<f32> = (0..24).map(|i| i as f32).collect();
        assert_eq!(exec::read_f32(&g, x0), expect);
    }

    #[test]
    fn test_pair_fuses_to_single_transpose() {
        let mut g = graph();
        let x0 = g.add_tensor([2, 3, 4], DataType::F32);
        let t1 = g.add_transpose(x0, None, [1, 2, 0]).unwrap();
        let x1 = g.op(t1).output();
        let t2 = g.add_transpose(x1, None, [1, 2, 0]).unwrap();
        let x2 = g.op(t2).output();
        let fuid = g.tensor(x2).fuid();

        g.optimize();
        g.check_valid().unwrap();
        assert_eq!(g.op_count(), 1);

        let op = g.ops_in_order().next().unwrap();
        assert_eq!(
            op.kind,
            OpKind::Transpose {
                perm: [2, 0, 1].into_iter().collect()
            }
        );
        assert_eq!(op.inputs(), &[x0]);
        // the final output keeps its forwarded id; the intermediate is gone
        assert_eq!(g.get_tensor(fuid), Some(x2));
        assert!(!g.contains_tensor(x1));
    }

    #[test]
    fn test_transpose_fuses_into_matmul() {
        let (m, n, k) = (4, 3, 5);
        let mut g = graph();
        let a = g.add_tensor([n, m], DataType::F32);
        let b = g.add_tensor([n, k], DataType::F32);
        let t = g.add_transpose(a, None, [1, 0]).unwrap();
        let at = g.op(t).output();
        let mm = g.add_matmul(at, b, None, false, false).unwrap();
        let y = g.op(mm).output();

        g.optimize();
        g.check_valid().unwrap();
        assert_eq!(g.op_count(), 1);

        let op = g.ops_in_order().next().unwrap();
        assert_eq!(
            op.kind,
            OpKind::MatMul {
                trans_a: true,
                trans_b: false
            }
        );
        assert_eq!(op.inputs(), &[a, b]);
        assert_eq!(op.outputs(), &[y]);
        assert_eq!(g.tensor(y).source(), Some(g.op_order()[0]));

        g.topo_sort().unwrap();
        g.shape_infer().unwrap();
        assert_eq!(g.tensor(y).shape.extents(), &[m, k]);
    }

    #[test]
    fn test_transpose_on_b_side_toggles_trans_b() {
        let mut g = graph();
        let a = g.add_tensor([4, 3], DataType::F32);
        let b = g.add_tensor([5, 3], DataType::F32);
        let t = g.add_transpose(b, None, [1, 0]).unwrap();
        let bt = g.op(t).output();
        g.add_matmul(a, bt, None, false, false).unwrap();

        g.optimize();
        g.check_valid().unwrap();
        assert_eq!(g.op_count(), 1);
        let op = g.ops_in_order().next().unwrap();
        assert_eq!(
            op.kind,
            OpKind::MatMul {
                trans_a: false,
                trans_b: true
            }
        );
        assert_eq!(op.inputs(), &[a, b]);
    }

    #[test]
    fn test_identity_transpose_spliced_out() {
        let mut g = graph();
        let a = g.add_tensor([4, 3], DataType::F32);
        let b = g.add_tensor([3, 5], DataType::F32);
        let t = g.add_transpose(a, None, [0, 1]).unwrap();
        let ai = g.op(t).output();
        let mm = g.add_matmul(ai, b, None, false, false).unwrap();

        g.optimize();
        g.check_valid().unwrap();
        assert_eq!(g.op_count(), 1);
        assert_eq!(g.op(mm).inputs(), &[a, b]);
        assert_eq!(g.tensor(a).targets(), &[mm]);
        assert!(!g.contains_tensor(ai));
    }

    #[test]
    fn test_mixed_fanout_is_left_alone() {
        // the transpose feeds both a transpose and a matmul, so neither
        // rule 1 nor rule 2 may claim it
        let mut g = graph();
        let a = g.add_tensor([4, 3], DataType::F32);
        let b = g.add_tensor([4, 5], DataType::F32);
        let t = g.add_transpose(a, None, [1, 0]).unwrap();
        let at = g.op(t).output();
        g.add_transpose(at, None, [1, 0]).unwrap();
        g.add_matmul(at, b, None, false, false).unwrap();

        g.optimize();
        g.check_valid().unwrap();
        assert_eq!(g.op_count(), 3);
        assert!(g.contains_op(t));
    }

    #[test]
    fn test_optimize_is_a_fixpoint() {
        let mut g = graph();
        let a = g.add_tensor([4, 3], DataType::F32);
        let b = g.add_tensor([4, 5], DataType::F32);
        let t = g.add_transpose(a, None, [1, 0]).unwrap();
        let at = g.op(t).output();
        g.add_matmul(at, b, None, false, false).unwrap();

        g.optimize();
        let first = g.to_string();
        g.optimize();
        assert_eq!(g.to_string(), first);
    }

    #[test]
    fn test_optimize_preserves_results() {
        let a_data: Vec<f32> = (0..12).map(|i| (i as f32) * 0.5 - 3.0).collect();
        let b_data: Vec<f32> = (0..20).map(|i| (i as f32) * 0.25 + 1.0).collect();

        let run = |optimize: bool| -> Vec<f32> {
            let mut g = graph();
            let a = g.add_tensor([4, 3], DataType::F32);
            let b = g.add_tensor([4, 5], DataType::F32);
            let t = g.add_transpose(a, None, [1, 0]).unwrap();
            let at = g.op(t).output();
            let mm = g.add_matmul(at, b, None, false, false).unwrap();
            let y = g.op(mm).output();

            g.topo_sort().unwrap();
            g.shape_infer().unwrap();
            if optimize {
                g.optimize();
                g.topo_sort().unwrap();
            }
            g.data_malloc().unwrap();
            exec::write_f32(&g, a, &a_data);
            exec::write_f32(&g, b, &b_data);
            exec::run(&g).unwrap();
            exec::read_f32(&g, y)
        };

        let plain = run(false);
        let optimized = run(true);
        // bit-identical, not approximately equal
        assert_eq!(plain, optimized);
    }
}
