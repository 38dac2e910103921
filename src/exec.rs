// reference execution of a planned graph; naive f32 kernels

use crate::error::Error;
use crate::graph::{Graph, GraphError};
use crate::ops::{OpKind, Operator};
use crate::tensor::{DataType, Tensor, TensorId};

fn check_f32(op: &'static str, t: &Tensor) -> Result<(), Error> {
    if t.dtype != DataType::F32 {
        return Err(Error::Graph(GraphError::UnsupportedKernel {
            op,
            dtype: t.dtype,
        }));
    }
    Ok(())
}

fn slice_f32(t: &Tensor) -> &[f32] {
    let ptr = t.data_ptr().expect("tensor has no storage; run data_malloc first");
    unsafe { std::slice::from_raw_parts(ptr as *const f32, t.shape.size()) }
}

#[allow(clippy::mut_from_ref)]
fn slice_f32_mut(t: &Tensor) -> &mut [f32] {
    let ptr = t.data_ptr().expect("tensor has no storage; run data_malloc first");
    unsafe { std::slice::from_raw_parts_mut(ptr as *mut f32, t.shape.size()) }
}

pub fn write_f32(graph: &Graph, id: TensorId, data: &[f32]) {
    let t = graph.tensor(id);
    assert_eq!(t.dtype, DataType::F32);
    assert_eq!(t.shape.size(), data.len());
    slice_f32_mut(t).copy_from_slice(data);
}

pub fn read_f32(graph: &Graph, id: TensorId) -> Vec<f32> {
    let t = graph.tensor(id);
    assert_eq!(t.dtype, DataType::F32);
    slice_f32(t).to_vec()
}

// fill with 0, 1, 2, 3, the pattern the kernel tests key their expectations to
pub fn fill_incremental(graph: &Graph, id: TensorId) {
    let t = graph.tensor(id);
    for (i, v) in slice_f32_mut(t).iter_mut().enumerate() {
        *v = i as f32;
    }
}

// executes operators in sequence order; the graph must be sorted and planned
pub fn run(graph: &Graph) -> Result<(), Error> {
    for op in graph.ops_in_order() {
        match &op.kind {
            OpKind::Transpose { .. } => transpose_f32(graph, op)?,
            OpKind::MatMul { .. } => matmul_f32(graph, op)?,
        }
    }
    Ok(())
}

fn transpose_f32(graph: &Graph, op: &Operator) -> Result<(), Error> {
    let x = graph.tensor(op.inputs()[0]);
    let y = graph.tensor(op.output());
    check_f32("Transpose", x)?;
    check_f32("Transpose", y)?;
    let perm = match &op.kind {
        OpKind::Transpose { perm } => perm,
        _ => unreachable!(),
    };

    let in_strides = x.shape.strides();
    let out_strides = y.shape.strides();
    let src = slice_f32(x);
    let dst = slice_f32_mut(y);

    // input axis i lands on output axis perm[i]
    for (linear, v) in src.iter().enumerate() {
        let mut rem = linear;
        let mut out_index = 0;
        for (i, stride) in in_strides.iter().enumerate() {
            let c = rem / stride;
            rem %= stride;
            out_index += c * out_strides[perm[i]];
        }
        dst[out_index] = *v;
    }
    Ok(())
}

fn matmul_f32(graph: &Graph, op: &Operator) -> Result<(), Error> {
    let a = graph.tensor(op.inputs()[0]);
    let b = graph.tensor(op.inputs()[1]);
    let y = graph.tensor(op.output());
    check_f32("MatMul", a)?;
    check_f32("MatMul", b)?;
    check_f32("MatMul", y)?;
    let (trans_a, trans_b) = match op.kind {
        OpKind::MatMul { trans_a, trans_b } => (trans_a, trans_b),
        _ => unreachable!(),
    };

    let (sa, sb, sy) = (a.shape.extents(), b.shape.extents(), y.shape.extents());
    let (la, lb, ly) = (sa.len(), sb.len(), sy.len());
    let (sta, stb, sty) = (a.shape.strides(), b.shape.strides(), y.shape.strides());

    let m = sy[ly - 2];
    let k = sy[ly - 1];
    let n = if trans_a { sa[la - 2] } else { sa[la - 1] };

    let batch: usize = sy[..ly - 2].iter().product::<usize>().max(1);
    let src_a = slice_f32(a);
    let src_b = slice_f32(b);
    let dst = slice_f32_mut(y);

    for batch_linear in 0..batch {
        // decompose over the output's leading axes, then wrap each
        // coordinate into the (possibly smaller) operand axes
        let (mut a_base, mut b_base, mut y_base) = (0, 0, 0);
        let mut rem = batch_linear;
        for i in (0..ly - 2).rev() {
            let c = rem % sy[i];
            rem /= sy[i];
            y_base += c * sty[i];
            let ja = (i + la).wrapping_sub(ly);
            if ja < la.saturating_sub(2) {
                a_base += c % sa[ja] * sta[ja];
            }
            let jb = (i + lb).wrapping_sub(ly);
            if jb < lb.saturating_sub(2) {
                b_base += c % sb[jb] * stb[jb];
            }
        }

        for i in 0..m {
            for j in 0..k {
                let mut acc = 0.0f32;
                for p in 0..n {
                    let a_idx = a_base
                        + if trans_a {
                            p * sta[la - 2] + i * sta[la - 1]
                        } else {
                            i * sta[la - 2] + p * sta[la - 1]
                        };
                    let b_idx = b_base
                        + if trans_b {
                            j * stb[lb - 2] + p * stb[lb - 1]
                        } else {
                            p * stb[lb - 2] + j * stb[lb - 1]
                        };
                    acc += src_a[a_idx] * src_b[b_idx];
                }
                dst[y_base + i * sty[ly - 2] + j * sty[ly - 1]] = acc;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CpuRuntime;
    use std::rc::Rc;

    fn graph() -> Graph {
        Graph::new(Rc::new(CpuRuntime::new()))
    }

    #[test]
    fn test_transpose_kernel() {
        let mut g = graph();
        let x = g.add_tensor([2, 3], DataType::F32);
        let op = g.add_transpose(x, None, [1, 0]).unwrap();
        let y = g.op(op).output();
        g.data_malloc().unwrap();

        write_f32(&g, x, &[0., 1., 2., 3., 4., 5.]);
        run(&g).unwrap();
        assert_eq!(read_f32(&g, y), vec![0., 3., 1., 4., 2., 5.]);
    }

    #[test]
    fn test_transpose_kernel_rank3() {
        let mut g = graph();
        let x = g.add_tensor([2, 3, 4], DataType::F32);
        // send axis 0 to position 2: out shape [3, 4, 2]
        let op = g.add_transpose(x, None, [2, 0, 1]).unwrap();
        let y = g.op(op).output();
        g.data_malloc().unwrap();

        fill_incremental(&g, x);
        run(&g).unwrap();

        assert_eq!(g.tensor(y).shape.extents(), &[3, 4, 2]);
        let out = read_f32(&g, y);
        // out[c1][c2][c0] == in[c0][c1][c2]
        for c0 in 0..2 {
            for c1 in 0..3 {
                for c2 in 0..4 {
                    let src = c0 * 12 + c1 * 4 + c2;
                    let dst = c1 * 8 + c2 * 2 + c0;
                    assert_eq!(out[dst], src as f32);
                }
            }
        }
    }

    #[test]
    fn test_matmul_kernel() {
        let mut g = graph();
        let a = g.add_tensor([2, 3], DataType::F32);
        let b = g.add_tensor([3, 2], DataType::F32);
        let op = g.add_matmul(a, b, None, false, false).unwrap();
        let y = g.op(op).output();
        g.data_malloc().unwrap();

        write_f32(&g, a, &[1., 2., 3., 4., 5., 6.]);
        write_f32(&g, b, &[7., 8., 9., 10., 11., 12.]);
        run(&g).unwrap();
        assert_eq!(read_f32(&g, y), vec![58., 64., 139., 154.]);
    }

    #[test]
    fn test_matmul_kernel_transposed_equivalence() {
        // A^T stored as [3, 2] with trans_a must reproduce A @ B
        let a_data = [1., 2., 3., 4., 5., 6.]; // A: [2, 3]
        let at_data = [1., 4., 2., 5., 3., 6.]; // A^T: [3, 2]
        let b_data = [7., 8., 9., 10., 11., 12.];

        let mut g = graph();
        let a = g.add_tensor([2, 3], DataType::F32);
        let b = g.add_tensor([3, 2], DataType::F32);
        let op = g.add_matmul(a, b, None, false, false).unwrap();
        let y = g.op(op).output();
        g.data_malloc().unwrap();
        write_f32(&g, a, &a_data);
        write_f32(&g, b, &b_data);
        run(&g).unwrap();
        let plain = read_f32(&g, y);

        let mut g = graph();
        let at = g.add_tensor([3, 2], DataType::F32);
        let b = g.add_tensor([3, 2], DataType::F32);
        let op = g.add_matmul(at, b, None, true, false).unwrap();
        let y = g.op(op).output();
        g.data_malloc().unwrap();
        write_f32(&g, at, &at_data);
        write_f32(&g, b, &b_data);
        run(&g).unwrap();

        assert_eq!(read_f32(&g, y), plain);
    }

    #[test]
    fn test_matmul_kernel_batched_broadcast() {
        // A: [2, 1, 2], B: [1, 2], leading dims broadcast to [2]
        let mut g = graph();
        let a = g.add_tensor([2, 1, 2], DataType::F32);
        let b = g.add_tensor([2, 2], DataType::F32);
        let op = g.add_matmul(a, b, None, false, false).unwrap();
        let y = g.op(op).output();
        g.data_malloc().unwrap();

        write_f32(&g, a, &[1., 2., 3., 4.]);
        write_f32(&g, b, &[1., 0., 0., 1.]);
        run(&g).unwrap();

        assert_eq!(g.tensor(y).shape.extents(), &[2, 1, 2]);
        assert_eq!(read_f32(&g, y), vec![1., 2., 3., 4.]);
    }

    #[test]
    fn test_unsupported_dtype() {
        let mut g = graph();
        let x = g.add_tensor([2, 2], DataType::I32);
        g.add_transpose(x, None, [1, 0]).unwrap();
        g.data_malloc().unwrap();

        assert!(matches!(
            run(&g),
            Err(Error::Graph(GraphError::UnsupportedKernel { .. }))
        ));
    }
}
