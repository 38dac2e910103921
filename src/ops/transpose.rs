use crate::shape::{Shape, ShapeError};
use smallvec::SmallVec;

pub type Perm = SmallVec<[usize; 4]>;

pub fn is_permutation(p: &[usize]) -> bool {
    let mut seen = vec![false; p.len()];
    for &i in p {
        if i >= p.len() || seen[i] {
            return false;
        }
        seen[i] = true;
    }
    true
}

// permutation of applying p then q: compose(p, q)[i] = q[p[i]]
pub fn compose(p: &[usize], q: &[usize]) -> Perm {
    p.iter().map(|&i| q[i]).collect()
}

pub fn is_identity(p: &[usize]) -> bool {
    p.iter().enumerate().all(|(i, &x)| x == i)
}

// identity on the leading axes, swapping only the last two; the shape of
// transpose a matmul can absorb into its trans flags
pub fn is_last_two_swap(p: &[usize]) -> bool {
    let n = p.len();
    if n < 2 {
        return false;
    }
    p[..n - 2].iter().enumerate().all(|(i, &x)| x == i) && p[n - 1] == n - 2 && p[n - 2] == n - 1
}

// transpose sends input axis i to output axis perm[i], so
// out[perm[i]] = in[i]; chained transposes then compose by compose()
pub fn infer(input: &Shape, perm: &[usize]) -> Result<Shape, ShapeError> {
    if perm.len() != input.rank() || !is_permutation(perm) {
        return Err(ShapeError::InvalidPermutation(
            perm.to_vec(),
            input.rank(),
        ));
    }
    let mut extents = input.extents.clone();
    for (i, &axis) in perm.iter().enumerate() {
        extents[axis] = input.extents[i];
    }
    Ok(Shape { extents })
}
