use itertools::Itertools;
use smallvec::SmallVec;
use thiserror::Error;

pub type Dims = SmallVec<[usize; 4]>;

pub fn display_comma(arr: &[usize]) -> String {
    arr.iter().map(|s| s.to_string()).join(", ")
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum ShapeError {
    #[error("inner dimensions disagree, lhs contracts over {}, rhs over {}", .0, .1)]
    ShapeMismatch(usize, usize),

    #[error("matmul operands need rank >= 2, got rank {}", .0)]
    RankTooSmall(usize),

    #[error("[{}] is not a permutation of 0..{}", display_comma(.0), .1)]
    InvalidPermutation(Vec<usize>, usize),

    #[error("operator produced {} shapes for {} outputs", .0, .1)]
    OutputArity(usize, usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape {
    pub extents: Dims,
}

impl Shape {
    pub fn new<E>(extents: E) -> Shape
    where
        E: IntoIterator<Item = usize>,
    {
        Shape {
            extents: extents.into_iter().collect(),
        }
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    pub fn size(&self) -> usize {
        self.extents.iter().product()
    }

    // row-major, innermost axis contiguous
    pub fn strides(&self) -> Dims {
        let size = self.size();
        self.extents
            .iter()
            .scan(size, |size, extent| {
                *size /= extent;
                Some(*size)
            })
            .collect()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", display_comma(&self.extents))
    }
}

impl From<&[usize]> for Shape {
    fn from(extents: &[usize]) -> Shape {
        Shape::new(extents.iter().copied())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(extents: [usize; N]) -> Shape {
        Shape::new(extents)
    }
}

// right-aligned broadcast: missing leading axes count as 1, present axes
// combine by element-wise maximum
pub fn infer_broadcast(a: &[usize], b: &[usize]) -> Dims {
    let n = a.len().max(b.len());
    let pad_a = n - a.len();
    let pad_b = n - b.len();

    (0..n)
        .map(|i| {
            let la = if i < pad_a { 1 } else { a[i - pad_a] };
            let lb = if i < pad_b { 1 } else { b[i - pad_b] };
            la.max(lb)
        })
        .collect()
}
