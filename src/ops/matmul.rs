use crate::shape::{infer_broadcast, Shape, ShapeError};

// GEMM shape rule over the last two axes, leading axes broadcast. With
// trans_a the left operand contributes m from its last axis and n from its
// second-to-last; n must match the right operand's contracted axis, and
// the surviving right axis k becomes the output's last dimension.
pub fn infer(
    a: &Shape,
    b: &Shape,
    trans_a: bool,
    trans_b: bool,
) -> Result<Shape, ShapeError> {
    let (sa, sb) = (a.extents(), b.extents());
    let rank = sa.len().min(sb.len());
    if rank < 2 {
        return Err(ShapeError::RankTooSmall(rank));
    }

    let (la, lb) = (sa.len(), sb.len());
    let m = if trans_a { sa[la - 1] } else { sa[la - 2] };
    let n = if trans_a { sa[la - 2] } else { sa[la - 1] };
    let nb = if trans_b { sb[lb - 1] } else { sb[lb - 2] };
    let k = if trans_b { sb[lb - 2] } else { sb[lb - 1] };

    if n != nb {
        return Err(ShapeError::ShapeMismatch(n, nb));
    }

    let mut extents = infer_broadcast(&sa[..la - 2], &sb[..lb - 2]);
    extents.push(m);
    extents.push(k);
    Ok(Shape { extents })
}
