use crate::memory::Pool;
use crate::ops::OpId;
use crate::shape::Shape;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

// handle into a graph's tensor table; ids are never reused, so a handle
// stays unambiguous even after the tensor it names has been removed
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) usize);

impl Debug for TensorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DataType {
    pub fn size_of(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// where a tensor lives once the pool is materialized: a shared pool handle
// plus a byte offset; the backing memory is released when the last handle
// drops
#[derive(Clone)]
pub struct Storage {
    pub(crate) pool: Rc<Pool>,
    pub(crate) offset: usize,
}

impl Storage {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ptr(&self) -> *mut u8 {
        // offsets handed out by the planner stay below the peak the pool
        // was sized with
        unsafe { self.pool.base().add(self.offset) }
    }
}

impl Debug for Storage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool+{}", self.offset)
    }
}

pub struct Tensor {
    uid: usize,
    fuid: usize,
    pub shape: Shape,
    pub dtype: DataType,
    pub(crate) source: Option<OpId>,
    pub(crate) targets: Vec<OpId>,
    pub(crate) storage: Option<Storage>,
}

impl Tensor {
    pub(crate) fn new(uid: usize, fuid: usize, shape: Shape, dtype: DataType) -> Tensor {
        Tensor {
            uid,
            fuid,
            shape,
            dtype,
            source: None,
            targets: Vec::new(),
            storage: None,
        }
    }

    pub fn uid(&self) -> usize {
        self.uid
    }

    pub fn fuid(&self) -> usize {
        self.fuid
    }

    pub fn bytes(&self) -> usize {
        self.shape.size() * self.dtype.size_of()
    }

    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    pub fn targets(&self) -> &[OpId] {
        &self.targets
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    pub fn offset(&self) -> Option<usize> {
        self.storage.as_ref().map(|s| s.offset)
    }

    pub fn data_ptr(&self) -> Option<*mut u8> {
        self.storage.as_ref().map(|s| s.ptr())
    }

    pub(crate) fn add_target(&mut self, op: OpId) {
        if !self.targets.contains(&op) {
            self.targets.push(op);
        }
    }

    pub(crate) fn remove_target(&mut self, op: OpId) {
        self.targets.retain(|t| *t != op);
    }
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t{} (fuid {}) {} {}, source {}, targets {:?}",
            self.uid,
            self.fuid,
            self.dtype,
            self.shape,
            match self.source {
                Some(op) => format!("{:?}", op),
                None => "-".to_string(),
            },
            self.targets,
        )?;
        if let Some(s) = &self.storage {
            write!(f, ", {:?}", s)?;
        }
        Ok(())
    }
}
