use crate::runtime::{Runtime, POOL_ALIGNMENT};
use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum MemoryError {
    #[error("planning call on an allocator whose pool is already materialized")]
    AllocatorSealed,

    #[error("runtime refused an allocation of {} bytes", .0)]
    OutOfMemory(usize),
}

// the single contiguous buffer every tensor offset points into, shared
// between the allocator and tensor storage descriptors; the runtime gets
// the memory back exactly once, when the last handle drops
pub struct Pool {
    base: *mut u8,
    size: usize,
    runtime: Rc<dyn Runtime>,
}

impl Pool {
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.runtime.dealloc(self.base);
    }
}

impl Debug for Pool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool of {} bytes on {}", self.size, self.runtime.describe())
    }
}

// ordered by size first, so range() finds the smallest sufficient block
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct Block {
    size: usize,
    begin: usize,
}

// two-phase arena: while unsealed, alloc/free only plan byte offsets and
// track the peak; get_ptr materializes one pool of peak bytes and seals
// the planning surface
pub struct Allocator {
    runtime: Rc<dyn Runtime>,
    used: usize,
    peak: usize,
    alignment: usize,
    frees: BTreeSet<Block>,
    pool: Option<Rc<Pool>>,
}

impl Allocator {
    pub fn new(runtime: Rc<dyn Runtime>) -> Allocator {
        Allocator {
            runtime,
            used: 0,
            peak: 0,
            // the widest supported element type (f64/i64)
            alignment: POOL_ALIGNMENT,
            frees: BTreeSet::new(),
            pool: None,
        }
    }

    fn aligned(&self, size: usize) -> usize {
        (size + self.alignment - 1) / self.alignment * self.alignment
    }

    // returns the byte offset the block will occupy
    pub fn alloc(&mut self, size: usize) -> Result<usize, MemoryError> {
        if self.pool.is_some() {
            return Err(MemoryError::AllocatorSealed);
        }
        let size = self.aligned(size);
        self.used += size;

        // smallest sufficient free block, lowest offset among equals
        if let Some(&blk) = self.frees.range(Block { size, begin: 0 }..).next() {
            self.frees.remove(&blk);
            if blk.size > size {
                self.frees.insert(Block {
                    size: blk.size - size,
                    begin: blk.begin + size,
                });
            }
            return Ok(blk.begin);
        }

        // no block fits: consume the last block in address order and push
        // the pool boundary out past it
        if let Some(&blk) = self.frees.iter().max_by_key(|b| b.begin) {
            self.frees.remove(&blk);
            self.peak = self.peak.max(blk.begin + size);
            return Ok(blk.begin);
        }

        let pos = self.peak;
        self.peak += size;
        Ok(pos)
    }

    // returns a planned block to the free set; no coalescing
    pub fn free(&mut self, addr: usize, size: usize) -> Result<(), MemoryError> {
        if self.pool.is_some() {
            return Err(MemoryError::AllocatorSealed);
        }
        let size = self.aligned(size);
        self.used -= size;
        self.frees.insert(Block { size, begin: addr });
        Ok(())
    }

    // idempotent; the first call seals the allocator against further planning
    pub fn get_ptr(&mut self) -> Result<Rc<Pool>, MemoryError> {
        if let Some(pool) = &self.pool {
            return Ok(Rc::clone(pool));
        }
        let base = self.runtime.alloc(self.peak);
        if base.is_null() {
            return Err(MemoryError::OutOfMemory(self.peak));
        }
        let pool = Rc::new(Pool {
            base,
            size: self.peak,
            runtime: Rc::clone(&self.runtime),
        });
        self.pool = Some(Rc::clone(&pool));
        Ok(pool)
    }

    pub fn is_sealed(&self) -> bool {
        self.pool.is_some()
    }

    pub fn mem_used(&self) -> usize {
        self.used
    }

    pub fn mem_peak(&self) -> usize {
        self.peak
    }
}

impl Display for Allocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "used memory: {}, peak memory: {}",
            self.used, self.peak
        )
    }
}
