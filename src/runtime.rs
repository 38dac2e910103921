use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;

// provider of backing memory for a graph's pool; one handle may be shared
// by several graphs and must be safe to call from any thread
pub trait Runtime {
    // returns null on failure
    fn alloc(&self, bytes: usize) -> *mut u8;

    // must tolerate the exact pointer previously returned; null is a no-op
    fn dealloc(&self, ptr: *mut u8);

    fn describe(&self) -> String;
}

// host memory, 8-byte aligned; keeps the layout of every live allocation
// so dealloc needs only the pointer
pub struct CpuRuntime {
    live: Mutex<HashMap<usize, Layout>>,
}

pub const POOL_ALIGNMENT: usize = std::mem::size_of::<u64>();

impl CpuRuntime {
    pub fn new() -> CpuRuntime {
        CpuRuntime {
            live: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for CpuRuntime {
    fn default() -> Self {
        CpuRuntime::new()
    }
}

impl Runtime for CpuRuntime {
    fn alloc(&self, bytes: usize) -> *mut u8 {
        // an empty pool still gets a real, freeable address
        let layout = match Layout::from_size_align(bytes.max(POOL_ALIGNMENT), POOL_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => return std::ptr::null_mut(),
        };
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if !ptr.is_null() {
            let mut live = match self.live.lock() {
                Ok(live) => live,
                Err(poisoned) => poisoned.into_inner(),
            };
            live.insert(ptr as usize, layout);
        }
        ptr
    }

    fn dealloc(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let layout = {
            let mut live = match self.live.lock() {
                Ok(live) => live,
                Err(poisoned) => poisoned.into_inner(),
            };
            live.remove(&(ptr as usize))
        };
        if let Some(layout) = layout {
            unsafe { alloc::dealloc(ptr, layout) };
        }
    }

    fn describe(&self) -> String {
        "native cpu".to_string()
    }
}

impl Debug for CpuRuntime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_roundtrip() {
        let rt = CpuRuntime::new();
        let p = rt.alloc(64);
        assert!(!p.is_null());
        assert_eq!(p as usize % POOL_ALIGNMENT, 0);

        // zero-initialized
        let bytes = unsafe { std::slice::from_raw_parts(p, 64) };
        assert!(bytes.iter().all(|b| *b == 0));

        rt.dealloc(p);
    }

    #[test]
    fn test_dealloc_tolerates_null_and_unknown() {
        let rt = CpuRuntime::new();
        rt.dealloc(std::ptr::null_mut());

        let p = rt.alloc(8);
        rt.dealloc(p);
        // second dealloc of the same pointer is ignored, not a double free
        rt.dealloc(p);
    }

    #[test]
    fn test_zero_sized_pool() {
        let rt = CpuRuntime::new();
        let p = rt.alloc(0);
        assert!(!p.is_null());
        rt.dealloc(p);
    }
}
