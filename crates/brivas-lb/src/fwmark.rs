//! Firewall mark pool
//!
//! Marks come from the fixed range `[base, base + size)`. Allocation is keyed
//! and reference counted: every `allocate` of a key needs a matching
//! `release` before its mark goes back to the pool.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::FwmarkError;

pub const DEFAULT_FWMARK_BASE: u32 = 5000;
pub const DEFAULT_FWMARK_SIZE: u32 = 1000;

#[derive(Debug)]
struct Allocation {
    mark: u32,
    refs: u32,
}

#[derive(Debug)]
struct Inner {
    free: BTreeSet<u32>,
    allocations: HashMap<String, Allocation>,
}

/// Shared by every balancer of one control plane
#[derive(Debug)]
pub struct FwmarkAllocator {
    base: u32,
    size: u32,
    inner: Mutex<Inner>,
}

impl Default for FwmarkAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_FWMARK_BASE, DEFAULT_FWMARK_SIZE)
    }
}

impl FwmarkAllocator {
    pub fn new(base: u32, size: u32) -> Self {
        let end = base.saturating_add(size);
        Self {
            base,
            size: end - base,
            inner: Mutex::new(Inner {
                free: (base..end).collect(),
                allocations: HashMap::new(),
            }),
        }
    }

    /// Mark for `key`, taking the lowest free one on first use
    pub fn allocate(&self, key: &str) -> Result<u32, FwmarkError> {
        let mut inner = self.inner.lock();
        if let Some(allocation) = inner.allocations.get_mut(key) {
            allocation.refs += 1;
            return Ok(allocation.mark);
        }

        let mark = inner.free.pop_first().ok_or(FwmarkError::Exhausted {
            base: self.base,
            size: self.size,
        })?;
        inner
            .allocations
            .insert(key.to_string(), Allocation { mark, refs: 1 });
        debug!(key, mark, "Allocated fwmark");
        Ok(mark)
    }

    /// Drop one reference; the mark is freed when none remain
    pub fn release(&self, key: &str) -> Result<(), FwmarkError> {
        let mut inner = self.inner.lock();
        let allocation = inner
            .allocations
            .get_mut(key)
            .ok_or_else(|| FwmarkError::UnknownKey(key.to_string()))?;

        allocation.refs -= 1;
        if allocation.refs == 0 {
            let mark = allocation.mark;
            inner.allocations.remove(key);
            inner.free.insert(mark);
            debug!(key, mark, "Released fwmark");
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<u32, FwmarkError> {
        self.inner
            .lock()
            .allocations
            .get(key)
            .map(|a| a.mark)
            .ok_or_else(|| FwmarkError::UnknownKey(key.to_string()))
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_idempotent() {
        let pool = FwmarkAllocator::new(100, 4);
        let mark = pool.allocate("10.0.0.1/10.1.0.1").unwrap();
        assert_eq!(mark, 100);
        assert_eq!(pool.available(), 3);

        assert_eq!(pool.allocate("10.0.0.1/10.1.0.1").unwrap(), mark);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.get("10.0.0.1/10.1.0.1").unwrap(), mark);
    }

    #[test]
    fn test_release_needs_every_reference() {
        let pool = FwmarkAllocator::new(100, 4);
        for _ in 0..3 {
            pool.allocate("k").unwrap();
        }

        pool.release("k").unwrap();
        pool.release("k").unwrap();
        assert_eq!(pool.available(), 3);
        assert!(pool.get("k").is_ok());

        pool.release("k").unwrap();
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.get("k"), Err(FwmarkError::UnknownKey("k".into())));
    }

    #[test]
    fn test_release_unknown_key_errors() {
        let pool = FwmarkAllocator::new(100, 4);
        assert!(matches!(pool.release("nope"), Err(FwmarkError::UnknownKey(_))));
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let pool = FwmarkAllocator::new(7, 2);
        assert_eq!(pool.allocate("a").unwrap(), 7);
        assert_eq!(pool.allocate("b").unwrap(), 8);
        assert!(matches!(pool.allocate("c"), Err(FwmarkError::Exhausted { .. })));

        pool.release("a").unwrap();
        assert_eq!(pool.allocate("c").unwrap(), 7);
    }
}
