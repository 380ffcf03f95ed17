//! Host port allocation from a fixed range

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::Range;

/// Hands out host ports from `[start, end)`, lowest free port first.
///
/// A port stays allocated until explicitly released, so an instance keeps the
/// same port across stop/start cycles.
pub struct PortAllocator {
    range: Range<u16>,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            range: start..end,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocate the lowest free port, or `None` when the range is exhausted
    pub fn allocate(&self) -> Option<u16> {
        let mut allocated = self.allocated.lock();
        let port = self.range.clone().find(|p| !allocated.contains(p))?;
        allocated.insert(port);
        Some(port)
    }

    /// Claim a specific port. Returns false if it is outside the range or taken.
    pub fn reserve(&self, port: u16) -> bool {
        if !self.range.contains(&port) {
            return false;
        }
        self.allocated.lock().insert(port)
    }

    pub fn release(&self, port: u16) {
        self.allocated.lock().remove(&port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.lock().contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.range.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_lowest_free_port() {
        let ports = PortAllocator::new(4000, 4003);
        assert_eq!(ports.allocate(), Some(4000));
        assert_eq!(ports.allocate(), Some(4001));
        ports.release(4000);
        assert_eq!(ports.allocate(), Some(4000));
        assert_eq!(ports.allocate(), Some(4002));
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.allocated_count(), 3);
        assert_eq!(ports.capacity(), 3);
    }

    #[test]
    fn test_reserve() {
        let ports = PortAllocator::new(4000, 4010);
        assert!(ports.reserve(4005));
        assert!(!ports.reserve(4005));
        assert!(!ports.reserve(3999));
        assert!(!ports.reserve(4010));
        assert!(ports.is_allocated(4005));
        assert_eq!(ports.allocate(), Some(4000));
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let ports = std::sync::Arc::new(PortAllocator::new(4000, 4100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = std::sync::Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..10).filter_map(|_| ports.allocate()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(total, 80);
    }
}
