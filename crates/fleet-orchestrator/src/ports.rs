//! Port Allocation
//!
//! Hands out free ports from a bounded range. The allocator itself is
//! stateless; the set of claimed ports is derived from the registry at call
//! time so there is a single source of truth for "in use".

use std::collections::BTreeSet;

use crate::error::{RegistryError, Result};

/// Allocates the lowest free port in a fixed inclusive range.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    start: u16,
    end: u16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Lowest port in range not present in `in_use`, or `PortsExhausted`.
    pub fn next_free(&self, in_use: &BTreeSet<u16>) -> Result<u16> {
        (self.start..=self.end)
            .find(|port| !in_use.contains(port))
            .ok_or(RegistryError::PortsExhausted {
                start: self.start,
                end: self.end,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_first() {
        let alloc = PortAllocator::new(8188, 8199);
        assert_eq!(alloc.next_free(&BTreeSet::new()).unwrap(), 8188);
    }

    #[test]
    fn test_skips_claimed_ports() {
        let alloc = PortAllocator::new(8188, 8199);
        let in_use: BTreeSet<u16> = [8188, 8189, 8191].into_iter().collect();
        assert_eq!(alloc.next_free(&in_use).unwrap(), 8190);
    }

    #[test]
    fn test_exhausted() {
        let alloc = PortAllocator::new(8188, 8190);
        let in_use: BTreeSet<u16> = [8188, 8189, 8190].into_iter().collect();
        match alloc.next_free(&in_use) {
            Err(RegistryError::PortsExhausted { start, end }) => {
                assert_eq!((start, end), (8188, 8190));
            }
            other => panic!("expected PortsExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_ports_outside_range_ignored() {
        let alloc = PortAllocator::new(8188, 8190);
        let in_use: BTreeSet<u16> = [80, 443, 9000].into_iter().collect();
        assert_eq!(alloc.next_free(&in_use).unwrap(), 8188);
        assert!(!alloc.contains(9000));
        assert!(alloc.contains(8189));
    }
}
