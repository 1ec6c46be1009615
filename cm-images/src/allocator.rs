//! Disk-space reservation.
//!
//! Two independent allocators exist per [`crate::service::ImageService`]: one
//! reserves bytes before a download starts, the other commits bytes after a
//! successful extraction. Both are this same simple counting allocator —
//! the eviction policy that runs when an allocator is under pressure lives
//! in [`crate::service`], since only the service knows which cached items
//! are eviction candidates.

use cm_proto::{CmError, CmResult, ErrorKind};

pub struct SpaceAllocator {
    capacity: u64,
    reserved: u64,
}

impl SpaceAllocator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            reserved: 0,
        }
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.reserved)
    }

    pub fn try_reserve(&mut self, bytes: u64) -> bool {
        if bytes <= self.available() {
            self.reserved += bytes;
            true
        } else {
            false
        }
    }

    pub fn release(&mut self, bytes: u64) {
        self.reserved = self.reserved.saturating_sub(bytes);
    }
}

/// Reserves `bytes`, evicting candidates supplied by `next_victim` (oldest
/// `cached` item first, per spec) until the request fits or candidates are
/// exhausted. `evict` actually frees the victim's storage and must call
/// `allocator.release` with its size before returning.
pub fn reserve_with_eviction<F, E>(
    allocator: &mut SpaceAllocator,
    bytes: u64,
    mut next_victim: F,
    mut evict: E,
) -> CmResult<()>
where
    F: FnMut() -> Option<(String, u64)>,
    E: FnMut(&str),
{
    if allocator.try_reserve(bytes) {
        return Ok(());
    }
    while let Some((digest, size)) = next_victim() {
        evict(&digest);
        allocator.release(size);
        if allocator.try_reserve(bytes) {
            return Ok(());
        }
    }
    Err(CmError::no_memory(format!(
        "no {bytes} bytes available after evicting all cached items"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_within_capacity() {
        let mut a = SpaceAllocator::new(100);
        assert!(a.try_reserve(60));
        assert!(a.try_reserve(40));
        assert!(!a.try_reserve(1));
        a.release(40);
        assert!(a.try_reserve(40));
    }

    #[test]
    fn eviction_frees_enough_to_satisfy_request() {
        let mut a = SpaceAllocator::new(100);
        assert!(a.try_reserve(100));

        let mut victims = vec![("old1".to_string(), 30u64), ("old2".to_string(), 30u64)];
        let mut evicted = Vec::new();
        let result = reserve_with_eviction(
            &mut a,
            50,
            || victims.pop(),
            |digest| evicted.push(digest.to_string()),
        );
        assert!(result.is_ok());
        assert_eq!(evicted, vec!["old2", "old1"]);
    }

    #[test]
    fn fails_with_no_memory_when_eviction_cannot_satisfy() {
        let mut a = SpaceAllocator::new(100);
        assert!(a.try_reserve(100));

        let result = reserve_with_eviction(&mut a, 50, || None, |_| {});
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NoMemory);
    }
}
