//! Provider VLAN selection. The RNG is injected
//! (`original_source`'s `NetworkManager` test doubles show `RandInt` is
//! injected, via a `MockRandom` seam) so allocation is deterministic in
//! tests.

use std::collections::HashSet;

use cm_proto::{CmError, CmResult, ErrorKind};
use rand::RngCore;

pub const VLAN_MIN: u16 = 1;
pub const VLAN_MAX: u16 = 4094;
const MAX_ATTEMPTS: u32 = 4096;

/// Picks an unused VLAN ID in `[VLAN_MIN, VLAN_MAX]` from `rng`, retrying on
/// an out-of-range draw or a collision with `in_use` up to `MAX_ATTEMPTS`
/// times.
pub fn pick(rng: &mut dyn RngCore, in_use: &HashSet<u16>) -> CmResult<u16> {
    for _ in 0..MAX_ATTEMPTS {
        let raw = rng.next_u32();
        if raw < VLAN_MIN as u32 || raw > VLAN_MAX as u32 {
            continue;
        }
        let candidate = raw as u16;
        if !in_use.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(CmError::new(
        ErrorKind::OutOfRange,
        format!("exhausted {MAX_ATTEMPTS} attempts picking a free vlan id"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns a fixed sequence, then panics if drained further.
    struct SequenceRng(std::vec::IntoIter<u32>);

    impl RngCore for SequenceRng {
        fn next_u32(&mut self) -> u32 {
            self.0.next().expect("sequence rng exhausted")
        }
        fn next_u64(&mut self) -> u64 {
            self.next_u32() as u64
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(4) {
                let bytes = self.next_u32().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn two_networks_get_the_literal_rng_values() {
        let mut rng = SequenceRng(vec![1000, 2000].into_iter());
        let mut in_use = HashSet::new();

        let first = pick(&mut rng, &in_use).unwrap();
        assert_eq!(first, 1000);
        in_use.insert(first);

        let second = pick(&mut rng, &in_use).unwrap();
        assert_eq!(second, 2000);
    }

    #[test]
    fn out_of_range_draws_are_retried() {
        let mut rng = SequenceRng(vec![5000, 0, 1234].into_iter());
        let picked = pick(&mut rng, &HashSet::new()).unwrap();
        assert_eq!(picked, 1234);
    }
}
