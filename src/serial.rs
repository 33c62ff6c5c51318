use std::collections::BTreeSet;

/// Smallest positive serial not present in `used`.
///
/// Gaps left by deleted bookings are reused first; with no gap the result is
/// `max + 1`, and `1` for an empty day. Only correct against a consistent
/// snapshot: the engine calls this while holding the day's serial lock.
pub fn next_serial(used: &BTreeSet<u32>) -> u32 {
    let mut candidate = 1u32;
    // BTreeSet iterates in ascending order, so the first mismatch is the gap.
    for &serial in used.range(1..) {
        if serial != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}
