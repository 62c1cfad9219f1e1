//! Successor election after primary loss.
//!
//! Candidates are standbys that were verified healthy during the current
//! cycle. The most advanced replication position wins; equal positions are
//! broken by the lowest serial so that every controller replica, given the
//! same observations, picks the same instance.

use crate::lsn::Lsn;
use std::cmp::Ordering;

/// A standby eligible for promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub serial: u32,
    /// Last WAL position received or replayed by the standby.
    pub position: Lsn,
}

/// Preference order: most advanced position first, then lowest serial.
pub fn preference(a: &Candidate, b: &Candidate) -> Ordering {
    b.position
        .cmp(&a.position)
        .then_with(|| a.serial.cmp(&b.serial))
}

/// Pick the candidate to promote, or `None` if there is nobody eligible.
pub fn elect(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().min_by(|a, b| preference(a, b))
}
