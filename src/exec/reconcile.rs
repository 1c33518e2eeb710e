//! Expected-versus-venue comparison.
//!
//! Zero-tolerance by default: any position drift beyond the configured
//! threshold is a state-consistency failure that trips the kill switch and
//! forces a flatten. The comparison itself is pure so it can be tested
//! without an adapter.

use crate::adapter::VenueSnapshot;
use crate::logging::log_reconcile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Clean,
    Mismatch { expected: i64, reported: i64, drift: i64 },
}

pub fn compare(expected_position: i64, snapshot: &VenueSnapshot, tolerance: i64) -> ReconcileOutcome {
    let drift = (expected_position - snapshot.position).abs();
    if drift > tolerance.max(0) {
        log_reconcile("mismatch", expected_position, snapshot.position);
        ReconcileOutcome::Mismatch {
            expected: expected_position,
            reported: snapshot.position,
            drift,
        }
    } else {
        log_reconcile("clean", expected_position, snapshot.position);
        ReconcileOutcome::Clean
    }
}
