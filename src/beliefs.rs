//! Read-only cycle inputs: price bars, the signal-engine feature vector,
//! and the belief engine's per-constraint probabilities.
//!
//! These are produced by external collaborators and are never recomputed
//! here; the decision engine only checks them for completeness and
//! staleness, and fails closed when either check fails.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub ts: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Fixed-shape numeric features with a reliability score per feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f64>,
    pub reliability: Vec<f64>,
}

impl FeatureVector {
    /// Shape check: one reliability entry per value, all finite.
    pub fn is_well_formed(&self) -> bool {
        self.values.len() == self.reliability.len()
            && self.values.iter().all(|v| v.is_finite())
            && self
                .reliability
                .iter()
                .all(|r| r.is_finite() && (0.0..=1.0).contains(r))
    }
}

/// Health of the data and fill pipelines, both in [0,1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalQuality {
    pub dvs: f64,
    pub eqs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayState {
    Fresh,
    Decaying,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintBelief {
    pub constraint_id: String,
    pub probability: f64,
    pub stability: f64,
    pub decay_state: DecayState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeliefSnapshot {
    /// Timestamp when the belief engine produced this snapshot (0 = never)
    pub fetch_ts: u64,
    pub beliefs: Vec<ConstraintBelief>,
}

impl BeliefSnapshot {
    pub fn is_stale(&self, now_ts: u64, max_age_secs: u64) -> bool {
        if self.fetch_ts == 0 {
            return true;
        }
        now_ts.saturating_sub(self.fetch_ts) > max_age_secs
    }

    pub fn is_empty(&self) -> bool {
        self.beliefs.is_empty()
    }

    /// Probabilities and stabilities must be finite and in [0,1].
    pub fn is_well_formed(&self) -> bool {
        self.beliefs.iter().all(|b| {
            b.probability.is_finite()
                && (0.0..=1.0).contains(&b.probability)
                && b.stability.is_finite()
                && (0.0..=1.0).contains(&b.stability)
        })
    }

    pub fn is_valid_for_trading(&self, now_ts: u64, max_age_secs: u64) -> bool {
        !self.is_stale(now_ts, max_age_secs) && !self.is_empty() && self.is_well_formed()
    }

    /// The constraint with the highest probability, if any.
    pub fn dominant(&self) -> Option<&ConstraintBelief> {
        self.beliefs
            .iter()
            .max_by(|a, b| a.probability.partial_cmp(&b.probability).unwrap_or(std::cmp::Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn belief(id: &str, p: f64, s: f64) -> ConstraintBelief {
        ConstraintBelief {
            constraint_id: id.to_string(),
            probability: p,
            stability: s,
            decay_state: DecayState::Fresh,
        }
    }

    #[test]
    fn test_snapshot_staleness() {
        let snap = BeliefSnapshot { fetch_ts: 1000, beliefs: vec![belief("c1", 0.6, 0.8)] };
        assert!(!snap.is_stale(1100, 120));
        assert!(snap.is_stale(1200, 120));

        let never = BeliefSnapshot { fetch_ts: 0, beliefs: vec![belief("c1", 0.6, 0.8)] };
        assert!(never.is_stale(1000, 120));
    }

    #[test]
    fn test_snapshot_well_formed() {
        let good = BeliefSnapshot { fetch_ts: 1000, beliefs: vec![belief("c1", 0.6, 0.8)] };
        assert!(good.is_well_formed());

        let bad = BeliefSnapshot { fetch_ts: 1000, beliefs: vec![belief("c1", 1.6, 0.8)] };
        assert!(!bad.is_well_formed());

        let nan = BeliefSnapshot { fetch_ts: 1000, beliefs: vec![belief("c1", f64::NAN, 0.8)] };
        assert!(!nan.is_well_formed());
    }

    #[test]
    fn test_dominant_constraint() {
        let snap = BeliefSnapshot {
            fetch_ts: 1000,
            beliefs: vec![belief("c1", 0.4, 0.9), belief("c2", 0.7, 0.5), belief("c3", 0.2, 0.8)],
        };
        assert_eq!(snap.dominant().unwrap().constraint_id, "c2");
    }

    #[test]
    fn test_feature_vector_shape() {
        let ok = FeatureVector { values: vec![1.0, 2.0], reliability: vec![0.9, 1.0] };
        assert!(ok.is_well_formed());

        let mismatched = FeatureVector { values: vec![1.0], reliability: vec![] };
        assert!(!mismatched.is_well_formed());

        let out_of_range = FeatureVector { values: vec![1.0], reliability: vec![1.5] };
        assert!(!out_of_range.is_well_formed());
    }
}
