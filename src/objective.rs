//! The default scalar objective and ground-truth weight presets.

use serde::{Deserialize, Serialize};

use crate::state::{ComboResult, ScoredResult};

/// Weights for the default scalar objective. Minimization targets are
/// expressed by negative weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveWeights {
    pub acceptance: f64,
    pub misalignment: f64,
    pub alignment: f64,
    pub nonzero_cells: f64,
    pub active_tracks: f64,
}

impl ObjectiveWeights {
    /// All weight on acceptance; used by the `acceptance` objective.
    pub fn acceptance_only() -> Self {
        Self {
            acceptance: 1.0,
            misalignment: 0.0,
            alignment: 0.0,
            nonzero_cells: 0.0,
            active_tracks: 0.0,
        }
    }
}

impl Default for ObjectiveWeights {
    /// Preset defaults for the `weighted` objective: reward acceptance and
    /// alignment, penalize misalignment, lightly reward richer scenes.
    fn default() -> Self {
        Self {
            acceptance: 1.0,
            misalignment: -1.0,
            alignment: 0.5,
            nonzero_cells: 0.1,
            active_tracks: 0.1,
        }
    }
}

/// Eight weights used when `objective = ground_truth`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthWeights {
    pub detection_rate: f64,
    pub fragmentation: f64,
    pub false_positives: f64,
    pub velocity_coverage: f64,
    pub quality_premium: f64,
    pub truncation_rate: f64,
    pub velocity_noise_rate: f64,
    pub stopped_recovery: f64,
}

impl Default for GroundTruthWeights {
    fn default() -> Self {
        Self {
            detection_rate: 1.0,
            fragmentation: 5.0,
            false_positives: 2.0,
            velocity_coverage: 0.5,
            quality_premium: 0.3,
            truncation_rate: 0.4,
            velocity_noise_rate: 0.4,
            stopped_recovery: 0.2,
        }
    }
}

impl GroundTruthWeights {
    /// Round-1 exploratory bias: favor recall by upweighting detection and
    /// down-weighting the false-positive penalty.
    pub fn biased_for_recall(&self) -> Self {
        Self {
            detection_rate: self.detection_rate * 1.5,
            false_positives: self.false_positives * 0.5,
            ..*self
        }
    }
}

/// The objective selector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Acceptance,
    Weighted,
    GroundTruth,
}

impl Default for Objective {
    fn default() -> Self {
        Objective::Acceptance
    }
}

/// `score = w_acc*accept + w_mis*misalignment + w_align*alignment
///        + w_cells*ln(nonzero_cells) [if > 0] + w_tracks*ln(active_tracks) [if > 0]`
pub fn score_combo(combo: &ComboResult, weights: &ObjectiveWeights) -> f64 {
    let mut score = weights.acceptance * combo.overall_accept_mean
        + weights.misalignment * combo.misalignment_ratio_mean
        + weights.alignment * combo.alignment_deg_mean;
    if combo.nonzero_cells_mean > 0.0 {
        score += weights.nonzero_cells * combo.nonzero_cells_mean.ln();
    }
    if combo.active_tracks_mean > 0.0 {
        score += weights.active_tracks * combo.active_tracks_mean.ln();
    }
    score
}

/// Score every input and return them sorted by score descending (stable sort,
/// so ties preserve input order).
pub fn rank(results: Vec<ComboResult>, weights: &ObjectiveWeights) -> Vec<ScoredResult> {
    let mut scored: Vec<ScoredResult> = results
        .into_iter()
        .map(|combo| {
            let score = score_combo(&combo, weights);
            ScoredResult { combo, score }
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}
