//! State types shared by `AutoTuner` and `RLHFTuner`.
//!
//! Every type here derives `Clone` so that `get_state()` can hand callers a
//! full deep copy (nested summaries, param maps, round history, label
//! progress) that they can mutate freely without affecting the tuner.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::param::ParamMap;

/// Aggregate outcome of one parameter combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboResult {
    pub params: ParamMap,
    pub overall_accept_mean: f64,
    pub misalignment_ratio_mean: f64,
    pub alignment_deg_mean: f64,
    pub nonzero_cells_mean: f64,
    pub active_tracks_mean: f64,
    pub foreground_capture_mean: f64,
    pub empty_box_ratio_mean: f64,
    pub unbounded_point_mean: f64,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// A `ComboResult` paired with a scalar score. Ordered strictly by score
/// descending; ties keep stable input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredResult {
    pub combo: ComboResult,
    pub score: f64,
}

/// Summary of one completed round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_index: u32,
    pub bounds: BTreeMap<String, (f64, f64)>,
    pub best_score: f64,
    pub best_params: ParamMap,
    pub num_combos: usize,
    pub top_k: Vec<ScoredResult>,
    pub pipeline_name: String,
    pub pipeline_version: String,
}

/// Best parameters plus their metric summary, published once a run completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub params: ParamMap,
    pub score: f64,
    pub acceptance_rate: f64,
    pub misalignment_ratio: f64,
    pub alignment_deg: f64,
    pub nonzero_cells: f64,
}

/// Lifecycle status of an `AutoTuner` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuneStatus {
    Idle,
    Running,
    Complete,
    Error,
}

impl TuneStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TuneStatus::Idle | TuneStatus::Complete | TuneStatus::Error)
    }
}

/// Full lifecycle record of an `AutoTuner` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTuneState {
    pub status: TuneStatus,
    pub round: u32,
    pub total_rounds: u32,
    pub completed_combos: usize,
    pub total_combos: usize,
    pub round_results: Vec<RoundSummary>,
    pub results: Vec<ScoredResult>,
    pub recommendation: Option<Recommendation>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for AutoTuneState {
    fn default() -> Self {
        Self {
            status: TuneStatus::Idle,
            round: 0,
            total_rounds: 0,
            completed_combos: 0,
            total_combos: 0,
            round_results: Vec::new(),
            results: Vec::new(),
            recommendation: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Phase of the RLHF label -> tune -> carry-over loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RlhfPhase {
    Idle,
    RunningReference,
    AwaitingLabels,
    RunningSweep,
    RoundComplete,
    Complete,
    Failed,
}

impl RlhfPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RlhfPhase::Idle | RlhfPhase::Complete | RlhfPhase::Failed)
    }
}

/// Labelling progress for the reference run currently awaiting labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelProgress {
    pub total: usize,
    pub labelled: usize,
    pub pct: f64,
    pub by_class: BTreeMap<String, usize>,
}

impl LabelProgress {
    pub fn new(total: usize, labelled: usize, by_class: BTreeMap<String, usize>) -> Self {
        let pct = if total == 0 { 0.0 } else { labelled as f64 / total as f64 * 100.0 };
        Self { total, labelled, pct, by_class }
    }
}

/// One completed RLHF round, appended to `round_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlhfRound {
    pub round: u32,
    pub reference_run_id: Option<String>,
    pub labelled_at: Option<DateTime<Utc>>,
    pub recommendation: Recommendation,
}

/// Full lifecycle record of an `RLHFTuner` run: a superset of
/// `AutoTuneState` plus the labelling protocol's own bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RLHFState {
    pub status: RlhfPhase,
    pub current_round: u32,
    pub total_rounds: u32,
    pub reference_run_id: Option<String>,
    pub label_deadline: Option<DateTime<Utc>>,
    pub label_progress: LabelProgress,
    pub round_history: Vec<RlhfRound>,
    pub min_label_threshold: f64,
    pub next_sweep_duration_secs: i64,
    pub sweep_deadline: Option<DateTime<Utc>>,
    pub recommendation: Option<Recommendation>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub auto_tune_state: AutoTuneState,
}

impl Default for RLHFState {
    fn default() -> Self {
        Self {
            status: RlhfPhase::Idle,
            current_round: 0,
            total_rounds: 0,
            reference_run_id: None,
            label_deadline: None,
            label_progress: LabelProgress::default(),
            round_history: Vec::new(),
            min_label_threshold: 0.9,
            next_sweep_duration_secs: 3600,
            sweep_deadline: None,
            recommendation: None,
            started_at: None,
            completed_at: None,
            error: None,
            auto_tune_state: AutoTuneState::default(),
        }
    }
}
