//! Injected collaborator traits: the external sweep runner, label store,
//! scene store, run creator, ground-truth scorer, and persister.
//!
//! Each is `Send + Sync` and object-safe via `async_trait`, following a
//! dependency-injection style where shared services live behind an
//! `Arc<dyn Trait>` handed to the tuner constructors.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::TuneError;
use crate::objective::GroundTruthWeights;
use crate::param::{ParamMap, SweepParam};
use crate::state::ComboResult;

/// A request submitted to the external sweep runner: the per-parameter grid
/// values plus the pass-through sampling configuration.
#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub params: Vec<SweepParam>,
    pub iterations: u32,
    pub settle_time: f64,
    pub interval: f64,
    pub seed: Option<u64>,
    pub data_source: String,
    pub pcap_file: Option<String>,
    pub pcap_start_secs: Option<f64>,
    pub pcap_duration_secs: Option<f64>,
    pub settle_mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Running,
    Complete,
    Error,
}

/// Snapshot of the sweep runner's progress, as read by polling.
#[derive(Debug, Clone)]
pub struct RunnerState {
    pub status: RunnerStatus,
    pub completed_combos: usize,
    pub total_combos: usize,
    pub results: Vec<ComboResult>,
    pub error: Option<String>,
}

/// Executes a grid of parameter combinations and produces per-combination
/// aggregate metrics. Polled every 500ms by `AutoTuner`.
#[async_trait]
pub trait SweepRunner: Send + Sync {
    async fn start(&self, req: SweepRequest) -> Result<(), TuneError>;
    async fn get_state(&self) -> Result<RunnerState, TuneError>;
}

/// A single track within a reference run, with whatever human label it has
/// been given so far.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: String,
    pub start_ns: i64,
    pub end_ns: i64,
    pub user_label: Option<String>,
    pub quality_label: Option<String>,
}

/// Reads and writes human labels against a persisted run.
#[async_trait]
pub trait LabelQuerier: Send + Sync {
    async fn labeling_progress(
        &self,
        run_id: &str,
    ) -> Result<(usize, usize, BTreeMap<String, usize>), TuneError>;

    async fn run_tracks(&self, run_id: &str) -> Result<Vec<Track>, TuneError>;

    #[allow(clippy::too_many_arguments)]
    async fn update_track_label(
        &self,
        run_id: &str,
        track_id: &str,
        user_label: &str,
        quality_label: &str,
        confidence: f64,
        labeler_id: &str,
    ) -> Result<(), TuneError>;
}

/// Scene metadata: any previously-stored optimal params and the current
/// reference run.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub scene_id: String,
    pub optimal_params: Option<ParamMap>,
    pub reference_run_id: Option<String>,
}

/// Stores scene metadata and the scene's optimal-parameter recommendation.
#[async_trait]
pub trait SceneStore: Send + Sync {
    async fn scene(&self, scene_id: &str) -> Result<Scene, TuneError>;
    async fn set_reference_run(&self, scene_id: &str, run_id: &str) -> Result<(), TuneError>;
    async fn set_optimal_params(
        &self,
        scene_id: &str,
        params: serde_json::Value,
    ) -> Result<(), TuneError>;
}

/// Materializes a reference run against the live pipeline or recorded data.
#[async_trait]
pub trait RunCreator: Send + Sync {
    async fn create_sweep_run(
        &self,
        sensor_id: &str,
        pcap_file: Option<&str>,
        params: &ParamMap,
    ) -> Result<String, TuneError>;
}

/// Scores a labelled run against ground truth.
#[async_trait]
pub trait GroundTruthScorer: Send + Sync {
    async fn score(
        &self,
        scene_id: &str,
        run_id: &str,
        weights: &GroundTruthWeights,
    ) -> Result<f64, TuneError>;
}

/// A persisted sweep-completion record (schema-versioned JSON columns).
#[derive(Debug, Clone)]
pub struct SweepCompletionRecord {
    pub status: String,
    pub round_results: serde_json::Value,
    pub score_components: Option<serde_json::Value>,
    pub recommendation_explanation: Option<serde_json::Value>,
    pub label_provenance_summary: Option<serde_json::Value>,
    pub schema_version: String,
}

/// Persists sweep start/completion records. Failures are logged but never
/// fail the run.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn save_sweep_start(&self, kind: &str, request: &serde_json::Value) -> Result<(), TuneError>;
    async fn save_sweep_complete(&self, record: SweepCompletionRecord) -> Result<(), TuneError>;
}
