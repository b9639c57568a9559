//! The coordinate-grid parameter auto-tuner.
//!
//! Mirrors an `AppState` + `cancel_flag` + async-command shape: shared state
//! lives behind a `tokio::sync::RwLock`, a single background task drives the
//! run to completion, and callers observe progress only through deep-copied
//! state snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::collaborators::{GroundTruthScorer, Persister, RunnerStatus, SceneStore, SweepCompletionRecord, SweepRequest, SweepRunner};
use crate::error::TuneError;
use crate::grid::{float_grid, int_grid, narrow_from_values};
use crate::objective::{rank, score_combo, GroundTruthWeights, Objective, ObjectiveWeights};
use crate::param::{ParamMap, ParamType, ParamValue, SweepParam};
use crate::state::{AutoTuneState, ComboResult, Recommendation, RoundSummary, ScoredResult, TuneStatus};
use crate::transform::TransformRegistry;

/// Hard cap on combinations evaluated in a single round.
pub const MAX_COMBOS_PER_ROUND: usize = 1000;

/// Request parameters for one `AutoTuner::start` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTuneRequest {
    pub params: Vec<SweepParam>,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_values_per_param")]
    pub values_per_param: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub weights: Option<ObjectiveWeights>,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub settle_time: f64,
    #[serde(default)]
    pub interval: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub data_source: String,
    #[serde(default)]
    pub pcap_file: Option<String>,
    #[serde(default)]
    pub pcap_start_secs: Option<f64>,
    #[serde(default)]
    pub pcap_duration_secs: Option<f64>,
    #[serde(default)]
    pub settle_mode: Option<String>,
    #[serde(default)]
    pub scene_id: Option<String>,
    #[serde(default)]
    pub ground_truth_weights: Option<GroundTruthWeights>,
}

fn default_max_rounds() -> u32 {
    3
}
fn default_values_per_param() -> usize {
    5
}
fn default_top_k() -> usize {
    5
}

/// Validate a request without touching any collaborator.
pub fn validate_request(req: &AutoTuneRequest) -> Result<(), TuneError> {
    if req.params.is_empty() {
        return Err(TuneError::InvalidRequest("no parameters specified".into()));
    }
    if req.params.len() > 10 {
        return Err(TuneError::InvalidRequest(
            "at most 10 parameters may be auto-tuned".into(),
        ));
    }
    for p in &req.params {
        if !p.param_type.is_numeric() {
            return Err(TuneError::InvalidRequest(format!(
                "parameter '{}' has type {:?} but auto-tuning only supports numeric types",
                p.name, p.param_type
            )));
        }
        if !(p.start < p.end) {
            return Err(TuneError::InvalidRequest(format!(
                "parameter '{}' must have start < end",
                p.name
            )));
        }
    }
    if req.max_rounds < 1 || req.max_rounds > 10 {
        return Err(TuneError::InvalidRequest("max_rounds must not exceed 10".into()));
    }
    if req.values_per_param < 2 {
        return Err(TuneError::InvalidRequest(
            "values_per_param must be at least 2".into(),
        ));
    }
    if req.values_per_param > 20 {
        return Err(TuneError::InvalidRequest(
            "values_per_param must not exceed 20".into(),
        ));
    }
    if req.top_k == 0 || req.top_k > 50 {
        return Err(TuneError::InvalidRequest("top_k must be between 1 and 50".into()));
    }
    if matches!(req.objective, Objective::GroundTruth) && req.scene_id.is_none() {
        return Err(TuneError::InvalidRequest(
            "ground_truth objective requires scene_id".into(),
        ));
    }
    Ok(())
}

fn resolve_weights(req: &AutoTuneRequest) -> ObjectiveWeights {
    match req.objective {
        Objective::Acceptance => ObjectiveWeights::acceptance_only(),
        Objective::Weighted => req.weights.unwrap_or_default(),
        Objective::GroundTruth => ObjectiveWeights::default(),
    }
}

fn initial_bounds(params: &[SweepParam]) -> BTreeMap<String, (f64, f64)> {
    params.iter().map(|p| (p.name.clone(), (p.start, p.end))).collect()
}

/// Build the cartesian product of per-parameter grids, failing when the
/// total would exceed `MAX_COMBOS_PER_ROUND`.
fn build_grid(
    params: &[SweepParam],
    bounds: &BTreeMap<String, (f64, f64)>,
    values_per_param: usize,
) -> Result<Vec<ParamMap>, TuneError> {
    let mut per_param: Vec<(String, Vec<ParamValue>)> = Vec::with_capacity(params.len());
    let mut total: usize = 1;
    for p in params {
        let (start, end) = bounds.get(&p.name).copied().unwrap_or((p.start, p.end));
        let values: Vec<ParamValue> = match p.param_type {
            ParamType::Float => float_grid(start, end, values_per_param)
                .into_iter()
                .map(ParamValue::Float)
                .collect(),
            ParamType::Int32 => int_grid(start, end, values_per_param)
                .into_iter()
                .map(|v| ParamValue::Int32(v as i32))
                .collect(),
            ParamType::Int64 => int_grid(start, end, values_per_param)
                .into_iter()
                .map(ParamValue::Int64)
                .collect(),
            ParamType::Bool | ParamType::String => unreachable!("validated numeric-only at Start"),
        };
        total = total.saturating_mul(values.len().max(1));
        if total > MAX_COMBOS_PER_ROUND {
            return Err(TuneError::InvalidRequest(format!(
                "grid of {} combinations exceeds the per-round limit of {}",
                total, MAX_COMBOS_PER_ROUND
            )));
        }
        per_param.push((p.name.clone(), values));
    }

    let mut combos: Vec<ParamMap> = vec![ParamMap::new()];
    for (name, values) in per_param {
        let mut next = Vec::with_capacity(combos.len() * values.len().max(1));
        for combo in &combos {
            for v in &values {
                let mut c = combo.clone();
                c.insert(name.clone(), v.clone());
                next.push(c);
            }
        }
        combos = next;
    }
    Ok(combos)
}

/// Narrow each parameter's bounds around its values in `top_k`, clamped back
/// into the parameter's original request bounds.
pub fn narrow_bounds(
    params: &[SweepParam],
    top_k: &[ScoredResult],
    values_per_param: usize,
) -> BTreeMap<String, (f64, f64)> {
    let mut out = BTreeMap::new();
    for p in params {
        let values: Vec<f64> = top_k
            .iter()
            .filter_map(|sr| sr.combo.params.get(&p.name))
            .filter_map(|v| v.as_f64())
            .collect();
        let (new_start, new_end) = if values.is_empty() {
            (p.start, p.end)
        } else {
            narrow_from_values(&values, values_per_param)
        };
        let clamped_start = new_start.max(p.start).min(p.end);
        let clamped_end = new_end.min(p.end).max(p.start);
        out.insert(p.name.clone(), (clamped_start, clamped_end));
    }
    out
}

struct Inner {
    state: RwLock<AutoTuneState>,
    cancelled: AtomicBool,
    runner: Option<Arc<dyn SweepRunner>>,
    scene_store: Option<Arc<dyn SceneStore>>,
    scorer: Option<Arc<dyn GroundTruthScorer>>,
    persister: Option<Arc<dyn Persister>>,
    registry: Arc<TransformRegistry>,
}

/// Runs up to `max_rounds` of grid evaluation, narrowing bounds around the
/// top-K after each round.
#[derive(Clone)]
pub struct AutoTuner {
    inner: Arc<Inner>,
}

impl AutoTuner {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(AutoTuneState::default()),
                cancelled: AtomicBool::new(false),
                runner: None,
                scene_store: None,
                scorer: None,
                persister: None,
                registry: Arc::new(TransformRegistry::with_presets()),
            }),
        }
    }

    /// Builders below are only meaningful before the first clone of `self`
    /// (i.e. immediately after `new()`), so `Arc::get_mut` always succeeds.
    fn edit(&mut self, f: impl FnOnce(&mut Inner)) {
        let inner = Arc::get_mut(&mut self.inner).expect("collaborators must be set before sharing AutoTuner");
        f(inner);
    }

    pub fn with_runner(mut self, runner: Arc<dyn SweepRunner>) -> Self {
        self.edit(|i| i.runner = Some(runner));
        self
    }

    pub fn with_scene_store(mut self, scene_store: Arc<dyn SceneStore>) -> Self {
        self.edit(|i| i.scene_store = Some(scene_store));
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn GroundTruthScorer>) -> Self {
        self.edit(|i| i.scorer = Some(scorer));
        self
    }

    pub fn with_persister(mut self, persister: Arc<dyn Persister>) -> Self {
        self.edit(|i| i.persister = Some(persister));
        self
    }

    fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Deep copy of the current state tree.
    pub async fn get_state(&self) -> AutoTuneState {
        self.inner.state.read().await.clone()
    }

    /// Cancel the current run. Idempotent; a no-op while idle.
    pub fn stop(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Validate the request and spawn the background round loop.
    pub async fn start(&self, req: AutoTuneRequest) -> Result<(), TuneError> {
        validate_request(&req)?;
        {
            let state = self.inner.state.read().await;
            if state.status == TuneStatus::Running {
                return Err(TuneError::AlreadyRunning);
            }
        }
        if self.inner.runner.is_none() {
            return Err(TuneError::NotConfigured("sweep runner".into()));
        }
        if matches!(req.objective, Objective::GroundTruth) && self.inner.scorer.is_none() {
            return Err(TuneError::InvalidRequest(
                "ground_truth objective requires a configured ground-truth scorer".into(),
            ));
        }

        self.inner.cancelled.store(false, Ordering::SeqCst);
        {
            let mut state = self.inner.state.write().await;
            *state = AutoTuneState {
                status: TuneStatus::Running,
                total_rounds: req.max_rounds,
                started_at: Some(Utc::now()),
                ..AutoTuneState::default()
            };
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_rounds(req).await;
        });
        Ok(())
    }

    async fn set_round(&self, round: u32, total_combos: usize) {
        let mut state = self.inner.state.write().await;
        state.round = round;
        state.total_combos = total_combos;
        state.completed_combos = 0;
    }

    async fn set_progress(&self, completed: usize, total: usize) {
        let mut state = self.inner.state.write().await;
        if total > 0 {
            state.total_combos = total;
        }
        state.completed_combos = completed.min(state.total_combos);
    }

    async fn push_round(&self, summary: RoundSummary, results: Vec<ScoredResult>) {
        let mut state = self.inner.state.write().await;
        state.round_results.push(summary);
        state.results.extend(results);
    }

    async fn fail(&self, err: TuneError) {
        {
            let mut state = self.inner.state.write().await;
            state.status = TuneStatus::Error;
            state.error = Some(err.to_string());
            state.completed_at = Some(Utc::now());
        }
        tracing::error!(error = %err, "auto-tune run failed");
        if let Some(persister) = &self.inner.persister {
            let record = SweepCompletionRecord {
                status: "failed".into(),
                round_results: serde_json::Value::Null,
                score_components: None,
                recommendation_explanation: None,
                label_provenance_summary: None,
                schema_version: "1".into(),
            };
            if let Err(e) = persister.save_sweep_complete(record).await {
                tracing::warn!(error = %e, "failed to persist auto-tune failure record");
            }
        }
    }

    async fn complete(&self, best: ScoredResult, req: &AutoTuneRequest) {
        let recommendation = Recommendation {
            params: best.combo.params.clone(),
            score: best.score,
            acceptance_rate: best.combo.overall_accept_mean,
            misalignment_ratio: best.combo.misalignment_ratio_mean,
            alignment_deg: best.combo.alignment_deg_mean,
            nonzero_cells: best.combo.nonzero_cells_mean,
        };
        {
            let mut state = self.inner.state.write().await;
            state.status = TuneStatus::Complete;
            state.completed_at = Some(Utc::now());
            state.recommendation = Some(recommendation.clone());
        }
        tracing::info!(score = recommendation.score, "auto-tune complete");

        if matches!(req.objective, Objective::GroundTruth) {
            if let (Some(store), Some(scene_id)) = (&self.inner.scene_store, &req.scene_id) {
                let params_json = serde_json::to_value(&recommendation.params).unwrap_or(serde_json::Value::Null);
                if let Err(e) = store.set_optimal_params(scene_id, params_json).await {
                    tracing::warn!(error = %e, "failed to persist optimal params to scene store");
                }
            }
        }
    }

    async fn run_rounds(&self, req: AutoTuneRequest) {
        let runner = match &self.inner.runner {
            Some(r) => r.clone(),
            None => {
                self.fail(TuneError::NotConfigured("sweep runner".into())).await;
                return;
            }
        };
        if let Some(persister) = &self.inner.persister {
            let request_json = serde_json::to_value(&req).unwrap_or(serde_json::Value::Null);
            if let Err(e) = persister.save_sweep_start("autotune", &request_json).await {
                tracing::warn!(error = %e, "failed to persist auto-tune start record");
            }
        }
        let weights = resolve_weights(&req);
        let pipeline = self
            .inner
            .registry
            .get(if matches!(req.objective, Objective::GroundTruth) {
                "ground_truth"
            } else {
                "default"
            })
            .unwrap_or_else(|| Arc::new(crate::transform::Pipeline::default_preset()));

        let mut bounds = initial_bounds(&req.params);
        let mut overall_best: Option<ScoredResult> = None;

        for round_index in 1..=req.max_rounds {
            if self.is_cancelled() {
                self.fail(TuneError::Cancelled("auto-tune cancelled".into())).await;
                return;
            }

            let combos = match build_grid(&req.params, &bounds, req.values_per_param) {
                Ok(c) => c,
                Err(e) => {
                    self.fail(e).await;
                    return;
                }
            };
            let total_combos = combos.len();
            self.set_round(round_index, total_combos).await;
            tracing::info!(round = round_index, total_combos, "starting auto-tune round");

            let sweep_params: Vec<SweepParam> = req
                .params
                .iter()
                .map(|p| {
                    let (start, end) = bounds.get(&p.name).copied().unwrap_or((p.start, p.end));
                    let values: Vec<ParamValue> = combos
                        .iter()
                        .filter_map(|c| c.get(&p.name).cloned())
                        .collect();
                    SweepParam {
                        name: p.name.clone(),
                        param_type: p.param_type,
                        start,
                        end,
                        step: p.step,
                        values: Some(values),
                    }
                })
                .collect();

            let sweep_req = SweepRequest {
                params: sweep_params,
                iterations: req.iterations,
                settle_time: req.settle_time,
                interval: req.interval,
                seed: req.seed,
                data_source: req.data_source.clone(),
                pcap_file: req.pcap_file.clone(),
                pcap_start_secs: req.pcap_start_secs,
                pcap_duration_secs: req.pcap_duration_secs,
                settle_mode: req.settle_mode.clone(),
            };

            if let Err(e) = runner.start(sweep_req).await {
                self.fail(TuneError::RunnerFailure(e.to_string())).await;
                return;
            }

            let results = loop {
                if self.is_cancelled() {
                    self.fail(TuneError::Cancelled("auto-tune cancelled".into())).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                let runner_state = match runner.get_state().await {
                    Ok(s) => s,
                    Err(e) => {
                        self.fail(TuneError::RunnerFailure(e.to_string())).await;
                        return;
                    }
                };
                self.set_progress(runner_state.completed_combos, runner_state.total_combos).await;
                match runner_state.status {
                    RunnerStatus::Running => continue,
                    RunnerStatus::Error => {
                        self.fail(TuneError::RunnerFailure(
                            runner_state.error.unwrap_or_else(|| "sweep runner reported an error".into()),
                        ))
                        .await;
                        return;
                    }
                    RunnerStatus::Complete => break runner_state.results,
                }
            };

            if results.is_empty() {
                self.fail(TuneError::RunnerFailure("round produced no results".into())).await;
                return;
            }

            let scored_all: Vec<ScoredResult> = if matches!(req.objective, Objective::GroundTruth) {
                self.score_ground_truth(&results, req.scene_id.as_deref().unwrap(), &req.ground_truth_weights.unwrap_or_default())
                    .await
            } else {
                rank(results, &weights)
            };

            let top_k: Vec<ScoredResult> = scored_all.iter().take(req.top_k).cloned().collect();
            if let Some(best) = top_k.first() {
                if overall_best.as_ref().map_or(true, |b| best.score > b.score) {
                    overall_best = Some(best.clone());
                }
            }

            let summary = RoundSummary {
                round_index,
                bounds: bounds.clone(),
                best_score: top_k.first().map(|t| t.score).unwrap_or(0.0),
                best_params: top_k.first().map(|t| t.combo.params.clone()).unwrap_or_default(),
                num_combos: total_combos,
                top_k: top_k.clone(),
                pipeline_name: pipeline.name.clone(),
                pipeline_version: pipeline.version.clone(),
            };
            self.push_round(summary, scored_all).await;

            if round_index < req.max_rounds {
                bounds = narrow_bounds(&req.params, &top_k, req.values_per_param);
            }
        }

        match overall_best {
            None => self.fail(TuneError::RunnerFailure("no successful rounds".into())).await,
            Some(best) => self.complete(best, &req).await,
        }
    }

    async fn score_ground_truth(
        &self,
        results: &[ComboResult],
        scene_id: &str,
        weights: &GroundTruthWeights,
    ) -> Vec<ScoredResult> {
        let scorer = self.inner.scorer.clone();
        let mut scored = Vec::with_capacity(results.len());
        for combo in results {
            let score = match (&scorer, &combo.run_id) {
                (Some(scorer), Some(run_id)) => match scorer.score(scene_id, run_id, weights).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, run_id, "ground-truth scorer failed, falling back to 0");
                        0.0
                    }
                },
                _ => {
                    tracing::warn!("combo missing run_id for ground-truth scoring, falling back to 0");
                    0.0
                }
            };
            scored.push(ScoredResult { combo: combo.clone(), score });
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

impl Default for AutoTuner {
    fn default() -> Self {
        Self::new()
    }
}

// Exposed for RLHFTuner's narrowing re-use and for ad hoc scoring of a
// single combo without going through a full round.
pub fn score_one(combo: &ComboResult, weights: &ObjectiveWeights) -> f64 {
    score_combo(combo, weights)
}
