//! `RLHFTuner`: the human-in-the-loop label -> tune -> carry-over loop.
//!
//! Wraps an internal, single-round `AutoTuner` dispatch per round behind a
//! shared `RwLock<RLHFState>` progress bridge: the background task mirrors
//! the inner `AutoTuner`'s state into its own on every poll tick rather than
//! pushing updates through an event channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::autotuner::{narrow_bounds, AutoTuneRequest, AutoTuner};
use crate::collaborators::{
    GroundTruthScorer, LabelQuerier, Persister, RunCreator, SceneStore, SweepCompletionRecord, SweepRunner, Track,
};
use crate::error::TuneError;
use crate::objective::{GroundTruthWeights, Objective};
use crate::param::{ParamMap, ParamType, ParamValue, SweepParam};
use crate::state::{RLHFState, RlhfPhase, RlhfRound};

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Request parameters for one `RLHFTuner::start` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlhfRequest {
    pub scene_id: String,
    #[serde(default)]
    pub sensor_id: Option<String>,
    pub params: Vec<SweepParam>,
    #[serde(default = "default_num_rounds")]
    pub num_rounds: u32,
    #[serde(default)]
    pub min_label_threshold: f64,
    #[serde(default)]
    pub round_durations_secs: Vec<i64>,
    #[serde(default)]
    pub carry_over_labels: bool,
    #[serde(default = "default_values_per_param")]
    pub values_per_param: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
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
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: i64,
    #[serde(default = "default_next_sweep_duration_secs")]
    pub next_sweep_duration_secs: i64,
}

fn default_num_rounds() -> u32 {
    3
}
fn default_values_per_param() -> usize {
    5
}
fn default_top_k() -> usize {
    5
}
fn default_poll_interval_secs() -> i64 {
    10
}
fn default_next_sweep_duration_secs() -> i64 {
    3600
}

/// Signal sent by `continue_from_labels` to short-circuit the label wait.
#[derive(Debug, Clone, Copy)]
pub struct ContinueSignal {
    pub next_sweep_duration_secs: Option<i64>,
    pub add_round: bool,
}

pub fn validate_rlhf_request(req: &RlhfRequest) -> Result<(), TuneError> {
    if req.scene_id.trim().is_empty() {
        return Err(TuneError::InvalidRequest("scene_id is required".into()));
    }
    if req.num_rounds < 1 || req.num_rounds > 10 {
        return Err(TuneError::InvalidRequest("num_rounds must be between 1 and 10".into()));
    }
    if req.params.is_empty() {
        return Err(TuneError::InvalidRequest("no parameters specified".into()));
    }
    if req.params.len() > 20 {
        return Err(TuneError::InvalidRequest(
            "at most 20 parameters may be auto-tuned".into(),
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
    if req.values_per_param < 2 || req.values_per_param > 20 {
        return Err(TuneError::InvalidRequest(
            "values_per_param must be between 2 and 20".into(),
        ));
    }
    if req.top_k == 0 || req.top_k > 50 {
        return Err(TuneError::InvalidRequest("top_k must be between 1 and 50".into()));
    }
    Ok(())
}

/// Per-track nanosecond interval IoU. Zero-length intervals yield 0.
pub fn temporal_iou(a_start: i64, a_end: i64, b_start: i64, b_end: i64) -> f64 {
    let inter_start = a_start.max(b_start);
    let inter_end = a_end.min(b_end);
    let intersection = (inter_end - inter_start).max(0) as f64;
    let union_start = a_start.min(b_start);
    let union_end = a_end.max(b_end);
    let union = (union_end - union_start) as f64;
    if union <= 0.0 {
        0.0
    } else {
        (intersection / union).max(0.0)
    }
}

/// For each labelled track in `prior`, find the best IoU match in `new_tracks`
/// with `IoU >= 0.5`. Returns `(prior_track, new_track, iou)` triples.
fn match_carry_over<'a>(prior: &'a [Track], new_tracks: &'a [Track]) -> Vec<(&'a Track, &'a Track, f64)> {
    let mut matches = Vec::new();
    for p in prior.iter().filter(|t| t.user_label.is_some()) {
        let best = new_tracks
            .iter()
            .map(|n| (n, temporal_iou(p.start_ns, p.end_ns, n.start_ns, n.end_ns)))
            .filter(|(_, iou)| *iou >= 0.5)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((n, iou)) = best {
            matches.push((p, n, iou));
        }
    }
    matches
}

fn midpoint_params(params: &[SweepParam]) -> ParamMap {
    params
        .iter()
        .map(|p| {
            let mid = (p.start + p.end) / 2.0;
            let value = match p.param_type {
                ParamType::Float => ParamValue::Float(mid),
                ParamType::Int32 => ParamValue::Int32(mid.round() as i32),
                ParamType::Int64 => ParamValue::Int64(mid.round() as i64),
                ParamType::Bool | ParamType::String => unreachable!("validated numeric-only at Start"),
            };
            (p.name.clone(), value)
        })
        .collect()
}

struct Inner {
    state: RwLock<RLHFState>,
    cancelled: AtomicBool,
    continue_tx: mpsc::Sender<ContinueSignal>,
    continue_rx: Mutex<mpsc::Receiver<ContinueSignal>>,
    run_creator: Option<Arc<dyn RunCreator>>,
    label_querier: Option<Arc<dyn LabelQuerier>>,
    scene_store: Option<Arc<dyn SceneStore>>,
    scorer: Option<Arc<dyn GroundTruthScorer>>,
    persister: Option<Arc<dyn Persister>>,
    sweep_runner: Option<Arc<dyn SweepRunner>>,
}

/// Coordinates reference-run generation, label waiting, optional carry-over,
/// and a one-round-per-call `AutoTuner` dispatch scored against ground truth.
#[derive(Clone)]
pub struct RLHFTuner {
    inner: Arc<Inner>,
}

impl RLHFTuner {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(RLHFState::default()),
                cancelled: AtomicBool::new(false),
                continue_tx: tx,
                continue_rx: Mutex::new(rx),
                run_creator: None,
                label_querier: None,
                scene_store: None,
                scorer: None,
                persister: None,
                sweep_runner: None,
            }),
        }
    }

    fn edit(&mut self, f: impl FnOnce(&mut Inner)) {
        let inner = Arc::get_mut(&mut self.inner).expect("collaborators must be set before sharing RLHFTuner");
        f(inner);
    }

    pub fn with_run_creator(mut self, v: Arc<dyn RunCreator>) -> Self {
        self.edit(|i| i.run_creator = Some(v));
        self
    }
    pub fn with_label_querier(mut self, v: Arc<dyn LabelQuerier>) -> Self {
        self.edit(|i| i.label_querier = Some(v));
        self
    }
    pub fn with_scene_store(mut self, v: Arc<dyn SceneStore>) -> Self {
        self.edit(|i| i.scene_store = Some(v));
        self
    }
    pub fn with_scorer(mut self, v: Arc<dyn GroundTruthScorer>) -> Self {
        self.edit(|i| i.scorer = Some(v));
        self
    }
    pub fn with_persister(mut self, v: Arc<dyn Persister>) -> Self {
        self.edit(|i| i.persister = Some(v));
        self
    }
    pub fn with_sweep_runner(mut self, v: Arc<dyn SweepRunner>) -> Self {
        self.edit(|i| i.sweep_runner = Some(v));
        self
    }

    fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn get_state(&self) -> RLHFState {
        self.inner.state.read().await.clone()
    }

    pub fn stop(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Legal only while `status = awaiting_labels`; sends a non-blocking
    /// signal that short-circuits the current label wait.
    pub async fn continue_from_labels(&self, next_sweep_duration_minutes: Option<i64>, add_round: bool) -> Result<(), TuneError> {
        {
            let state = self.inner.state.read().await;
            if state.status != RlhfPhase::AwaitingLabels {
                return Err(TuneError::InvalidRequest(
                    "continue_from_labels is only valid while awaiting labels".into(),
                ));
            }
        }
        let signal = ContinueSignal {
            next_sweep_duration_secs: next_sweep_duration_minutes.map(|m| m * 60),
            add_round,
        };
        self.inner
            .continue_tx
            .try_send(signal)
            .map_err(|e| TuneError::InvalidRequest(format!("continue signal could not be delivered: {e}")))
    }

    pub async fn start(&self, req: RlhfRequest) -> Result<(), TuneError> {
        validate_rlhf_request(&req)?;
        {
            let state = self.inner.state.read().await;
            if !state.status.is_terminal() {
                return Err(TuneError::AlreadyRunning);
            }
        }
        if self.inner.run_creator.is_none() {
            return Err(TuneError::NotConfigured("run creator".into()));
        }
        if self.inner.label_querier.is_none() {
            return Err(TuneError::NotConfigured("label querier".into()));
        }
        if self.inner.scene_store.is_none() {
            return Err(TuneError::NotConfigured("scene store".into()));
        }
        if self.inner.sweep_runner.is_none() {
            return Err(TuneError::NotConfigured("sweep runner".into()));
        }
        if self.inner.scorer.is_none() {
            return Err(TuneError::NotConfigured("ground-truth scorer".into()));
        }

        let threshold = if req.min_label_threshold <= 0.0 { 0.9 } else { req.min_label_threshold };

        self.inner.cancelled.store(false, Ordering::SeqCst);
        {
            let mut state = self.inner.state.write().await;
            *state = RLHFState {
                status: RlhfPhase::RunningReference,
                total_rounds: req.num_rounds,
                min_label_threshold: threshold,
                next_sweep_duration_secs: req.next_sweep_duration_secs,
                started_at: Some(now()),
                ..RLHFState::default()
            };
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_rounds(req, threshold).await;
        });
        Ok(())
    }

    async fn set_status(&self, status: RlhfPhase) {
        let mut state = self.inner.state.write().await;
        state.status = status;
    }

    async fn fail(&self, err: TuneError) {
        {
            let mut state = self.inner.state.write().await;
            state.status = RlhfPhase::Failed;
            state.error = Some(err.to_string());
            state.completed_at = Some(now());
        }
        tracing::error!(error = %err, "rlhf run failed");
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
                tracing::warn!(error = %e, "failed to persist rlhf failure record");
            }
        }
    }

    async fn run_rounds(&self, req: RlhfRequest, threshold: f64) {
        let run_creator = self.inner.run_creator.clone().unwrap();
        let label_querier = self.inner.label_querier.clone().unwrap();
        let scene_store = self.inner.scene_store.clone().unwrap();
        let sweep_runner = self.inner.sweep_runner.clone().unwrap();
        let sensor_id = req.sensor_id.clone().unwrap_or_else(|| req.scene_id.clone());

        if let Some(persister) = &self.inner.persister {
            let request_json = serde_json::to_value(&req).unwrap_or(serde_json::Value::Null);
            if let Err(e) = persister.save_sweep_start("rlhf", &request_json).await {
                tracing::warn!(error = %e, "failed to persist rlhf start record");
            }
        }

        let mut bounds: BTreeMap<String, (f64, f64)> = req.params.iter().map(|p| (p.name.clone(), (p.start, p.end))).collect();
        let mut prior_reference: Option<(String, Vec<Track>)> = None;
        let mut best_so_far: Option<ParamMap> = None;
        let mut total_rounds = req.num_rounds;
        let mut round = 1u32;

        loop {
            if round > total_rounds {
                break;
            }
            if self.is_cancelled() {
                self.fail(TuneError::Cancelled("rlhf cancelled".into())).await;
                return;
            }

            self.set_status(RlhfPhase::RunningReference).await;
            let reference_params: ParamMap = if round > 1 {
                if let Some(best) = &best_so_far {
                    best.clone()
                } else {
                    midpoint_params(&req.params)
                }
            } else {
                match scene_store.scene(&req.scene_id).await {
                    Ok(scene) => scene.optimal_params.unwrap_or_else(|| midpoint_params(&req.params)),
                    Err(e) => {
                        self.fail(TuneError::RunnerFailure(e.to_string())).await;
                        return;
                    }
                }
            };

            let reference_run_id = match run_creator
                .create_sweep_run(&sensor_id, req.pcap_file.as_deref(), &reference_params)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    self.fail(TuneError::RunnerFailure(e.to_string())).await;
                    return;
                }
            };
            if let Err(e) = scene_store.set_reference_run(&req.scene_id, &reference_run_id).await {
                tracing::warn!(error = %e, "failed to record reference run on scene");
            }
            tracing::info!(round, reference_run_id = %reference_run_id, "reference run created");

            // --- Await labels ---
            self.set_status(RlhfPhase::AwaitingLabels).await;
            let round_duration_secs = req
                .round_durations_secs
                .get((round - 1) as usize)
                .copied()
                .unwrap_or(600);
            let label_deadline = now() + chrono::Duration::seconds(round_duration_secs);
            {
                let mut state = self.inner.state.write().await;
                state.current_round = round;
                state.reference_run_id = Some(reference_run_id.clone());
                state.label_deadline = Some(label_deadline);
            }

            let labelled_at;
            loop {
                if self.is_cancelled() {
                    self.fail(TuneError::Cancelled("rlhf cancelled".into())).await;
                    return;
                }
                let (total, labelled, by_class) = match label_querier.labeling_progress(&reference_run_id).await {
                    Ok(v) => v,
                    Err(e) => {
                        self.fail(TuneError::RunnerFailure(e.to_string())).await;
                        return;
                    }
                };
                {
                    let mut state = self.inner.state.write().await;
                    state.label_progress = crate::state::LabelProgress::new(total, labelled, by_class);
                }

                if now() >= label_deadline {
                    let fraction = if total == 0 { 0.0 } else { labelled as f64 / total as f64 };
                    if fraction >= threshold {
                        labelled_at = now();
                        break;
                    }
                    self.fail(TuneError::LabelDeadlineExpired).await;
                    return;
                }

                let mut rx = self.inner.continue_rx.lock().await;
                let tick = Duration::from_secs(req.poll_interval_secs.max(1) as u64);
                tokio::select! {
                    signal = rx.recv() => {
                        if let Some(signal) = signal {
                            if let Some(secs) = signal.next_sweep_duration_secs {
                                let mut state = self.inner.state.write().await;
                                state.next_sweep_duration_secs = secs;
                            }
                            if signal.add_round {
                                total_rounds += 1;
                                let mut state = self.inner.state.write().await;
                                state.total_rounds = total_rounds;
                            }
                        }
                        labelled_at = now();
                        break;
                    }
                    _ = tokio::time::sleep(tick) => {
                        continue;
                    }
                }
            }
            // --- Optional carry-over ---
            if req.carry_over_labels {
                if let Some((prior_run_id, prior_tracks)) = &prior_reference {
                    match label_querier.run_tracks(&reference_run_id).await {
                        Ok(new_tracks) => {
                            let matches = match_carry_over(prior_tracks, &new_tracks);
                            tracing::info!(
                                round,
                                prior_run_id = %prior_run_id,
                                matched = matches.len(),
                                "carrying over labels"
                            );
                            for (prior, new_track, _iou) in matches {
                                let user_label = prior.user_label.clone().unwrap_or_default();
                                let quality_label = prior.quality_label.clone().unwrap_or_default();
                                if let Err(e) = label_querier
                                    .update_track_label(
                                        &reference_run_id,
                                        &new_track.track_id,
                                        &user_label,
                                        &quality_label,
                                        1.0,
                                        "carried_over",
                                    )
                                    .await
                                {
                                    tracing::warn!(error = %e, track_id = %new_track.track_id, "carry-over label write failed");
                                }
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to fetch tracks for carry-over"),
                    }
                }
            }
            let current_tracks = label_querier.run_tracks(&reference_run_id).await.unwrap_or_default();
            prior_reference = Some((reference_run_id.clone(), current_tracks));

            // --- Build and dispatch a single-round ground-truth AutoTuner ---
            self.set_status(RlhfPhase::RunningSweep).await;
            let ground_truth_weights = if round == 1 {
                GroundTruthWeights::default().biased_for_recall()
            } else {
                GroundTruthWeights::default()
            };
            let sweep_params: Vec<SweepParam> = req
                .params
                .iter()
                .map(|p| {
                    let (start, end) = bounds.get(&p.name).copied().unwrap_or((p.start, p.end));
                    SweepParam {
                        name: p.name.clone(),
                        param_type: p.param_type,
                        start,
                        end,
                        step: p.step,
                        values: None,
                    }
                })
                .collect();
            let auto_req = AutoTuneRequest {
                params: sweep_params,
                max_rounds: 1,
                values_per_param: req.values_per_param,
                top_k: req.top_k,
                objective: Objective::GroundTruth,
                weights: None,
                iterations: req.iterations,
                settle_time: req.settle_time,
                interval: req.interval,
                seed: req.seed,
                data_source: req.data_source.clone(),
                pcap_file: req.pcap_file.clone(),
                pcap_start_secs: req.pcap_start_secs,
                pcap_duration_secs: req.pcap_duration_secs,
                settle_mode: req.settle_mode.clone(),
                scene_id: Some(req.scene_id.clone()),
                ground_truth_weights: Some(ground_truth_weights),
            };

            let mut auto_tuner = AutoTuner::new().with_runner(sweep_runner.clone());
            if let Some(scorer) = &self.inner.scorer {
                auto_tuner = auto_tuner.with_scorer(scorer.clone());
            }
            if let Some(store) = &self.inner.scene_store {
                auto_tuner = auto_tuner.with_scene_store(store.clone());
            }
            if let Err(e) = auto_tuner.start(auto_req).await {
                self.fail(e).await;
                return;
            }

            let sweep_deadline = now() + chrono::Duration::seconds(req.next_sweep_duration_secs.max(1));
            {
                let mut state = self.inner.state.write().await;
                state.sweep_deadline = Some(sweep_deadline);
            }
            let final_auto_state = loop {
                if self.is_cancelled() {
                    auto_tuner.stop();
                    self.fail(TuneError::Cancelled("rlhf cancelled".into())).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                let auto_state = auto_tuner.get_state().await;
                {
                    let mut state = self.inner.state.write().await;
                    state.auto_tune_state = auto_state.clone();
                }
                match auto_state.status {
                    crate::state::TuneStatus::Running | crate::state::TuneStatus::Idle => {
                        if now() >= sweep_deadline {
                            auto_tuner.stop();
                            self.fail(TuneError::SweepDeadlineExceeded).await;
                            return;
                        }
                        continue;
                    }
                    crate::state::TuneStatus::Error => {
                        self.fail(TuneError::RunnerFailure(
                            auto_state.error.clone().unwrap_or_else(|| "auto-tune round failed".into()),
                        ))
                        .await;
                        return;
                    }
                    crate::state::TuneStatus::Complete => break auto_state,
                }
            };

            let recommendation = match &final_auto_state.recommendation {
                Some(r) => r.clone(),
                None => {
                    self.fail(TuneError::RunnerFailure("auto-tune round produced no recommendation".into())).await;
                    return;
                }
            };
            best_so_far = Some(recommendation.params.clone());

            let round_record = RlhfRound {
                round,
                reference_run_id: Some(reference_run_id.clone()),
                labelled_at: Some(labelled_at),
                recommendation: recommendation.clone(),
            };
            {
                let mut state = self.inner.state.write().await;
                state.round_history.push(round_record);
                state.status = RlhfPhase::RoundComplete;
            }
            tracing::info!(round, score = recommendation.score, "rlhf round complete");

            if let Some(last_round) = final_auto_state.round_results.last() {
                bounds = narrow_bounds(&req.params, &last_round.top_k, req.values_per_param);
            }

            round += 1;
        }

        let recommendation = {
            let state = self.inner.state.read().await;
            state.round_history.last().map(|r| r.recommendation.clone())
        };

        {
            let mut state = self.inner.state.write().await;
            state.status = RlhfPhase::Complete;
            state.completed_at = Some(now());
            state.recommendation = recommendation.clone();
        }
        tracing::info!("rlhf run complete");

        if let Some(persister) = &self.inner.persister {
            let round_results = {
                let state = self.inner.state.read().await;
                serde_json::to_value(&state.round_history).unwrap_or(serde_json::Value::Null)
            };
            let record = SweepCompletionRecord {
                status: "complete".into(),
                round_results,
                score_components: None,
                recommendation_explanation: None,
                label_provenance_summary: None,
                schema_version: "1".into(),
            };
            if let Err(e) = persister.save_sweep_complete(record).await {
                tracing::warn!(error = %e, "failed to persist rlhf completion record");
            }
        }
    }
}

impl Default for RLHFTuner {
    fn default() -> Self {
        Self::new()
    }
}
