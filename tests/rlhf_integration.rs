//! End-to-end coverage of `RLHFTuner` against in-memory mock collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use autotune_core::{
    ComboResult, GroundTruthScorer, ParamType, ParamValue, RlhfPhase, RlhfRequest, RunCreator, RunnerState,
    RunnerStatus, Scene, SceneStore, SweepParam, SweepRequest, SweepRunner, Track, TuneError, RLHFTuner,
};

struct MockRunCreator {
    next_id: AtomicUsize,
}

#[async_trait]
impl RunCreator for MockRunCreator {
    async fn create_sweep_run(
        &self,
        _sensor_id: &str,
        _pcap_file: Option<&str>,
        _params: &autotune_core::ParamMap,
    ) -> Result<String, TuneError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("run-{id}"))
    }
}

struct MockSceneStore {
    scene: Mutex<Scene>,
}

#[async_trait]
impl SceneStore for MockSceneStore {
    async fn scene(&self, scene_id: &str) -> Result<Scene, TuneError> {
        let mut s = self.scene.lock().await.clone();
        s.scene_id = scene_id.to_string();
        Ok(s)
    }
    async fn set_reference_run(&self, _scene_id: &str, run_id: &str) -> Result<(), TuneError> {
        self.scene.lock().await.reference_run_id = Some(run_id.to_string());
        Ok(())
    }
    async fn set_optimal_params(&self, _scene_id: &str, params: serde_json::Value) -> Result<(), TuneError> {
        let parsed: autotune_core::ParamMap = serde_json::from_value(params).unwrap_or_default();
        self.scene.lock().await.optimal_params = Some(parsed);
        Ok(())
    }
}

/// Always-fully-labelled instantly so the label wait proceeds on the first poll.
struct InstantLabelQuerier {
    tracks_by_run: Mutex<BTreeMap<String, Vec<Track>>>,
    update_calls: AtomicUsize,
}

impl InstantLabelQuerier {
    fn new() -> Self {
        Self {
            tracks_by_run: Mutex::new(BTreeMap::new()),
            update_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl autotune_core::LabelQuerier for InstantLabelQuerier {
    async fn labeling_progress(&self, run_id: &str) -> Result<(usize, usize, BTreeMap<String, usize>), TuneError> {
        let mut tracks = self.tracks_by_run.lock().await;
        tracks.entry(run_id.to_string()).or_insert_with(|| {
            vec![Track {
                track_id: format!("{run_id}-t0"),
                start_ns: 0,
                end_ns: 100,
                user_label: Some("car".into()),
                quality_label: Some("good".into()),
            }]
        });
        Ok((1, 1, BTreeMap::new()))
    }

    async fn run_tracks(&self, run_id: &str) -> Result<Vec<Track>, TuneError> {
        let tracks = self.tracks_by_run.lock().await;
        Ok(tracks.get(run_id).cloned().unwrap_or_default())
    }

    async fn update_track_label(
        &self,
        _run_id: &str,
        _track_id: &str,
        _user_label: &str,
        _quality_label: &str,
        _confidence: f64,
        _labeler_id: &str,
    ) -> Result<(), TuneError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FlatScorer;
#[async_trait]
impl GroundTruthScorer for FlatScorer {
    async fn score(
        &self,
        _scene_id: &str,
        _run_id: &str,
        _weights: &autotune_core::GroundTruthWeights,
    ) -> Result<f64, TuneError> {
        Ok(1.0)
    }
}

struct ScriptedSweepRunner;
#[async_trait]
impl SweepRunner for ScriptedSweepRunner {
    async fn start(&self, req: SweepRequest) -> Result<(), TuneError> {
        let _ = req;
        Ok(())
    }
    async fn get_state(&self) -> Result<RunnerState, TuneError> {
        Ok(RunnerState {
            status: RunnerStatus::Complete,
            completed_combos: 1,
            total_combos: 1,
            results: vec![ComboResult {
                params: [("gain".to_string(), ParamValue::Float(5.0))].into_iter().collect(),
                overall_accept_mean: 0.8,
                misalignment_ratio_mean: 0.1,
                alignment_deg_mean: 0.0,
                nonzero_cells_mean: 5.0,
                active_tracks_mean: 2.0,
                foreground_capture_mean: 0.0,
                empty_box_ratio_mean: 0.0,
                unbounded_point_mean: 0.0,
                run_id: Some("run-scored".into()),
            }],
            error: None,
        })
    }
}

fn gain_param() -> SweepParam {
    SweepParam {
        name: "gain".into(),
        param_type: ParamType::Float,
        start: 0.0,
        end: 10.0,
        step: None,
        values: None,
    }
}

fn tuner() -> RLHFTuner {
    RLHFTuner::new()
        .with_run_creator(Arc::new(MockRunCreator { next_id: AtomicUsize::new(0) }))
        .with_label_querier(Arc::new(InstantLabelQuerier::new()))
        .with_scene_store(Arc::new(MockSceneStore { scene: Mutex::new(Scene::default()) }))
        .with_scorer(Arc::new(FlatScorer))
        .with_sweep_runner(Arc::new(ScriptedSweepRunner))
}

#[tokio::test]
async fn completes_two_rounds_and_publishes_recommendation() {
    let tuner = tuner();
    let req = RlhfRequest {
        scene_id: "scene-1".into(),
        sensor_id: None,
        params: vec![gain_param()],
        num_rounds: 2,
        min_label_threshold: 0.9,
        round_durations_secs: vec![1, 1],
        carry_over_labels: true,
        values_per_param: 3,
        top_k: 3,
        iterations: 1,
        settle_time: 0.0,
        interval: 0.0,
        seed: None,
        data_source: "synthetic".into(),
        pcap_file: None,
        pcap_start_secs: None,
        pcap_duration_secs: None,
        settle_mode: None,
        poll_interval_secs: 1,
        next_sweep_duration_secs: 30,
    };
    tuner.start(req).await.unwrap();

    let mut state = tuner.get_state().await;
    for _ in 0..300 {
        if state.status.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        state = tuner.get_state().await;
    }

    assert_eq!(state.status, RlhfPhase::Complete);
    assert_eq!(state.round_history.len(), 2);
    assert!(state.recommendation.is_some());
}

#[tokio::test]
async fn missing_collaborator_fails_fast() {
    let tuner = RLHFTuner::new();
    let req = RlhfRequest {
        scene_id: "scene-1".into(),
        sensor_id: None,
        params: vec![gain_param()],
        num_rounds: 1,
        min_label_threshold: 0.9,
        round_durations_secs: vec![1],
        carry_over_labels: false,
        values_per_param: 3,
        top_k: 3,
        iterations: 1,
        settle_time: 0.0,
        interval: 0.0,
        seed: None,
        data_source: "synthetic".into(),
        pcap_file: None,
        pcap_start_secs: None,
        pcap_duration_secs: None,
        settle_mode: None,
        poll_interval_secs: 1,
        next_sweep_duration_secs: 30,
    };
    let err = tuner.start(req).await.unwrap_err();
    assert!(matches!(err, TuneError::NotConfigured(_)));
}

#[tokio::test]
async fn continue_from_labels_only_legal_while_awaiting() {
    let tuner = tuner();
    let err = tuner.continue_from_labels(Some(5), false).await.unwrap_err();
    assert!(matches!(err, TuneError::InvalidRequest(_)));
}
