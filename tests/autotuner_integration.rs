//! End-to-end coverage of `AutoTuner` against in-memory mock collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use autotune_core::{
    AutoTuneRequest, AutoTuner, ComboResult, Objective, ParamType, ParamValue, RunnerState, RunnerStatus, SweepParam,
    SweepRequest, SweepRunner, TuneError, TuneStatus,
};

/// A sweep runner that scores every combo by how close its `gain` parameter
/// is to a target value, completing synchronously on the first poll.
struct ScriptedRunner {
    target: f64,
    state: Mutex<Option<RunnerState>>,
    calls: AtomicUsize,
}

impl ScriptedRunner {
    fn new(target: f64) -> Self {
        Self {
            target,
            state: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SweepRunner for ScriptedRunner {
    async fn start(&self, req: SweepRequest) -> Result<(), TuneError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gain_values: Vec<ParamValue> = req
            .params
            .iter()
            .find(|p| p.name == "gain")
            .and_then(|p| p.values.clone())
            .unwrap_or_default();

        let results: Vec<ComboResult> = gain_values
            .iter()
            .map(|v| {
                let gain = v.as_f64().unwrap_or(0.0);
                let distance = (gain - self.target).abs();
                ComboResult {
                    params: [("gain".to_string(), v.clone())].into_iter().collect(),
                    overall_accept_mean: (1.0 - distance).max(0.0),
                    misalignment_ratio_mean: distance,
                    alignment_deg_mean: 0.0,
                    nonzero_cells_mean: 10.0,
                    active_tracks_mean: 3.0,
                    foreground_capture_mean: 0.0,
                    empty_box_ratio_mean: 0.0,
                    unbounded_point_mean: 0.0,
                    run_id: None,
                }
            })
            .collect();

        *self.state.lock().await = Some(RunnerState {
            status: RunnerStatus::Complete,
            completed_combos: results.len(),
            total_combos: results.len(),
            results,
            error: None,
        });
        Ok(())
    }

    async fn get_state(&self) -> Result<RunnerState, TuneError> {
        Ok(self.state.lock().await.clone().expect("start must be called before get_state"))
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

fn base_request(runner_target: f64) -> (AutoTuneRequest, Arc<ScriptedRunner>) {
    let runner = Arc::new(ScriptedRunner::new(runner_target));
    let req = AutoTuneRequest {
        params: vec![gain_param()],
        max_rounds: 3,
        values_per_param: 5,
        top_k: 3,
        objective: Objective::Acceptance,
        weights: None,
        iterations: 1,
        settle_time: 0.0,
        interval: 0.0,
        seed: None,
        data_source: "synthetic".into(),
        pcap_file: None,
        pcap_start_secs: None,
        pcap_duration_secs: None,
        settle_mode: None,
        scene_id: None,
        ground_truth_weights: None,
    };
    (req, runner)
}

#[tokio::test]
async fn converges_toward_target_and_narrows_bounds_each_round() {
    let (req, runner) = base_request(7.0);
    let tuner = AutoTuner::new().with_runner(runner.clone());
    tuner.start(req).await.unwrap();

    let mut state = tuner.get_state().await;
    for _ in 0..200 {
        if state.status.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        state = tuner.get_state().await;
    }

    assert_eq!(state.status, TuneStatus::Complete);
    assert_eq!(state.round_results.len(), 3);
    let recommendation = state.recommendation.expect("completed run publishes a recommendation");
    let gain = recommendation.params["gain"].as_f64().unwrap();
    assert!((gain - 7.0).abs() < 1.0, "expected convergence near 7.0, got {gain}");

    // Bounds should strictly narrow round over round.
    let widths: Vec<f64> = state
        .round_results
        .iter()
        .map(|r| {
            let (s, e) = r.bounds["gain"];
            e - s
        })
        .collect();
    assert!(widths[0] >= widths[1] - 1e-6);
}

#[tokio::test]
async fn rejects_already_running() {
    let (req, runner) = base_request(5.0);
    let tuner = AutoTuner::new().with_runner(runner);
    tuner.start(req.clone()).await.unwrap();
    let err = tuner.start(req).await.unwrap_err();
    assert!(matches!(err, TuneError::AlreadyRunning));
}

#[tokio::test]
async fn missing_runner_fails_fast() {
    let (req, _runner) = base_request(5.0);
    let tuner = AutoTuner::new();
    let err = tuner.start(req).await.unwrap_err();
    assert!(matches!(err, TuneError::NotConfigured(_)));
}

#[tokio::test]
async fn cancellation_moves_to_error_within_one_poll() {
    let (req, runner) = base_request(5.0);
    let tuner = AutoTuner::new().with_runner(runner);
    tuner.start(req).await.unwrap();
    tuner.stop();

    let mut state = tuner.get_state().await;
    for _ in 0..50 {
        if state.status.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        state = tuner.get_state().await;
    }
    assert_eq!(state.status, TuneStatus::Error);
    assert!(state.completed_at.is_some());
    assert!(state.error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn empty_results_fail_the_round() {
    struct EmptyRunner;
    #[async_trait]
    impl SweepRunner for EmptyRunner {
        async fn start(&self, _req: SweepRequest) -> Result<(), TuneError> {
            Ok(())
        }
        async fn get_state(&self) -> Result<RunnerState, TuneError> {
            Ok(RunnerState {
                status: RunnerStatus::Complete,
                completed_combos: 0,
                total_combos: 0,
                results: vec![],
                error: None,
            })
        }
    }

    let (mut req, _) = base_request(0.0);
    req.max_rounds = 1;
    let tuner = AutoTuner::new().with_runner(Arc::new(EmptyRunner));
    tuner.start(req).await.unwrap();

    let mut state = tuner.get_state().await;
    for _ in 0..50 {
        if state.status.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        state = tuner.get_state().await;
    }
    assert_eq!(state.status, TuneStatus::Error);
}
