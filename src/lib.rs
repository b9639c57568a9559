//! Coordinate-grid parameter auto-tuning with an optional RLHF labelling loop.
//!
//! Two engines share the same grid-search core:
//!
//! - [`autotuner::AutoTuner`] runs a bounded number of rounds of grid search,
//!   narrowing the search bounds around the top-K results of each round.
//! - [`rlhf::RLHFTuner`] wraps the same per-round grid search behind a
//!   human-in-the-loop labelling protocol: generate a reference run, wait for
//!   labels, score candidates against those labels, optionally carry labels
//!   forward, and repeat.
//!
//! External systems (the sweep executor, the label store, scene metadata,
//! ground-truth scoring, persistence) are injected as `Arc<dyn Trait>`
//! collaborators; neither engine owns a database or network client directly.

pub mod autotuner;
pub mod collaborators;
pub mod error;
pub mod grid;
pub mod objective;
pub mod param;
pub mod rlhf;
pub mod state;
pub mod transform;

pub use autotuner::{AutoTuneRequest, AutoTuner};
pub use collaborators::{
    GroundTruthScorer, LabelQuerier, Persister, RunCreator, RunnerState, RunnerStatus, Scene, SceneStore,
    SweepCompletionRecord, SweepRequest, SweepRunner, Track,
};
pub use error::TuneError;
pub use objective::{GroundTruthWeights, Objective, ObjectiveWeights};
pub use param::{ParamMap, ParamType, ParamValue, SweepParam};
pub use rlhf::{ContinueSignal, RLHFTuner, RlhfRequest};
pub use state::{
    AutoTuneState, ComboResult, LabelProgress, RLHFState, Recommendation, RlhfPhase, RlhfRound, RoundSummary,
    ScoredResult, TuneStatus,
};
pub use transform::{MetricMap, Pipeline, Transform, TransformRegistry};

/// Installs a `tracing` subscriber honoring `RUST_LOG`, wiring up
/// `tracing_subscriber::fmt().with_env_filter(...)` the way a binary
/// embedding this crate would at startup. Callers embedding this crate in
/// their own binary are free to install their own subscriber instead; this
/// is a convenience for standalone use and for the integration tests.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
