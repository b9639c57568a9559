//! Metric transform pipelines: a named, versioned, side-effect-free chain of
//! operations over a metric map, plus a concurrency-safe preset registry
//! backed by `dashmap`.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::grid::clip as clamp;

/// A metric name -> value map. Every transform returns a fresh map; none
/// mutate their input.
pub type MetricMap = BTreeMap<String, f64>;

/// One transform operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    Normalise { metric: String, min: f64, max: f64 },
    Clip { metric: String, min: f64, max: f64 },
    Log { metric: String },
    Weight { metric: String, w: f64 },
    RoundModifier { metric: String, multiplier: f64, round: u32 },
}

impl Transform {
    /// Apply this transform, producing a new map. `current_round` is only
    /// consulted by `RoundModifier`.
    pub fn apply(&self, metrics: &MetricMap, current_round: u32) -> MetricMap {
        let mut out = metrics.clone();
        match self {
            Transform::Normalise { metric, min, max } => {
                if let Some(v) = out.get_mut(metric) {
                    if (max - min).abs() > f64::EPSILON {
                        *v = (*v - min) / (max - min);
                    }
                }
            }
            Transform::Clip { metric, min, max } => {
                if let Some(v) = out.get_mut(metric) {
                    *v = clamp(*v, *min, *max);
                }
            }
            Transform::Log { metric } => {
                if let Some(v) = out.get_mut(metric) {
                    *v = (1.0 + *v).ln();
                }
            }
            Transform::Weight { metric, w } => {
                if let Some(v) = out.get_mut(metric) {
                    *v *= w;
                }
            }
            Transform::RoundModifier { metric, multiplier, round } => {
                if current_round == *round {
                    if let Some(v) = out.get_mut(metric) {
                        *v *= multiplier;
                    }
                }
            }
        }
        out
    }
}

/// A named, versioned chain of transforms, recorded on each completed sweep
/// for reproducibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub version: String,
    pub transforms: Vec<Transform>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, version: impl Into<String>, transforms: Vec<Transform>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            transforms,
        }
    }

    /// Apply every transform in order, returning a new map. The input map is
    /// never mutated, even for the identity pipeline.
    pub fn apply(&self, metrics: &MetricMap, current_round: u32) -> MetricMap {
        self.transforms
            .iter()
            .fold(metrics.clone(), |acc, t| t.apply(&acc, current_round))
    }

    /// Identity pipeline.
    pub fn default_preset() -> Self {
        Pipeline::new("default", "1", Vec::new())
    }

    /// Clip ratio metrics to `[0, 1]`; log-scale cell/track counts.
    pub fn ground_truth_preset() -> Self {
        Pipeline::new(
            "ground_truth",
            "1",
            vec![
                Transform::Clip { metric: "misalignment_ratio_mean".into(), min: 0.0, max: 1.0 },
                Transform::Clip { metric: "foreground_capture_mean".into(), min: 0.0, max: 1.0 },
                Transform::Clip { metric: "empty_box_ratio_mean".into(), min: 0.0, max: 1.0 },
                Transform::Clip { metric: "unbounded_point_mean".into(), min: 0.0, max: 1.0 },
                Transform::Log { metric: "nonzero_cells_mean".into() },
                Transform::Log { metric: "active_tracks_mean".into() },
            ],
        )
    }
}

/// Maps preset names to pipelines. Registration with the same name replaces
/// the entry; retrieval is concurrency-safe.
#[derive(Debug, Default)]
pub struct TransformRegistry {
    pipelines: DashMap<String, Arc<Pipeline>>,
}

impl TransformRegistry {
    /// A registry pre-populated with the `default` and `ground_truth` presets.
    pub fn with_presets() -> Self {
        let registry = Self::default();
        registry.register(Pipeline::default_preset());
        registry.register(Pipeline::ground_truth_preset());
        registry
    }

    pub fn register(&self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.name.clone(), Arc::new(pipeline));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricMap {
        let mut m = MetricMap::new();
        m.insert("nonzero_cells_mean".into(), 9.0);
        m
    }

    #[test]
    fn transforms_do_not_mutate_input() {
        let input = sample();
        let before = input.clone();
        let t = Transform::Log { metric: "nonzero_cells_mean".into() };
        let _ = t.apply(&input, 1);
        assert_eq!(input, before);
    }

    #[test]
    fn pipeline_returns_new_map_even_for_identity() {
        let input = sample();
        let pipeline = Pipeline::default_preset();
        let out = pipeline.apply(&input, 1);
        assert_eq!(out, input);
    }

    #[test]
    fn clip_transform_clamps() {
        let mut m = MetricMap::new();
        m.insert("x".into(), 5.0);
        let t = Transform::Clip { metric: "x".into(), min: 0.0, max: 1.0 };
        let out = t.apply(&m, 1);
        assert_eq!(out["x"], 1.0);
    }

    #[test]
    fn round_modifier_only_fires_on_its_round() {
        let mut m = MetricMap::new();
        m.insert("x".into(), 2.0);
        let t = Transform::RoundModifier { metric: "x".into(), multiplier: 10.0, round: 2 };
        assert_eq!(t.apply(&m, 1)["x"], 2.0);
        assert_eq!(t.apply(&m, 2)["x"], 20.0);
    }

    #[test]
    fn registry_replace_and_concurrent_get() {
        let registry = TransformRegistry::with_presets();
        assert!(registry.get("default").is_some());
        assert!(registry.get("ground_truth").is_some());
        assert!(registry.get("missing").is_none());

        registry.register(Pipeline::new("default", "2", vec![]));
        assert_eq!(registry.get("default").unwrap().version, "2");
    }
}
