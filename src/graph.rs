use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};

use crate::error::Error;
use crate::frame::{group_by_frame, FrameObservations};
use crate::linker::link_motion;
use crate::observation::{ObservationId, ObservationPatch};
use crate::store::FeatureStore;
use crate::tracker::TrackingReport;

/// Artifact file names of one pretrained association pair.
pub const METRIC_WEIGHTS: &str = "metric.onnx";
pub const SEQUENCE_WEIGHTS: &str = "sequence.onnx";

/// A matched pair of pretrained model artifacts: the metric/embedding model
/// and the sequence/edge-scoring model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelPair {
    pub name: String,
    pub metric: PathBuf,
    pub sequence: PathBuf,
}

impl ModelPair {
    fn from_dir(name: &str, dir: &Path) -> Option<Self> {
        let metric = dir.join(METRIC_WEIGHTS);
        let sequence = dir.join(SEQUENCE_WEIGHTS);
        if metric.is_file() && sequence.is_file() {
            Some(Self {
                name: name.to_string(),
                metric,
                sequence,
            })
        } else {
            None
        }
    }
}

/// One scored candidate edge between an observation in frame t and an
/// observation in frame t+1.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct EdgeScore {
    #[serde(rename = "a")]
    pub source: ObservationId,
    #[serde(rename = "b")]
    pub target: ObservationId,
    #[serde(rename = "p")]
    pub probability: f64,
}

/// External model pipeline scoring candidate cell pairs. Opaque to the
/// core; any failure inside is reported, never panicked.
pub trait EdgeScorer {
    fn score_candidate_edges(
        &mut self,
        pair: &ModelPair,
        frames: &[FrameObservations],
    ) -> Result<Vec<EdgeScore>, Error>;
}

/// Capability object constructed once at process start: which pretrained
/// pairs exist on disk and whether an edge-scoring runtime is registered.
/// Replaces ad hoc availability checks scattered through the call sites.
pub struct GnnCapability {
    catalog: BTreeMap<String, ModelPair>,
    default_pair: Option<ModelPair>,
    scorer: Option<Box<dyn EdgeScorer>>,
}

impl GnnCapability {
    /// A capability with no runtime and no artifacts; every graph-tracking
    /// request degrades to the label-identity fallback.
    pub fn unavailable() -> Self {
        Self {
            catalog: BTreeMap::new(),
            default_pair: None,
            scorer: None,
        }
    }

    /// Scan `model_root` for pretrained pairs: a pair directly in the root
    /// is the default, each subdirectory holding both artifacts is a
    /// dataset-named catalog entry.
    pub fn detect(model_root: &Path, scorer: Option<Box<dyn EdgeScorer>>) -> Self {
        let default_pair = ModelPair::from_dir("default", model_root);

        let mut catalog = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(model_root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some(pair) = ModelPair::from_dir(name, &path) {
                    debug!("found pretrained pair {name}");
                    catalog.insert(name.to_string(), pair);
                }
            }
        }

        Self {
            catalog,
            default_pair,
            scorer,
        }
    }

    /// Capability with an explicit catalog, bypassing disk discovery.
    pub fn with_catalog(
        catalog: BTreeMap<String, ModelPair>,
        default_pair: Option<ModelPair>,
        scorer: Option<Box<dyn EdgeScorer>>,
    ) -> Self {
        Self {
            catalog,
            default_pair,
            scorer,
        }
    }

    pub fn is_available(&self) -> bool {
        self.scorer.is_some() && (self.default_pair.is_some() || !self.catalog.is_empty())
    }

    /// Pretrained pair for a dataset name: exact catalog key first, then
    /// partial match (sequence-numbered dataset names start with or contain
    /// their catalog key), then the default pair.
    pub fn select_pair(&self, dataset: Option<&str>) -> Option<&ModelPair> {
        if let Some(name) = dataset {
            if let Some(pair) = self.catalog.get(name) {
                return Some(pair);
            }
            for (key, pair) in &self.catalog {
                if name.starts_with(key.as_str()) || name.contains(key.as_str()) {
                    return Some(pair);
                }
            }
        }
        self.default_pair.as_ref()
    }

    fn scorer_mut(&mut self) -> Option<&mut dyn EdgeScorer> {
        self.scorer.as_deref_mut()
    }
}

/// Association tracking driven by an external edge scorer: greedy matching
/// over predicted link probabilities per consecutive frame pair.
pub struct GraphAssociationTracker {
    pub threshold: f64,
}

impl GraphAssociationTracker {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn run(
        &self,
        store: &mut dyn FeatureStore,
        capability: &mut GnnCapability,
        dataset: Option<&str>,
    ) -> Result<TrackingReport, Error> {
        let pair = capability
            .select_pair(dataset)
            .cloned()
            .ok_or_else(|| Error::GnnUnavailable("no pretrained model pair found".into()))?;

        let observations = store.list_observations();
        if observations.is_empty() {
            return Err(Error::NoFeatures);
        }
        let total_cells = observations.len();
        let mut frames = group_by_frame(observations);
        if frames.len() < 2 {
            return Err(Error::NotEnoughFrames(frames.len()));
        }

        let scorer = capability
            .scorer_mut()
            .ok_or_else(|| Error::GnnUnavailable("no edge-scoring runtime registered".into()))?;
        debug!("scoring candidate edges with pair {}", pair.name);
        let edges = scorer.score_candidate_edges(&pair, &frames)?;

        // observation id -> (frame index, index within frame)
        let mut index: BTreeMap<ObservationId, (usize, usize)> = BTreeMap::new();
        for (fi, frame) in frames.iter().enumerate() {
            for (oi, obs) in frame.observations.iter().enumerate() {
                index.insert(obs.id, (fi, oi));
            }
        }

        // bucket candidate edges per consecutive frame pair
        let mut candidates: Vec<Vec<(f64, usize, usize)>> = vec![Vec::new(); frames.len() - 1];
        for edge in edges {
            let Some(&(fa, oa)) = index.get(&edge.source) else {
                warn!("edge references unknown observation {}, skipping", edge.source);
                continue;
            };
            let Some(&(fb, ob)) = index.get(&edge.target) else {
                warn!("edge references unknown observation {}, skipping", edge.target);
                continue;
            };
            let (pair_idx, prev_obs, curr_obs) = if fb == fa + 1 {
                (fa, oa, ob)
            } else if fa == fb + 1 {
                (fb, ob, oa)
            } else {
                warn!(
                    "edge {} -> {} does not join consecutive frames, skipping",
                    edge.source, edge.target
                );
                continue;
            };
            candidates[pair_idx].push((edge.probability, prev_obs, curr_obs));
        }

        let mut next_track_id: u32 = 1;
        for obs in &mut frames[0].observations {
            obs.track_id = Some(next_track_id);
            next_track_id += 1;
        }

        for i in 1..frames.len() {
            let (head, tail) = frames.split_at_mut(i);
            let prev = &head[i - 1];
            let curr = &mut tail[0];

            let mut ranked = std::mem::take(&mut candidates[i - 1]);
            // descending probability, ties broken on indexes for determinism
            ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| (a.1, a.2).cmp(&(b.1, b.2))));

            let mut prev_used = vec![false; prev.len()];
            let mut curr_used = vec![false; curr.len()];
            for (probability, pi, ci) in ranked {
                if probability.is_nan() || probability < self.threshold {
                    continue;
                }
                if prev_used[pi] || curr_used[ci] {
                    continue;
                }
                prev_used[pi] = true;
                curr_used[ci] = true;

                let p = &prev.observations[pi];
                let c = &mut curr.observations[ci];
                c.track_id = p.track_id;
                link_motion(c, p);
            }

            for (ci, c) in curr.observations.iter_mut().enumerate() {
                if !curr_used[ci] {
                    c.track_id = Some(next_track_id);
                    next_track_id += 1;
                }
            }
        }

        let mut track_ids = BTreeSet::new();
        let mut updates = Vec::with_capacity(total_cells);
        for frame in &frames {
            for obs in &frame.observations {
                if let Some(t) = obs.track_id {
                    track_ids.insert(t);
                }
                updates.push((obs.id, ObservationPatch::tracking(obs)));
            }
        }
        store.bulk_update(updates)?;
        store.commit()?;

        Ok(TrackingReport {
            strategy: "gnn",
            message: "Tracking completed".into(),
            total_tracks: track_ids.len(),
            total_cells,
            frames_processed: frames.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::CellObservation;
    use crate::store::InMemoryFeatureStore;

    fn cell(frame_num: u32, cell_label: u32, row: f64, col: f64) -> CellObservation {
        CellObservation {
            frame_num,
            cell_label,
            centroid_row: Some(row),
            centroid_col: Some(col),
            ..Default::default()
        }
    }

    fn pair() -> ModelPair {
        ModelPair {
            name: "default".into(),
            metric: PathBuf::from("metric.onnx"),
            sequence: PathBuf::from("sequence.onnx"),
        }
    }

    struct FixedScorer(Vec<EdgeScore>);

    impl EdgeScorer for FixedScorer {
        fn score_candidate_edges(
            &mut self,
            _pair: &ModelPair,
            _frames: &[FrameObservations],
        ) -> Result<Vec<EdgeScore>, Error> {
            Ok(self.0.clone())
        }
    }

    fn capability(scorer: Box<dyn EdgeScorer>) -> GnnCapability {
        GnnCapability::with_catalog(BTreeMap::new(), Some(pair()), Some(scorer))
    }

    #[test]
    fn greedy_matching_prefers_higher_probability() {
        let mut store = InMemoryFeatureStore::new();
        let p0 = store.insert(cell(0, 1, 0.0, 0.0));
        let p1 = store.insert(cell(0, 2, 10.0, 10.0));
        let c0 = store.insert(cell(1, 1, 1.0, 1.0));
        let c1 = store.insert(cell(1, 2, 11.0, 11.0));

        let scorer = FixedScorer(vec![
            EdgeScore { source: p0, target: c0, probability: 0.9 },
            EdgeScore { source: p0, target: c1, probability: 0.6 },
            EdgeScore { source: p1, target: c1, probability: 0.8 },
            EdgeScore { source: p1, target: c0, probability: 0.3 },
        ]);
        let mut cap = capability(Box::new(scorer));

        let report = GraphAssociationTracker::new(0.5)
            .run(&mut store, &mut cap, None)
            .unwrap();
        assert_eq!(report.strategy, "gnn");
        assert_eq!(report.total_tracks, 2);

        assert_eq!(store.get(c0).unwrap().track_id, store.get(p0).unwrap().track_id);
        assert_eq!(store.get(c1).unwrap().track_id, store.get(p1).unwrap().track_id);
        assert!(store.get(c0).unwrap().displacement.is_some());
    }

    #[test]
    fn sub_threshold_edges_start_new_tracks() {
        let mut store = InMemoryFeatureStore::new();
        let p0 = store.insert(cell(0, 1, 0.0, 0.0));
        let c0 = store.insert(cell(1, 1, 1.0, 1.0));

        let scorer = FixedScorer(vec![EdgeScore {
            source: p0,
            target: c0,
            probability: 0.4,
        }]);
        let mut cap = capability(Box::new(scorer));

        let report = GraphAssociationTracker::new(0.5)
            .run(&mut store, &mut cap, None)
            .unwrap();
        assert_eq!(report.total_tracks, 2);
        assert_eq!(store.get(c0).unwrap().displacement, None);
    }

    #[test]
    fn unknown_edge_ids_are_skipped() {
        let mut store = InMemoryFeatureStore::new();
        let p0 = store.insert(cell(0, 1, 0.0, 0.0));
        let c0 = store.insert(cell(1, 1, 1.0, 1.0));

        let scorer = FixedScorer(vec![
            EdgeScore { source: 9999, target: c0, probability: 0.99 },
            EdgeScore { source: p0, target: c0, probability: 0.9 },
        ]);
        let mut cap = capability(Box::new(scorer));

        GraphAssociationTracker::new(0.5)
            .run(&mut store, &mut cap, None)
            .unwrap();
        assert_eq!(store.get(c0).unwrap().track_id, store.get(p0).unwrap().track_id);
    }

    #[test]
    fn missing_runtime_is_a_typed_unavailability() {
        let mut store = InMemoryFeatureStore::new();
        store.insert(cell(0, 1, 0.0, 0.0));
        store.insert(cell(1, 1, 1.0, 1.0));

        let mut cap = GnnCapability::with_catalog(BTreeMap::new(), Some(pair()), None);
        let err = GraphAssociationTracker::new(0.5)
            .run(&mut store, &mut cap, None)
            .unwrap_err();
        assert!(err.is_degradable());
    }

    #[test]
    fn dataset_names_match_catalog_keys_partially() {
        let mut catalog = BTreeMap::new();
        catalog.insert("Fluo-N2DH-SIM".to_string(), ModelPair {
            name: "Fluo-N2DH-SIM".into(),
            metric: PathBuf::from("m"),
            sequence: PathBuf::from("s"),
        });
        let cap = GnnCapability::with_catalog(catalog, Some(pair()), None);

        assert_eq!(cap.select_pair(Some("Fluo-N2DH-SIM")).unwrap().name, "Fluo-N2DH-SIM");
        assert_eq!(cap.select_pair(Some("Fluo-N2DH-SIM-01")).unwrap().name, "Fluo-N2DH-SIM");
        assert_eq!(cap.select_pair(Some("unrelated")).unwrap().name, "default");
        assert_eq!(cap.select_pair(None).unwrap().name, "default");
    }
}
