use std::collections::BTreeMap;

use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::graph::{GnnCapability, GraphAssociationTracker};
use crate::labels::LabelIdentityTracker;
use crate::linker::FrameLinker;
use crate::observation::CellObservation;
use crate::store::{FeatureExtractor, FeatureStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    NearestNeighbor,
    LabelIdentity,
    Gnn { dataset: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackingReport {
    pub strategy: &'static str,
    pub message: String,
    pub total_tracks: usize,
    pub total_cells: usize,
    pub frames_processed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub track_id: u32,
    pub cell_count: usize,
    pub start_frame: u32,
    pub end_frame: u32,
    pub duration: u32,
}

/// Single entry point for tracking. Strategy selection and fallback live
/// here; this is the only place tracking errors may be downgraded.
pub struct TrackingOrchestrator {
    config: PipelineConfig,
    capability: GnnCapability,
    extractor: Option<Box<dyn FeatureExtractor>>,
}

impl TrackingOrchestrator {
    pub fn new(config: PipelineConfig, capability: GnnCapability) -> Self {
        Self {
            config,
            capability,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn run_tracking(
        &mut self,
        store: &mut dyn FeatureStore,
        strategy: Strategy,
    ) -> Result<TrackingReport, Error> {
        self.ensure_features(store)?;

        match strategy {
            Strategy::NearestNeighbor => {
                FrameLinker::new(self.config.max_distance).run(store)
            }
            Strategy::LabelIdentity => LabelIdentityTracker::run(store),
            Strategy::Gnn { dataset } => {
                let tracker = GraphAssociationTracker::new(self.config.edge_threshold);
                match tracker.run(store, &mut self.capability, dataset.as_deref()) {
                    Ok(report) => Ok(report),
                    Err(err) if err.is_degradable() => {
                        warn!("graph association tracking degraded ({err}), using label identity");
                        LabelIdentityTracker::run(store)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Auto-recovery for an empty store: ask the extraction collaborator
    /// once, then re-check.
    fn ensure_features(&mut self, store: &mut dyn FeatureStore) -> Result<(), Error> {
        if !store.list_observations().is_empty() {
            return Ok(());
        }
        if let Some(extractor) = self.extractor.as_mut() {
            debug!("no features present, invoking extraction collaborator");
            if extractor.extract_features_if_missing()? && !store.list_observations().is_empty() {
                return Ok(());
            }
        }
        Err(Error::NoFeatures)
    }
}

/// All observations of one track, frame-ordered.
pub fn get_track_data(store: &dyn FeatureStore, track_id: u32) -> Vec<CellObservation> {
    store.list_for_track(track_id)
}

/// Per-track summaries over every tracked observation.
pub fn get_all_tracks(store: &dyn FeatureStore) -> Vec<TrackSummary> {
    let mut spans: BTreeMap<u32, (usize, u32, u32)> = BTreeMap::new();
    for obs in store.list_observations() {
        let Some(track_id) = obs.track_id else {
            continue;
        };
        let entry = spans
            .entry(track_id)
            .or_insert((0, obs.frame_num, obs.frame_num));
        entry.0 += 1;
        entry.1 = entry.1.min(obs.frame_num);
        entry.2 = entry.2.max(obs.frame_num);
    }

    spans
        .into_iter()
        .map(|(track_id, (cell_count, start_frame, end_frame))| TrackSummary {
            track_id,
            cell_count,
            start_frame,
            end_frame,
            duration: end_frame - start_frame + 1,
        })
        .collect()
}
