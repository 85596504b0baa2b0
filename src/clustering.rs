use std::collections::BTreeMap;

use serde_derive::Serialize;

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::gmm::{run_gmm_clustering, GmmOptions, GmmReport};
use crate::hmm::{run_hmm_smoothing, HmmOptions, HmmReport};
use crate::store::FeatureStore;

/// What happened to the HMM stage of a full clustering run. The GMM result
/// is always reported alongside, even when smoothing is skipped or fails.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HmmOutcome {
    Ran(HmmReport),
    Skipped { reason: String },
    Failed { error: String },
    NotRequested,
}

impl HmmOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, HmmOutcome::Skipped { .. })
    }

    pub fn report(&self) -> Option<&HmmReport> {
        match self {
            HmmOutcome::Ran(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FullClusteringReport {
    pub gmm: GmmReport,
    pub hmm: HmmOutcome,
    pub pipeline: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct ClusteringOptions {
    pub gmm: GmmOptions,
    /// Pin the component count, overriding the min/max range.
    pub n_components: Option<usize>,
    pub use_hmm: bool,
}

/// GMM state discovery followed by (gated) HMM smoothing. HMM smoothing is
/// only meaningful over track sequences, so it is skipped outright when the
/// GMM stage ran on untracked data.
pub fn run_full_clustering(
    store: &mut dyn FeatureStore,
    config: &PipelineConfig,
    options: &ClusteringOptions,
) -> Result<FullClusteringReport, Error> {
    let mut gmm_options = options.gmm.clone();
    if let Some(k) = options.n_components {
        gmm_options.min_components = k;
        gmm_options.max_components = k;
    }

    let gmm = run_gmm_clustering(store, config, &gmm_options)?;

    if !options.use_hmm {
        return Ok(FullClusteringReport {
            gmm,
            hmm: HmmOutcome::NotRequested,
            pipeline: "gmm_only",
        });
    }

    let hmm = if !gmm.tracking_mode {
        HmmOutcome::Skipped {
            reason: "requires tracking".into(),
        }
    } else {
        let hmm_options = HmmOptions {
            n_states: Some(gmm.optimal_components),
        };
        match run_hmm_smoothing(store, config, &hmm_options) {
            Ok(report) => HmmOutcome::Ran(report),
            Err(err) => HmmOutcome::Failed {
                error: err.to_string(),
            },
        }
    };

    Ok(FullClusteringReport {
        gmm,
        hmm,
        pipeline: "complete",
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StateCount {
    pub state: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameStateCount {
    pub gmm_state: usize,
    pub hmm_state: Option<usize>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusteringSummary {
    pub gmm_distribution: Vec<StateCount>,
    pub hmm_distribution: Vec<StateCount>,
    pub total_gmm_clustered: usize,
    pub total_hmm_smoothed: usize,
    pub frames: BTreeMap<u32, Vec<FrameStateCount>>,
}

/// Current clustering state of the store: distributions over both state
/// kinds plus a per-frame breakdown.
pub fn get_clustering_results(store: &dyn FeatureStore) -> ClusteringSummary {
    let observations = store.list_observations();

    let mut gmm_counts: BTreeMap<usize, usize> = BTreeMap::new();
    let mut hmm_counts: BTreeMap<usize, usize> = BTreeMap::new();
    let mut frame_counts: BTreeMap<(u32, usize, Option<usize>), usize> = BTreeMap::new();
    for obs in &observations {
        if let Some(state) = obs.gmm_state {
            *gmm_counts.entry(state).or_default() += 1;
            *frame_counts
                .entry((obs.frame_num, state, obs.hmm_state))
                .or_default() += 1;
        }
        if let Some(state) = obs.hmm_state {
            *hmm_counts.entry(state).or_default() += 1;
        }
    }

    let mut frames: BTreeMap<u32, Vec<FrameStateCount>> = BTreeMap::new();
    for ((frame_num, gmm_state, hmm_state), count) in frame_counts {
        frames.entry(frame_num).or_default().push(FrameStateCount {
            gmm_state,
            hmm_state,
            count,
        });
    }

    ClusteringSummary {
        total_gmm_clustered: gmm_counts.values().sum(),
        total_hmm_smoothed: hmm_counts.values().sum(),
        gmm_distribution: gmm_counts
            .into_iter()
            .map(|(state, count)| StateCount { state, count })
            .collect(),
        hmm_distribution: hmm_counts
            .into_iter()
            .map(|(state, count)| StateCount { state, count })
            .collect(),
        frames,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmm::FeatureMode;
    use crate::observation::CellObservation;
    use crate::store::InMemoryFeatureStore;

    fn cell(track: Option<u32>, frame_num: u32, area: f64, intensity: f64) -> CellObservation {
        CellObservation {
            frame_num,
            track_id: track,
            area: Some(area),
            mean_intensity: Some(intensity),
            ..Default::default()
        }
    }

    fn options() -> ClusteringOptions {
        ClusteringOptions {
            gmm: GmmOptions {
                features: vec!["area".into(), "mean_intensity".into()],
                min_components: 2,
                max_components: 3,
                mode: FeatureMode::Strict,
            },
            n_components: None,
            use_hmm: true,
        }
    }

    fn tracked_store() -> InMemoryFeatureStore {
        let mut store = InMemoryFeatureStore::new();
        for f in 0..3 {
            let jitter = f as f64 * 0.3;
            store.insert(cell(Some(1), f, 10.0 + jitter, 5.0 + jitter));
            store.insert(cell(Some(2), f, 100.0 + jitter, 50.0 + jitter));
        }
        store
    }

    #[test]
    fn untracked_data_skips_hmm_without_attempting_it() {
        let mut store = InMemoryFeatureStore::new();
        for i in 0..6 {
            let v = if i < 3 { 10.0 } else { 100.0 };
            store.insert(cell(None, 0, v + i as f64 * 0.2, v / 2.0));
        }

        let report =
            run_full_clustering(&mut store, &PipelineConfig::default(), &options()).unwrap();
        assert!(!report.gmm.tracking_mode);
        assert!(report.hmm.is_skipped());
        assert!(store.list_observations().iter().all(|o| o.hmm_state.is_none()));
    }

    #[test]
    fn tracked_data_runs_both_stages() {
        let mut store = tracked_store();
        let report =
            run_full_clustering(&mut store, &PipelineConfig::default(), &options()).unwrap();
        assert!(report.gmm.tracking_mode);
        assert_eq!(report.pipeline, "complete");
        let hmm = report.hmm.report().expect("HMM stage did not run");
        assert_eq!(hmm.n_states, report.gmm.optimal_components);
        assert_eq!(hmm.tracks_processed, 2);
    }

    #[test]
    fn gmm_error_short_circuits() {
        let mut store = InMemoryFeatureStore::new();
        store.insert(cell(Some(1), 0, 10.0, 5.0));
        let err =
            run_full_clustering(&mut store, &PipelineConfig::default(), &options()).unwrap_err();
        assert!(matches!(err, Error::NotEnoughCells { .. }));
    }

    #[test]
    fn pinned_component_count_collapses_the_range() {
        let mut store = tracked_store();
        let mut opts = options();
        opts.n_components = Some(2);
        opts.use_hmm = false;
        let report =
            run_full_clustering(&mut store, &PipelineConfig::default(), &opts).unwrap();
        assert_eq!(report.gmm.optimal_components, 2);
        assert_eq!(report.pipeline, "gmm_only");
        assert!(matches!(report.hmm, HmmOutcome::NotRequested));
    }

    #[test]
    fn summary_reflects_committed_states() {
        let mut store = tracked_store();
        run_full_clustering(&mut store, &PipelineConfig::default(), &options()).unwrap();

        let summary = get_clustering_results(&store);
        assert_eq!(summary.total_gmm_clustered, 6);
        assert_eq!(summary.total_hmm_smoothed, 6);
        assert_eq!(summary.frames.len(), 3);
        let per_frame: usize = summary
            .frames
            .values()
            .flat_map(|v| v.iter().map(|c| c.count))
            .sum();
        assert_eq!(per_frame, 6);
    }
}
