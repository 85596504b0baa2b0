//! Cell tracking and state-clustering core for microscopy image sequences:
//! frame-to-frame linking by optimal assignment, label-identity and
//! graph-model association strategies, and GMM + HMM cell-state discovery
//! over the resulting tracks.

pub mod assignment;
pub mod clustering;
pub mod config;
pub mod error;
pub mod frame;
pub mod gmm;
pub mod graph;
pub mod hmm;
pub mod labels;
pub mod linker;
pub mod math;
pub mod observation;
pub mod store;
pub mod tracker;

pub use clustering::{
    get_clustering_results, run_full_clustering, ClusteringOptions, FullClusteringReport,
    HmmOutcome,
};
pub use config::PipelineConfig;
pub use error::Error;
pub use gmm::{run_gmm_clustering, GmmOptions, GmmReport};
pub use graph::{EdgeScore, EdgeScorer, GnnCapability, ModelPair};
pub use hmm::{run_hmm_smoothing, HmmOptions, HmmReport};
pub use observation::{
    available_features, CellObservation, FeatureInfo, ObservationId, ObservationPatch,
    DEFAULT_FEATURES,
};
pub use store::{FeatureExtractor, FeatureStore, InMemoryFeatureStore};
pub use tracker::{
    get_all_tracks, get_track_data, Strategy, TrackSummary, TrackingOrchestrator, TrackingReport,
};
