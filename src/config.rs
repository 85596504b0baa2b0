use std::path::PathBuf;

use serde_derive::Deserialize;

/// Tunables for one pipeline instance, constructed once at process start
/// and passed down explicitly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Centroid distance gate for nearest-neighbor linking, in pixels.
    pub max_distance: f64,
    /// Acceptance threshold for graph-model edge probabilities.
    pub edge_threshold: f64,
    /// Root directory holding pretrained association model artifacts.
    pub model_root: PathBuf,

    pub gmm_seed: u64,
    pub gmm_inits: usize,
    pub gmm_max_iter: usize,
    pub gmm_tol: f64,
    pub gmm_reg_covar: f64,

    pub hmm_seed: u64,
    pub hmm_max_iter: usize,
    pub hmm_tol: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_distance: 100.0,
            edge_threshold: 0.5,
            model_root: PathBuf::from("models"),
            gmm_seed: 42,
            gmm_inits: 3,
            gmm_max_iter: 100,
            gmm_tol: 1e-3,
            gmm_reg_covar: 1e-6,
            hmm_seed: 42,
            hmm_max_iter: 100,
            hmm_tol: 1e-2,
        }
    }
}
