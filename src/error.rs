use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No features found. Run feature extraction first.")]
    NoFeatures,

    #[error("Need at least 2 frames for tracking, got {0}")]
    NotEnoughFrames(usize),

    #[error("tracking requires either a model-based tracker or masks with embedded persistent labels")]
    LabelsNotPersistent,

    #[error("assignment could not be solved")]
    AssignmentUnsolvable,

    #[error("graph association model is not available: {0}")]
    GnnUnavailable(String),

    #[error("edge scoring failed: {0}")]
    EdgeScoring(String),

    #[error("Not enough cells for clustering. Need at least {required}, got {available}")]
    NotEnoughCells { required: usize, available: usize },

    #[error("unknown clustering feature: {0}")]
    UnknownFeature(String),

    #[error("no usable clustering features after validation")]
    NoUsableFeatures,

    #[error("GMM fitting failed for every component count")]
    ClusteringFailed,

    #[error("No GMM states found. Run GMM clustering first.")]
    NoGmmStates,

    #[error("Not enough sequence data for HMM")]
    NotEnoughSequenceData,

    #[error("HMM fitting failed: {0}")]
    HmmFitFailed(String),

    #[error("feature store error: {0}")]
    Store(String),
}

impl Error {
    /// True for failures the tracking orchestrator may downgrade into the
    /// label-identity fallback: a missing model runtime/artifact, or a
    /// runtime failure inside the external scorer. Precondition errors are
    /// never degradable.
    pub fn is_degradable(&self) -> bool {
        matches!(self, Error::GnnUnavailable(_) | Error::EdgeScoring(_))
    }
}
