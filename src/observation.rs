use serde_derive::{Deserialize, Serialize};

pub type ObservationId = u64;

/// One detected cell instance in one frame. Geometry, shape ratios and
/// intensity fields are computed at extraction time and treated as
/// immutable here; tracking and clustering outputs are the only fields the
/// pipeline writes back.
///
/// `cell_label` is the mask-assigned label, unique within its frame only.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CellObservation {
    pub id: ObservationId,
    pub frame_num: u32,
    pub cell_label: u32,

    pub min_row_bb: u32,
    pub min_col_bb: u32,
    pub max_row_bb: u32,
    pub max_col_bb: u32,
    pub centroid_row: Option<f64>,
    pub centroid_col: Option<f64>,
    pub area: Option<f64>,
    pub major_axis_length: Option<f64>,
    pub minor_axis_length: Option<f64>,
    pub perimeter: Option<f64>,
    pub convex_area: Option<f64>,

    pub aspect_ratio: Option<f64>,
    pub circularity: Option<f64>,
    pub solidity: Option<f64>,
    pub extent: Option<f64>,
    pub eccentricity: Option<f64>,
    pub convexity_deficit: Option<f64>,

    pub max_intensity: Option<f64>,
    pub mean_intensity: Option<f64>,
    pub min_intensity: Option<f64>,
    pub intensity_ratio_max_mean: Option<f64>,
    pub intensity_ratio_mean_min: Option<f64>,

    // tracking outputs
    pub track_id: Option<u32>,
    pub delta_x: Option<f64>,
    pub delta_y: Option<f64>,
    pub displacement: Option<f64>,
    pub speed: Option<f64>,
    pub turning: Option<f64>,

    // clustering outputs
    pub gmm_state: Option<usize>,
    pub hmm_state: Option<usize>,
}

impl CellObservation {
    /// Dynamic accessor used by the clustering feature-matrix builder.
    /// Returns `None` when the value is missing on this observation; unknown
    /// names must be rejected up front via [`is_known_feature`].
    pub fn feature_value(&self, name: &str) -> Option<f64> {
        match name {
            "area" => self.area,
            "major_axis_length" => self.major_axis_length,
            "minor_axis_length" => self.minor_axis_length,
            "aspect_ratio" => self.aspect_ratio,
            "circularity" => self.circularity,
            "eccentricity" => self.eccentricity,
            "solidity" => self.solidity,
            "extent" => self.extent,
            "perimeter" => self.perimeter,
            "convex_area" => self.convex_area,
            "convexity_deficit" => self.convexity_deficit,
            "mean_intensity" => self.mean_intensity,
            "max_intensity" => self.max_intensity,
            "min_intensity" => self.min_intensity,
            "intensity_ratio_max_mean" => self.intensity_ratio_max_mean,
            "intensity_ratio_mean_min" => self.intensity_ratio_mean_min,
            "displacement" => self.displacement,
            "speed" => self.speed,
            "turning" => self.turning,
            "delta_x" => self.delta_x,
            "delta_y" => self.delta_y,
            _ => None,
        }
    }
}

/// Batched write against one observation. `None` fields are left untouched.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ObservationPatch {
    pub track_id: Option<u32>,
    pub delta_x: Option<f64>,
    pub delta_y: Option<f64>,
    pub displacement: Option<f64>,
    pub speed: Option<f64>,
    pub turning: Option<f64>,
    pub gmm_state: Option<usize>,
    pub hmm_state: Option<usize>,
}

impl ObservationPatch {
    /// Snapshot of an observation's tracking outputs, as produced by one
    /// tracker run.
    pub fn tracking(obs: &CellObservation) -> Self {
        Self {
            track_id: obs.track_id,
            delta_x: obs.delta_x,
            delta_y: obs.delta_y,
            displacement: obs.displacement,
            speed: obs.speed,
            turning: obs.turning,
            gmm_state: None,
            hmm_state: None,
        }
    }

    pub fn gmm_state(state: usize) -> Self {
        Self {
            gmm_state: Some(state),
            ..Default::default()
        }
    }

    pub fn hmm_state(state: usize) -> Self {
        Self {
            hmm_state: Some(state),
            ..Default::default()
        }
    }

    pub fn apply(&self, obs: &mut CellObservation) {
        if let Some(v) = self.track_id {
            obs.track_id = Some(v);
        }
        if let Some(v) = self.delta_x {
            obs.delta_x = Some(v);
        }
        if let Some(v) = self.delta_y {
            obs.delta_y = Some(v);
        }
        if let Some(v) = self.displacement {
            obs.displacement = Some(v);
        }
        if let Some(v) = self.speed {
            obs.speed = Some(v);
        }
        if let Some(v) = self.turning {
            obs.turning = Some(v);
        }
        if let Some(v) = self.gmm_state {
            obs.gmm_state = Some(v);
        }
        if let Some(v) = self.hmm_state {
            obs.hmm_state = Some(v);
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy)]
pub struct FeatureInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Motion features are populated only for observations with a predecessor
/// link; the matrix builder defaults them to 0.0 instead of dropping rows.
pub const MOTION_FEATURES: &[&str] = &["delta_x", "delta_y", "displacement", "speed", "turning"];

/// Default feature subset for GMM clustering.
pub const DEFAULT_FEATURES: &[&str] = &[
    "area",
    "major_axis_length",
    "minor_axis_length",
    "aspect_ratio",
    "circularity",
    "eccentricity",
    "solidity",
    "extent",
    "mean_intensity",
    "max_intensity",
    "min_intensity",
    "intensity_ratio_max_mean",
    "intensity_ratio_mean_min",
    "displacement",
];

pub fn available_features() -> &'static [FeatureInfo] {
    &[
        FeatureInfo { name: "area", description: "Cell area in pixels" },
        FeatureInfo { name: "major_axis_length", description: "Length of major axis" },
        FeatureInfo { name: "minor_axis_length", description: "Length of minor axis" },
        FeatureInfo { name: "aspect_ratio", description: "Major/Minor axis ratio" },
        FeatureInfo { name: "circularity", description: "Shape circularity (4*pi*area/perimeter^2)" },
        FeatureInfo { name: "eccentricity", description: "Ellipse eccentricity" },
        FeatureInfo { name: "solidity", description: "Area/Convex area ratio" },
        FeatureInfo { name: "extent", description: "Area/Bounding box area" },
        FeatureInfo { name: "perimeter", description: "Cell perimeter" },
        FeatureInfo { name: "convex_area", description: "Convex hull area" },
        FeatureInfo { name: "convexity_deficit", description: "(Convex area - area)/Convex area" },
        FeatureInfo { name: "mean_intensity", description: "Mean pixel intensity" },
        FeatureInfo { name: "max_intensity", description: "Maximum pixel intensity" },
        FeatureInfo { name: "min_intensity", description: "Minimum pixel intensity" },
        FeatureInfo { name: "intensity_ratio_max_mean", description: "Max/Mean intensity ratio" },
        FeatureInfo { name: "intensity_ratio_mean_min", description: "Mean/Min intensity ratio" },
        FeatureInfo { name: "displacement", description: "Movement from previous frame" },
        FeatureInfo { name: "speed", description: "Movement speed" },
        FeatureInfo { name: "turning", description: "Turning angle" },
        FeatureInfo { name: "delta_x", description: "X displacement" },
        FeatureInfo { name: "delta_y", description: "Y displacement" },
    ]
}

pub fn is_known_feature(name: &str) -> bool {
    available_features().iter().any(|f| f.name == name)
}

pub fn is_motion_feature(name: &str) -> bool {
    MOTION_FEATURES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_catalog_is_consistent() {
        for name in DEFAULT_FEATURES {
            assert!(is_known_feature(name), "{name} missing from catalog");
        }
        for name in MOTION_FEATURES {
            assert!(is_known_feature(name), "{name} missing from catalog");
        }
    }

    #[test]
    fn missing_motion_values_read_as_none() {
        let obs = CellObservation {
            area: Some(50.0),
            ..Default::default()
        };
        assert_eq!(obs.feature_value("area"), Some(50.0));
        assert_eq!(obs.feature_value("displacement"), None);
        assert_eq!(obs.feature_value("no_such_feature"), None);
    }

    #[test]
    fn patch_leaves_unset_fields_alone() {
        let mut obs = CellObservation {
            track_id: Some(3),
            displacement: Some(1.5),
            ..Default::default()
        };
        ObservationPatch::gmm_state(1).apply(&mut obs);
        assert_eq!(obs.track_id, Some(3));
        assert_eq!(obs.displacement, Some(1.5));
        assert_eq!(obs.gmm_state, Some(1));
    }
}
