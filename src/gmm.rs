//! Gaussian Mixture clustering of standardized cell features.
//!
//! Each component count in the requested range is fitted with full
//! covariances and a fixed seed; BIC and AIC curves are recorded and the
//! component count is chosen by consensus, preferring BIC on disagreement.

use std::collections::BTreeMap;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_derive::Serialize;

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::math;
use crate::observation::{
    is_known_feature, is_motion_feature, CellObservation, ObservationId, ObservationPatch,
    DEFAULT_FEATURES,
};
use crate::store::FeatureStore;

#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub seed: u64,
    pub n_init: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub reg_covar: f64,
}

impl FitOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            seed: config.gmm_seed,
            n_init: config.gmm_inits,
            max_iter: config.gmm_max_iter,
            tol: config.gmm_tol,
            reg_covar: config.gmm_reg_covar,
        }
    }
}

/// Full-covariance Gaussian mixture fitted by EM.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    pub weights: Vec<f64>,
    pub means: Vec<DVector<f64>>,
    pub covariances: Vec<DMatrix<f64>>,
    pub log_likelihood: f64,
}

impl GaussianMixture {
    /// Best of `n_init` seeded EM runs, by final log-likelihood. `None`
    /// when every run degenerates (singular covariance, empty component).
    pub fn fit(x: &Array2<f64>, n_components: usize, opts: &FitOptions) -> Option<Self> {
        let n = x.nrows();
        let d = x.ncols();
        if n_components == 0 || d == 0 || n < n_components {
            return None;
        }

        let rows: Vec<DVector<f64>> = (0..n)
            .map(|i| DVector::from_iterator(d, x.row(i).iter().cloned()))
            .collect();

        let mut rng = StdRng::seed_from_u64(opts.seed);
        let mut best: Option<Self> = None;
        for _ in 0..opts.n_init.max(1) {
            if let Some(model) = Self::fit_once(&rows, n_components, &mut rng, opts) {
                if best
                    .as_ref()
                    .map_or(true, |b| model.log_likelihood > b.log_likelihood)
                {
                    best = Some(model);
                }
            }
        }
        best
    }

    /// Hard cluster assignment (argmax responsibility) per row.
    pub fn predict(&self, x: &Array2<f64>) -> Option<Vec<usize>> {
        let d = x.ncols();
        let rows: Vec<DVector<f64>> = (0..x.nrows())
            .map(|i| DVector::from_iterator(d, x.row(i).iter().cloned()))
            .collect();
        let (resp, _) = Self::e_step(&rows, &self.weights, &self.means, &self.covariances)?;

        Some(
            (0..rows.len())
                .map(|i| {
                    let mut best = 0;
                    let mut best_resp = f64::NEG_INFINITY;
                    for j in 0..self.weights.len() {
                        if resp[(i, j)] > best_resp {
                            best_resp = resp[(i, j)];
                            best = j;
                        }
                    }
                    best
                })
                .collect(),
        )
    }

    fn fit_once(
        rows: &[DVector<f64>],
        k: usize,
        rng: &mut StdRng,
        opts: &FitOptions,
    ) -> Option<Self> {
        let n = rows.len();
        let d = rows[0].len();

        // init: k distinct sample rows as means, shared global covariance
        let picks = rand::seq::index::sample(rng, n, k).into_vec();
        let mut means: Vec<DVector<f64>> = picks.iter().map(|&i| rows[i].clone()).collect();

        let mut global_mean = DVector::zeros(d);
        for row in rows {
            global_mean += row;
        }
        global_mean /= n as f64;
        let mut global_cov = DMatrix::zeros(d, d);
        for row in rows {
            let diff = row - &global_mean;
            global_cov += &diff * diff.transpose();
        }
        global_cov /= n as f64;
        for t in 0..d {
            global_cov[(t, t)] += opts.reg_covar;
        }

        let mut covariances = vec![global_cov; k];
        let mut weights = vec![1.0 / k as f64; k];

        let mut prev_ll = f64::NEG_INFINITY;
        let mut converged_ll = None;
        for _ in 0..opts.max_iter {
            let (resp, ll) = Self::e_step(rows, &weights, &means, &covariances)?;
            if ((ll - prev_ll) / n as f64).abs() < opts.tol {
                converged_ll = Some(ll);
                break;
            }
            prev_ll = ll;
            if !Self::m_step(rows, &resp, &mut weights, &mut means, &mut covariances, opts.reg_covar)
            {
                return None;
            }
        }

        let log_likelihood = match converged_ll {
            Some(ll) => ll,
            None => Self::e_step(rows, &weights, &means, &covariances)?.1,
        };

        Some(Self {
            weights,
            means,
            covariances,
            log_likelihood,
        })
    }

    /// Responsibilities and total log-likelihood under the current
    /// parameters. `None` when a covariance loses positive-definiteness.
    fn e_step(
        rows: &[DVector<f64>],
        weights: &[f64],
        means: &[DVector<f64>],
        covariances: &[DMatrix<f64>],
    ) -> Option<(DMatrix<f64>, f64)> {
        let n = rows.len();
        let k = weights.len();
        let d = means[0].len() as f64;

        let mut prepared = Vec::with_capacity(k);
        for j in 0..k {
            let chol = covariances[j].clone().cholesky()?;
            let ln_det = chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>() * 2.0;
            prepared.push((chol, ln_det, weights[j].max(f64::MIN_POSITIVE).ln()));
        }

        let norm = d * (2.0 * std::f64::consts::PI).ln();
        let mut resp = DMatrix::zeros(n, k);
        let mut log_likelihood = 0.0;
        let mut weighted = vec![0.0; k];
        for (i, row) in rows.iter().enumerate() {
            for (j, (chol, ln_det, ln_weight)) in prepared.iter().enumerate() {
                let diff = row - &means[j];
                let mahalanobis = diff.dot(&chol.solve(&diff));
                weighted[j] = ln_weight - 0.5 * (norm + ln_det + mahalanobis);
            }
            let lse = math::logsumexp(&weighted);
            if !lse.is_finite() {
                return None;
            }
            log_likelihood += lse;
            for j in 0..k {
                resp[(i, j)] = (weighted[j] - lse).exp();
            }
        }

        Some((resp, log_likelihood))
    }

    fn m_step(
        rows: &[DVector<f64>],
        resp: &DMatrix<f64>,
        weights: &mut [f64],
        means: &mut [DVector<f64>],
        covariances: &mut [DMatrix<f64>],
        reg_covar: f64,
    ) -> bool {
        let n = rows.len();
        let d = rows[0].len();

        for j in 0..weights.len() {
            let nk: f64 = (0..n).map(|i| resp[(i, j)]).sum();
            if nk < 1e-10 {
                // empty component, this run is degenerate
                return false;
            }

            let mut mean = DVector::zeros(d);
            for (i, row) in rows.iter().enumerate() {
                mean += row * resp[(i, j)];
            }
            mean /= nk;

            let mut cov = DMatrix::zeros(d, d);
            for (i, row) in rows.iter().enumerate() {
                let diff = row - &mean;
                cov += (&diff * diff.transpose()) * resp[(i, j)];
            }
            cov /= nk;
            for t in 0..d {
                cov[(t, t)] += reg_covar;
            }

            weights[j] = nk / n as f64;
            means[j] = mean;
            covariances[j] = cov;
        }
        true
    }
}

/// Free parameters of a k-component full-covariance mixture over d
/// dimensions.
fn n_parameters(k: usize, d: usize) -> usize {
    k * d + k * d * (d + 1) / 2 + (k - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureMode {
    /// Drop any row missing a requested non-motion value.
    Strict,
    /// Probe the first eligible row and exclude features it lacks.
    Exploratory,
}

#[derive(Debug, Clone)]
pub struct GmmOptions {
    pub features: Vec<String>,
    pub min_components: usize,
    pub max_components: usize,
    pub mode: FeatureMode,
}

impl Default for GmmOptions {
    fn default() -> Self {
        Self {
            features: DEFAULT_FEATURES.iter().map(|s| s.to_string()).collect(),
            min_components: 2,
            max_components: 10,
            mode: FeatureMode::Strict,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentScore {
    pub n_components: usize,
    pub bic: f64,
    pub aic: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStat {
    pub cluster_id: usize,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GmmReport {
    pub optimal_components: usize,
    /// "consensus" when BIC and AIC agree on the count, else
    /// "bic_preferred".
    pub selection: &'static str,
    pub bic_optimal: usize,
    pub aic_optimal: usize,
    pub best_bic: f64,
    pub best_aic: f64,
    pub scores: Vec<ComponentScore>,
    pub total_cells: usize,
    pub cluster_stats: Vec<ClusterStat>,
    pub features_used: Vec<String>,
    /// True when only tracked observations were clustered.
    pub tracking_mode: bool,
}

/// Rows, observation ids and surviving column names of the clustering
/// matrix. Missing motion values default to 0 (frame-0 cells have no
/// predecessor); rows missing any other requested value are dropped.
fn build_feature_matrix(
    eligible: &[CellObservation],
    features: &[String],
    mode: FeatureMode,
) -> Result<(Array2<f64>, Vec<ObservationId>, Vec<String>), Error> {
    for name in features {
        if !is_known_feature(name) {
            return Err(Error::UnknownFeature(name.clone()));
        }
    }

    let columns: Vec<String> = match mode {
        FeatureMode::Strict => features.to_vec(),
        FeatureMode::Exploratory => {
            let probe = &eligible[0];
            features
                .iter()
                .filter(|name| {
                    let keep =
                        is_motion_feature(name) || probe.feature_value(name).is_some();
                    if !keep {
                        warn!("feature {name} unavailable on probed observation, excluding");
                    }
                    keep
                })
                .cloned()
                .collect()
        }
    };
    if columns.is_empty() {
        return Err(Error::NoUsableFeatures);
    }

    let mut data = Vec::with_capacity(eligible.len() * columns.len());
    let mut ids = Vec::with_capacity(eligible.len());
    'rows: for obs in eligible {
        let start = data.len();
        for name in &columns {
            match obs.feature_value(name) {
                Some(v) => data.push(v),
                None if is_motion_feature(name) => data.push(0.0),
                None => {
                    data.truncate(start);
                    continue 'rows;
                }
            }
        }
        ids.push(obs.id);
    }

    let x = Array2::from_shape_vec((ids.len(), columns.len()), data)
        .map_err(|e| Error::Store(e.to_string()))?;
    Ok((x, ids, columns))
}

/// Cluster eligible observations into Gaussian mixture states and persist
/// the hard assignments.
pub fn run_gmm_clustering(
    store: &mut dyn FeatureStore,
    config: &PipelineConfig,
    options: &GmmOptions,
) -> Result<GmmReport, Error> {
    if options.features.is_empty() {
        return Err(Error::NoUsableFeatures);
    }

    let min_components = options.min_components.max(1);

    let all = store.list_observations();
    let tracked: Vec<CellObservation> = all
        .iter()
        .filter(|o| o.track_id.is_some())
        .cloned()
        .collect();
    let tracking_mode = !tracked.is_empty();
    let eligible = if tracking_mode { tracked } else { all };

    if eligible.len() < min_components {
        return Err(Error::NotEnoughCells {
            required: min_components,
            available: eligible.len(),
        });
    }

    let (mut x, ids, features_used) =
        build_feature_matrix(&eligible, &options.features, options.mode)?;
    if ids.len() < min_components {
        return Err(Error::NotEnoughCells {
            required: min_components,
            available: ids.len(),
        });
    }

    math::standardize_columns(&mut x);

    let fit_opts = FitOptions::from_config(config);
    let max_k = options.max_components.min(ids.len().saturating_sub(1));

    let mut scores = Vec::new();
    let mut bic_best: Option<(usize, f64)> = None;
    let mut aic_best: Option<(usize, f64)> = None;
    for k in min_components..=max_k {
        let Some(model) = GaussianMixture::fit(&x, k, &fit_opts) else {
            warn!("GMM failed for {k} components");
            continue;
        };
        let p = n_parameters(k, x.ncols()) as f64;
        let n = ids.len() as f64;
        let bic = -2.0 * model.log_likelihood + p * n.ln();
        let aic = -2.0 * model.log_likelihood + 2.0 * p;
        scores.push(ComponentScore {
            n_components: k,
            bic,
            aic,
        });
        if bic_best.map_or(true, |(_, best)| bic < best) {
            bic_best = Some((k, bic));
        }
        if aic_best.map_or(true, |(_, best)| aic < best) {
            aic_best = Some((k, aic));
        }
    }

    let (Some((bic_k, best_bic)), Some((aic_k, _))) = (bic_best, aic_best) else {
        return Err(Error::ClusteringFailed);
    };
    let selection = if bic_k == aic_k {
        "consensus"
    } else {
        // stated policy: BIC's stronger complexity penalty wins
        debug!("BIC picks {bic_k} components, AIC picks {aic_k}; preferring BIC");
        "bic_preferred"
    };
    let optimal = bic_k;
    let best_aic = scores
        .iter()
        .find(|s| s.n_components == optimal)
        .map(|s| s.aic)
        .unwrap_or(f64::NAN);

    let model = GaussianMixture::fit(&x, optimal, &fit_opts).ok_or(Error::ClusteringFailed)?;
    let labels = model.predict(&x).ok_or(Error::ClusteringFailed)?;

    let updates: Vec<_> = ids
        .iter()
        .zip(&labels)
        .map(|(&id, &state)| (id, ObservationPatch::gmm_state(state)))
        .collect();
    store.bulk_update(updates)?;
    store.commit()?;

    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for &state in &labels {
        *counts.entry(state).or_default() += 1;
    }
    let cluster_stats = (0..optimal)
        .map(|cluster_id| {
            let count = counts.get(&cluster_id).copied().unwrap_or(0);
            ClusterStat {
                cluster_id,
                count,
                percentage: count as f64 / labels.len() as f64 * 100.0,
            }
        })
        .collect();

    Ok(GmmReport {
        optimal_components: optimal,
        selection,
        bic_optimal: bic_k,
        aic_optimal: aic_k,
        best_bic,
        best_aic,
        scores,
        total_cells: ids.len(),
        cluster_stats,
        features_used,
        tracking_mode,
    })
}
