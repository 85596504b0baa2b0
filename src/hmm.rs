//! Hidden-Markov smoothing of per-track GMM state sequences.
//!
//! One categorical HMM is fitted jointly across all qualifying tracks
//! (concatenated sequences with an explicit length list), then each track
//! is decoded independently with the shared model. Smoothing removes
//! spurious single-frame state flips that the per-frame mixture assignment
//! cannot see.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_derive::Serialize;

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::observation::{ObservationId, ObservationPatch};
use crate::store::FeatureStore;

const PROB_FLOOR: f64 = 1e-12;

/// Categorical (discrete-emission) hidden Markov model.
#[derive(Debug, Clone)]
pub struct CategoricalHmm {
    pub start: Array1<f64>,
    /// state x state
    pub transition: Array2<f64>,
    /// state x symbol
    pub emission: Array2<f64>,
    pub log_likelihood: f64,
}

impl CategoricalHmm {
    /// Baum-Welch over multiple sequences with a seeded random start and a
    /// capped iteration count.
    pub fn fit(
        sequences: &[Vec<usize>],
        n_states: usize,
        n_symbols: usize,
        seed: u64,
        max_iter: usize,
        tol: f64,
    ) -> Result<Self, Error> {
        if n_states == 0 || n_symbols == 0 {
            return Err(Error::HmmFitFailed("degenerate state space".into()));
        }
        if sequences.iter().any(|s| s.iter().any(|&o| o >= n_symbols)) {
            return Err(Error::HmmFitFailed("symbol outside emission alphabet".into()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut start = random_simplex(&mut rng, n_states);
        let mut transition = random_rows(&mut rng, n_states, n_states);
        let mut emission = random_rows(&mut rng, n_states, n_symbols);

        let mut prev_ll = f64::NEG_INFINITY;
        let mut log_likelihood = f64::NEG_INFINITY;
        for iteration in 0..max_iter {
            let mut start_acc = Array1::<f64>::zeros(n_states);
            let mut trans_acc = Array2::<f64>::zeros((n_states, n_states));
            let mut emis_acc = Array2::<f64>::zeros((n_states, n_symbols));
            let mut total_ll = 0.0;

            for seq in sequences {
                total_ll += accumulate(
                    seq,
                    &start,
                    &transition,
                    &emission,
                    &mut start_acc,
                    &mut trans_acc,
                    &mut emis_acc,
                )?;
            }
            if !total_ll.is_finite() {
                return Err(Error::HmmFitFailed("non-finite log-likelihood".into()));
            }
            log_likelihood = total_ll;

            start = normalized(&start_acc);
            for i in 0..n_states {
                let row = normalized(&trans_acc.row(i).to_owned());
                transition.row_mut(i).assign(&row);
                let row = normalized(&emis_acc.row(i).to_owned());
                emission.row_mut(i).assign(&row);
            }

            if (total_ll - prev_ll).abs() < tol {
                debug!("HMM converged after {} iterations", iteration + 1);
                break;
            }
            prev_ll = total_ll;
        }

        Ok(Self {
            start,
            transition,
            emission,
            log_likelihood,
        })
    }

    /// Most likely state path for one observation sequence.
    pub fn viterbi(&self, seq: &[usize]) -> Vec<usize> {
        if seq.is_empty() {
            return Vec::new();
        }
        let n_states = self.start.len();
        let ln = |p: f64| p.max(PROB_FLOOR).ln();

        let mut score = vec![0.0; n_states];
        let mut back: Vec<Vec<usize>> = Vec::with_capacity(seq.len());
        for (i, s) in score.iter_mut().enumerate() {
            *s = ln(self.start[i]) + ln(self.emission[[i, seq[0]]]);
        }
        back.push(vec![0; n_states]);

        for &symbol in &seq[1..] {
            let mut next = vec![f64::NEG_INFINITY; n_states];
            let mut from = vec![0; n_states];
            for (j, slot) in next.iter_mut().enumerate() {
                for i in 0..n_states {
                    let candidate = score[i] + ln(self.transition[[i, j]]);
                    if candidate > *slot {
                        *slot = candidate;
                        from[j] = i;
                    }
                }
                *slot += ln(self.emission[[j, symbol]]);
            }
            score = next;
            back.push(from);
        }

        let mut best = 0;
        for i in 1..n_states {
            if score[i] > score[best] {
                best = i;
            }
        }
        let mut path = vec![best; seq.len()];
        for t in (1..seq.len()).rev() {
            path[t - 1] = back[t][path[t]];
        }
        path
    }
}

/// Scaled forward-backward pass over one sequence; adds its sufficient
/// statistics to the accumulators and returns the sequence log-likelihood.
#[allow(clippy::too_many_arguments)]
fn accumulate(
    seq: &[usize],
    start: &Array1<f64>,
    transition: &Array2<f64>,
    emission: &Array2<f64>,
    start_acc: &mut Array1<f64>,
    trans_acc: &mut Array2<f64>,
    emis_acc: &mut Array2<f64>,
) -> Result<f64, Error> {
    let n_states = start.len();
    let len = seq.len();

    // forward, scaled so each alpha row sums to one
    let mut alpha = Array2::<f64>::zeros((len, n_states));
    let mut scale = vec![0.0; len];
    for i in 0..n_states {
        alpha[[0, i]] = start[i] * emission[[i, seq[0]]];
    }
    scale[0] = alpha.row(0).sum();
    if scale[0] <= 0.0 {
        return Err(Error::HmmFitFailed("zero-probability observation".into()));
    }
    for i in 0..n_states {
        alpha[[0, i]] /= scale[0];
    }
    for t in 1..len {
        for j in 0..n_states {
            let mut acc = 0.0;
            for i in 0..n_states {
                acc += alpha[[t - 1, i]] * transition[[i, j]];
            }
            alpha[[t, j]] = acc * emission[[j, seq[t]]];
        }
        scale[t] = alpha.row(t).sum();
        if scale[t] <= 0.0 {
            return Err(Error::HmmFitFailed("zero-probability observation".into()));
        }
        for j in 0..n_states {
            alpha[[t, j]] /= scale[t];
        }
    }

    // backward, using the forward scaling factors
    let mut beta = Array2::<f64>::zeros((len, n_states));
    for i in 0..n_states {
        beta[[len - 1, i]] = 1.0;
    }
    for t in (0..len - 1).rev() {
        for i in 0..n_states {
            let mut acc = 0.0;
            for j in 0..n_states {
                acc += transition[[i, j]] * emission[[j, seq[t + 1]]] * beta[[t + 1, j]];
            }
            beta[[t, i]] = acc / scale[t + 1];
        }
    }

    // gamma is alpha * beta under this scaling convention
    for t in 0..len {
        for i in 0..n_states {
            let gamma = alpha[[t, i]] * beta[[t, i]];
            if t == 0 {
                start_acc[i] += gamma;
            }
            emis_acc[[i, seq[t]]] += gamma;
        }
    }
    for t in 0..len - 1 {
        for i in 0..n_states {
            for j in 0..n_states {
                trans_acc[[i, j]] += alpha[[t, i]]
                    * transition[[i, j]]
                    * emission[[j, seq[t + 1]]]
                    * beta[[t + 1, j]]
                    / scale[t + 1];
            }
        }
    }

    Ok(scale.iter().map(|c| c.ln()).sum())
}

fn random_simplex(rng: &mut StdRng, n: usize) -> Array1<f64> {
    let mut v = Array1::from_shape_fn(n, |_| rng.gen_range(0.1..1.0));
    let sum = v.sum();
    v.mapv_inplace(|x| x / sum);
    v
}

fn random_rows(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f64> {
    let mut m = Array2::zeros((rows, cols));
    for mut row in m.rows_mut() {
        let v = random_simplex(rng, cols);
        row.assign(&v);
    }
    m
}

fn normalized(v: &Array1<f64>) -> Array1<f64> {
    let sum = v.sum();
    if sum <= 0.0 {
        Array1::from_elem(v.len(), 1.0 / v.len() as f64)
    } else {
        v.mapv(|x| (x / sum).max(PROB_FLOOR))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HmmOptions {
    /// Number of hidden states; defaults to the number of distinct GMM
    /// states observed.
    pub n_states: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateStat {
    pub state_id: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HmmReport {
    pub n_states: usize,
    pub tracks_processed: usize,
    pub cells_updated: usize,
    pub state_stats: Vec<StateStat>,
    pub transition_matrix: Vec<Vec<f64>>,
}

/// Smooth per-track GMM state sequences with a jointly fitted categorical
/// HMM and persist the decoded states.
pub fn run_hmm_smoothing(
    store: &mut dyn FeatureStore,
    config: &PipelineConfig,
    options: &HmmOptions,
) -> Result<HmmReport, Error> {
    let observations = store.list_observations();

    let symbols: BTreeSet<usize> = observations.iter().filter_map(|o| o.gmm_state).collect();
    if symbols.is_empty() {
        return Err(Error::NoGmmStates);
    }
    let symbol_index: BTreeMap<usize, usize> = symbols
        .iter()
        .enumerate()
        .map(|(idx, &state)| (state, idx))
        .collect();
    let n_symbols = symbols.len();
    let n_states = options.n_states.unwrap_or(n_symbols);

    // frame-ordered symbol sequence per track, tracked + clustered rows only
    let mut tracks: BTreeMap<u32, Vec<(ObservationId, usize)>> = BTreeMap::new();
    for obs in &observations {
        let (Some(track_id), Some(gmm_state)) = (obs.track_id, obs.gmm_state) else {
            continue;
        };
        tracks
            .entry(track_id)
            .or_default()
            .push((obs.id, symbol_index[&gmm_state]));
    }
    // single-observation tracks carry no sequence information
    tracks.retain(|_, seq| seq.len() >= 2);
    if tracks.is_empty() {
        return Err(Error::NotEnoughSequenceData);
    }

    let sequences: Vec<Vec<usize>> = tracks
        .values()
        .map(|seq| seq.iter().map(|&(_, s)| s).collect())
        .collect();

    let model = CategoricalHmm::fit(
        &sequences,
        n_states,
        n_symbols,
        config.hmm_seed,
        config.hmm_max_iter,
        config.hmm_tol,
    )?;

    let mut updates = Vec::new();
    for seq in tracks.values() {
        let symbols: Vec<usize> = seq.iter().map(|&(_, s)| s).collect();
        let path = model.viterbi(&symbols);
        for (&(id, _), &state) in seq.iter().zip(&path) {
            updates.push((id, ObservationPatch::hmm_state(state)));
        }
    }
    let cells_updated = updates.len();
    store.bulk_update(updates)?;
    store.commit()?;

    let committed = store.list_observations();
    let state_stats = (0..n_states)
        .map(|state_id| StateStat {
            state_id,
            count: committed
                .iter()
                .filter(|o| o.hmm_state == Some(state_id))
                .count(),
        })
        .collect();

    let transition_matrix = model
        .transition
        .rows()
        .into_iter()
        .map(|row| row.to_vec())
        .collect();

    Ok(HmmReport {
        n_states,
        tracks_processed: tracks.len(),
        cells_updated,
        state_stats,
        transition_matrix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::CellObservation;
    use crate::store::InMemoryFeatureStore;

    fn clustered_cell(frame_num: u32, track: u32, state: usize) -> CellObservation {
        CellObservation {
            frame_num,
            cell_label: track,
            track_id: Some(track),
            gmm_state: Some(state),
            ..Default::default()
        }
    }

    fn pure_sequences_store() -> InMemoryFeatureStore {
        let mut store = InMemoryFeatureStore::new();
        for f in 0..4 {
            store.insert(clustered_cell(f, 1, 0));
            store.insert(clustered_cell(f, 2, 0));
            store.insert(clustered_cell(f, 3, 1));
        }
        store
    }

    #[test]
    fn smoothing_assigns_states_to_every_tracked_cell() {
        let mut store = pure_sequences_store();
        let report = run_hmm_smoothing(
            &mut store,
            &PipelineConfig::default(),
            &HmmOptions::default(),
        )
        .unwrap();

        assert_eq!(report.n_states, 2);
        assert_eq!(report.tracks_processed, 3);
        assert_eq!(report.cells_updated, 12);
        assert_eq!(report.state_stats.iter().map(|s| s.count).sum::<usize>(), 12);

        for obs in store.list_observations() {
            let state = obs.hmm_state.expect("hmm_state missing");
            assert!(state < report.n_states);
        }

        // constant input sequences decode to constant state paths
        for track in 1..=3 {
            let states: BTreeSet<_> = store
                .list_for_track(track)
                .into_iter()
                .map(|o| o.hmm_state)
                .collect();
            assert_eq!(states.len(), 1, "track {track} flipped states");
        }

        // rows of the learned transition matrix are distributions
        for row in &report.transition_matrix {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn missing_gmm_states_error_without_mutation() {
        let mut store = InMemoryFeatureStore::new();
        for f in 0..3 {
            store.insert(CellObservation {
                frame_num: f,
                track_id: Some(1),
                ..Default::default()
            });
        }
        let err = run_hmm_smoothing(
            &mut store,
            &PipelineConfig::default(),
            &HmmOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoGmmStates));
        assert!(store.list_observations().iter().all(|o| o.hmm_state.is_none()));
    }

    #[test]
    fn single_observation_tracks_are_excluded() {
        let mut store = InMemoryFeatureStore::new();
        store.insert(clustered_cell(0, 1, 0));
        let err = run_hmm_smoothing(
            &mut store,
            &PipelineConfig::default(),
            &HmmOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotEnoughSequenceData));
    }

    #[test]
    fn untracked_clustered_rows_never_get_hmm_states() {
        let mut store = pure_sequences_store();
        let loose = store.insert(CellObservation {
            frame_num: 0,
            cell_label: 9,
            gmm_state: Some(1),
            ..Default::default()
        });
        run_hmm_smoothing(
            &mut store,
            &PipelineConfig::default(),
            &HmmOptions::default(),
        )
        .unwrap();
        assert_eq!(store.get(loose).unwrap().hmm_state, None);
    }

    #[test]
    fn repeated_fits_are_deterministic() {
        let run = || {
            let mut store = pure_sequences_store();
            let report = run_hmm_smoothing(
                &mut store,
                &PipelineConfig::default(),
                &HmmOptions::default(),
            )
            .unwrap();
            let states: Vec<_> = store
                .list_observations()
                .into_iter()
                .map(|o| o.hmm_state)
                .collect();
            (report.transition_matrix, states)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn viterbi_follows_dominant_emissions() {
        let model = CategoricalHmm {
            start: Array1::from_vec(vec![0.5, 0.5]),
            transition: Array2::from_shape_vec((2, 2), vec![0.9, 0.1, 0.1, 0.9]).unwrap(),
            emission: Array2::from_shape_vec((2, 2), vec![0.95, 0.05, 0.05, 0.95]).unwrap(),
            log_likelihood: 0.0,
        };
        assert_eq!(model.viterbi(&[0, 0, 0]), vec![0, 0, 0]);
        assert_eq!(model.viterbi(&[1, 1, 1]), vec![1, 1, 1]);
        // a lone flip in a long run is smoothed away
        assert_eq!(model.viterbi(&[0, 0, 1, 0, 0]), vec![0, 0, 0, 0, 0]);
    }
}
