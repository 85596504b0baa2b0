use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::error::Error;
use crate::linker::link_motion;
use crate::observation::{CellObservation, ObservationPatch};
use crate::store::FeatureStore;
use crate::tracker::TrackingReport;

/// Fallback tracker for masks whose labels are already persistent across
/// frames (a label-consistent relabeling): the per-frame cell label becomes
/// the track identity and no assignment solving is needed.
pub struct LabelIdentityTracker;

impl LabelIdentityTracker {
    pub fn run(store: &mut dyn FeatureStore) -> Result<TrackingReport, Error> {
        let observations = store.list_observations();
        if observations.is_empty() {
            return Err(Error::NoFeatures);
        }

        let total_cells = observations.len();
        let frame_count = observations
            .iter()
            .map(|o| o.frame_num)
            .collect::<BTreeSet<_>>()
            .len();

        let mut by_label: BTreeMap<u32, Vec<CellObservation>> = BTreeMap::new();
        for obs in observations {
            by_label.entry(obs.cell_label).or_default().push(obs);
        }

        let persistent = by_label.values().any(|seq| {
            seq.iter().map(|o| o.frame_num).collect::<BTreeSet<_>>().len() > 1
        });
        if !persistent {
            return Err(Error::LabelsNotPersistent);
        }

        let total_tracks = by_label.len();
        let mut updates = Vec::with_capacity(total_cells);

        for (label, mut seq) in by_label {
            seq.sort_by_key(|o| o.frame_num);

            // a label occurring twice in one frame cannot be one cell;
            // keep the first occurrence in the motion sequence
            let mut track: Vec<CellObservation> = Vec::with_capacity(seq.len());
            for mut obs in seq {
                obs.track_id = Some(label);
                if track.last().map(|p| p.frame_num) == Some(obs.frame_num) {
                    warn!(
                        "label {} occurs more than once in frame {}, skipping duplicate for motion",
                        label, obs.frame_num
                    );
                    updates.push((obs.id, ObservationPatch::tracking(&obs)));
                    continue;
                }
                track.push(obs);
            }

            for i in 1..track.len() {
                let (head, tail) = track.split_at_mut(i);
                link_motion(&mut tail[0], &head[i - 1]);
            }
            for obs in &track {
                updates.push((obs.id, ObservationPatch::tracking(obs)));
            }
        }

        store.bulk_update(updates)?;
        store.commit()?;

        debug!("label-identity tracking: {total_tracks} tracks over {frame_count} frames");

        Ok(TrackingReport {
            strategy: "label_identity",
            message: "Tracking completed".into(),
            total_tracks,
            total_cells,
            frames_processed: frame_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn persistent_labels_become_track_ids() {
        let mut store = InMemoryFeatureStore::new();
        let ids = [
            store.insert(cell(0, 7, 0.0, 0.0)),
            store.insert(cell(1, 7, 0.0, 2.0)),
            store.insert(cell(2, 7, 2.0, 2.0)),
        ];

        let report = LabelIdentityTracker::run(&mut store).unwrap();
        assert_eq!(report.total_tracks, 1);
        assert_eq!(report.frames_processed, 3);

        for id in ids {
            assert_eq!(store.get(id).unwrap().track_id, Some(7));
        }
        // second observation moved +2 columns
        let mid = store.get(ids[1]).unwrap();
        assert_eq!(mid.delta_x, Some(2.0));
        assert_eq!(mid.delta_y, Some(0.0));
        assert_eq!(mid.turning, None);
        // third observation turned from +x onto +y
        let last = store.get(ids[2]).unwrap();
        assert_eq!(last.delta_y, Some(2.0));
        assert!((last.turning.unwrap() - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn non_repeating_labels_are_an_explicit_failure() {
        let mut store = InMemoryFeatureStore::new();
        store.insert(cell(0, 1, 0.0, 0.0));
        store.insert(cell(1, 2, 1.0, 1.0));

        let err = LabelIdentityTracker::run(&mut store).unwrap_err();
        assert!(matches!(err, Error::LabelsNotPersistent));
        assert!(store.list_observations().iter().all(|o| o.track_id.is_none()));
    }

    #[test]
    fn duplicate_label_in_one_frame_is_skipped_not_fatal() {
        let mut store = InMemoryFeatureStore::new();
        store.insert(cell(0, 7, 0.0, 0.0));
        let dup = store.insert(cell(0, 7, 5.0, 5.0));
        let next = store.insert(cell(1, 7, 0.0, 1.0));

        let report = LabelIdentityTracker::run(&mut store).unwrap();
        assert_eq!(report.total_cells, 3);
        // the duplicate still carries the label identity but no motion
        assert_eq!(store.get(dup).unwrap().track_id, Some(7));
        assert_eq!(store.get(dup).unwrap().displacement, None);
        // motion is computed against the first occurrence
        assert_eq!(store.get(next).unwrap().delta_x, Some(1.0));
    }
}
