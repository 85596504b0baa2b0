use std::collections::BTreeSet;

use log::debug;
use ndarray::Array2;

use crate::assignment;
use crate::error::Error;
use crate::frame::group_by_frame;
use crate::math;
use crate::observation::{CellObservation, ObservationPatch};
use crate::store::FeatureStore;
use crate::tracker::TrackingReport;

/// Nearest-neighbor tracker: optimal centroid-distance assignment between
/// consecutive frames, gated at `max_distance`.
pub struct FrameLinker {
    pub max_distance: f64,
}

impl FrameLinker {
    pub fn new(max_distance: f64) -> Self {
        Self { max_distance }
    }

    pub fn run(&self, store: &mut dyn FeatureStore) -> Result<TrackingReport, Error> {
        let observations = store.list_observations();
        if observations.is_empty() {
            return Err(Error::NoFeatures);
        }

        let total_cells = observations.len();
        let mut frames = group_by_frame(observations);
        if frames.len() < 2 {
            return Err(Error::NotEnoughFrames(frames.len()));
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

            let mut costs =
                Array2::from_elem((curr.len(), prev.len()), f64::INFINITY);
            for (ci, c) in curr.observations.iter().enumerate() {
                for (pi, p) in prev.observations.iter().enumerate() {
                    let (Some(cr), Some(cc), Some(pr), Some(pc)) =
                        (c.centroid_row, c.centroid_col, p.centroid_row, p.centroid_col)
                    else {
                        continue;
                    };
                    let dist = math::euclidean(cr, cc, pr, pc);
                    if dist <= self.max_distance {
                        costs[[ci, pi]] = dist;
                    }
                }
            }

            let links = assignment::solve(&costs)?;
            let mut assigned = vec![false; curr.len()];
            for link in links {
                if !link.is_valid() {
                    continue;
                }
                let p = &prev.observations[link.col];
                let c = &mut curr.observations[link.row];
                c.track_id = p.track_id;
                link_motion(c, p);
                assigned[link.row] = true;
            }

            for (ci, c) in curr.observations.iter_mut().enumerate() {
                if !assigned[ci] {
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

        debug!(
            "nearest-neighbor tracking: {} tracks over {} frames",
            track_ids.len(),
            frames.len()
        );

        Ok(TrackingReport {
            strategy: "nearest_neighbor",
            message: "Tracking completed".into(),
            total_tracks: track_ids.len(),
            total_cells,
            frames_processed: frames.len(),
        })
    }
}

/// Motion features of an accepted link, written onto the current
/// observation. delta_x follows columns, delta_y follows rows; all four of
/// delta_x/delta_y/displacement/speed are set together. Turning is the raw
/// angle difference (not wrapped to (-pi, pi]) and needs the previous
/// observation to carry a motion vector of its own.
pub(crate) fn link_motion(curr: &mut CellObservation, prev: &CellObservation) {
    let (Some(cr), Some(cc), Some(pr), Some(pc)) = (
        curr.centroid_row,
        curr.centroid_col,
        prev.centroid_row,
        prev.centroid_col,
    ) else {
        return;
    };

    let dx = cc - pc;
    let dy = cr - pr;
    let displacement = dx.hypot(dy);

    curr.delta_x = Some(dx);
    curr.delta_y = Some(dy);
    curr.displacement = Some(displacement);
    curr.speed = Some(displacement);

    if let (Some(pdx), Some(pdy)) = (prev.delta_x, prev.delta_y) {
        curr.turning = Some(dy.atan2(dx) - pdy.atan2(pdx));
    }
}
