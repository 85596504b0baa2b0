use log::warn;

use crate::error::Error;
use crate::observation::{CellObservation, ObservationId, ObservationPatch};

/// Persistence contract the pipeline runs against. Implementations load
/// whole batches and flush once per stage; the core never updates rows one
/// at a time.
pub trait FeatureStore {
    /// All observations, ordered by (frame_num, cell_label).
    fn list_observations(&self) -> Vec<CellObservation>;

    /// Observations of one track, ordered by frame_num.
    fn list_for_track(&self, track_id: u32) -> Vec<CellObservation>;

    /// Stage a batch of patches. Staged writes become visible on `commit`.
    fn bulk_update(&mut self, updates: Vec<(ObservationId, ObservationPatch)>)
        -> Result<(), Error>;

    /// Atomic flush point, called once per pipeline stage.
    fn commit(&mut self) -> Result<(), Error>;
}

/// Segmentation/extraction collaborator, consulted only as an auto-recovery
/// path when tracking finds an empty store.
pub trait FeatureExtractor {
    /// Returns true if any new observations were produced.
    fn extract_features_if_missing(&mut self) -> Result<bool, Error>;
}

/// In-memory store used by tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryFeatureStore {
    rows: Vec<CellObservation>,
    staged: Vec<(ObservationId, ObservationPatch)>,
    next_id: ObservationId,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an extracted observation, assigning its id. Inserts are
    /// visible immediately; only patches go through the staging buffer.
    pub fn insert(&mut self, mut obs: CellObservation) -> ObservationId {
        self.next_id += 1;
        obs.id = self.next_id;
        self.rows.push(obs);
        self.next_id
    }

    pub fn get(&self, id: ObservationId) -> Option<&CellObservation> {
        self.rows.iter().find(|o| o.id == id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn list_observations(&self) -> Vec<CellObservation> {
        let mut rows = self.rows.clone();
        rows.sort_by_key(|o| (o.frame_num, o.cell_label));
        rows
    }

    fn list_for_track(&self, track_id: u32) -> Vec<CellObservation> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .filter(|o| o.track_id == Some(track_id))
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.frame_num);
        rows
    }

    fn bulk_update(
        &mut self,
        updates: Vec<(ObservationId, ObservationPatch)>,
    ) -> Result<(), Error> {
        for (id, patch) in updates {
            if self.rows.iter().any(|o| o.id == id) {
                self.staged.push((id, patch));
            } else {
                // bad ids are skipped, not fatal for the batch
                warn!("bulk_update: no observation with id {id}, skipping");
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        for (id, patch) in self.staged.drain(..) {
            if let Some(obs) = self.rows.iter_mut().find(|o| o.id == id) {
                patch.apply(obs);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(frame_num: u32, cell_label: u32) -> CellObservation {
        CellObservation {
            frame_num,
            cell_label,
            ..Default::default()
        }
    }

    #[test]
    fn listing_orders_by_frame_then_label() {
        let mut store = InMemoryFeatureStore::new();
        store.insert(obs(1, 2));
        store.insert(obs(0, 5));
        store.insert(obs(1, 1));
        let listed = store.list_observations();
        let order: Vec<_> = listed.iter().map(|o| (o.frame_num, o.cell_label)).collect();
        assert_eq!(order, vec![(0, 5), (1, 1), (1, 2)]);
    }

    #[test]
    fn staged_updates_are_invisible_until_commit() {
        let mut store = InMemoryFeatureStore::new();
        let id = store.insert(obs(0, 1));
        store
            .bulk_update(vec![(
                id,
                ObservationPatch {
                    track_id: Some(7),
                    ..Default::default()
                },
            )])
            .unwrap();
        assert_eq!(store.get(id).unwrap().track_id, None);
        store.commit().unwrap();
        assert_eq!(store.get(id).unwrap().track_id, Some(7));
    }

    #[test]
    fn unknown_id_is_skipped_not_fatal() {
        let mut store = InMemoryFeatureStore::new();
        let id = store.insert(obs(0, 1));
        store
            .bulk_update(vec![
                (9999, ObservationPatch::gmm_state(1)),
                (id, ObservationPatch::gmm_state(0)),
            ])
            .unwrap();
        store.commit().unwrap();
        assert_eq!(store.get(id).unwrap().gmm_state, Some(0));
    }
}
