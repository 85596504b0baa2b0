use std::collections::BTreeMap;

use crate::observation::CellObservation;

/// Observations of one frame, in (frame, label) listing order.
#[derive(Debug, Clone)]
pub struct FrameObservations {
    pub frame_num: u32,
    pub observations: Vec<CellObservation>,
}

impl FrameObservations {
    #[inline]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &CellObservation> {
        self.observations.iter()
    }
}

/// Group observations by frame, ascending frame order.
pub fn group_by_frame(observations: Vec<CellObservation>) -> Vec<FrameObservations> {
    let mut frames: BTreeMap<u32, Vec<CellObservation>> = BTreeMap::new();
    for obs in observations {
        frames.entry(obs.frame_num).or_default().push(obs);
    }

    frames
        .into_iter()
        .map(|(frame_num, observations)| FrameObservations {
            frame_num,
            observations,
        })
        .collect()
}
