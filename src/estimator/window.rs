//! Sliding window of stochastic pose clones and the covariance block
//! bookkeeping that goes with it.
//!
//! Feature positions are not filter states, so marginalizing the oldest
//! clone reduces to deleting its rows and columns of the joint covariance:
//! in covariance form that is the exact marginal of the remaining Gaussian.

use std::collections::{HashSet, VecDeque};

use crate::estimator::state::StampedPose;
use crate::tracker::TrackId;
use crate::types::{DMatrix, UnitQuaternion, Vector2, Vector3, CLONE_STATE_DIM, IMU_STATE_DIM};

/// One past body pose kept as a filter state, with the feature observations
/// recorded at that frame (undistorted normalized coordinates).
#[derive(Debug, Clone)]
pub struct PoseClone {
    pub timestamp_ns: i64,
    pub q: UnitQuaternion,
    pub p: Vector3,
    pub observations: Vec<(TrackId, Vector2)>,
}

#[derive(Debug)]
pub struct SlidingWindow {
    max_clones: usize,
    clones: VecDeque<PoseClone>,
}

impl SlidingWindow {
    pub fn new(max_clones: usize) -> Self {
        Self {
            max_clones: max_clones.max(2),
            clones: VecDeque::new(),
        }
    }

    pub fn max_clones(&self) -> usize {
        self.max_clones
    }

    pub fn len(&self) -> usize {
        self.clones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clones.is_empty()
    }

    pub fn is_over_capacity(&self) -> bool {
        self.clones.len() > self.max_clones
    }

    pub fn push(&mut self, clone: PoseClone) {
        self.clones.push_back(clone);
    }

    pub fn pop_oldest(&mut self) -> Option<PoseClone> {
        self.clones.pop_front()
    }

    pub fn get(&self, index: usize) -> Option<&PoseClone> {
        self.clones.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PoseClone> {
        self.clones.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoseClone> {
        self.clones.iter()
    }

    pub fn poses(&self) -> Vec<StampedPose> {
        self.clones
            .iter()
            .map(|c| StampedPose {
                timestamp_ns: c.timestamp_ns,
                q: c.q,
                p: c.p,
            })
            .collect()
    }

    /// Track ids referenced by any clone of the window. Lost tracks outside
    /// this set are safe to garbage-collect.
    pub fn referenced_track_ids(&self) -> HashSet<TrackId> {
        self.clones
            .iter()
            .flat_map(|c| c.observations.iter().map(|(id, _)| *id))
            .collect()
    }

    /// All window observations of one track as `(clone index, measurement)`.
    pub fn observations_of(&self, id: TrackId) -> Vec<(usize, Vector2)> {
        self.clones
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| {
                c.observations
                    .iter()
                    .find(|(tid, _)| *tid == id)
                    .map(|(_, z)| (idx, *z))
            })
            .collect()
    }

    /// Ids of tracks observed by at least `min_obs` clones.
    pub fn multi_view_tracks(&self, min_obs: usize) -> Vec<TrackId> {
        let mut counts = std::collections::HashMap::new();
        for clone in &self.clones {
            for (id, _) in &clone.observations {
                *counts.entry(*id).or_insert(0usize) += 1;
            }
        }
        let mut ids: Vec<TrackId> = counts
            .into_iter()
            .filter(|(_, n)| *n >= min_obs)
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Error-state offset of clone `index` inside the joint covariance.
pub fn clone_offset(index: usize) -> usize {
    IMU_STATE_DIM + CLONE_STATE_DIM * index
}

/// Grow the covariance for a freshly appended clone whose error state equals
/// the current body attitude/position errors.
pub fn augment_clone_covariance(cov: &DMatrix) -> DMatrix {
    let dim = cov.nrows();
    let new_dim = dim + CLONE_STATE_DIM;
    let mut out = DMatrix::zeros(new_dim, new_dim);
    out.view_mut((0, 0), (dim, dim)).copy_from(cov);

    // J selects [dtheta, dp] of the body state; the new rows/columns are
    // J * P and its transpose, the corner is J * P * J^T.
    let body_rows = cov.view((0, 0), (CLONE_STATE_DIM, dim));
    out.view_mut((dim, 0), (CLONE_STATE_DIM, dim))
        .copy_from(&body_rows);
    let body_cols = cov.view((0, 0), (dim, CLONE_STATE_DIM));
    out.view_mut((0, dim), (dim, CLONE_STATE_DIM))
        .copy_from(&body_cols);
    let corner = cov.view((0, 0), (CLONE_STATE_DIM, CLONE_STATE_DIM));
    out.view_mut((dim, dim), (CLONE_STATE_DIM, CLONE_STATE_DIM))
        .copy_from(&corner);
    out
}

/// Remove one clone's rows and columns from the joint covariance.
pub fn remove_clone_covariance(cov: &DMatrix, clone_index: usize) -> DMatrix {
    let dim = cov.nrows();
    let start = clone_offset(clone_index);
    let end = start + CLONE_STATE_DIM;
    debug_assert!(end <= dim);

    let keep: Vec<usize> = (0..dim).filter(|i| *i < start || *i >= end).collect();
    let mut out = DMatrix::zeros(keep.len(), keep.len());
    for (r_new, &r_old) in keep.iter().enumerate() {
        for (c_new, &c_old) in keep.iter().enumerate() {
            out[(r_new, c_new)] = cov[(r_old, c_old)];
        }
    }
    out
}

/// Guard against floating-point drift: force exact symmetry.
pub fn symmetrize(cov: &mut DMatrix) {
    let sym = (&*cov + cov.transpose()) * 0.5;
    *cov = sym;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Float;
    use nalgebra::linalg::Cholesky;

    fn test_cov(dim: usize) -> DMatrix {
        // Diagonally dominant, symmetric, PD.
        let mut cov = DMatrix::zeros(dim, dim);
        for i in 0..dim {
            for j in 0..dim {
                cov[(i, j)] = 0.01 / (1.0 + (i as Float - j as Float).abs());
            }
            cov[(i, i)] = 1.0 + i as Float * 0.1;
        }
        symmetrize(&mut cov);
        cov
    }

    fn clone_at(t: i64) -> PoseClone {
        PoseClone {
            timestamp_ns: t,
            q: UnitQuaternion::identity(),
            p: Vector3::new(t as Float, 0.0, 0.0),
            observations: vec![(t as TrackId, Vector2::zeros())],
        }
    }

    #[test]
    fn augmentation_adds_one_clone_block() {
        let cov = test_cov(IMU_STATE_DIM);
        let grown = augment_clone_covariance(&cov);
        assert_eq!(grown.nrows(), IMU_STATE_DIM + CLONE_STATE_DIM);
        // New corner equals the body attitude/position block.
        for r in 0..CLONE_STATE_DIM {
            for c in 0..CLONE_STATE_DIM {
                assert_eq!(grown[(IMU_STATE_DIM + r, IMU_STATE_DIM + c)], cov[(r, c)]);
            }
        }
        // Still symmetric PSD.
        assert!((grown.clone() - grown.transpose()).norm() < 1e-12);
        let loaded = grown + DMatrix::identity(21, 21) * 1e-9;
        assert!(Cholesky::new(loaded).is_some());
    }

    #[test]
    fn marginalization_preserves_remaining_blocks() {
        let cov = test_cov(IMU_STATE_DIM + 2 * CLONE_STATE_DIM);
        let reduced = remove_clone_covariance(&cov, 0);
        assert_eq!(reduced.nrows(), IMU_STATE_DIM + CLONE_STATE_DIM);
        // The body block is untouched.
        for r in 0..IMU_STATE_DIM {
            for c in 0..IMU_STATE_DIM {
                assert_eq!(reduced[(r, c)], cov[(r, c)]);
            }
        }
        // The surviving clone block shifted into the first clone slot.
        let old = clone_offset(1);
        let new = clone_offset(0);
        for r in 0..CLONE_STATE_DIM {
            for c in 0..CLONE_STATE_DIM {
                assert_eq!(reduced[(new + r, new + c)], cov[(old + r, old + c)]);
            }
        }
        // Marginalizing a Gaussian in covariance form keeps it PSD.
        assert!(Cholesky::new(reduced).is_some());
    }

    #[test]
    fn window_bookkeeping() {
        let mut window = SlidingWindow::new(3);
        for t in 0..4 {
            window.push(clone_at(t));
        }
        assert!(window.is_over_capacity());
        let popped = window.pop_oldest().unwrap();
        assert_eq!(popped.timestamp_ns, 0);
        assert_eq!(window.len(), 3);

        let refs = window.referenced_track_ids();
        assert_eq!(refs.len(), 3);
        assert!(!refs.contains(&0));
    }

    #[test]
    fn multi_view_tracks_counts_observing_clones() {
        let mut window = SlidingWindow::new(4);
        for t in 0..3 {
            let mut c = clone_at(t);
            c.observations = vec![(7, Vector2::new(0.1, 0.2)), (t as TrackId + 100, Vector2::zeros())];
            window.push(c);
        }
        assert_eq!(window.multi_view_tracks(2), vec![7]);
        assert_eq!(window.observations_of(7).len(), 3);
        assert_eq!(window.observations_of(100).len(), 1);
    }
}
