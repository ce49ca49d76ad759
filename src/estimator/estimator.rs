//! Sliding-window visual-inertial filter.
//!
//! One cycle per frame: inertial propagation of the body state and
//! covariance, stochastic pose-clone augmentation, a stacked reprojection
//! update over all multi-view tracks, and covariance-form marginalization of
//! the oldest clone once the window exceeds its bound. Every per-cycle
//! failure degrades confidence instead of failing the cycle.

use std::collections::HashMap;

use nalgebra::linalg::Cholesky;

use crate::config::EstimatorConfig;
use crate::imu::{ImuState, Propagator};
use crate::tracker::{TrackId, TrackerOutput};
use crate::types::{
    skew, DMatrix, DVector, Matrix15, Matrix2x3, UnitQuaternion, Vector2, Vector3,
    CLONE_STATE_DIM, IMU_STATE_DIM,
};

use super::state::EstimatorState;
use super::window::{self, PoseClone, SlidingWindow};

/// Minimum clones that must observe a track before it constrains the filter.
const MIN_TRACK_OBSERVATIONS: usize = 2;

pub struct Estimator {
    config: EstimatorConfig,
    imu_state: ImuState,
    /// Joint error-state covariance, `IMU_STATE_DIM + 6 * window.len()`.
    cov: DMatrix,
    window: SlidingWindow,
    /// Last triangulated position per window track, world frame.
    landmarks: HashMap<TrackId, Vector3>,
    last_frame_ts: Option<i64>,
    tracked_features: usize,
    degraded: bool,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let mut cov = DMatrix::zeros(IMU_STATE_DIM, IMU_STATE_DIM);
        // The first pose anchors the gauge: attitude/position start almost
        // certain, velocity and biases loosely known.
        for i in 0..3 {
            cov[(i, i)] = 1e-4; // attitude
            cov[(3 + i, 3 + i)] = 1e-9; // position
            cov[(6 + i, 6 + i)] = 1e-2; // velocity
            cov[(9 + i, 9 + i)] = 1e-4; // gyro bias
            cov[(12 + i, 12 + i)] = 1e-2; // accel bias
        }
        let window_size = config.window_size;
        Self {
            config,
            imu_state: ImuState::identity(),
            cov,
            window: SlidingWindow::new(window_size),
            landmarks: HashMap::new(),
            last_frame_ts: None,
            tracked_features: 0,
            degraded: true,
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn referenced_track_ids(&self) -> std::collections::HashSet<TrackId> {
        self.window.referenced_track_ids()
    }

    /// Run one fusion cycle for the tracker output of a new frame.
    pub fn process_frame(&mut self, output: &TrackerOutput, propagator: &mut Propagator) {
        let t = output.timestamp_ns;
        let mut degraded_cycle = false;

        // 1. Inertial propagation up to the frame's capture time.
        if let Some(prev_t) = self.last_frame_ts {
            match propagator.propagate(&self.imu_state, prev_t, t) {
                Some(prop) => {
                    self.imu_state = prop.state;
                    self.propagate_covariance(&prop.phi, &prop.noise);
                }
                None => {
                    // Zero-motion prior with inflated covariance.
                    log::debug!(
                        "[Estimator] no inertial coverage for ({}, {}], using zero-motion prior",
                        prev_t,
                        t
                    );
                    self.inflate_for_fallback();
                    degraded_cycle = true;
                }
            }
        }
        self.last_frame_ts = Some(t);

        // 2. Pose-clone augmentation for this frame.
        self.cov = window::augment_clone_covariance(&self.cov);
        self.window.push(PoseClone {
            timestamp_ns: t,
            q: self.imu_state.q,
            p: self.imu_state.p,
            observations: output.observations.clone(),
        });

        for id in &output.lost {
            self.landmarks.remove(id);
        }

        // 3. Visual update over all multi-view tracks.
        if !self.visual_update() {
            degraded_cycle = true;
        }

        // 4. Bound the window: marginalize the oldest clone.
        while self.window.is_over_capacity() {
            self.cov = window::remove_clone_covariance(&self.cov, 0);
            let dropped = self.window.pop_oldest();
            if let Some(dropped) = dropped {
                log::debug!(
                    "[Estimator] marginalized clone ts={} ({} clones retained)",
                    dropped.timestamp_ns,
                    self.window.len()
                );
            }
        }
        window::symmetrize(&mut self.cov);

        let referenced = self.window.referenced_track_ids();
        self.landmarks.retain(|id, _| referenced.contains(id));

        self.tracked_features = output.observations.len();
        self.degraded = degraded_cycle;
        if degraded_cycle {
            log::debug!(
                "[Estimator] frame ts={}: inertial-only cycle, confidence degraded",
                t
            );
        }
    }

    /// Current snapshot; cheap enough to clone out every cycle.
    pub fn snapshot(&self) -> EstimatorState {
        EstimatorState {
            timestamp_ns: self.last_frame_ts.unwrap_or(0),
            q: self.imu_state.q,
            p: self.imu_state.p,
            v: self.imu_state.v,
            gyro_bias: self.imu_state.gyro_bias,
            accel_bias: self.imu_state.accel_bias,
            window: self.window.poses(),
            covariance: self.cov.clone(),
            tracked_features: self.tracked_features,
            degraded: self.degraded,
        }
    }

    pub fn landmarks(&self) -> Vec<(TrackId, Vector3)> {
        let mut points: Vec<(TrackId, Vector3)> =
            self.landmarks.iter().map(|(id, p)| (*id, *p)).collect();
        points.sort_by_key(|(id, _)| *id);
        points
    }

    fn propagate_covariance(&mut self, phi: &Matrix15, noise: &Matrix15) {
        let dim = self.cov.nrows();
        let clone_dim = dim - IMU_STATE_DIM;

        let p_ii = self.cov.fixed_view::<15, 15>(0, 0).into_owned();
        let p_ii_new = phi * p_ii * phi.transpose() + noise;
        self.cov
            .view_mut((0, 0), (IMU_STATE_DIM, IMU_STATE_DIM))
            .copy_from(&p_ii_new);

        if clone_dim > 0 {
            let phi_dyn = DMatrix::from_column_slice(IMU_STATE_DIM, IMU_STATE_DIM, phi.as_slice());
            let p_ic = self
                .cov
                .view((0, IMU_STATE_DIM), (IMU_STATE_DIM, clone_dim))
                .into_owned();
            let p_ic_new = &phi_dyn * &p_ic;
            self.cov
                .view_mut((0, IMU_STATE_DIM), (IMU_STATE_DIM, clone_dim))
                .copy_from(&p_ic_new);
            self.cov
                .view_mut((IMU_STATE_DIM, 0), (clone_dim, IMU_STATE_DIM))
                .copy_from(&p_ic_new.transpose());
        }
        window::symmetrize(&mut self.cov);
    }

    fn inflate_for_fallback(&mut self) {
        for i in 0..3 {
            self.cov[(i, i)] += self.config.fallback_attitude_noise;
            self.cov[(3 + i, 3 + i)] += self.config.fallback_position_noise;
            self.cov[(6 + i, 6 + i)] += self.config.fallback_velocity_noise;
        }
    }

    /// Stacked reprojection correction. Returns false when no usable
    /// constraint existed or the linear system was rejected; the caller keeps
    /// the propagated state in that case.
    fn visual_update(&mut self) -> bool {
        let dim = self.cov.nrows();
        let mut blocks: Vec<(DVector, DMatrix)> = Vec::new();
        let mut total_rows = 0;

        for id in self.window.multi_view_tracks(MIN_TRACK_OBSERVATIONS) {
            let obs = self.window.observations_of(id);
            let point = match self.triangulate(&obs) {
                Some(p) => p,
                // Near-degenerate geometry is excluded from the update.
                None => continue,
            };

            if let Some((r, h)) = self.track_residual(&point, &obs, dim) {
                self.landmarks.insert(id, point);
                total_rows += r.nrows();
                blocks.push((r, h));
            }
        }

        if blocks.is_empty() {
            return false;
        }

        let mut r_all = DVector::zeros(total_rows);
        let mut h_all = DMatrix::zeros(total_rows, dim);
        let mut row = 0;
        for (r, h) in &blocks {
            r_all.view_mut((row, 0), (r.nrows(), 1)).copy_from(r);
            h_all.view_mut((row, 0), (h.nrows(), dim)).copy_from(h);
            row += r.nrows();
        }

        let sigma2 = self.config.observation_noise * self.config.observation_noise;
        let hp = &h_all * &self.cov;
        let s = &hp * h_all.transpose() + DMatrix::identity(total_rows, total_rows) * sigma2;
        let chol = match Cholesky::new(s) {
            Some(c) => c,
            None => {
                log::warn!(
                    "[Estimator] visual update rejected: innovation covariance not PD ({} rows)",
                    total_rows
                );
                return false;
            }
        };

        // K = P H^T S^-1, computed as (S^-1 H P)^T.
        let k_t = chol.solve(&hp);
        let delta = k_t.transpose() * &r_all;
        self.apply_correction(&delta);

        self.cov -= k_t.transpose() * &hp;
        window::symmetrize(&mut self.cov);
        true
    }

    /// Residual vector and Jacobian of one track against the window clones.
    /// `None` when any observation fails the depth or residual gate.
    fn track_residual(
        &self,
        point: &Vector3,
        obs: &[(usize, Vector2)],
        dim: usize,
    ) -> Option<(DVector, DMatrix)> {
        let m = obs.len();
        let mut r = DVector::zeros(2 * m);
        let mut h_x = DMatrix::zeros(2 * m, dim);
        let mut h_f = DMatrix::zeros(2 * m, 3);

        for (k, (clone_idx, z)) in obs.iter().enumerate() {
            let clone = self.window.get(*clone_idx)?;
            let rot_t = clone.q.to_rotation_matrix().into_inner().transpose();
            let c = rot_t * (point - clone.p);
            if c.z <= 1e-6 {
                return None;
            }

            let pred = Vector2::new(c.x / c.z, c.y / c.z);
            let res = z - pred;
            if res.norm() > self.config.max_residual {
                return None;
            }

            let inv_z = 1.0 / c.z;
            let j_pi = Matrix2x3::new(
                inv_z,
                0.0,
                -c.x * inv_z * inv_z,
                0.0,
                inv_z,
                -c.y * inv_z * inv_z,
            );
            let h_theta = j_pi * skew(&c);
            let h_p = -(j_pi * rot_t);
            let h_feat = j_pi * rot_t;

            r[2 * k] = res.x;
            r[2 * k + 1] = res.y;
            let off = window::clone_offset(*clone_idx);
            h_x.view_mut((2 * k, off), (2, 3)).copy_from(&h_theta);
            h_x.view_mut((2 * k, off + 3), (2, 3)).copy_from(&h_p);
            h_f.view_mut((2 * k, 0), (2, 3)).copy_from(&h_feat);
        }

        // Project the feature dimensions out so the update constrains only
        // the pose states (the feature itself is not a filter state).
        let gram = h_f.transpose() * &h_f;
        let gram_inv = gram.try_inverse()?;
        let projector = DMatrix::identity(2 * m, 2 * m) - &h_f * gram_inv * h_f.transpose();
        Some((&projector * r, projector * h_x))
    }

    /// Midpoint triangulation from the widest-baseline observation pair.
    fn triangulate(&self, obs: &[(usize, Vector2)]) -> Option<Vector3> {
        let (first_idx, z0) = obs.first()?;
        let (last_idx, z1) = obs.last()?;
        if first_idx == last_idx {
            return None;
        }
        let c0 = self.window.get(*first_idx)?;
        let c1 = self.window.get(*last_idx)?;

        let d0 = c0.q * Vector3::new(z0.x, z0.y, 1.0).normalize();
        let d1 = c1.q * Vector3::new(z1.x, z1.y, 1.0).normalize();

        let b = d0.dot(&d1);
        let denom = 1.0 - b * b;
        let min_sin = (self.config.min_parallax_deg.to_radians()).sin();
        if denom < min_sin * min_sin {
            return None;
        }

        let w = c0.p - c1.p;
        let a0 = d0.dot(&w);
        let a1 = d1.dot(&w);
        let s = (b * a1 - a0) / denom;
        let t = (a1 - b * a0) / denom;
        let point = 0.5 * ((c0.p + s * d0) + (c1.p + t * d1));

        // Both anchor views must see the point in front of them.
        for clone in [c0, c1] {
            let local = clone.q.inverse() * (point - clone.p);
            if local.z <= 0.0 {
                return None;
            }
        }
        Some(point)
    }

    fn apply_correction(&mut self, delta: &DVector) {
        let dtheta = Vector3::new(delta[0], delta[1], delta[2]);
        self.imu_state.q *= UnitQuaternion::from_scaled_axis(dtheta);
        self.imu_state.p += Vector3::new(delta[3], delta[4], delta[5]);
        self.imu_state.v += Vector3::new(delta[6], delta[7], delta[8]);
        self.imu_state.gyro_bias += Vector3::new(delta[9], delta[10], delta[11]);
        self.imu_state.accel_bias += Vector3::new(delta[12], delta[13], delta[14]);

        for idx in 0..self.window.len() {
            let off = window::clone_offset(idx);
            let clone = self.window.get_mut(idx).expect("index in range");
            let dtheta = Vector3::new(delta[off], delta[off + 1], delta[off + 2]);
            clone.q *= UnitQuaternion::from_scaled_axis(dtheta);
            clone.p += Vector3::new(delta[off + 3], delta[off + 4], delta[off + 5]);
        }
    }
}

// The clone block layout is assumed throughout the update assembly.
const _: () = assert!(CLONE_STATE_DIM == 6);
