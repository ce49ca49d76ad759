use crate::types::{DMatrix, UnitQuaternion, Vector3};

/// One pose with its capture timestamp.
#[derive(Debug, Clone, Copy)]
pub struct StampedPose {
    pub timestamp_ns: i64,
    /// Body-to-world rotation.
    pub q: UnitQuaternion,
    /// Body position in world.
    pub p: Vector3,
}

/// Read-only snapshot of the estimator, published after every cycle.
///
/// Mutated only by the estimator; external consumers receive a clone and the
/// quality fields below instead of errors (per-cycle failures are absorbed).
#[derive(Debug, Clone)]
pub struct EstimatorState {
    /// Timestamp of the newest processed frame, 0 before the first cycle.
    pub timestamp_ns: i64,
    /// Body-to-world rotation.
    pub q: UnitQuaternion,
    /// Body position in world.
    pub p: Vector3,
    /// Body velocity in world.
    pub v: Vector3,
    pub gyro_bias: Vector3,
    pub accel_bias: Vector3,
    /// Sliding window of recent poses, oldest first.
    pub window: Vec<StampedPose>,
    /// Full error-state covariance (15 + 6 * window.len()).
    pub covariance: DMatrix,
    /// Number of feature tracks observed in the newest frame.
    pub tracked_features: usize,
    /// True when the last cycle ran on inertial data alone (no usable visual
    /// update, or no inertial coverage either). Confidence is degraded.
    pub degraded: bool,
}

impl EstimatorState {
    pub fn initial(covariance: DMatrix) -> Self {
        Self {
            timestamp_ns: 0,
            q: UnitQuaternion::identity(),
            p: Vector3::zeros(),
            v: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            window: Vec::new(),
            covariance,
            tracked_features: 0,
            degraded: true,
        }
    }
}
