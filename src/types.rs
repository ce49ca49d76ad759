//! Float precision configuration and shared linear-algebra aliases.
//!
//! The estimation stack is generic over one scalar type selected at compile
//! time:
//!
//! - Default: `f64` (double precision)
//! - With the `use_f32` feature: `f32` (single precision)

#[cfg(feature = "use_f32")]
/// Scalar type used throughout the estimation stack (f32 precision).
pub type Float = f32;

#[cfg(not(feature = "use_f32"))]
/// Scalar type used throughout the estimation stack (f64 precision, default).
pub type Float = f64;

use nalgebra as na;

pub type Vector2 = na::Vector2<Float>;
pub type Vector3 = na::Vector3<Float>;
pub type Matrix2 = na::Matrix2<Float>;
pub type Matrix3 = na::Matrix3<Float>;
pub type Matrix2x3 = na::Matrix2x3<Float>;
pub type UnitQuaternion = na::UnitQuaternion<Float>;
pub type DVector = na::DVector<Float>;
pub type DMatrix = na::DMatrix<Float>;
pub type SMatrix<const R: usize, const C: usize> = na::SMatrix<Float, R, C>;
pub type SVector<const N: usize> = na::SVector<Float, N>;

/// Error-state dimension of the inertial portion of the filter:
/// attitude (3) + position (3) + velocity (3) + gyro bias (3) + accel bias (3).
pub const IMU_STATE_DIM: usize = 15;

/// Error-state dimension of one stochastic pose clone: attitude (3) + position (3).
pub const CLONE_STATE_DIM: usize = 6;

pub type Matrix15 = SMatrix<15, 15>;

/// Skew-symmetric cross-product matrix `[v]x` such that `[v]x * w == v.cross(&w)`.
pub fn skew(v: &Vector3) -> Matrix3 {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Seconds between two nanosecond timestamps.
pub fn ns_to_sec(from_ns: i64, to_ns: i64) -> Float {
    (to_ns - from_ns) as Float * 1e-9
}
