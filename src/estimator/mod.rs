//! State estimation: inertial prediction fused with multi-view reprojection
//! constraints over a bounded sliding window of pose clones.

mod estimator;
pub mod state;
pub mod window;

pub use estimator::Estimator;
pub use state::{EstimatorState, StampedPose};
pub use window::{PoseClone, SlidingWindow};
