//! Visualization hook. The core performs no rendering; an external renderer
//! implements [`SceneViewer`] and is handed the estimated scene after the
//! pipeline has stopped.

use crate::estimator::StampedPose;
use crate::tracker::TrackId;
use crate::types::Vector3;

pub trait SceneViewer: Send {
    /// Log the final body pose.
    fn log_pose(&mut self, pose: &StampedPose);

    /// Log the estimated trajectory as a time-ordered polyline.
    fn log_trajectory(&mut self, trajectory: &[StampedPose]);

    /// Log the triangulated landmarks still referenced by the window.
    fn log_landmarks(&mut self, landmarks: &[(TrackId, Vector3)]);
}
