//! Visual-inertial odometry core.
//!
//! Fuses a camera image stream with inertial measurements into an online,
//! causal pose/velocity estimate: feature tracking over persistent point
//! tracks, strapdown IMU propagation, and a sliding-window filter, driven by
//! a pipeline scheduler with a dedicated worker thread or a cooperative
//! single-thread mode.

pub mod camera;
pub mod config;
pub mod error;
pub mod estimator;
pub mod imu;
pub mod pipeline;
pub mod tracker;
pub mod types;
pub mod viz;

// Re-export the public surface the surrounding application touches.
pub use camera::{create_camera_model, CameraModel};
pub use config::Config;
pub use error::VioError;
pub use estimator::{EstimatorState, StampedPose};
pub use imu::InertialSample;
pub use pipeline::{PipelineState, VioPipeline};
pub use tracker::{Frame, TrackId};
pub use viz::SceneViewer;
