//! Camera model abstraction: pixel <-> ray conversion with lens distortion.
//!
//! Callers depend only on the [`CameraModel`] capability; concrete families
//! are selected by [`create_camera_model`] from the configuration
//! discriminator, never by matching on the concrete type.

mod fisheye;
mod pinhole;

pub use fisheye::Fisheye;
pub use pinhole::Pinhole;

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::CameraConfig;
use crate::error::VioError;
use crate::types::{Vector2, Vector3};

/// Projection/unprojection capability of one calibrated camera.
///
/// Both operations are pure and mutually consistent: for a ray inside the
/// model's field of view, `unproject(project(r))` recovers the direction of
/// `r` within numerical tolerance.
pub trait CameraModel: Debug + Send + Sync {
    /// Project a camera-frame ray to a pixel. `None` when the ray is not
    /// observable (e.g. behind a pinhole camera).
    fn project(&self, ray: &Vector3) -> Option<Vector2>;

    /// Unproject a pixel to a unit ray in the camera frame.
    fn unproject(&self, pixel: &Vector2) -> Vector3;

    /// Undistorted normalized image coordinates `(x/z, y/z)` for a pixel.
    fn unproject_normalized(&self, pixel: &Vector2) -> Vector2 {
        let ray = self.unproject(pixel);
        Vector2::new(ray.x / ray.z, ray.y / ray.z)
    }
}

/// Build a camera model from a configuration record.
///
/// The `model` field selects the family (case-insensitive). A missing field
/// defaults to pinhole, matching the most common calibration files.
pub fn create_camera_model(config: &CameraConfig) -> Result<Arc<dyn CameraModel>, VioError> {
    if config.intrinsics.len() < 4 {
        return Err(VioError::MissingCalibration(format!(
            "need [fx, fy, cx, cy], got {} intrinsic values",
            config.intrinsics.len()
        )));
    }

    let family = config.model.as_deref().unwrap_or("pinhole").to_lowercase();
    match family.as_str() {
        "pinhole" | "pinhole-radtan" | "radtan" => {
            Ok(Arc::new(Pinhole::from_config(config)) as Arc<dyn CameraModel>)
        }
        "fisheye" | "kannala-brandt" | "kb4" | "equidistant" => {
            Ok(Arc::new(Fisheye::from_config(config)) as Arc<dyn CameraModel>)
        }
        other => Err(VioError::UnknownCameraModel(other.to_string())),
    }
}
