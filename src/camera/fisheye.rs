use crate::config::CameraConfig;
use crate::types::{Float, Vector2, Vector3};

use super::CameraModel;

/// Kannala-Brandt equidistant fisheye model with a fourth-order angular
/// polynomial (`[k1, k2, k3, k4]`).
#[derive(Debug, Clone)]
pub struct Fisheye {
    fx: Float,
    fy: Float,
    cx: Float,
    cy: Float,
    k: [Float; 4],
}

const NEWTON_ITERS: usize = 8;

impl Fisheye {
    pub fn new(fx: Float, fy: Float, cx: Float, cy: Float, distortion: &[Float]) -> Self {
        let d = |i: usize| distortion.get(i).copied().unwrap_or(0.0);
        Self {
            fx,
            fy,
            cx,
            cy,
            k: [d(0), d(1), d(2), d(3)],
        }
    }

    pub fn from_config(config: &CameraConfig) -> Self {
        let k = &config.intrinsics;
        let distortion: Vec<Float> = config.distortion.iter().map(|&v| v as Float).collect();
        Self::new(
            k[0] as Float,
            k[1] as Float,
            k[2] as Float,
            k[3] as Float,
            &distortion,
        )
    }

    /// Distorted angle `theta_d = theta + k1*theta^3 + ... + k4*theta^9`.
    fn theta_d(&self, theta: Float) -> Float {
        let t2 = theta * theta;
        theta * (1.0 + t2 * (self.k[0] + t2 * (self.k[1] + t2 * (self.k[2] + t2 * self.k[3]))))
    }

    fn theta_d_derivative(&self, theta: Float) -> Float {
        let t2 = theta * theta;
        1.0 + t2
            * (3.0 * self.k[0]
                + t2 * (5.0 * self.k[1] + t2 * (7.0 * self.k[2] + t2 * 9.0 * self.k[3])))
    }

    /// Invert the angular polynomial by Newton iteration.
    fn theta_from_theta_d(&self, theta_d: Float) -> Float {
        let mut theta = theta_d;
        for _ in 0..NEWTON_ITERS {
            let f = self.theta_d(theta) - theta_d;
            let df = self.theta_d_derivative(theta);
            if df.abs() < 1e-12 {
                break;
            }
            theta -= f / df;
        }
        theta
    }
}

impl CameraModel for Fisheye {
    fn project(&self, ray: &Vector3) -> Option<Vector2> {
        let r = (ray.x * ray.x + ray.y * ray.y).sqrt();
        if r < 1e-12 {
            // On the optical axis; only the forward direction is observable.
            if ray.z <= 0.0 {
                return None;
            }
            return Some(Vector2::new(self.cx, self.cy));
        }
        let theta = r.atan2(ray.z);
        let theta_d = self.theta_d(theta);
        let scale = theta_d / r;
        Some(Vector2::new(
            self.fx * scale * ray.x + self.cx,
            self.fy * scale * ray.y + self.cy,
        ))
    }

    fn unproject(&self, pixel: &Vector2) -> Vector3 {
        let mx = (pixel.x - self.cx) / self.fx;
        let my = (pixel.y - self.cy) / self.fy;
        let theta_d = (mx * mx + my * my).sqrt();
        if theta_d < 1e-12 {
            return Vector3::new(0.0, 0.0, 1.0);
        }
        let theta = self.theta_from_theta_d(theta_d);
        let (sin_t, cos_t) = theta.sin_cos();
        Vector3::new(sin_t * mx / theta_d, sin_t * my / theta_d, cos_t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tumvi_like_model() -> Fisheye {
        Fisheye::new(
            190.9,
            190.9,
            254.9,
            256.8,
            &[0.0034, 0.0007, -0.0034, 0.0009],
        )
    }

    #[test]
    fn round_trip_recovers_ray_direction() {
        let cam = tumvi_like_model();
        // Include directions well off-axis; the equidistant model covers them.
        for &(x, y, z) in &[
            (0.0, 0.0, 1.0),
            (0.5, -0.2, 1.0),
            (-0.8, 0.6, 1.0),
            (1.2, 1.2, 1.0),
        ] {
            let ray = Vector3::new(x, y, z);
            let pixel = cam.project(&ray).expect("projectable ray");
            let back = cam.unproject(&pixel);
            let dir = ray.normalize();
            assert!(
                back.relative_eq(&dir, 1e-6, 1e-6),
                "ray ({x}, {y}, {z}): got {back:?}, want {dir:?}"
            );
        }
    }

    #[test]
    fn center_pixel_is_optical_axis() {
        let cam = tumvi_like_model();
        let pixel = cam.project(&Vector3::new(0.0, 0.0, 2.5)).unwrap();
        assert!(pixel.relative_eq(&Vector2::new(254.9, 256.8), 1e-9, 1e-9));
        let ray = cam.unproject(&pixel);
        assert!(ray.relative_eq(&Vector3::new(0.0, 0.0, 1.0), 1e-9, 1e-9));
    }
}
