use crate::config::CameraConfig;
use crate::types::{Float, Vector2, Vector3};

use super::CameraModel;

/// Pinhole projection with Brown-Conrady radial-tangential distortion
/// (`[k1, k2, p1, p2, k3]`).
#[derive(Debug, Clone)]
pub struct Pinhole {
    fx: Float,
    fy: Float,
    cx: Float,
    cy: Float,
    k1: Float,
    k2: Float,
    p1: Float,
    p2: Float,
    k3: Float,
}

/// Fixed-point undistortion iteration count. The contraction slows toward
/// the image corners under strong radial distortion, so leave headroom.
const UNDISTORT_ITERS: usize = 20;

impl Pinhole {
    pub fn new(fx: Float, fy: Float, cx: Float, cy: Float, distortion: &[Float]) -> Self {
        let d = |i: usize| distortion.get(i).copied().unwrap_or(0.0);
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: d(0),
            k2: d(1),
            p1: d(2),
            p2: d(3),
            k3: d(4),
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

    fn distort(&self, x: Float, y: Float) -> (Float, Float) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + x_tan, y * radial + y_tan)
    }

    fn undistort(&self, xd: Float, yd: Float) -> (Float, Float) {
        let mut x = xd;
        let mut y = yd;
        for _ in 0..UNDISTORT_ITERS {
            let (xp, yp) = self.distort(x, y);
            x -= xp - xd;
            y -= yp - yd;
        }
        (x, y)
    }
}

impl CameraModel for Pinhole {
    fn project(&self, ray: &Vector3) -> Option<Vector2> {
        if ray.z <= 0.0 {
            return None;
        }
        let (xd, yd) = self.distort(ray.x / ray.z, ray.y / ray.z);
        Some(Vector2::new(
            self.fx * xd + self.cx,
            self.fy * yd + self.cy,
        ))
    }

    fn unproject(&self, pixel: &Vector2) -> Vector3 {
        let xd = (pixel.x - self.cx) / self.fx;
        let yd = (pixel.y - self.cy) / self.fy;
        let (x, y) = self.undistort(xd, yd);
        Vector3::new(x, y, 1.0).normalize()
    }
}
