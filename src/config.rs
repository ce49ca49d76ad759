use serde::{Deserialize, Serialize};

use crate::types::Float;

/// Full pipeline configuration loaded from YAML.
///
/// Every section is optional in the file; missing sections fall back to the
/// defaults below so a bare `camera:` record (the common case for dataset
/// calibration files) is enough to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: Option<CameraConfig>,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub imu: ImuConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Model family discriminator, e.g. "pinhole" or "fisheye".
    #[serde(default)]
    pub model: Option<String>,
    #[serde(rename = "image_width")]
    pub image_width: u32,
    #[serde(rename = "image_height")]
    pub image_height: u32,
    /// `[fx, fy, cx, cy]`
    #[serde(default)]
    pub intrinsics: Vec<f64>,
    /// Pinhole: `[k1, k2, p1, p2, k3]`; fisheye: `[k1, k2, k3, k4]`.
    #[serde(default)]
    pub distortion: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Hard cap on the number of simultaneously live tracks.
    #[serde(rename = "max_tracks")]
    pub max_tracks: usize,
    /// Re-detection kicks in when the active count drops below this.
    #[serde(rename = "target_track_count")]
    pub target_track_count: usize,
    /// Side length in pixels of one detection grid cell.
    #[serde(rename = "grid_size")]
    pub grid_size: u32,
    #[serde(rename = "fast_threshold")]
    pub fast_threshold: u8,
    #[serde(rename = "pyramid_levels")]
    pub pyramid_levels: usize,
    #[serde(rename = "pyramid_ratio")]
    pub pyramid_ratio: f64,
    #[serde(rename = "preprocessing_blur")]
    pub preprocessing_blur: bool,
    #[serde(rename = "preprocessing_blur_sigma")]
    pub preprocessing_blur_sigma: f32,
    /// Per-level iteration cap of the patch alignment loop.
    #[serde(rename = "optical_flow_max_iterations")]
    pub optical_flow_max_iterations: usize,
    /// Alignment step norm below which iteration stops, in pixels.
    #[serde(rename = "optical_flow_convergence_threshold")]
    pub optical_flow_convergence_threshold: Float,
    /// Mean absolute patch residual above which a match is rejected.
    #[serde(rename = "max_patch_residual")]
    pub max_patch_residual: Float,
    /// Forward-backward consistency gate in pixels.
    #[serde(rename = "forward_backward_threshold")]
    pub forward_backward_threshold: Float,
    /// Pixels from the image border inside which nothing is tracked or detected.
    #[serde(rename = "edge_margin")]
    pub edge_margin: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_tracks: 150,
            target_track_count: 100,
            grid_size: 32,
            fast_threshold: 40,
            pyramid_levels: 3,
            pyramid_ratio: 2.0,
            preprocessing_blur: false,
            preprocessing_blur_sigma: 0.8,
            optical_flow_max_iterations: 10,
            optical_flow_convergence_threshold: 1e-2,
            max_patch_residual: 0.12,
            forward_backward_threshold: 2.0,
            edge_margin: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Gyroscope white-noise density, rad/s/sqrt(Hz).
    #[serde(rename = "gyro_noise_density")]
    pub gyro_noise_density: Float,
    /// Accelerometer white-noise density, m/s^2/sqrt(Hz).
    #[serde(rename = "accel_noise_density")]
    pub accel_noise_density: Float,
    #[serde(rename = "gyro_bias_random_walk")]
    pub gyro_bias_random_walk: Float,
    #[serde(rename = "accel_bias_random_walk")]
    pub accel_bias_random_walk: Float,
    /// Gravity magnitude, m/s^2; gravity points along world -Z.
    #[serde(rename = "gravity")]
    pub gravity: Float,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            gyro_noise_density: 1.7e-4,
            accel_noise_density: 2.0e-3,
            gyro_bias_random_walk: 2.0e-5,
            accel_bias_random_walk: 3.0e-3,
            gravity: 9.81,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Maximum number of pose clones kept in the sliding window.
    #[serde(rename = "window_size")]
    pub window_size: usize,
    /// Observation noise sigma in normalized image coordinates.
    #[serde(rename = "observation_noise")]
    pub observation_noise: Float,
    /// Minimum ray separation angle (degrees) for triangulation.
    #[serde(rename = "min_parallax_deg")]
    pub min_parallax_deg: Float,
    /// Per-observation residual gate in normalized coordinates.
    #[serde(rename = "max_residual")]
    pub max_residual: Float,
    /// Attitude process noise added per cycle when no inertial data covers it.
    #[serde(rename = "fallback_attitude_noise")]
    pub fallback_attitude_noise: Float,
    /// Position process noise added per cycle when no inertial data covers it.
    #[serde(rename = "fallback_position_noise")]
    pub fallback_position_noise: Float,
    /// Velocity process noise added per cycle when no inertial data covers it.
    #[serde(rename = "fallback_velocity_noise")]
    pub fallback_velocity_noise: Float,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            window_size: 8,
            observation_noise: 2e-3,
            min_parallax_deg: 0.5,
            max_residual: 5e-2,
            fallback_attitude_noise: 1e-4,
            fallback_position_noise: 1e-2,
            fallback_velocity_noise: 1e-2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded capacity of the unprocessed-frame queue (multi-thread mode).
    #[serde(rename = "frame_queue_capacity")]
    pub frame_queue_capacity: usize,
    /// Process frames inline on the caller's thread instead of a worker.
    #[serde(rename = "single_thread")]
    pub single_thread: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue_capacity: 16,
            single_thread: false,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Strip YAML directive if present (e.g., %YAML:1.0)
        let content = if content.trim_start().starts_with("%YAML") {
            content
                .lines()
                .skip_while(|line| line.trim_start().starts_with('%'))
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            content
        };
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
