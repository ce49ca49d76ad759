//! Cross-component pipeline scenarios: scheduling modes, backpressure,
//! stop semantics, and degraded operation.

use std::thread;
use std::time::Duration;

use image::GrayImage;
use vio::pipeline::PipelineState;
use vio::types::Vector3;
use vio::{Config, Frame, InertialSample, SceneViewer, StampedPose, VioPipeline};

const SEC: i64 = 1_000_000_000;
const FRAME_INTERVAL: i64 = SEC / 10;

/// Deterministic block texture; `shift` moves the pattern along +x.
fn textured_image(w: u32, h: u32, shift: f32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| {
        let xf = x as f32 - shift;
        let yf = y as f32;
        let block: f32 = if ((xf / 10.0).floor() as i32 + (yf / 10.0).floor() as i32) % 2 == 0 {
            70.0
        } else {
            -70.0
        };
        image::Luma([(127.0 + block).clamp(0.0, 255.0) as u8])
    })
}

fn frame(k: i64, shift: f32) -> Frame {
    Frame::new(k * FRAME_INTERVAL, textured_image(160, 120, shift))
}

/// Samples of a platform at rest, 100 Hz, covering `(from, to]`.
fn rest_samples(from: i64, to: i64) -> Vec<InertialSample> {
    let step = SEC / 100;
    let mut out = Vec::new();
    let mut t = from + step;
    while t <= to {
        out.push(InertialSample {
            timestamp_ns: t,
            gyro: Vector3::zeros(),
            accel: Vector3::new(0.0, 0.0, 9.81),
        });
        t += step;
    }
    out
}

fn run_sequence(single_thread: bool, frames: usize) -> vio::EstimatorState {
    let mut config = Config::default();
    config.pipeline.single_thread = single_thread;
    let mut pipeline = VioPipeline::new(config, None);
    pipeline.start().unwrap();

    for k in 0..frames as i64 {
        if k > 0 {
            for sample in rest_samples((k - 1) * FRAME_INTERVAL, k * FRAME_INTERVAL) {
                assert!(pipeline.process_imu_sample(sample));
            }
        }
        assert!(pipeline.process_new_image(frame(k, k as f32 * 1.5)));
    }

    pipeline.stop();
    pipeline.current_state()
}

#[test]
fn single_and_multi_thread_modes_agree() {
    let single = run_sequence(true, 6);
    let multi = run_sequence(false, 6);

    assert_eq!(single.timestamp_ns, multi.timestamp_ns);
    assert_eq!(single.p, multi.p);
    assert_eq!(single.v, multi.v);
    assert_eq!(single.q, multi.q);
    assert_eq!(single.tracked_features, multi.tracked_features);
    assert_eq!(single.degraded, multi.degraded);
    assert_eq!(single.window.len(), multi.window.len());
}

#[test]
fn full_queue_rejects_frames_without_blocking() {
    let mut config = Config::default();
    config.pipeline.frame_queue_capacity = 5;
    let mut pipeline = VioPipeline::new(config, None);
    pipeline.start().unwrap();

    // An expensive frame keeps the worker busy while the queue fills.
    let heavy = Frame::new(0, textured_image(1600, 1200, 0.0));
    assert!(pipeline.process_new_image(heavy));
    thread::sleep(Duration::from_millis(100));

    for k in 1..=5 {
        assert!(
            pipeline.process_new_image(frame(k, 0.0)),
            "frame {k} should fit into the bounded queue"
        );
    }
    assert!(
        !pipeline.process_new_image(frame(6, 0.0)),
        "sixth frame against a full capacity-5 queue must be rejected"
    );
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.stop();
}

#[test]
fn stop_drains_queue_and_blocks_until_done() {
    let mut pipeline = VioPipeline::new(Config::default(), None);
    pipeline.start().unwrap();

    let last_ts = 3 * FRAME_INTERVAL;
    for k in 0..=3 {
        assert!(pipeline.process_new_image(frame(k, k as f32)));
    }
    pipeline.stop();

    // Every frame enqueued before stop() was processed before it returned.
    let state = pipeline.current_state();
    assert_eq!(state.timestamp_ns, last_ts);

    // After stop, the pipeline no longer accepts frames; stop is idempotent.
    assert!(!pipeline.process_new_image(frame(4, 0.0)));
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn featureless_frames_degrade_without_failure() {
    let mut config = Config::default();
    config.pipeline.single_thread = true;
    let mut pipeline = VioPipeline::new(config, None);
    pipeline.start().unwrap();

    let blank = GrayImage::from_pixel(160, 120, image::Luma([90]));
    assert!(pipeline.process_new_image(Frame::new(0, blank.clone())));
    assert!(pipeline.process_new_image(Frame::new(FRAME_INTERVAL, blank)));
    pipeline.stop();

    let state = pipeline.current_state();
    assert_eq!(state.tracked_features, 0);
    assert!(state.degraded);
    assert_eq!(state.timestamp_ns, FRAME_INTERVAL);
}

#[test]
fn control_surface_enforces_lifecycle() {
    let mut pipeline = VioPipeline::new(Config::default(), None);

    // Not running yet: no frames accepted.
    assert!(!pipeline.process_new_image(frame(0, 0.0)));
    assert!(pipeline.set_single_thread_mode(true).is_ok());

    pipeline.start().unwrap();
    assert!(pipeline.start().is_err());
    assert!(pipeline.set_single_thread_mode(false).is_err());

    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    // A stopped pipeline can be restarted.
    pipeline.start().unwrap();
    assert!(pipeline.process_new_image(frame(0, 0.0)));
    pipeline.stop();
}

#[derive(Default)]
struct RecordingViewer {
    poses: usize,
    trajectory_len: usize,
    landmarks: usize,
}

impl SceneViewer for RecordingViewer {
    fn log_pose(&mut self, _pose: &StampedPose) {
        self.poses += 1;
    }
    fn log_trajectory(&mut self, trajectory: &[StampedPose]) {
        self.trajectory_len = trajectory.len();
    }
    fn log_landmarks(&mut self, landmarks: &[(vio::TrackId, Vector3)]) {
        self.landmarks = landmarks.len();
    }
}

#[test]
fn visualization_hook_runs_after_stop_only() {
    let mut config = Config::default();
    config.pipeline.single_thread = true;
    let mut pipeline = VioPipeline::new(config, None);
    pipeline.start().unwrap();

    let mut viewer = RecordingViewer::default();
    assert!(pipeline.visualize_scene(&mut viewer).is_err());

    for k in 0..3 {
        assert!(pipeline.process_new_image(frame(k, k as f32)));
    }
    pipeline.stop();

    pipeline.visualize_scene(&mut viewer).unwrap();
    assert_eq!(viewer.poses, 1);
    assert_eq!(viewer.trajectory_len, 3);
    // Only window-referenced landmarks may be reported.
    assert!(viewer.landmarks <= 150);
}
