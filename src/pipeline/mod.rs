//! Pipeline scheduler: owns the tracker -> estimator sequence and drives it
//! either on a dedicated worker thread or inline on the caller's thread.
//!
//! The frame queue is the only shared mutable resource between caller and
//! worker; tracker, propagator and estimator are owned exclusively by
//! whichever thread runs the cycle, so their code path is identical in both
//! scheduling modes. State leaves the worker only as a snapshot clone
//! published under a short-held lock.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::camera::CameraModel;
use crate::config::Config;
use crate::error::VioError;
use crate::estimator::{Estimator, EstimatorState, StampedPose};
use crate::imu::{InertialSample, Propagator};
use crate::tracker::{FeatureTracker, Frame};
use crate::viz::SceneViewer;

/// Scheduler lifecycle. `Stopping` is observable only from the worker side;
/// callers see enqueue failures while the transition completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Running,
    Stopping,
}

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

fn state_from_u8(v: u8) -> PipelineState {
    match v {
        STATE_RUNNING => PipelineState::Running,
        STATE_STOPPING => PipelineState::Stopping,
        _ => PipelineState::Stopped,
    }
}

enum Input {
    Frame(Frame),
    Imu(InertialSample),
    Stop,
}

/// Everything a processing cycle touches, owned by exactly one thread.
struct Core {
    tracker: FeatureTracker,
    propagator: Propagator,
    estimator: Estimator,
    trajectory: Vec<StampedPose>,
    last_frame_ts: Option<i64>,
    snapshot: Arc<Mutex<EstimatorState>>,
}

impl Core {
    fn push_imu(&mut self, sample: InertialSample) -> bool {
        self.propagator.queue_sample(sample)
    }

    fn process_frame(&mut self, frame: Frame) {
        if let Some(prev) = self.last_frame_ts {
            if frame.timestamp_ns <= prev {
                log::warn!(
                    "[Pipeline] dropped non-monotonic frame ts={} (previous {})",
                    frame.timestamp_ns,
                    prev
                );
                return;
            }
        }
        self.last_frame_ts = Some(frame.timestamp_ns);

        let cycle_start = Instant::now();
        let tracking_start = Instant::now();
        let output = self
            .tracker
            .process_frame(&frame.image, frame.timestamp_ns);
        let tracking_ms = tracking_start.elapsed().as_secs_f64() * 1000.0;

        let update_start = Instant::now();
        self.estimator.process_frame(&output, &mut self.propagator);
        let update_ms = update_start.elapsed().as_secs_f64() * 1000.0;

        self.tracker
            .prune_lost(&self.estimator.referenced_track_ids());

        let snapshot = self.estimator.snapshot();
        self.trajectory.push(StampedPose {
            timestamp_ns: snapshot.timestamp_ns,
            q: snapshot.q,
            p: snapshot.p,
        });
        *self.snapshot.lock().unwrap() = snapshot;

        log::debug!(
            "[Timing] tracking={:.3} ms, update={:.3} ms, total={:.3} ms",
            tracking_ms,
            update_ms,
            cycle_start.elapsed().as_secs_f64() * 1000.0
        );
    }
}

/// The visual-inertial odometry pipeline: the application-facing control
/// surface around the tracker, propagator and estimator.
pub struct VioPipeline {
    frame_queue_capacity: usize,
    single_thread: bool,
    state: Arc<AtomicU8>,
    /// Frames enqueued but not yet dequeued by the worker.
    frames_in_flight: Arc<AtomicUsize>,
    snapshot: Arc<Mutex<EstimatorState>>,
    /// Present while stopped (both modes) and while running single-threaded.
    core: Option<Core>,
    sender: Option<Sender<Input>>,
    worker: Option<JoinHandle<Core>>,
}

impl VioPipeline {
    pub fn new(config: Config, camera: Option<Arc<dyn CameraModel>>) -> Self {
        if camera.is_none() {
            log::warn!("[Pipeline] running without geometric undistortion");
        }
        let estimator = Estimator::new(config.estimator.clone());
        let snapshot = Arc::new(Mutex::new(estimator.snapshot()));
        let core = Core {
            tracker: FeatureTracker::new(config.tracker.clone(), camera),
            propagator: Propagator::new(config.imu.clone()),
            estimator,
            trajectory: Vec::new(),
            last_frame_ts: None,
            snapshot: snapshot.clone(),
        };
        Self {
            frame_queue_capacity: config.pipeline.frame_queue_capacity.max(1),
            single_thread: config.pipeline.single_thread,
            state: Arc::new(AtomicU8::new(STATE_STOPPED)),
            frames_in_flight: Arc::new(AtomicUsize::new(0)),
            snapshot,
            core: Some(core),
            sender: None,
            worker: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Select cooperative single-thread scheduling. Only valid while stopped.
    pub fn set_single_thread_mode(&mut self, single_thread: bool) -> Result<(), VioError> {
        if self.state() != PipelineState::Stopped {
            return Err(VioError::InvalidTransition(
                "scheduling mode must be selected before start()",
            ));
        }
        self.single_thread = single_thread;
        Ok(())
    }

    /// STOPPED -> RUNNING. In multi-thread mode this launches the worker; in
    /// single-thread mode it arms inline processing.
    pub fn start(&mut self) -> Result<(), VioError> {
        if self.state() != PipelineState::Stopped {
            return Err(VioError::InvalidTransition("start() requires STOPPED"));
        }

        if !self.single_thread {
            let (tx, rx) = unbounded();
            let mut core = self.core.take().expect("core present while stopped");
            let frames_in_flight = self.frames_in_flight.clone();
            let handle = thread::Builder::new()
                .name("vio-worker".into())
                .spawn(move || {
                    worker_loop(&mut core, rx, frames_in_flight);
                    core
                })
                .expect("spawn vio worker");
            self.sender = Some(tx);
            self.worker = Some(handle);
        }

        self.state.store(STATE_RUNNING, Ordering::Release);
        log::info!(
            "[Pipeline] started ({} mode)",
            if self.single_thread {
                "single-thread"
            } else {
                "multi-thread"
            }
        );
        Ok(())
    }

    /// Enqueue a frame (multi-thread mode) or process it inline
    /// (single-thread mode). Returns false, enqueueing nothing, when the
    /// pipeline is not running or the bounded frame queue is full; the
    /// caller decides whether to drop or retry. Never blocks.
    pub fn process_new_image(&mut self, frame: Frame) -> bool {
        if self.state() != PipelineState::Running {
            return false;
        }

        if self.single_thread {
            let core = self.core.as_mut().expect("core present in single-thread");
            core.process_frame(frame);
            return true;
        }

        // Bounded backpressure: count unprocessed frames, never evict.
        let in_flight = self.frames_in_flight.load(Ordering::Acquire);
        if in_flight >= self.frame_queue_capacity {
            log::debug!(
                "[Pipeline] frame queue full ({in_flight} in flight), rejecting frame"
            );
            return false;
        }
        let sender = match &self.sender {
            Some(s) => s,
            None => return false,
        };
        self.frames_in_flight.fetch_add(1, Ordering::AcqRel);
        if sender.send(Input::Frame(frame)).is_err() {
            self.frames_in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Feed one inertial sample. Samples must arrive in timestamp order;
    /// violations are rejected by the propagation buffer with a warning.
    pub fn process_imu_sample(&mut self, sample: InertialSample) -> bool {
        if self.state() != PipelineState::Running {
            return false;
        }
        if self.single_thread {
            let core = self.core.as_mut().expect("core present in single-thread");
            return core.push_imu(sample);
        }
        match &self.sender {
            Some(s) => s.send(Input::Imu(sample)).is_ok(),
            None => false,
        }
    }

    /// RUNNING -> STOPPING -> STOPPED. Cooperative: the worker finishes the
    /// in-flight cycle and drains the queue, and this call blocks until it
    /// has fully terminated. Idempotent.
    pub fn stop(&mut self) {
        if self.state() != PipelineState::Running {
            return;
        }
        self.state.store(STATE_STOPPING, Ordering::Release);

        if let Some(sender) = self.sender.take() {
            // Wakes the worker if it is blocked on an empty queue.
            let _ = sender.send(Input::Stop);
        }
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(core) => self.core = Some(core),
                Err(_) => log::error!("[Pipeline] worker thread panicked"),
            }
        }

        self.state.store(STATE_STOPPED, Ordering::Release);
        log::info!("[Pipeline] stopped");
    }

    /// Read-only snapshot of the current estimate. Never blocks the worker
    /// beyond the copy-out.
    pub fn current_state(&self) -> EstimatorState {
        self.snapshot.lock().unwrap().clone()
    }

    /// Hand the estimated scene to an external renderer. Valid after stop().
    pub fn visualize_scene(&self, viewer: &mut dyn SceneViewer) -> Result<(), VioError> {
        if self.state() != PipelineState::Stopped {
            return Err(VioError::InvalidTransition(
                "visualize_scene() requires STOPPED",
            ));
        }
        let core = self
            .core
            .as_ref()
            .ok_or(VioError::InvalidTransition("pipeline core unavailable"))?;
        if let Some(last) = core.trajectory.last() {
            viewer.log_pose(last);
        }
        viewer.log_trajectory(&core.trajectory);
        viewer.log_landmarks(&core.estimator.landmarks());
        Ok(())
    }
}

impl Drop for VioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(core: &mut Core, receiver: Receiver<Input>, frames_in_flight: Arc<AtomicUsize>) {
    while let Ok(input) = receiver.recv() {
        match input {
            Input::Imu(sample) => {
                core.push_imu(sample);
            }
            Input::Frame(frame) => {
                frames_in_flight.fetch_sub(1, Ordering::AcqRel);
                core.process_frame(frame);
            }
            // Every input enqueued before the stop signal has been handled
            // at this point: the queue is drained, the cycle finished.
            Input::Stop => break,
        }
    }
}
