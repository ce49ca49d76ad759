//! Inertial sample buffering and strapdown propagation.
//!
//! The propagator owns a timestamp-ordered queue of samples; each propagation
//! call consumes the samples covering the requested interval exactly once and
//! returns the propagated state together with the accumulated linearization
//! (state transition and process-noise growth) the filter needs.

use std::collections::VecDeque;

use crate::config::ImuConfig;
use crate::types::{
    ns_to_sec, skew, Float, Matrix15, Matrix3, UnitQuaternion, Vector3, IMU_STATE_DIM,
};

/// One inertial measurement: body angular velocity and specific force.
#[derive(Debug, Clone, Copy)]
pub struct InertialSample {
    pub timestamp_ns: i64,
    /// Angular velocity, rad/s, body frame.
    pub gyro: Vector3,
    /// Specific force, m/s^2, body frame.
    pub accel: Vector3,
}

/// Inertial portion of the filter state used as the propagation basis.
#[derive(Debug, Clone, Copy)]
pub struct ImuState {
    /// Body-to-world rotation.
    pub q: UnitQuaternion,
    /// Body position in world.
    pub p: Vector3,
    /// Body velocity in world.
    pub v: Vector3,
    pub gyro_bias: Vector3,
    pub accel_bias: Vector3,
}

impl ImuState {
    pub fn identity() -> Self {
        Self {
            q: UnitQuaternion::identity(),
            p: Vector3::zeros(),
            v: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
        }
    }
}

/// Result of one propagation call.
#[derive(Debug, Clone)]
pub struct Propagation {
    /// The basis state advanced to the end of the interval.
    pub state: ImuState,
    /// Accumulated error-state transition over the interval.
    pub phi: Matrix15,
    /// Accumulated discrete process-noise covariance.
    pub noise: Matrix15,
    /// Number of samples integrated (and discarded).
    pub samples_used: usize,
}

pub struct Propagator {
    config: ImuConfig,
    buffer: VecDeque<InertialSample>,
    /// Most recently consumed sample, kept only as the midpoint anchor for
    /// the next interval. It is never counted as coverage again.
    last_consumed: Option<InertialSample>,
    last_timestamp_ns: Option<i64>,
}

impl Propagator {
    pub fn new(config: ImuConfig) -> Self {
        Self {
            config,
            buffer: VecDeque::new(),
            last_consumed: None,
            last_timestamp_ns: None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Queue a sample. Timestamps must strictly increase across the whole
    /// feed; violations are rejected with a warning.
    pub fn queue_sample(&mut self, sample: InertialSample) -> bool {
        let newest = self
            .buffer
            .back()
            .map(|s| s.timestamp_ns)
            .or(self.last_timestamp_ns);
        if let Some(newest) = newest {
            if sample.timestamp_ns <= newest {
                log::warn!(
                    "[Propagator] rejected out-of-order sample at {} (newest {})",
                    sample.timestamp_ns,
                    newest
                );
                return false;
            }
        }
        self.buffer.push_back(sample);
        true
    }

    /// Integrate all buffered samples with timestamps in `(from_ns, to_ns]`,
    /// extending the final sub-interval to `to_ns` by holding the last
    /// measurement. Returns `None` when no sample covers the interval; the
    /// caller must fall back to a zero-motion prior with inflated covariance.
    pub fn propagate(
        &mut self,
        basis: &ImuState,
        from_ns: i64,
        to_ns: i64,
    ) -> Option<Propagation> {
        let mut used = Vec::new();
        while let Some(front) = self.buffer.front() {
            if front.timestamp_ns <= to_ns {
                used.push(self.buffer.pop_front().unwrap());
            } else {
                break;
            }
        }
        if used.is_empty() {
            return None;
        }

        let mut state = *basis;
        let mut phi = Matrix15::identity();
        let mut noise = Matrix15::zeros();

        let mut prev_t = from_ns;
        let mut prev_meas = self.last_consumed;
        for sample in &used {
            let dt = ns_to_sec(prev_t, sample.timestamp_ns).max(0.0);
            if dt > 0.0 {
                // Midpoint between the previous and the current measurement;
                // rectangular on the very first sample of the feed.
                let (gyro, accel) = match prev_meas {
                    Some(prev) => (
                        0.5 * (prev.gyro + sample.gyro),
                        0.5 * (prev.accel + sample.accel),
                    ),
                    None => (sample.gyro, sample.accel),
                };
                self.step(&mut state, &mut phi, &mut noise, &gyro, &accel, dt);
            }
            // Samples predating the interval (warm-up) only move the
            // midpoint anchor, never the integration clock.
            prev_t = prev_t.max(sample.timestamp_ns);
            prev_meas = Some(*sample);
        }

        // Hold the last measurement up to the frame time.
        if prev_t < to_ns {
            let last = prev_meas.expect("used is non-empty");
            let dt = ns_to_sec(prev_t, to_ns);
            self.step(&mut state, &mut phi, &mut noise, &last.gyro, &last.accel, dt);
        }

        self.last_consumed = prev_meas;
        self.last_timestamp_ns = Some(to_ns.max(prev_t));

        Some(Propagation {
            state,
            phi,
            noise,
            samples_used: used.len(),
        })
    }

    /// One integration step with constant measurements over `dt` seconds,
    /// accumulating the first-order error-state transition and noise.
    fn step(
        &self,
        state: &mut ImuState,
        phi: &mut Matrix15,
        noise: &mut Matrix15,
        gyro: &Vector3,
        accel: &Vector3,
        dt: Float,
    ) {
        let w = gyro - state.gyro_bias;
        let a = accel - state.accel_bias;
        let gravity = Vector3::new(0.0, 0.0, -self.config.gravity);

        let rot = state.q.to_rotation_matrix().into_inner();
        let acc_world = rot * a + gravity;

        // Error-state transition, first order:
        //   d(dtheta) = -[w]x dtheta - dbg
        //   d(dp)     = dv
        //   d(dv)     = -R [a]x dtheta - R dba
        let mut f = Matrix15::identity();
        let i3 = Matrix3::identity();
        f.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(i3 - skew(&w) * dt));
        f.fixed_view_mut::<3, 3>(0, 9).copy_from(&(-i3 * dt));
        f.fixed_view_mut::<3, 3>(3, 6).copy_from(&(i3 * dt));
        f.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-(rot * skew(&a)) * dt));
        f.fixed_view_mut::<3, 3>(6, 12).copy_from(&(-rot * dt));

        let sg = self.config.gyro_noise_density.powi(2);
        let sa = self.config.accel_noise_density.powi(2);
        let sbg = self.config.gyro_bias_random_walk.powi(2);
        let sba = self.config.accel_bias_random_walk.powi(2);
        let mut qd = Matrix15::zeros();
        qd.fixed_view_mut::<3, 3>(0, 0).copy_from(&(i3 * sg * dt));
        qd.fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(i3 * sa * dt.powi(3) / 3.0));
        qd.fixed_view_mut::<3, 3>(6, 6).copy_from(&(i3 * sa * dt));
        qd.fixed_view_mut::<3, 3>(9, 9).copy_from(&(i3 * sbg * dt));
        qd.fixed_view_mut::<3, 3>(12, 12)
            .copy_from(&(i3 * sba * dt));

        *phi = f * *phi;
        *noise = f * *noise * f.transpose() + qd;

        // Nominal-state strapdown update.
        state.q *= UnitQuaternion::from_scaled_axis(w * dt);
        state.p += state.v * dt + 0.5 * acc_world * dt * dt;
        state.v += acc_world * dt;
    }
}

// Keep the constant referenced so dimension changes are caught here.
const _: () = assert!(IMU_STATE_DIM == 15);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ns_to_sec;

    const SEC: i64 = 1_000_000_000;

    fn stationary_sample(t: i64, gravity: Float) -> InertialSample {
        InertialSample {
            timestamp_ns: t,
            gyro: Vector3::zeros(),
            // A resting accelerometer measures the upward reaction force.
            accel: Vector3::new(0.0, 0.0, gravity),
        }
    }

    fn propagator() -> Propagator {
        Propagator::new(ImuConfig::default())
    }

    #[test]
    fn rejects_out_of_order_samples() {
        let mut prop = propagator();
        assert!(prop.queue_sample(stationary_sample(100, 9.81)));
        assert!(!prop.queue_sample(stationary_sample(100, 9.81)));
        assert!(!prop.queue_sample(stationary_sample(50, 9.81)));
        assert!(prop.queue_sample(stationary_sample(150, 9.81)));
        assert_eq!(prop.buffered(), 2);
    }

    #[test]
    fn empty_interval_returns_none() {
        let mut prop = propagator();
        assert!(prop.propagate(&ImuState::identity(), 0, SEC).is_none());

        prop.queue_sample(stationary_sample(2 * SEC, 9.81));
        // Sample lies beyond the interval: no coverage.
        assert!(prop.propagate(&ImuState::identity(), 0, SEC).is_none());
        assert_eq!(prop.buffered(), 1);
    }

    #[test]
    fn stationary_platform_stays_put() {
        let g = ImuConfig::default().gravity;
        let mut prop = propagator();
        for k in 1..=20 {
            prop.queue_sample(stationary_sample(k * SEC / 20, g));
        }
        let result = prop
            .propagate(&ImuState::identity(), 0, SEC)
            .expect("interval covered");
        assert_eq!(result.samples_used, 20);
        assert!(result.state.p.norm() < 1e-9, "p = {:?}", result.state.p);
        assert!(result.state.v.norm() < 1e-9, "v = {:?}", result.state.v);
        assert!(result.state.q.angle() < 1e-9);
    }

    #[test]
    fn constant_rotation_integrates_angle() {
        let g = ImuConfig::default().gravity;
        let rate = 0.5; // rad/s about z
        let mut prop = propagator();
        for k in 1..=100 {
            prop.queue_sample(InertialSample {
                timestamp_ns: k * SEC / 100,
                gyro: Vector3::new(0.0, 0.0, rate),
                accel: Vector3::new(0.0, 0.0, g),
            });
        }
        let result = prop.propagate(&ImuState::identity(), 0, SEC).unwrap();
        assert!(
            (result.state.q.angle() - rate * ns_to_sec(0, SEC)).abs() < 1e-6,
            "angle = {}",
            result.state.q.angle()
        );
    }

    #[test]
    fn samples_consumed_at_most_once() {
        let g = ImuConfig::default().gravity;
        let mut prop = propagator();
        for k in 1..=10 {
            prop.queue_sample(stationary_sample(k * SEC / 10, g));
        }
        let first = prop
            .propagate(&ImuState::identity(), 0, SEC / 2)
            .expect("first half covered");
        let second = prop
            .propagate(&first.state, SEC / 2, SEC)
            .expect("second half covered");
        assert_eq!(first.samples_used + second.samples_used, 10);
        assert_eq!(prop.buffered(), 0);
        // Nothing left for a third call over the same span.
        assert!(prop.propagate(&second.state, 0, SEC).is_none());
    }

    #[test]
    fn noisy_rest_drifts_slowly() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let g = ImuConfig::default().gravity;
        let mut prop = propagator();
        for k in 1..=200 {
            prop.queue_sample(InertialSample {
                timestamp_ns: k * SEC / 200,
                gyro: Vector3::new(
                    rng.gen_range(-1e-3..1e-3),
                    rng.gen_range(-1e-3..1e-3),
                    rng.gen_range(-1e-3..1e-3),
                ),
                accel: Vector3::new(
                    rng.gen_range(-1e-2..1e-2),
                    rng.gen_range(-1e-2..1e-2),
                    g + rng.gen_range(-1e-2..1e-2),
                ),
            });
        }
        let result = prop.propagate(&ImuState::identity(), 0, SEC).unwrap();
        assert!(result.state.p.norm() < 0.05, "p = {:?}", result.state.p);
        assert!(result.state.v.norm() < 0.05, "v = {:?}", result.state.v);
    }

    #[test]
    fn noise_grows_with_interval_length() {
        let g = ImuConfig::default().gravity;
        let mut prop_short = propagator();
        let mut prop_long = propagator();
        for k in 1..=10 {
            prop_short.queue_sample(stationary_sample(k * SEC / 10, g));
            prop_long.queue_sample(stationary_sample(k * SEC / 10, g));
        }
        let short = prop_short
            .propagate(&ImuState::identity(), 0, SEC / 10)
            .unwrap();
        let long = prop_long.propagate(&ImuState::identity(), 0, SEC).unwrap();
        assert!(long.noise.trace() > short.noise.trace());
        // Symmetry of the accumulated noise.
        let asym = (long.noise - long.noise.transpose()).norm();
        assert!(asym < 1e-12);
    }
}
