//! Feature tracker: turns a sequence of frames into persistent point tracks.

pub mod detection;
pub mod flow;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use image::GrayImage;

use crate::camera::CameraModel;
use crate::config::TrackerConfig;
use crate::types::{Float, Vector2};

use flow::{AlignParams, Pyramid};

/// One camera image with its capture timestamp. Transient: consumed by the
/// tracker and dropped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp_ns: i64,
    pub image: GrayImage,
}

impl Frame {
    pub fn new(timestamp_ns: i64, image: GrayImage) -> Self {
        Self {
            timestamp_ns,
            image,
        }
    }
}

/// Stable track identifier. Never reused, even after the track is dropped.
pub type TrackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Active,
    /// Terminal: a lost track never becomes active again.
    Lost,
}

/// A time-ordered record of one physical point's observed image position.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub status: TrackStatus,
    /// `(frame timestamp, pixel position)` per frame the track was matched.
    pub observations: Vec<(i64, Vector2)>,
}

impl Track {
    fn last_position(&self) -> Vector2 {
        self.observations
            .last()
            .map(|(_, p)| *p)
            .expect("track has at least its creation observation")
    }
}

/// Per-frame tracker result handed to the estimator.
#[derive(Debug, Clone, Default)]
pub struct TrackerOutput {
    pub timestamp_ns: i64,
    /// All tracks still active after this frame, as undistorted normalized
    /// image coordinates (raw pixels when no camera model is configured).
    pub observations: Vec<(TrackId, Vector2)>,
    /// Tracks that transitioned to lost on this frame.
    pub lost: Vec<TrackId>,
}

pub struct FeatureTracker {
    config: TrackerConfig,
    camera: Option<Arc<dyn CameraModel>>,
    tracks: HashMap<TrackId, Track>,
    next_id: TrackId,
    prev_pyramid: Option<Pyramid>,
}

impl FeatureTracker {
    pub fn new(config: TrackerConfig, camera: Option<Arc<dyn CameraModel>>) -> Self {
        if camera.is_none() {
            log::warn!("[FeatureTracker] no camera model; emitting raw pixel coordinates");
        }
        Self {
            config,
            camera,
            tracks: HashMap::new(),
            next_id: 0,
            prev_pyramid: None,
        }
    }

    pub fn active_count(&self) -> usize {
        self.tracks
            .values()
            .filter(|t| t.status == TrackStatus::Active)
            .count()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Process one frame: match active tracks, re-detect if starved, and
    /// report the surviving observations. A frame with no detectable features
    /// yields an empty output; this is not an error.
    pub fn process_frame(&mut self, image: &GrayImage, timestamp_ns: i64) -> TrackerOutput {
        let pyramid = flow::build_pyramid(
            image,
            self.config.pyramid_levels,
            self.config.pyramid_ratio,
            self.config.preprocessing_blur,
            self.config.preprocessing_blur_sigma,
        );

        let mut lost = Vec::new();

        let prev = self.prev_pyramid.take();
        if let Some(prev_pyramid) = prev.as_ref() {
            let params = AlignParams {
                max_iterations: self.config.optical_flow_max_iterations,
                convergence_threshold: self.config.optical_flow_convergence_threshold as f32,
                max_residual: self.config.max_patch_residual as f32,
            };
            let fb_threshold = self.config.forward_backward_threshold as f32;

            let active_ids: Vec<TrackId> = self
                .tracks
                .values()
                .filter(|t| t.status == TrackStatus::Active)
                .map(|t| t.id)
                .collect();

            for id in active_ids {
                let from = {
                    let p = self.tracks[&id].last_position();
                    [p.x as f32, p.y as f32]
                };
                let matched =
                    flow::track_point_checked(prev_pyramid, &pyramid, from, &params, fb_threshold)
                        .ok()
                        .filter(|p| self.inside_margin(image, p));

                let track = self.tracks.get_mut(&id).unwrap();
                match matched {
                    Some(p) => {
                        track
                            .observations
                            .push((timestamp_ns, Vector2::new(p[0] as Float, p[1] as Float)));
                    }
                    None => {
                        track.status = TrackStatus::Lost;
                        lost.push(id);
                    }
                }
            }
        }

        let active = self.active_count();
        if active < self.config.target_track_count {
            self.detect_new_tracks(image, timestamp_ns, active);
        }

        self.prev_pyramid = Some(pyramid);

        let mut observations: Vec<(TrackId, Vector2)> = self
            .tracks
            .values()
            .filter(|t| t.status == TrackStatus::Active)
            .map(|t| (t.id, self.undistort(&t.last_position())))
            .collect();
        observations.sort_by_key(|(id, _)| *id);
        lost.sort_unstable();

        log::debug!(
            "[FeatureTracker] frame ts={}: {} active, {} lost",
            timestamp_ns,
            observations.len(),
            lost.len()
        );

        TrackerOutput {
            timestamp_ns,
            observations,
            lost,
        }
    }

    /// Drop lost tracks that no external consumer references anymore. Ids are
    /// never reused, so dropping is safe for any stale id the caller holds.
    pub fn prune_lost(&mut self, referenced: &HashSet<TrackId>) {
        self.tracks
            .retain(|id, t| t.status == TrackStatus::Active || referenced.contains(id));
    }

    fn inside_margin(&self, image: &GrayImage, p: &[f32; 2]) -> bool {
        let m = self.config.edge_margin as f32;
        p[0] >= m
            && p[1] >= m
            && p[0] < image.width() as f32 - m
            && p[1] < image.height() as f32 - m
    }

    fn detect_new_tracks(&mut self, image: &GrayImage, timestamp_ns: i64, active: usize) {
        let budget = self.config.max_tracks.saturating_sub(active);
        if budget == 0 {
            return;
        }

        let occupied: Vec<[f32; 2]> = self
            .tracks
            .values()
            .filter(|t| t.status == TrackStatus::Active)
            .map(|t| {
                let p = t.last_position();
                [p.x as f32, p.y as f32]
            })
            .collect();

        let corners = detection::detect_grid_corners(
            image,
            self.config.grid_size,
            &occupied,
            self.config.fast_threshold,
            self.config.edge_margin,
            budget,
        );

        for corner in corners {
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(
                id,
                Track {
                    id,
                    status: TrackStatus::Active,
                    observations: vec![(
                        timestamp_ns,
                        Vector2::new(corner[0] as Float, corner[1] as Float),
                    )],
                },
            );
        }
    }

    fn undistort(&self, pixel: &Vector2) -> Vector2 {
        match &self.camera {
            Some(camera) => camera.unproject_normalized(pixel),
            None => *pixel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn tracker() -> FeatureTracker {
        FeatureTracker::new(TrackerConfig::default(), None)
    }

    #[test]
    fn first_frame_creates_tracks() {
        let mut t = tracker();
        let out = t.process_frame(&textured_image(256, 192, 0.0), 0);
        assert!(!out.observations.is_empty());
        assert!(out.lost.is_empty());
        assert!(out.observations.len() <= TrackerConfig::default().max_tracks);
    }

    #[test]
    fn featureless_frames_yield_empty_output() {
        let mut t = tracker();
        let blank = GrayImage::from_pixel(256, 192, image::Luma([90]));
        let first = t.process_frame(&blank, 0);
        let second = t.process_frame(&blank, 33_000_000);
        assert!(first.observations.is_empty());
        assert!(second.observations.is_empty());
        assert!(second.lost.is_empty());
    }

    #[test]
    fn ids_are_stable_across_frames() {
        let mut t = tracker();
        let first = t.process_frame(&textured_image(256, 192, 0.0), 0);
        let second = t.process_frame(&textured_image(256, 192, 1.5), 33_000_000);

        let first_ids: HashSet<TrackId> = first.observations.iter().map(|(id, _)| *id).collect();
        let survivors: Vec<TrackId> = second
            .observations
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| first_ids.contains(id))
            .collect();
        assert!(
            !survivors.is_empty(),
            "small translation should not kill every track"
        );
        for id in &survivors {
            assert_eq!(t.track(*id).unwrap().status, TrackStatus::Active);
            assert_eq!(t.track(*id).unwrap().observations.len(), 2);
        }
    }

    #[test]
    fn lost_is_terminal_and_prunable() {
        let mut t = tracker();
        t.process_frame(&textured_image(256, 192, 0.0), 0);
        // A blank frame kills every track.
        let blank = GrayImage::from_pixel(256, 192, image::Luma([90]));
        let out = t.process_frame(&blank, 33_000_000);
        assert!(!out.lost.is_empty());
        for id in &out.lost {
            assert_eq!(t.track(*id).unwrap().status, TrackStatus::Lost);
        }

        let keep: HashSet<TrackId> = out.lost.iter().take(1).copied().collect();
        t.prune_lost(&keep);
        for id in &out.lost {
            if keep.contains(id) {
                assert!(t.track(*id).is_some());
            } else {
                assert!(t.track(*id).is_none());
            }
        }
    }

    #[test]
    fn never_reuses_ids_after_pruning() {
        let mut t = tracker();
        let first = t.process_frame(&textured_image(256, 192, 0.0), 0);
        let max_first = first.observations.iter().map(|(id, _)| *id).max().unwrap();

        let blank = GrayImage::from_pixel(256, 192, image::Luma([90]));
        t.process_frame(&blank, 33_000_000);
        t.prune_lost(&HashSet::new());

        let third = t.process_frame(&textured_image(256, 192, 0.0), 66_000_000);
        for (id, _) in &third.observations {
            assert!(*id > max_first);
        }
    }
}
