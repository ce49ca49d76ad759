//! Grid-based corner detection for track replenishment.
//!
//! The image is divided into square cells; cells already containing a live
//! track are skipped, and each empty cell contributes at most one FAST corner
//! so new tracks spread evenly instead of clustering on the strongest texture.

use image::{GenericImageView, GrayImage};
use imageproc::corners::{corners_fast9, Corner};

/// Lowest FAST threshold tried during per-cell back-off.
const MIN_FAST_THRESHOLD: u8 = 10;
/// Threshold decrement between back-off attempts.
const FAST_THRESHOLD_STEP: u8 = 5;

pub fn point_in_bound(corner: &Corner, height: u32, width: u32, radius: u32) -> bool {
    corner.x >= radius
        && corner.x <= width - radius
        && corner.y >= radius
        && corner.y <= height - radius
}

/// Detect up to `max_new` corners in cells not already occupied by a point in
/// `occupied`. Work is bounded by the grid: each cell runs FAST a fixed number
/// of back-off attempts at most.
pub fn detect_grid_corners(
    image: &GrayImage,
    grid_size: u32,
    occupied: &[[f32; 2]],
    base_threshold: u8,
    edge_margin: u32,
    max_new: usize,
) -> Vec<[f32; 2]> {
    let h = image.height();
    let w = image.width();
    if max_new == 0 || w < 2 * grid_size || h < 2 * grid_size {
        return Vec::new();
    }

    let mut grids = nalgebra::DMatrix::<i32>::zeros(
        (h / grid_size + 1) as usize,
        (w / grid_size + 1) as usize,
    );

    let x_start = (w % grid_size) / 2;
    let x_stop = x_start + grid_size * (w / grid_size - 1) + 1;
    let y_start = (h % grid_size) / 2;
    let y_stop = y_start + grid_size * (h / grid_size - 1) + 1;

    // Mark cells that already hold a live track.
    for point in occupied {
        let x = point[0].round().max(0.0) as u32;
        let y = point[1].round().max(0.0) as u32;
        if x >= x_start && y >= y_start && x < x_stop + grid_size && y < y_stop + grid_size {
            let gx = (x - x_start) / grid_size;
            let gy = (y - y_start) / grid_size;
            grids[(gy as usize, gx as usize)] += 1;
        }
    }

    let mut corners = Vec::new();
    'cells: for x in (x_start..x_stop).step_by(grid_size as usize) {
        for y in (y_start..y_stop).step_by(grid_size as usize) {
            if grids[(
                ((y - y_start) / grid_size) as usize,
                ((x - x_start) / grid_size) as usize,
            )] > 0
            {
                continue;
            }

            let cell = image.view(x, y, grid_size, grid_size).to_image();
            let mut threshold = base_threshold.max(MIN_FAST_THRESHOLD);
            let mut best: Option<Corner> = None;

            while best.is_none() && threshold >= MIN_FAST_THRESHOLD {
                let mut fast_corners = corners_fast9(&cell, threshold);
                fast_corners
                    .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

                for mut corner in fast_corners {
                    corner.x += x;
                    corner.y += y;
                    if point_in_bound(&corner, h, w, edge_margin) {
                        best = Some(corner);
                        break;
                    }
                }
                threshold = threshold.saturating_sub(FAST_THRESHOLD_STEP);
            }

            if let Some(corner) = best {
                corners.push([corner.x as f32, corner.y as f32]);
                if corners.len() >= max_new {
                    break 'cells;
                }
            }
        }
    }
    corners
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checkerboard-like texture; FAST finds corners at the block boundaries.
    fn checkered_image(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                image::Luma([220])
            } else {
                image::Luma([30])
            }
        })
    }

    #[test]
    fn featureless_image_yields_nothing() {
        let img = GrayImage::from_pixel(128, 128, image::Luma([100]));
        let corners = detect_grid_corners(&img, 32, &[], 40, 8, 50);
        assert!(corners.is_empty());
    }

    #[test]
    fn detection_respects_cap() {
        let img = checkered_image(256, 256);
        let corners = detect_grid_corners(&img, 32, &[], 40, 8, 5);
        assert!(corners.len() <= 5);
        assert!(!corners.is_empty());
    }

    #[test]
    fn occupied_cells_are_skipped() {
        let img = checkered_image(256, 256);
        let unblocked = detect_grid_corners(&img, 32, &[], 40, 8, 500);
        // Occupy every detected location; re-detection must come up emptier.
        let blocked = detect_grid_corners(&img, 32, &unblocked, 40, 8, 500);
        assert!(blocked.len() < unblocked.len());
    }

    #[test]
    fn corners_stay_inside_margin() {
        let img = checkered_image(200, 160);
        let margin = 16;
        for c in detect_grid_corners(&img, 32, &[], 40, margin, 500) {
            assert!(c[0] >= margin as f32 && c[0] <= (200 - margin) as f32);
            assert!(c[1] >= margin as f32 && c[1] <= (160 - margin) as f32);
        }
    }
}
