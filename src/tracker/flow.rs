//! Image pyramid construction and iterative patch alignment.
//!
//! Matching is translation-only Lucas-Kanade on a square patch: the patch
//! gradient is sampled once on the host image and reused as the Gauss-Newton
//! system across iterations, coarse-to-fine over the pyramid.

use image::imageops::{blur, resize, FilterType};
use image::{GrayImage, ImageBuffer, Luma, Pixel};

/// Images are processed in single precision regardless of the estimation
/// stack's `Float` setting.
pub type ImageFloat = f32;
pub type FloatImage = ImageBuffer<Luma<ImageFloat>, Vec<ImageFloat>>;
pub type Pyramid = Vec<FloatImage>;

/// Half-width of the square alignment patch.
const PATCH_RADIUS: i32 = 3;
/// Patch pixel count, (2 * PATCH_RADIUS + 1)^2.
const PATCH_SIZE: usize = 49;

#[derive(Debug, Clone)]
pub struct AlignParams {
    pub max_iterations: usize,
    /// Step norm in pixels below which the iteration stops.
    pub convergence_threshold: ImageFloat,
    /// Mean absolute intensity residual above which the match is rejected.
    pub max_residual: ImageFloat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AlignError {
    OutOfBounds,
    FlatPatch,
    HighResidual,
}

/// Build a scale pyramid of intensity images in `[0, 1]`.
pub fn build_pyramid(
    input: &GrayImage,
    nlevels: usize,
    ratio: f64,
    blurring: bool,
    blur_sigma: ImageFloat,
) -> Pyramid {
    let float_image: FloatImage = ImageBuffer::from_vec(
        input.width(),
        input.height(),
        input
            .pixels()
            .map(|p| (p.channels()[0] as ImageFloat) / 255.0)
            .collect::<Vec<_>>(),
    )
    .unwrap();

    let float_image = if blurring {
        blur(&float_image, blur_sigma)
    } else {
        float_image
    };

    let (w0, h0) = float_image.dimensions();

    let mut pyramid = Vec::with_capacity(nlevels);
    pyramid.push(float_image);
    for l in 1..nlevels {
        let nwidth = ((w0 as f64) / ratio.powi(l as i32)).round().max(1.0) as u32;
        let nheight = ((h0 as f64) / ratio.powi(l as i32)).round().max(1.0) as u32;
        let previous = pyramid.last().unwrap();
        pyramid.push(resize(previous, nwidth, nheight, FilterType::Triangle));
    }
    pyramid
}

fn in_bounds(img: &FloatImage, x: ImageFloat, y: ImageFloat, margin: ImageFloat) -> bool {
    x >= margin
        && y >= margin
        && x < img.width() as ImageFloat - 1.0 - margin
        && y < img.height() as ImageFloat - 1.0 - margin
}

/// Bilinear intensity sample. The caller guarantees the point is in bounds.
fn sample(img: &FloatImage, x: ImageFloat, y: ImageFloat) -> ImageFloat {
    let ix = x.floor() as u32;
    let iy = y.floor() as u32;
    let dx = x - ix as ImageFloat;
    let dy = y - iy as ImageFloat;

    let w = img.width();
    let raw = img.as_raw();
    let i00 = (iy * w + ix) as usize;
    let i10 = i00 + 1;
    let i01 = i00 + w as usize;
    let i11 = i01 + 1;

    (1.0 - dx) * (1.0 - dy) * raw[i00]
        + dx * (1.0 - dy) * raw[i10]
        + (1.0 - dx) * dy * raw[i01]
        + dx * dy * raw[i11]
}

/// Bilinear sample plus central-difference image gradient.
fn sample_with_gradient(
    img: &FloatImage,
    x: ImageFloat,
    y: ImageFloat,
) -> (ImageFloat, ImageFloat, ImageFloat) {
    let value = sample(img, x, y);
    let gx = 0.5 * (sample(img, x + 1.0, y) - sample(img, x - 1.0, y));
    let gy = 0.5 * (sample(img, x, y + 1.0) - sample(img, x, y - 1.0));
    (value, gx, gy)
}

/// Align the patch around `host_center` in `host` against `target`, starting
/// the search at `initial_guess`. Returns the matched position in `target`.
pub fn align_patch(
    host: &FloatImage,
    target: &FloatImage,
    host_center: [ImageFloat; 2],
    initial_guess: [ImageFloat; 2],
    params: &AlignParams,
) -> Result<[ImageFloat; 2], AlignError> {
    let patch_margin = (PATCH_RADIUS + 2) as ImageFloat;
    if !in_bounds(host, host_center[0], host_center[1], patch_margin) {
        return Err(AlignError::OutOfBounds);
    }

    // Template intensities and the Gauss-Newton system from host gradients.
    let mut template = [0.0; PATCH_SIZE];
    let mut grads = [[0.0; 2]; PATCH_SIZE];
    let mut h00 = 0.0;
    let mut h01 = 0.0;
    let mut h11 = 0.0;
    let mut k = 0;
    for oy in -PATCH_RADIUS..=PATCH_RADIUS {
        for ox in -PATCH_RADIUS..=PATCH_RADIUS {
            let (value, gx, gy) = sample_with_gradient(
                host,
                host_center[0] + ox as ImageFloat,
                host_center[1] + oy as ImageFloat,
            );
            template[k] = value;
            grads[k] = [gx, gy];
            h00 += gx * gx;
            h01 += gx * gy;
            h11 += gy * gy;
            k += 1;
        }
    }

    let det = h00 * h11 - h01 * h01;
    if det.abs() < 1e-10 {
        return Err(AlignError::FlatPatch);
    }
    let inv00 = h11 / det;
    let inv01 = -h01 / det;
    let inv11 = h00 / det;

    let mut pos = initial_guess;
    let mut mean_abs_residual = ImageFloat::INFINITY;
    for _ in 0..params.max_iterations {
        if !in_bounds(target, pos[0], pos[1], patch_margin) {
            return Err(AlignError::OutOfBounds);
        }

        let mut b0 = 0.0;
        let mut b1 = 0.0;
        let mut abs_sum = 0.0;
        let mut k = 0;
        for oy in -PATCH_RADIUS..=PATCH_RADIUS {
            for ox in -PATCH_RADIUS..=PATCH_RADIUS {
                let value = sample(
                    target,
                    pos[0] + ox as ImageFloat,
                    pos[1] + oy as ImageFloat,
                );
                let e = value - template[k];
                b0 += grads[k][0] * e;
                b1 += grads[k][1] * e;
                abs_sum += e.abs();
                k += 1;
            }
        }
        mean_abs_residual = abs_sum / PATCH_SIZE as ImageFloat;

        let dx = inv00 * b0 + inv01 * b1;
        let dy = inv01 * b0 + inv11 * b1;
        pos[0] -= dx;
        pos[1] -= dy;

        if (dx * dx + dy * dy).sqrt() < params.convergence_threshold {
            break;
        }
    }

    if !in_bounds(target, pos[0], pos[1], patch_margin) {
        return Err(AlignError::OutOfBounds);
    }
    if mean_abs_residual > params.max_residual {
        return Err(AlignError::HighResidual);
    }
    Ok(pos)
}

/// Track a point coarse-to-fine through the pyramid.
pub fn track_point(
    host: &Pyramid,
    target: &Pyramid,
    from: [ImageFloat; 2],
    params: &AlignParams,
) -> Result<[ImageFloat; 2], AlignError> {
    let (w0, h0) = host.first().unwrap().dimensions();
    let (w0, h0) = (w0 as ImageFloat, h0 as ImageFloat);

    let mut estimate = from;
    for level in (0..host.len()).rev() {
        let img_host = &host[level];
        let img_target = &target[level];
        let (wl, hl) = img_host.dimensions();
        let sx = wl as ImageFloat / w0;
        let sy = hl as ImageFloat / h0;

        let host_lvl = [sx * (from[0] + 0.5) - 0.5, sy * (from[1] + 0.5) - 0.5];
        let guess_lvl = [sx * (estimate[0] + 0.5) - 0.5, sy * (estimate[1] + 0.5) - 0.5];

        match align_patch(img_host, img_target, host_lvl, guess_lvl, params) {
            Ok(pos_lvl) => {
                estimate = [(pos_lvl[0] + 0.5) / sx - 0.5, (pos_lvl[1] + 0.5) / sy - 0.5];
            }
            // Coarse levels may lack texture for small patches; keep refining
            // at finer levels unless the finest one fails.
            Err(e) if level == 0 => return Err(e),
            Err(_) => {}
        }
    }
    Ok(estimate)
}

/// Forward-backward consistent tracking: the backward track of the match must
/// return within `fb_threshold` pixels of the starting point.
pub fn track_point_checked(
    host: &Pyramid,
    target: &Pyramid,
    from: [ImageFloat; 2],
    params: &AlignParams,
    fb_threshold: ImageFloat,
) -> Result<[ImageFloat; 2], AlignError> {
    let forward = track_point(host, target, from, params)?;
    let backward = track_point(target, host, forward, params)?;
    let ex = backward[0] - from[0];
    let ey = backward[1] - from[1];
    if (ex * ex + ey * ey).sqrt() > fb_threshold {
        return Err(AlignError::HighResidual);
    }
    Ok(forward)
}
