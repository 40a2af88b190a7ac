// Brightness normalization for camera frames: a manual gamma/contrast/
// brightness chain, CLAHE on the luminance channel, and an EMA-smoothed
// adaptive gamma reducer for overexposed views.

use image::{GrayImage, RgbImage};

/// Parameters within this distance of 1.0 are treated as neutral.
const NEUTRAL_EPSILON: f32 = 1e-6;

/// True when the whole gamma/contrast/brightness chain would be a no-op.
pub fn is_neutral(brightness: f32, contrast: f32, gamma: f32) -> bool {
    (brightness - 1.0).abs() < NEUTRAL_EPSILON
        && (contrast - 1.0).abs() < NEUTRAL_EPSILON
        && (gamma - 1.0).abs() < NEUTRAL_EPSILON
}

/// Apply gamma, then contrast around the 128 midpoint, then a linear
/// brightness scale, to every channel. No-op when all three are neutral.
///
/// Gamma operates on [0,1]-normalized values with a 1e-7 floor so a
/// negative exponent cannot divide by zero.
pub fn apply_brightness_contrast_gamma(
    image: &mut RgbImage,
    brightness: f32,
    contrast: f32,
    gamma: f32,
) {
    if is_neutral(brightness, contrast, gamma) {
        return;
    }

    // The chain is pointwise per channel value, so one 256-entry LUT
    // covers the whole frame.
    let mut lut = [0u8; 256];
    for (v, entry) in lut.iter_mut().enumerate() {
        let mut out = v as f32;
        if (gamma - 1.0).abs() >= NEUTRAL_EPSILON {
            let normalized = (out / 255.0).clamp(1e-7, 1.0);
            out = normalized.powf(gamma) * 255.0;
        }
        if (contrast - 1.0).abs() >= NEUTRAL_EPSILON {
            out = (out - 128.0) * contrast + 128.0;
        }
        if (brightness - 1.0).abs() >= NEUTRAL_EPSILON {
            out *= brightness;
        }
        *entry = out.clamp(0.0, 255.0) as u8;
    }

    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = lut[*channel as usize];
        }
    }
}

// BT.601 conversion, same constants as the JPEG color space.
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = -0.168736 * r - 0.331264 * g + 0.5 * b + 128.0;
    let cr = 0.5 * r - 0.418688 * g - 0.081312 * b + 128.0;
    (y, cb, cr)
}

fn ycbcr_to_rgb(y: f32, cb: f32, cr: f32) -> (u8, u8, u8) {
    let r = y + 1.402 * (cr - 128.0);
    let g = y - 0.344136 * (cb - 128.0) - 0.714136 * (cr - 128.0);
    let b = y + 1.772 * (cb - 128.0);
    (
        r.clamp(0.0, 255.0) as u8,
        g.clamp(0.0, 255.0) as u8,
        b.clamp(0.0, 255.0) as u8,
    )
}

/// Extract the luminance (Y) plane.
pub fn luminance_plane(image: &RgbImage) -> GrayImage {
    let mut plane = GrayImage::new(image.width(), image.height());
    for (src, dst) in image.pixels().zip(plane.pixels_mut()) {
        let (y, _, _) = rgb_to_ycbcr(src.0[0], src.0[1], src.0[2]);
        dst.0[0] = y.round().clamp(0.0, 255.0) as u8;
    }
    plane
}

/// Mean luminance over the whole frame, 0..255.
pub fn mean_luminance(image: &RgbImage) -> f32 {
    let pixels = (image.width() as u64 * image.height() as u64).max(1);
    let sum: f64 = image
        .pixels()
        .map(|p| {
            let (y, _, _) = rgb_to_ycbcr(p.0[0], p.0[1], p.0[2]);
            y as f64
        })
        .sum();
    (sum / pixels as f64) as f32
}

/// Remap the luminance channel through `lut`, keeping color difference
/// channels untouched.
fn map_luminance(image: &mut RgbImage, lut: &[u8; 256]) {
    for pixel in image.pixels_mut() {
        let (y, cb, cr) = rgb_to_ycbcr(pixel.0[0], pixel.0[1], pixel.0[2]);
        let y_in = y.round().clamp(0.0, 255.0) as u8;
        let y_out = lut[y_in as usize];
        let (r, g, b) = ycbcr_to_rgb(y_out as f32, cb, cr);
        pixel.0 = [r, g, b];
    }
}

/// CLAHE on the luminance channel only. Clip limit is clamped to [0, 10],
/// tile size to [2, 32], matching the tuning range that makes sense for
/// 8x8-ish grids on camera frames.
pub fn clahe_luminance(image: &RgbImage, clip_limit: f32, tile_size: u32) -> RgbImage {
    let clip_limit = clip_limit.clamp(0.0, 10.0);
    let tile_size = tile_size.clamp(2, 32);

    let plane = luminance_plane(image);
    let equalized = equalize_clahe(&plane, clip_limit, tile_size);

    let mut out = image.clone();
    for (pixel, y_eq) in out.pixels_mut().zip(equalized.pixels()) {
        let (_, cb, cr) = rgb_to_ycbcr(pixel.0[0], pixel.0[1], pixel.0[2]);
        let (r, g, b) = ycbcr_to_rgb(y_eq.0[0] as f32, cb, cr);
        pixel.0 = [r, g, b];
    }
    out
}

/// Contrast-limited adaptive histogram equalization on a grayscale plane.
///
/// Per-tile 256-bin histograms are clipped (limit expressed as a multiple
/// of the uniform bin height), the excess redistributed evenly, and each
/// output pixel bilinearly interpolates between the LUTs of the four
/// nearest tile centers. Zuiderveld (1994), Graphics Gems IV.
pub fn equalize_clahe(plane: &GrayImage, clip_limit: f32, tile_size: u32) -> GrayImage {
    let (w, h) = plane.dimensions();
    if w == 0 || h == 0 {
        return GrayImage::new(w, h);
    }
    let tile = tile_size.max(1);

    let cols = w.div_ceil(tile) as usize;
    let rows = h.div_ceil(tile) as usize;

    let mut tile_luts = vec![[0u8; 256]; cols * rows];
    for ty in 0..rows {
        for tx in 0..cols {
            let x0 = tx as u32 * tile;
            let y0 = ty as u32 * tile;
            let x1 = (x0 + tile).min(w);
            let y1 = (y0 + tile).min(h);
            let tile_pixels = ((x1 - x0) * (y1 - y0)) as u32;

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[plane.get_pixel(x, y).0[0] as usize] += 1;
                }
            }

            if clip_limit > 0.0 {
                clip_tile_histogram(&mut hist, tile_pixels, clip_limit);
            }
            tile_luts[ty * cols + tx] = build_tile_lut(&hist, tile_pixels);
        }
    }

    let mut out = GrayImage::new(w, h);
    let tile_center = |t: usize| (t as f32 + 0.5) * tile as f32;

    for y in 0..h {
        for x in 0..w {
            // Nearest tile centers left/above and right/below the pixel,
            // clamped at the borders.
            let fx = x as f32 / tile as f32 - 0.5;
            let fy = y as f32 / tile as f32 - 0.5;
            let tx0 = (fx.floor() as isize).max(0) as usize;
            let ty0 = (fy.floor() as isize).max(0) as usize;
            let tx1 = (tx0 + 1).min(cols - 1);
            let ty1 = (ty0 + 1).min(rows - 1);

            let ax = if tx0 == tx1 {
                0.0
            } else {
                ((x as f32 - tile_center(tx0)) / (tile_center(tx1) - tile_center(tx0)))
                    .clamp(0.0, 1.0)
            };
            let ay = if ty0 == ty1 {
                0.0
            } else {
                ((y as f32 - tile_center(ty0)) / (tile_center(ty1) - tile_center(ty0)))
                    .clamp(0.0, 1.0)
            };

            let v = plane.get_pixel(x, y).0[0] as usize;
            let v00 = tile_luts[ty0 * cols + tx0][v] as f32;
            let v10 = tile_luts[ty0 * cols + tx1][v] as f32;
            let v01 = tile_luts[ty1 * cols + tx0][v] as f32;
            let v11 = tile_luts[ty1 * cols + tx1][v] as f32;

            let blended = v00 * (1.0 - ax) * (1.0 - ay)
                + v10 * ax * (1.0 - ay)
                + v01 * (1.0 - ax) * ay
                + v11 * ax * ay;
            out.put_pixel(x, y, image::Luma([blended.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

fn build_tile_lut(hist: &[u32; 256], total: u32) -> [u8; 256] {
    let mut cdf = [0u32; 256];
    cdf[0] = hist[0];
    for i in 1..256 {
        cdf[i] = cdf[i - 1] + hist[i];
    }

    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    let mut lut = [0u8; 256];
    let denom = total as f32 - cdf_min as f32;
    if denom <= 0.0 {
        // Every pixel in the tile has the same value.
        return lut;
    }
    for i in 0..256 {
        let mapped = (cdf[i] as f32 - cdf_min as f32) / denom * 255.0;
        lut[i] = mapped.round().clamp(0.0, 255.0) as u8;
    }
    lut
}

fn clip_tile_histogram(hist: &mut [u32; 256], tile_pixels: u32, clip_multiplier: f32) {
    let clip_val = ((tile_pixels as f32 / 256.0) * clip_multiplier).ceil() as u32;

    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip_val {
            excess += *bin - clip_val;
            *bin = clip_val;
        }
    }

    let per_bin = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += per_bin;
        if i < remainder {
            *bin += 1;
        }
    }
}

/// Reduces brightness only when the frame is too bright, using gamma on the
/// luminance channel smoothed with an EMA so the correction does not flicker
/// frame to frame. Optional CLAHE afterwards recovers detail without pushing
/// brightness back up. Geometry and resolution are never changed.
#[derive(Debug)]
pub struct BrightnessReducer {
    luminance_threshold: f32,
    gamma: f32,
    brightness_scale: f32,
    gamma_ema_alpha: f32,
    use_clahe: bool,
    clahe_clip_limit: f32,
    clahe_tile_size: u32,
    // Effective gamma used last frame; 1.0 means no correction.
    ema_gamma: f32,
}

impl Default for BrightnessReducer {
    fn default() -> Self {
        Self {
            luminance_threshold: 165.0,
            gamma: 1.4,
            brightness_scale: 1.0,
            gamma_ema_alpha: 0.85,
            use_clahe: true,
            clahe_clip_limit: 2.0,
            clahe_tile_size: 8,
            ema_gamma: 1.0,
        }
    }
}

impl BrightnessReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean luminance (0..255) above which correction kicks in.
    pub fn with_threshold(mut self, luminance_threshold: f32) -> Self {
        self.luminance_threshold = luminance_threshold.clamp(0.0, 255.0);
        self
    }

    /// Gamma applied when too bright; values below 1.0 are clamped up since
    /// this preprocessor only ever reduces brightness.
    pub fn with_gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma.max(1.0);
        self
    }

    /// Extra luminance scale after gamma; kept at or below 1.0.
    pub fn with_brightness_scale(mut self, scale: f32) -> Self {
        self.brightness_scale = scale.clamp(0.01, 1.0);
        self
    }

    /// EMA factor for the applied gamma; higher means more smoothing.
    pub fn with_smoothing(mut self, alpha: f32) -> Self {
        self.gamma_ema_alpha = alpha.clamp(0.0, 1.0);
        self
    }

    pub fn with_clahe(mut self, enabled: bool, clip_limit: f32, tile_size: u32) -> Self {
        self.use_clahe = enabled;
        self.clahe_clip_limit = clip_limit.clamp(0.0, 10.0);
        self.clahe_tile_size = tile_size.clamp(2, 32);
        self
    }

    /// Reset EMA state for a new session.
    pub fn reset(&mut self) {
        self.ema_gamma = 1.0;
    }

    /// Effective gamma after the last `process` call.
    pub fn current_gamma(&self) -> f32 {
        self.ema_gamma
    }

    /// Process one frame. The EMA advances every call, decaying back toward
    /// 1.0 on dark frames, so a single bright frame cannot cause a visible
    /// brightness jump.
    pub fn process(&mut self, image: &RgbImage) -> RgbImage {
        let mean = mean_luminance(image);
        let target_gamma = if mean <= self.luminance_threshold {
            1.0
        } else {
            self.gamma
        };

        let alpha = self.gamma_ema_alpha;
        self.ema_gamma = alpha * self.ema_gamma + (1.0 - alpha) * target_gamma;

        let mut out = image.clone();
        if self.ema_gamma > 1.01 {
            let mut lut = [0u8; 256];
            for (v, entry) in lut.iter_mut().enumerate() {
                let corrected = (v as f32 / 255.0).powf(self.ema_gamma) * 255.0;
                *entry = corrected.clamp(0.0, 255.0) as u8;
            }
            map_luminance(&mut out, &lut);

            if self.brightness_scale < 1.0 {
                let mut scale_lut = [0u8; 256];
                for (v, entry) in scale_lut.iter_mut().enumerate() {
                    *entry = (v as f32 * self.brightness_scale).clamp(0.0, 255.0) as u8;
                }
                map_luminance(&mut out, &scale_lut);
            }
        }

        if self.use_clahe {
            out = clahe_luminance(&out, self.clahe_clip_limit, self.clahe_tile_size);
        }
        out
    }
}
