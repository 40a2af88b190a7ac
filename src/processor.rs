use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::brightness;
use crate::config::VisionConfig;
use crate::roles::{camera_role_for_key, CameraRole};
use crate::segmenter::Segmenter;
use crate::throttle::LogThrottle;

/// Warn on the 1st segmentation failure, then every 30th after.
const FALLBACK_WARN_EVERY: u64 = 30;

/// Overwrite background pixels with `background`: mask==0 selects
/// background, any nonzero value keeps the original pixel. A mask whose
/// dimensions differ from the image is resized (nearest) first so the
/// {0, 255} values survive.
pub fn remove_background(image: &RgbImage, mask: &GrayImage, background: [u8; 3]) -> RgbImage {
    let resized;
    let mask = if mask.dimensions() == image.dimensions() {
        mask
    } else {
        resized = imageops::resize(mask, image.width(), image.height(), FilterType::Nearest);
        &resized
    };

    let mut out = image.clone();
    for (pixel, m) in out.pixels_mut().zip(mask.pixels()) {
        if m.0[0] == 0 {
            pixel.0 = background;
        }
    }
    out
}

/// Per-role frame processing: gripper gets background removal through the
/// segmentation service, top stays raw; both get their configured
/// brightness treatment. Segmentation runs every Nth call with the mask
/// cached in between, and any inference failure falls back to the raw
/// frame for that call.
pub struct DualCameraProcessor {
    config: VisionConfig,
    segmenter: Arc<dyn Segmenter>,
    frame_count: u64,
    cached_masks: Mutex<HashMap<CameraRole, GrayImage>>,
    fallback_warn: LogThrottle,
}

impl DualCameraProcessor {
    pub fn new(config: VisionConfig, segmenter: Arc<dyn Segmenter>) -> Self {
        Self {
            config,
            segmenter,
            frame_count: 0,
            cached_masks: Mutex::new(HashMap::new()),
            fallback_warn: LogThrottle::new(FALLBACK_WARN_EVERY),
        }
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    /// Gate runs on calls 1, N+1, 2N+1, ... for N = max(1, frame skip).
    fn should_run_segmentation(&mut self) -> bool {
        let skip = self.config.segmentation_frame_skip.max(1) as u64;
        self.frame_count += 1;
        (self.frame_count - 1) % skip == 0
    }

    /// Process a frame for its role, returning only the image.
    pub fn process(&mut self, role: CameraRole, image: &RgbImage) -> RgbImage {
        self.process_with_mask(role, image).0
    }

    /// Process a frame identified by its observation key. Keys that map to
    /// no configured role pass through untouched.
    pub fn process_key(&mut self, camera_key: &str, image: &RgbImage) -> RgbImage {
        self.process_key_with_mask(camera_key, image).0
    }

    pub fn process_key_with_mask(
        &mut self,
        camera_key: &str,
        image: &RgbImage,
    ) -> (RgbImage, Option<GrayImage>) {
        match camera_role_for_key(camera_key, &self.config) {
            Some(role) => self.process_with_mask(role, image),
            None => (image.clone(), None),
        }
    }

    /// Process a frame and also return the mask that was applied (None when
    /// the frame went through unmasked), for callers that persist masks.
    pub fn process_with_mask(
        &mut self,
        role: CameraRole,
        image: &RgbImage,
    ) -> (RgbImage, Option<GrayImage>) {
        if !self.config.use_ibr_for_role(role) {
            let mut out = image.clone();
            self.stabilize(&mut out, role);
            return (out, None);
        }

        let run_segmentation = self.should_run_segmentation();
        let mut mask: Option<GrayImage> = None;

        if run_segmentation {
            match self.segmenter.segment(image) {
                Ok(new_mask) => {
                    self.cached_masks.lock().insert(role, new_mask.clone());
                    mask = Some(new_mask);
                }
                Err(e) => {
                    // Raw fallback for this call; the cached mask stays in
                    // place for the next skip-reuse.
                    if self.fallback_warn.tick() {
                        warn!(
                            "Segmentation failed ({}), using raw image (failure {}, warning every {})",
                            e,
                            self.fallback_warn.count(),
                            FALLBACK_WARN_EVERY
                        );
                    }
                    return (image.clone(), None);
                }
            }
        }

        if mask.is_none() {
            mask = self.cached_masks.lock().get(&role).cloned();
        }

        let Some(mask) = mask else {
            // No mask cached yet this session: raw passthrough.
            return (image.clone(), None);
        };

        let mut out = remove_background(image, &mask, self.config.background_color);
        self.stabilize(&mut out, role);
        (out, Some(mask))
    }

    /// Manual brightness/contrast/gamma for the role, then CLAHE on
    /// luminance when the role's stabilize flag is set.
    fn stabilize(&self, image: &mut RgbImage, role: CameraRole) {
        let (brightness, contrast, gamma, stabilize, clip_limit, tile_size) = match role {
            CameraRole::Top => (
                self.config.top_brightness,
                self.config.top_contrast,
                self.config.top_gamma,
                self.config.top_brightness_stabilize,
                self.config.top_brightness_clip_limit,
                self.config.top_brightness_tile_size,
            ),
            CameraRole::Gripper => (
                self.config.gripper_brightness,
                self.config.gripper_contrast,
                self.config.gripper_gamma,
                self.config.gripper_brightness_stabilize,
                self.config.gripper_brightness_clip_limit,
                self.config.gripper_brightness_tile_size,
            ),
        };

        brightness::apply_brightness_contrast_gamma(image, brightness, contrast, gamma);
        if stabilize {
            *image = brightness::clahe_luminance(image, clip_limit, tile_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::SegmentError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Returns an all-foreground mask and counts invocations.
    struct CountingSegmenter {
        calls: AtomicUsize,
    }

    impl CountingSegmenter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Segmenter for CountingSegmenter {
        fn ensure_ready(&self) -> Result<(), SegmentError> {
            Ok(())
        }

        fn segment(&self, frame: &RgbImage) -> Result<GrayImage, SegmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GrayImage::from_pixel(
                frame.width(),
                frame.height(),
                image::Luma([255]),
            ))
        }
    }

    /// Centered foreground rectangle with quarter margins, switchable to
    /// failure mode mid-test.
    struct RectangleSegmenter {
        fail: AtomicBool,
    }

    impl RectangleSegmenter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
            })
        }
    }

    impl Segmenter for RectangleSegmenter {
        fn ensure_ready(&self) -> Result<(), SegmentError> {
            Ok(())
        }

        fn segment(&self, frame: &RgbImage) -> Result<GrayImage, SegmentError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SegmentError::Inference("mock failure".to_string()));
            }
            let (w, h) = frame.dimensions();
            let mut mask = GrayImage::new(w, h);
            for y in h / 4..(3 * h / 4) {
                for x in w / 4..(3 * w / 4) {
                    mask.put_pixel(x, y, image::Luma([255]));
                }
            }
            Ok(mask)
        }
    }

    fn uniform(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb([value, value, value]))
    }

    #[test]
    fn segmentation_runs_on_every_nth_call() {
        let segmenter = CountingSegmenter::new();
        let config = VisionConfig {
            segmentation_frame_skip: 3,
            ..VisionConfig::default()
        };
        let mut processor = DualCameraProcessor::new(config, segmenter.clone());
        let frame = uniform(16, 16, 100);
        for _ in 0..9 {
            processor.process(CameraRole::Gripper, &frame);
        }
        // Calls 1, 4 and 7.
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn frame_skip_zero_runs_every_call() {
        let segmenter = CountingSegmenter::new();
        let config = VisionConfig {
            segmentation_frame_skip: 0,
            ..VisionConfig::default()
        };
        let mut processor = DualCameraProcessor::new(config, segmenter.clone());
        let frame = uniform(8, 8, 100);
        for _ in 0..4 {
            processor.process(CameraRole::Gripper, &frame);
        }
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn skipped_calls_reuse_the_cached_mask() {
        let segmenter = RectangleSegmenter::new();
        let config = VisionConfig {
            segmentation_frame_skip: 2,
            ..VisionConfig::default()
        };
        let mut processor = DualCameraProcessor::new(config, segmenter);
        let frame = uniform(16, 16, 100);

        let (_, first) = processor.process_with_mask(CameraRole::Gripper, &frame);
        let (_, second) = processor.process_with_mask(CameraRole::Gripper, &frame);
        assert_eq!(first.as_ref().unwrap(), second.as_ref().unwrap());
    }

    #[test]
    fn failure_falls_back_to_raw_and_keeps_the_cached_mask() {
        let segmenter = RectangleSegmenter::new();
        let config = VisionConfig {
            segmentation_frame_skip: 2,
            ..VisionConfig::default()
        };
        let mut processor = DualCameraProcessor::new(config, segmenter.clone());
        let frame = uniform(16, 16, 100);

        // Call 1 populates the cache, call 2 reuses it.
        let (_, mask1) = processor.process_with_mask(CameraRole::Gripper, &frame);
        assert!(mask1.is_some());
        processor.process_with_mask(CameraRole::Gripper, &frame);

        // Call 3 is gated in but fails: raw frame, no mask.
        segmenter.fail.store(true, Ordering::SeqCst);
        let (out, mask3) = processor.process_with_mask(CameraRole::Gripper, &frame);
        assert_eq!(out, frame);
        assert!(mask3.is_none());

        // Call 4 is skipped and still finds the old cached mask.
        let (_, mask4) = processor.process_with_mask(CameraRole::Gripper, &frame);
        assert_eq!(mask4.as_ref(), mask1.as_ref());
    }

    #[test]
    fn first_skipped_call_without_cache_passes_through_raw() {
        let segmenter = RectangleSegmenter::new();
        segmenter.fail.store(true, Ordering::SeqCst);
        let config = VisionConfig {
            segmentation_frame_skip: 4,
            ..VisionConfig::default()
        };
        let mut processor = DualCameraProcessor::new(config, segmenter.clone());
        let frame = uniform(16, 16, 77);

        // Call 1 fails; calls 2 and 3 are skipped with nothing cached.
        processor.process(CameraRole::Gripper, &frame);
        segmenter.fail.store(false, Ordering::SeqCst);
        let (out2, mask2) = processor.process_with_mask(CameraRole::Gripper, &frame);
        assert_eq!(out2, frame);
        assert!(mask2.is_none());
    }

    #[test]
    fn ibr_disabled_role_gets_brightness_only() {
        let segmenter = CountingSegmenter::new();
        let config = VisionConfig::default(); // top_use_ibr = false
        let mut processor = DualCameraProcessor::new(config, segmenter.clone());
        let frame = uniform(16, 16, 200);

        let out = processor.process(CameraRole::Top, &frame);
        assert_eq!(out, frame);
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unmapped_keys_pass_through_untouched() {
        let segmenter = CountingSegmenter::new();
        let mut processor = DualCameraProcessor::new(VisionConfig::default(), segmenter.clone());
        let frame = uniform(8, 8, 42);
        let out = processor.process_key("side_cam", &frame);
        assert_eq!(out, frame);
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn background_pixels_take_the_configured_color() {
        let image = uniform(8, 8, 123);
        let mut mask = GrayImage::new(8, 8);
        for y in 2..6 {
            for x in 2..6 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        let out = remove_background(&image, &mask, [255, 255, 255]);
        assert_eq!(out.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(out.get_pixel(3, 3).0, [123, 123, 123]);
    }

    #[test]
    fn mismatched_mask_is_resized_before_compositing() {
        let image = uniform(8, 8, 50);
        // Left half foreground at half resolution.
        let mut mask = GrayImage::new(4, 4);
        for y in 0..4 {
            for x in 0..2 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        let out = remove_background(&image, &mask, [0, 0, 0]);
        assert_eq!(out.get_pixel(1, 1).0, [50, 50, 50]);
        assert_eq!(out.get_pixel(6, 6).0, [0, 0, 0]);
    }

    #[test]
    fn gripper_normalization_applies_after_masking() {
        let segmenter = RectangleSegmenter::new();
        let config = VisionConfig {
            gripper_gamma: 2.0,
            ..VisionConfig::default()
        };
        let mut processor = DualCameraProcessor::new(config, segmenter);
        let frame = uniform(16, 16, 100);
        let out = processor.process(CameraRole::Gripper, &frame);
        // Background stays black (0 is a gamma fixed point), foreground 100
        // maps through (100/255)^2 * 255 = 39.
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(8, 8).0, [39, 39, 39]);
    }

    #[test]
    fn masks_are_cached_per_role() {
        let segmenter = RectangleSegmenter::new();
        let config = VisionConfig {
            top_use_ibr: true,
            segmentation_frame_skip: 1,
            ..VisionConfig::default()
        };
        let mut processor = DualCameraProcessor::new(config, segmenter.clone());

        let gripper_frame = uniform(16, 16, 100);
        let top_frame = uniform(32, 32, 200);
        processor.process(CameraRole::Gripper, &gripper_frame);
        processor.process(CameraRole::Top, &top_frame);

        let masks = processor.cached_masks.lock();
        assert_eq!(masks.get(&CameraRole::Gripper).unwrap().dimensions(), (16, 16));
        assert_eq!(masks.get(&CameraRole::Top).unwrap().dimensions(), (32, 32));
    }
}
