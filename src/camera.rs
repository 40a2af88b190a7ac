use anyhow::{Result, anyhow};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use tracing::{debug, error, info, warn};

/// Capture settings for a single physical camera.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// One live camera feed delivering RGB frames.
pub struct CameraFeed {
    settings: CameraSettings,
    camera: Option<Camera>,
    is_initialized: bool,
}

impl CameraFeed {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            settings,
            camera: None,
            is_initialized: false,
        }
    }

    /// Index of the camera actually opened (may differ from the requested
    /// one after fallback).
    pub fn index(&self) -> u32 {
        self.settings.index
    }

    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing camera feed - scanning for available cameras");

        let available_cameras = Self::detect_cameras();
        if available_cameras.is_empty() {
            return Err(anyhow!("No cameras detected on this system"));
        }

        info!(
            "Found {} camera(s): {:?}",
            available_cameras.len(),
            available_cameras
        );

        // Try the requested camera first, then fall back to whatever exists.
        let camera_indices = if available_cameras.contains(&self.settings.index) {
            vec![self.settings.index]
        } else {
            available_cameras
        };

        for cam_id in camera_indices {
            match self.try_initialize_camera(cam_id) {
                Ok(_) => {
                    self.settings.index = cam_id;
                    info!("Successfully initialized camera {}", cam_id);
                    break;
                }
                Err(e) => {
                    warn!("Failed to initialize camera {}: {}", cam_id, e);
                    continue;
                }
            }
        }

        if !self.is_initialized {
            return Err(anyhow!("Failed to initialize any available camera"));
        }

        Ok(())
    }

    fn try_initialize_camera(&mut self, camera_id: u32) -> Result<()> {
        let camera_index = CameraIndex::Index(camera_id);
        let format = CameraFormat::new(
            Resolution::new(self.settings.width, self.settings.height),
            FrameFormat::MJPEG,
            self.settings.fps,
        );

        // Ask for the configured format first; not every device honors it.
        let mut camera = match Camera::new(
            camera_index.clone(),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format)),
        ) {
            Ok(camera) => camera,
            Err(e) => {
                debug!(
                    "Camera {} rejected {}x{}@{}fps ({}), retrying with highest frame rate",
                    camera_id, self.settings.width, self.settings.height, self.settings.fps, e
                );
                Camera::new(
                    camera_index,
                    RequestedFormat::new::<RgbFormat>(
                        RequestedFormatType::AbsoluteHighestFrameRate,
                    ),
                )?
            }
        };

        camera.open_stream()?;

        // Test capture a frame to ensure the stream actually delivers.
        let _test_frame = camera.frame()?;

        self.camera = Some(camera);
        self.is_initialized = true;

        Ok(())
    }

    pub fn detect_cameras() -> Vec<u32> {
        let mut cameras = Vec::new();

        // Try camera indices 0-9 (most common range)
        for cam_id in 0..10 {
            let camera_index = CameraIndex::Index(cam_id);
            let requested_format =
                RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);

            if let Ok(_camera) = Camera::new(camera_index, requested_format) {
                cameras.push(cam_id);
            }
        }

        cameras
    }

    pub fn capture_frame(&mut self) -> Result<RgbImage> {
        if !self.is_initialized {
            return Err(anyhow!("Camera feed not initialized"));
        }

        if let Some(ref mut camera) = self.camera {
            match camera.frame() {
                Ok(frame) => {
                    let decoded = frame.decode_image::<RgbFormat>()?;
                    debug!(
                        "Captured camera frame: {}x{}",
                        decoded.width(),
                        decoded.height()
                    );
                    Ok(decoded)
                }
                Err(e) => {
                    error!("Camera frame capture failed: {}", e);
                    Err(anyhow!("Camera frame capture error: {}", e))
                }
            }
        } else {
            Err(anyhow!("Camera not initialized"))
        }
    }

    pub fn stop(&mut self) {
        if let Some(ref mut camera) = self.camera {
            match camera.stop_stream() {
                Ok(_) => info!("Camera {} stream stopped", self.settings.index),
                Err(e) => warn!("Error stopping camera stream: {}", e),
            }
        }

        self.camera = None;
        self.is_initialized = false;
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        if self.is_initialized {
            if let Some(ref mut camera) = self.camera {
                let _ = camera.stop_stream();
            }
        }
    }
}
