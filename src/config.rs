use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

use crate::roles::CameraRole;

/// Single source of truth for the dual-camera vision pipeline parameters.
/// Loaded once at startup; not mutated during operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Run background removal on the gripper camera
    pub gripper_use_ibr: bool,
    /// Run background removal on the top camera
    pub top_use_ibr: bool,
    /// Path to the exported ONNX segmentation model; empty disables IBR
    pub segmentation_model_path: String,
    /// Detection confidence threshold
    pub segmentation_confidence: f32,
    /// IoU threshold for non-maximum suppression
    pub segmentation_iou_threshold: f32,
    /// Run segmentation every Nth frame, reusing the cached mask between runs
    pub segmentation_frame_skip: u32,
    /// Inference device: "auto", "cpu" or "cuda"
    pub device: String,
    /// Color written over background pixels (RGB)
    pub background_color: [u8; 3],
    /// Observation key of the gripper camera
    pub gripper_camera_key: String,
    /// Observation key of the top camera
    pub top_camera_key: String,

    // Top view: stabilize brightness so it looks similar in any lighting (CLAHE on luminance).
    pub top_brightness_stabilize: bool,
    /// CLAHE clip limit (higher = more contrast)
    pub top_brightness_clip_limit: f32,
    /// CLAHE grid size (8 = 8x8 tiles)
    pub top_brightness_tile_size: u32,
    /// Luminance scale: <1 darker, >1 brighter (e.g. 0.6 to reduce overexposure)
    pub top_brightness: f32,
    /// Contrast around the 128 midpoint: >1 more, <1 less
    pub top_contrast: f32,
    /// Gamma: >1 darken (e.g. 1.2~1.5 for overexposed), <1 brighten
    pub top_gamma: f32,

    // Gripper view: same knobs, applied after IBR when enabled.
    pub gripper_brightness_stabilize: bool,
    pub gripper_brightness_clip_limit: f32,
    pub gripper_brightness_tile_size: u32,
    pub gripper_brightness: f32,
    pub gripper_contrast: f32,
    pub gripper_gamma: f32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            gripper_use_ibr: true,
            top_use_ibr: false,
            segmentation_model_path: String::new(),
            segmentation_confidence: 0.35,
            segmentation_iou_threshold: 0.5,
            segmentation_frame_skip: 2,
            device: "auto".to_string(),
            background_color: [0, 0, 0],
            gripper_camera_key: "gripper".to_string(),
            top_camera_key: "top".to_string(),
            top_brightness_stabilize: false,
            top_brightness_clip_limit: 2.0,
            top_brightness_tile_size: 8,
            top_brightness: 1.0,
            top_contrast: 1.0,
            top_gamma: 1.0,
            gripper_brightness_stabilize: false,
            gripper_brightness_clip_limit: 2.0,
            gripper_brightness_tile_size: 8,
            gripper_brightness: 1.0,
            gripper_contrast: 1.0,
            gripper_gamma: 1.0,
        }
    }
}

impl VisionConfig {
    /// Load from an optional YAML, JSON or TOML file. Any failure (missing
    /// file, unknown extension, parse error) logs a warning and falls back
    /// to defaults; callers never see an error from here.
    pub async fn load<P: AsRef<Path>>(path: Option<P>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Self::default();
        }

        if !path.exists() {
            warn!("Vision config path does not exist: {}. Using defaults.", path.display());
            return Self::default();
        }

        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to read vision config {}: {}. Using defaults.", path.display(), e);
                return Self::default();
            }
        };

        let parsed = match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str::<Self>(&raw).map_err(|e| e.to_string())
            }
            Some("json") => serde_json::from_str::<Self>(&raw).map_err(|e| e.to_string()),
            Some("toml") => toml::from_str::<Self>(&raw).map_err(|e| e.to_string()),
            other => {
                warn!(
                    "Unknown vision config extension: {:?}. Using defaults.",
                    other.unwrap_or("")
                );
                return Self::default();
            }
        };

        match parsed {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid vision config {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Whether background removal is requested for the camera with this key.
    pub fn use_ibr_for_key(&self, camera_key: &str) -> bool {
        if camera_key == self.gripper_camera_key {
            self.gripper_use_ibr
        } else if camera_key == self.top_camera_key {
            self.top_use_ibr
        } else {
            false
        }
    }

    /// Whether background removal is requested for this role.
    pub fn use_ibr_for_role(&self, role: CameraRole) -> bool {
        match role {
            CameraRole::Gripper => self.gripper_use_ibr,
            CameraRole::Top => self.top_use_ibr,
        }
    }

    /// True when a model path is configured and the file exists on disk.
    pub fn model_file_available(&self) -> bool {
        !self.segmentation_model_path.is_empty()
            && Path::new(&self.segmentation_model_path).exists()
    }
}
