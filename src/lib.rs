pub mod brightness;
pub mod camera;
pub mod config;
pub mod processor;
pub mod roles;
pub mod segmenter;
pub mod throttle;
pub mod worker;
pub mod yolo;

pub use brightness::BrightnessReducer;
pub use config::VisionConfig;
pub use processor::DualCameraProcessor;
pub use roles::{camera_role_for_key, CameraRole};
pub use segmenter::{SegmentError, Segmenter, YoloSegmenter};
pub use worker::{ObservationFrames, ProcessedObservation, VisionWorker};
