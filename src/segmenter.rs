use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use ndarray::{Array4, Axis, Ix2, Ix3};
use ort::session::builder::SessionBuilder;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::VisionConfig;
use crate::yolo;

/// Hard cap on detections surviving NMS.
pub const MAX_DETECTIONS: usize = 300;
/// Side length of the square model input.
const INPUT_SIZE: u32 = 640;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segmentation model file not found: {0}")]
    ModelFileMissing(PathBuf),
    #[error("failed to load segmentation model: {0}")]
    ModelLoad(String),
    #[error("segmentation inference failed: {0}")]
    Inference(String),
    #[error("unexpected segmentation model output: {0}")]
    Output(String),
}

/// Seam between the processor and the model runtime. The production
/// implementation is [`YoloSegmenter`]; tests substitute mocks.
pub trait Segmenter: Send + Sync {
    /// Load the model if not already loaded. Idempotent and thread-safe;
    /// meant to be called once during startup so the first control-loop
    /// tick does not pay the load cost.
    fn ensure_ready(&self) -> Result<(), SegmentError>;

    /// Segment one frame into a combined foreground mask: same dimensions
    /// as the frame, 255 on any detected instance, 0 elsewhere.
    fn segment(&self, frame: &RgbImage) -> Result<GrayImage, SegmentError>;
}

/// A committed session together with the tensor names it was exported with.
struct LoadedModel {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
}

/// ONNX YOLO-seg model behind a single inference lock. The lock covers both
/// the lazy load and each `run`, so concurrent callers cannot race the
/// initialization and inferences execute one at a time.
pub struct YoloSegmenter {
    model_path: PathBuf,
    confidence_threshold: f32,
    iou_threshold: f32,
    device: String,
    session: Mutex<Option<LoadedModel>>,
}

impl YoloSegmenter {
    pub fn new<P: Into<PathBuf>>(
        model_path: P,
        confidence_threshold: f32,
        iou_threshold: f32,
        device: impl Into<String>,
    ) -> Self {
        Self {
            model_path: model_path.into(),
            confidence_threshold,
            iou_threshold,
            device: device.into(),
            session: Mutex::new(None),
        }
    }

    pub fn from_config(config: &VisionConfig) -> Self {
        Self::new(
            Path::new(&config.segmentation_model_path),
            config.segmentation_confidence,
            config.segmentation_iou_threshold,
            config.device.clone(),
        )
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn select_execution_provider(
        &self,
        builder: SessionBuilder,
    ) -> Result<SessionBuilder, SegmentError> {
        match self.device.as_str() {
            "cpu" => Ok(builder),
            #[cfg(feature = "cuda")]
            "cuda" => {
                use ort::ep::ExecutionProvider;
                use ort::execution_providers::CUDAExecutionProvider;
                let ep = CUDAExecutionProvider::default();
                debug!(
                    "CUDA execution provider available: {}",
                    ep.is_available().unwrap_or(false)
                );
                builder
                    .with_execution_providers([ep.build()])
                    .map_err(|e| SegmentError::ModelLoad(e.to_string()))
            }
            #[cfg(not(feature = "cuda"))]
            "cuda" => Err(SegmentError::ModelLoad(
                "device 'cuda' requested but built without the cuda feature".to_string(),
            )),
            other => {
                if other != "auto" {
                    debug!("Unrecognized device '{}', treating as auto", other);
                }
                #[cfg(feature = "cuda")]
                {
                    use ort::ep::ExecutionProvider;
                    use ort::execution_providers::CUDAExecutionProvider;
                    let ep = CUDAExecutionProvider::default();
                    if ep.is_available().unwrap_or(false) {
                        return builder
                            .with_execution_providers([ep.build()])
                            .map_err(|e| SegmentError::ModelLoad(e.to_string()));
                    }
                }
                Ok(builder)
            }
        }
    }

    fn load_session(&self) -> Result<LoadedModel, SegmentError> {
        if !self.model_path.exists() {
            return Err(SegmentError::ModelFileMissing(self.model_path.clone()));
        }

        info!(
            "Loading segmentation model from {} (device: {})",
            self.model_path.display(),
            self.device
        );
        let builder =
            Session::builder().map_err(|e| SegmentError::ModelLoad(e.to_string()))?;
        let builder = self.select_execution_provider(builder)?;
        let session = builder
            .with_intra_threads(4)
            .map_err(|e| SegmentError::ModelLoad(e.to_string()))?
            .commit_from_file(&self.model_path)
            .map_err(|e| SegmentError::ModelLoad(e.to_string()))?;

        let input_name = match session.inputs().first() {
            Some(input) => input.name().to_string(),
            None => {
                return Err(SegmentError::Output(
                    "model declares no input tensors".to_string(),
                ))
            }
        };
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();
        if output_names.len() < 2 {
            return Err(SegmentError::Output(format!(
                "expected detection and prototype outputs, got {}",
                output_names.len()
            )));
        }

        info!("Segmentation model loaded");
        Ok(LoadedModel {
            session,
            input_name,
            output_names,
        })
    }

    fn ensure_loaded<'a>(
        &self,
        slot: &'a mut Option<LoadedModel>,
    ) -> Result<&'a mut LoadedModel, SegmentError> {
        if slot.is_none() {
            *slot = Some(self.load_session()?);
        }
        match slot.as_mut() {
            Some(loaded) => Ok(loaded),
            None => Err(SegmentError::ModelLoad(
                "session slot empty after load".to_string(),
            )),
        }
    }

    /// Resize to the model input square and lay out as [1, 3, H, W] in [0, 1].
    fn preprocess(frame: &RgbImage) -> Array4<f32> {
        let resized = imageops::resize(frame, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let side = INPUT_SIZE as usize;
        let mut input = Array4::zeros((1, 3, side, side));
        for y in 0..side {
            for x in 0..side {
                let pixel = resized.get_pixel(x as u32, y as u32);
                input[[0, 0, y, x]] = pixel.0[0] as f32 / 255.0;
                input[[0, 1, y, x]] = pixel.0[1] as f32 / 255.0;
                input[[0, 2, y, x]] = pixel.0[2] as f32 / 255.0;
            }
        }
        input
    }
}

impl Segmenter for YoloSegmenter {
    fn ensure_ready(&self) -> Result<(), SegmentError> {
        let mut slot = self.session.lock();
        self.ensure_loaded(&mut slot).map(|_| ())
    }

    fn segment(&self, frame: &RgbImage) -> Result<GrayImage, SegmentError> {
        let (frame_w, frame_h) = frame.dimensions();
        let input = Self::preprocess(frame);

        let mut slot = self.session.lock();
        let LoadedModel {
            session,
            input_name,
            output_names,
        } = self.ensure_loaded(&mut slot)?;

        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| SegmentError::Inference(e.to_string()))?;
        let outputs = session
            .run(ort::inputs![input_name.as_str() => tensor])
            .map_err(|e| SegmentError::Inference(e.to_string()))?;

        let pred_view = outputs[output_names[0].as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| SegmentError::Output(e.to_string()))?;
        let proto_view = outputs[output_names[1].as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| SegmentError::Output(e.to_string()))?;

        let pred_shape = pred_view.shape().to_vec();
        if pred_shape.len() != 3
            || pred_shape[0] != 1
            || pred_shape[1] < yolo::BBOX_CHANNELS + yolo::NUM_CLASSES
        {
            return Err(SegmentError::Output(format!(
                "detection output shape {:?} not [1, channels, anchors]",
                pred_shape
            )));
        }
        let proto_shape = proto_view.shape().to_vec();
        if proto_shape.len() != 4 || proto_shape[0] != 1 {
            return Err(SegmentError::Output(format!(
                "prototype output shape {:?} not [1, protos, h, w]",
                proto_shape
            )));
        }
        let num_coeffs = pred_shape[1] - yolo::BBOX_CHANNELS - yolo::NUM_CLASSES;
        if proto_shape[1] != num_coeffs {
            return Err(SegmentError::Output(format!(
                "{} mask coefficients but {} prototypes",
                num_coeffs, proto_shape[1]
            )));
        }

        let pred = pred_view
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| SegmentError::Output(e.to_string()))?;
        let protos = proto_view
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix3>()
            .map_err(|e| SegmentError::Output(e.to_string()))?;

        let candidates =
            yolo::decode_candidates(&pred, self.confidence_threshold, INPUT_SIZE as f32);
        if candidates.is_empty() {
            // Nothing detected: all-background mask, not an error.
            return Ok(GrayImage::new(frame_w, frame_h));
        }
        let kept = yolo::non_max_suppression(candidates, self.iou_threshold, MAX_DETECTIONS);
        debug!("Segmentation kept {} instances", kept.len());

        Ok(yolo::combine_masks(
            &kept,
            &protos,
            INPUT_SIZE as f32,
            frame_w,
            frame_h,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_file_surfaces_at_ensure_ready() {
        let segmenter = YoloSegmenter::new("/nonexistent/model.onnx", 0.35, 0.5, "cpu");
        let err = segmenter.ensure_ready().unwrap_err();
        assert!(matches!(err, SegmentError::ModelFileMissing(_)));
    }

    #[test]
    fn missing_model_file_surfaces_at_first_segment() {
        let segmenter = YoloSegmenter::new("/nonexistent/model.onnx", 0.35, 0.5, "cpu");
        let frame = RgbImage::new(32, 24);
        let err = segmenter.segment(&frame).unwrap_err();
        assert!(matches!(err, SegmentError::ModelFileMissing(_)));
    }

    #[test]
    fn empty_model_path_counts_as_missing() {
        let config = VisionConfig::default();
        let segmenter = YoloSegmenter::from_config(&config);
        assert!(matches!(
            segmenter.ensure_ready().unwrap_err(),
            SegmentError::ModelFileMissing(_)
        ));
    }
}
