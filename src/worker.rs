use anyhow::{Context, Result};
use crossbeam::channel::{self, Sender, TrySendError};
use image::{GrayImage, RgbImage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

use crate::processor::DualCameraProcessor;

/// One tick's worth of camera frames, keyed by observation name.
#[derive(Debug, Clone)]
pub struct ObservationFrames {
    pub frames: Vec<(String, RgbImage)>,
    pub captured_at: Instant,
}

impl ObservationFrames {
    pub fn new(frames: Vec<(String, RgbImage)>) -> Self {
        Self {
            frames,
            captured_at: Instant::now(),
        }
    }
}

/// Processed counterpart published by the worker.
#[derive(Debug)]
pub struct ProcessedObservation {
    pub frames: Vec<(String, RgbImage)>,
    /// Mask applied to the gripper frame, when one was.
    pub gripper_mask: Option<GrayImage>,
    pub captured_at: Instant,
    pub processed_at: Instant,
}

/// Runs the dual-camera processor on its own thread. Frames go in through
/// a bounded size-1 channel with a non-blocking send, so a slow inference
/// drops frames instead of building a backlog; results land in a
/// single-slot buffer the control loop reads without blocking. Reads may
/// be stale; freshness is best-effort.
pub struct VisionWorker {
    sender: Option<Sender<ObservationFrames>>,
    latest: Arc<Mutex<Option<Arc<ProcessedObservation>>>>,
    handle: Option<JoinHandle<()>>,
    dropped: u64,
}

impl VisionWorker {
    /// Move the processor onto a background thread.
    pub fn spawn(mut processor: DualCameraProcessor) -> Result<Self> {
        let (sender, receiver) = channel::bounded::<ObservationFrames>(1);
        let latest: Arc<Mutex<Option<Arc<ProcessedObservation>>>> = Arc::new(Mutex::new(None));

        let slot = latest.clone();
        let handle = thread::Builder::new()
            .name("vision-worker".to_string())
            .spawn(move || {
                debug!("Vision worker started");
                // Ends when the sender side is dropped.
                for observation in receiver.iter() {
                    let processed = process_observation(&mut processor, observation);
                    *slot.lock() = Some(Arc::new(processed));
                }
                debug!("Vision worker stopped");
            })
            .context("failed to spawn vision worker thread")?;

        Ok(Self {
            sender: Some(sender),
            latest,
            handle: Some(handle),
            dropped: 0,
        })
    }

    /// Non-blocking submit. Returns false when the frames were dropped
    /// because the worker is still busy with the previous set.
    pub fn submit(&mut self, observation: ObservationFrames) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        match sender.try_send(observation) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Vision worker is gone; frame dropped");
                false
            }
        }
    }

    /// Latest processed observation, if any has been published yet.
    pub fn latest(&self) -> Option<Arc<ProcessedObservation>> {
        self.latest.lock().clone()
    }

    /// Frames dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Disconnect the queue and wait for the worker to drain and exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Vision worker thread panicked");
            }
        }
    }
}

impl Drop for VisionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process_observation(
    processor: &mut DualCameraProcessor,
    observation: ObservationFrames,
) -> ProcessedObservation {
    let gripper_key = processor.config().gripper_camera_key.clone();
    let mut frames = Vec::with_capacity(observation.frames.len());
    let mut gripper_mask = None;

    for (key, frame) in observation.frames {
        let (processed, mask) = processor.process_key_with_mask(&key, &frame);
        if key == gripper_key {
            gripper_mask = mask;
        }
        frames.push((key, processed));
    }

    ProcessedObservation {
        frames,
        gripper_mask,
        captured_at: observation.captured_at,
        processed_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VisionConfig;
    use crate::segmenter::{SegmentError, Segmenter};
    use std::time::Duration;

    /// All-foreground mask, so processing with neutral brightness is an
    /// identity and outputs are easy to assert on.
    struct PassSegmenter;

    impl Segmenter for PassSegmenter {
        fn ensure_ready(&self) -> Result<(), SegmentError> {
            Ok(())
        }

        fn segment(&self, frame: &RgbImage) -> Result<GrayImage, SegmentError> {
            Ok(GrayImage::from_pixel(
                frame.width(),
                frame.height(),
                image::Luma([255]),
            ))
        }
    }

    /// Blocks inside segment() until released, and reports when entered.
    struct GatedSegmenter {
        entered: Sender<()>,
        release: channel::Receiver<()>,
    }

    impl Segmenter for GatedSegmenter {
        fn ensure_ready(&self) -> Result<(), SegmentError> {
            Ok(())
        }

        fn segment(&self, frame: &RgbImage) -> Result<GrayImage, SegmentError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(GrayImage::new(frame.width(), frame.height()))
        }
    }

    fn uniform(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb([value, value, value]))
    }

    fn wait_for_latest(worker: &VisionWorker) -> Arc<ProcessedObservation> {
        for _ in 0..200 {
            if let Some(obs) = worker.latest() {
                return obs;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("worker never published an observation");
    }

    #[test]
    fn worker_publishes_processed_observations() {
        let processor =
            DualCameraProcessor::new(VisionConfig::default(), Arc::new(PassSegmenter));
        let mut worker = VisionWorker::spawn(processor).unwrap();
        assert!(worker.latest().is_none());

        let frames = ObservationFrames::new(vec![
            ("gripper".to_string(), uniform(16, 16, 100)),
            ("top".to_string(), uniform(16, 16, 200)),
        ]);
        assert!(worker.submit(frames));

        let obs = wait_for_latest(&worker);
        assert_eq!(obs.frames.len(), 2);
        assert_eq!(obs.frames[0].0, "gripper");
        assert_eq!(obs.frames[0].1, uniform(16, 16, 100));
        assert_eq!(obs.frames[1].1, uniform(16, 16, 200));
        assert!(obs.gripper_mask.is_some());
        assert!(obs.processed_at >= obs.captured_at);

        worker.shutdown();
    }

    #[test]
    fn full_queue_drops_frames_instead_of_blocking() {
        let (entered_tx, entered_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        let segmenter = GatedSegmenter {
            entered: entered_tx,
            release: release_rx,
        };
        let processor = DualCameraProcessor::new(VisionConfig::default(), Arc::new(segmenter));
        let mut worker = VisionWorker::spawn(processor).unwrap();

        let obs = || ObservationFrames::new(vec![("gripper".to_string(), uniform(8, 8, 10))]);

        // First set is dequeued and blocks inside the segmenter.
        assert!(worker.submit(obs()));
        entered_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("worker never started processing");

        // Second set parks in the size-1 queue; third has nowhere to go.
        assert!(worker.submit(obs()));
        assert!(!worker.submit(obs()));
        assert_eq!(worker.dropped(), 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        worker.shutdown();
    }
}
