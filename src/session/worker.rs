use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;

use crate::error::{Result, SessionError};
use crate::segmentation::{run_inference, InferenceOutcome, InferenceRequest, SegmentationBackend};

pub(crate) type SharedBackend = Arc<Mutex<Box<dyn SegmentationBackend>>>;

/// Run an inference against the session's backend
///
/// With a deadline the call runs on a named worker thread. A worker that
/// misses the deadline cannot be interrupted; it keeps the backend locked
/// until it finishes and its result is dropped.
pub(crate) fn dispatch(
    backend: &SharedBackend,
    request: InferenceRequest,
    deadline: Option<Duration>,
) -> Result<InferenceOutcome> {
    let Some(limit) = deadline else {
        let mut guard = lock(backend).map_err(SessionError::backend)?;
        return run_inference(&mut **guard, &request).map_err(SessionError::backend);
    };

    let (tx, rx) = mpsc::channel();
    let worker_backend = Arc::clone(backend);
    thread::Builder::new()
        .name("maskforge-inference".into())
        .spawn(move || {
            let result = lock(&worker_backend)
                .and_then(|mut guard| run_inference(&mut **guard, &request));
            // The receiver is gone when the deadline already passed
            let _ = tx.send(result);
        })
        .map_err(|e| SessionError::Backend(format!("Failed to spawn inference worker: {e}")))?;

    match rx.recv_timeout(limit) {
        Ok(result) => result.map_err(SessionError::backend),
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!("Inference exceeded {:?}, discarding its result", limit);
            Err(SessionError::BackendTimeout(limit))
        }
        Err(RecvTimeoutError::Disconnected) => Err(SessionError::Backend(
            "Inference worker exited without a result".to_string(),
        )),
    }
}

fn lock(backend: &SharedBackend) -> anyhow::Result<MutexGuard<'_, Box<dyn SegmentationBackend>>> {
    backend
        .lock()
        .map_err(|_| anyhow!("Segmentation backend poisoned by an earlier panic"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Mask;
    use crate::prompt::PromptPoint;
    use crate::segmentation::{EmbeddingSlot, Prediction, ScriptedBackend};
    use image::RgbImage;

    fn request() -> InferenceRequest {
        InferenceRequest {
            image: Arc::new(RgbImage::new(4, 4)),
            points: vec![PromptPoint::foreground(1.0, 1.0)],
            boxes: Vec::new(),
            embedding: EmbeddingSlot::new(),
        }
    }

    fn shared(backend: ScriptedBackend) -> SharedBackend {
        Arc::new(Mutex::new(Box::new(backend)))
    }

    #[test]
    fn inline_and_worker_paths_agree() {
        let answer = vec![Prediction::new(Mask::rect(4, 4, 0, 0, 1, 1), 0.9)];
        let backend = shared(
            ScriptedBackend::new()
                .with_prediction(answer.clone())
                .with_prediction(answer),
        );

        let inline = dispatch(&backend, request(), None).unwrap();
        let threaded = dispatch(&backend, request(), Some(Duration::from_secs(5))).unwrap();
        assert_eq!(inline.masks, threaded.masks);
    }

    #[test]
    fn slow_backend_times_out() {
        let backend = shared(
            ScriptedBackend::new()
                .with_delay(Duration::from_millis(300))
                .with_prediction(vec![Prediction::new(Mask::new(4, 4), 0.5)]),
        );

        let err = dispatch(&backend, request(), Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, SessionError::BackendTimeout(_)));
        assert_eq!(err.code(), "BACKEND_TIMEOUT");
    }

    #[test]
    fn backend_failure_is_reported() {
        let backend = shared(ScriptedBackend::unavailable("no model loaded"));
        let err = dispatch(&backend, request(), None).unwrap_err();
        assert_eq!(err.code(), "BACKEND_ERROR");
        assert!(err.to_string().contains("no model loaded"));
    }
}
