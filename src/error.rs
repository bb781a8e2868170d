use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionId;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Failures surfaced by the annotation session
///
/// Every variant is reported at the request boundary as a structured failure;
/// only `DimensionMismatch` means the offending input was unusable.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Mask layer store is empty")]
    EmptyStore,

    #[error("Invalid range: cannot keep {requested} of {len} entries")]
    InvalidRange { requested: usize, len: usize },

    #[error("Invalid stroke color {rgb:?}: expected pure red or pure blue")]
    InvalidStrokeColor { rgb: [u8; 3] },

    #[error("Mask is {actual:?} but image is {expected:?} (width, height)")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Dilation kernel {0} outside 0..=20")]
    InvalidDilation(u32),

    #[error("Blur level {0} outside 0..=25")]
    InvalidBlur(u32),

    #[error("Segmentation backend failed: {0}")]
    Backend(String),

    #[error("Segmentation backend did not answer within {0:?}")]
    BackendTimeout(Duration),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unknown session {0}")]
    UnknownSession(SessionId),
}

impl SessionError {
    pub(crate) fn backend(err: anyhow::Error) -> Self {
        SessionError::Backend(format!("{err:#}"))
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SessionError::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable code handed to the transport layer
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Precondition(_) => "PRECONDITION",
            SessionError::EmptyStore => "EMPTY_STORE",
            SessionError::InvalidRange { .. } => "INVALID_RANGE",
            SessionError::InvalidStrokeColor { .. } => "INVALID_STROKE_COLOR",
            SessionError::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            SessionError::InvalidDilation(_) => "INVALID_DILATION",
            SessionError::InvalidBlur(_) => "INVALID_BLUR",
            SessionError::Backend(_) => "BACKEND_ERROR",
            SessionError::BackendTimeout(_) => "BACKEND_TIMEOUT",
            SessionError::Io { .. } => "IO_ERROR",
            SessionError::Image(_) => "IMAGE_CODEC",
            SessionError::UnknownSession(_) => "UNKNOWN_SESSION",
        }
    }

    /// Whether the session stays usable after this failure
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SessionError::DimensionMismatch { .. })
    }
}
