use thiserror::Error;

/// Errors surfaced across the public pipeline boundary.
///
/// Per-cycle estimation failures are never reported here; they are absorbed
/// into the state snapshot's quality fields.
#[derive(Debug, Error)]
pub enum VioError {
    /// The configuration names a camera-model family this build does not know.
    /// This is the only error that should abort pipeline construction.
    #[error("unrecognized camera model family '{0}'")]
    UnknownCameraModel(String),

    /// The camera section is present but lacks required parameters. Callers
    /// should log a warning and run without geometric undistortion.
    #[error("camera calibration incomplete: {0}")]
    MissingCalibration(String),

    /// A control-surface call was made in the wrong scheduler state.
    #[error("invalid pipeline transition: {0}")]
    InvalidTransition(&'static str),
}
