//! Error types for the BOE client

use thiserror::Error;
use tracing::warn;

use crate::native::{NativeModule, NativeOp, NativeResult};

/// Result type alias for BOE operations
pub type Result<T> = std::result::Result<T, BoeError>;

/// Errors surfaced by the BOE client
#[derive(Debug, Error)]
pub enum BoeError {
    /// Module initialization or release failed
    #[error("Init failed: {0}")]
    InitFailed(String),

    /// Event type outside the module's reserved range
    #[error("Unknown event type: {0}")]
    UnknownEvent(u32),

    /// Bound account could not be read
    #[error("Get bind account failed: {0}")]
    GetAccountFailed(String),

    /// Serial number could not be read
    #[error("Get serial number failed: {0}")]
    GetSnFailed(String),

    /// Hardware authentication signing failed
    #[error("Hardware sign failed: {0}")]
    HwSignFailed(String),

    /// Signature could not be validated by either recovery path
    #[error("Signature check failed: {0}")]
    SignCheckFailed(String),

    /// Next hash derivation failed
    #[error("Get next hash failed: {0}")]
    GetNextHashFailed(String),

    /// Firmware update failed
    #[error("Firmware update failed: {0}")]
    UpdateFailed(String),

    /// Firmware update abort failed
    #[error("Firmware update abort failed: {0}")]
    UpdateAbortFailed(String),

    /// Hardware entropy could not be read
    #[error("Get random failed: {0}")]
    GetRandomFailed(String),

    /// Module version could not be read
    #[error("Get version failed: {0}")]
    GetVersionFailed(String),

    /// Release image could not be resolved or downloaded
    #[error("Release fetch failed: {0}")]
    ReleaseFetch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BoeError {
    fn from(e: serde_json::Error) -> Self {
        BoeError::Serialization(e.to_string())
    }
}

impl NativeOp {
    /// Public error kind for a failure of this operation
    pub fn into_error(self, detail: String) -> BoeError {
        match self {
            NativeOp::Init | NativeOp::Release | NativeOp::HwCheck => BoeError::InitFailed(detail),
            NativeOp::GetBindAccount => BoeError::GetAccountFailed(detail),
            NativeOp::GetSerialNumber => BoeError::GetSnFailed(detail),
            NativeOp::GetVersion => BoeError::GetVersionFailed(detail),
            NativeOp::GetRandom => BoeError::GetRandomFailed(detail),
            NativeOp::HwSign => BoeError::HwSignFailed(detail),
            NativeOp::HwVerify | NativeOp::ValidSign => BoeError::SignCheckFailed(detail),
            NativeOp::NextHash => BoeError::GetNextHashFailed(detail),
            NativeOp::Upgrade => BoeError::UpdateFailed(detail),
            NativeOp::UpgradeAbort => BoeError::UpdateAbortFailed(detail),
        }
    }
}

/// Translate a native result into the public error taxonomy
///
/// On failure the native code and message are logged, the error context is
/// returned to the module through [`NativeModule::free_error`], and the
/// error kind belonging to `op` is produced.
pub fn map_native<T>(native: &dyn NativeModule, op: NativeOp, ret: NativeResult<T>) -> Result<T> {
    ret.map_err(|err| {
        warn!("{} ecode:{}, emsg:{}", op, err.code, err.message);
        let detail = format!("{} returned ecode {}: {}", op, err.code, err.message);
        native.free_error(err);
        op.into_error(detail)
    })
}
