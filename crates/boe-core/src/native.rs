//! Call contract of the native BOE module
//!
//! The board firmware is reached through a synchronous, blocking call
//! interface. Every call either succeeds or yields a [`NativeError`] holding
//! the native error code and message. A native error context must be handed
//! back to [`NativeModule::free_error`] once it has been read; the mapper in
//! [`crate::error::map_native`] does this for every failure it translates.
//!
//! Fixed-size buffers are expressed as arrays so that a call with an
//! undersized input cannot be written.

use std::fmt;
use std::sync::Arc;

/// Length of the bound account identifier buffer
pub const ACCOUNT_LEN: usize = 42;

/// Length of a hardware random value
pub const RANDOM_LEN: usize = 32;

/// Length of a hardware authentication signature (r || s)
pub const AUTH_SIGNATURE_LEN: usize = 64;

/// Length of a host identifier used in hardware authentication
pub const HOST_ID_LEN: usize = 32;

/// Length of a challenger identifier (uncompressed public key, X || Y)
pub const CHALLENGER_ID_LEN: usize = 64;

/// Length of the packed buffer handed to native signature recovery
pub const HW_SIGNATURE_LEN: usize = 97;

/// Length of a recovered public key without its format prefix
pub const PUBLIC_KEY_LEN: usize = 64;

/// Error returned by a native call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    /// Native error code
    pub code: u32,
    /// Native error message
    pub message: String,
}

impl NativeError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ecode:{}, emsg:{}", self.code, self.message)
    }
}

/// Result of a native call
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Upgrade progress callback, invoked with `(percent, message)`
///
/// The native layer may call this from any thread, any number of times per
/// percentage value.
pub type ProgressCallback = Arc<dyn Fn(i32, &str) + Send + Sync>;

/// Identifies the native operation a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    Init,
    Release,
    GetBindAccount,
    GetSerialNumber,
    GetVersion,
    GetRandom,
    HwSign,
    HwVerify,
    ValidSign,
    NextHash,
    Upgrade,
    UpgradeAbort,
    HwCheck,
}

impl NativeOp {
    /// Operation name as used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            NativeOp::Init => "Init",
            NativeOp::Release => "Release",
            NativeOp::GetBindAccount => "GetBindAccount",
            NativeOp::GetSerialNumber => "GetSerialNumber",
            NativeOp::GetVersion => "GetVersion",
            NativeOp::GetRandom => "GetRandom",
            NativeOp::HwSign => "HwSign",
            NativeOp::HwVerify => "HwVerify",
            NativeOp::ValidSign => "ValidSign",
            NativeOp::NextHash => "NextHash",
            NativeOp::Upgrade => "Upgrade",
            NativeOp::UpgradeAbort => "UpgradeAbort",
            NativeOp::HwCheck => "HwCheck",
        }
    }
}

impl fmt::Display for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Synchronous call contract of the native module
///
/// All calls block the calling thread. Async callers should offload them
/// with `spawn_blocking` or an equivalent worker.
pub trait NativeModule: Send + Sync {
    /// Open the module
    fn init(&self) -> NativeResult<()>;

    /// Close the module
    fn release(&self) -> NativeResult<()>;

    /// Read the account bound to this board
    fn get_bind_account(&self) -> NativeResult<[u8; ACCOUNT_LEN]>;

    /// Read the board serial number
    fn get_serial_number(&self) -> NativeResult<Vec<u8>>;

    /// Read the hardware, major, feature and dev version bytes
    fn get_version(&self) -> NativeResult<[u8; 4]>;

    /// Draw hardware entropy
    fn get_random(&self) -> NativeResult<[u8; RANDOM_LEN]>;

    /// Sign a challenge with the board authentication key
    fn hw_sign(&self, random: &[u8; RANDOM_LEN]) -> NativeResult<[u8; AUTH_SIGNATURE_LEN]>;

    /// Verify another board's authentication signature
    fn hw_verify(
        &self,
        random: &[u8; RANDOM_LEN],
        host_id: &[u8; HOST_ID_LEN],
        challenger_id: &[u8; CHALLENGER_ID_LEN],
        signature: &[u8; AUTH_SIGNATURE_LEN],
    ) -> NativeResult<()>;

    /// Recover the signer public key from a packed `r || s || hash || v` buffer
    fn valid_sign(&self, packed: &[u8; HW_SIGNATURE_LEN]) -> NativeResult<[u8; PUBLIC_KEY_LEN]>;

    /// Derive the successor value of `hash`
    fn next_hash(&self, hash: &[u8; 32]) -> NativeResult<[u8; 32]>;

    /// Register the callback that receives upgrade progress
    fn register_upgrade_callback(&self, callback: ProgressCallback);

    /// Flash a firmware image
    fn upgrade(&self, image: &[u8]) -> NativeResult<()>;

    /// Ask an in-flight upgrade to stop
    fn upgrade_abort(&self) -> NativeResult<()>;

    /// Probe for the board
    fn hw_check(&self) -> NativeResult<()>;

    /// Release a native error context after it has been read
    fn free_error(&self, err: NativeError) {
        drop(err);
    }
}
