//! Software model of the BOE board
//!
//! Implements the full native call contract in process so the client can be
//! developed and tested without a board attached. Individual operations can
//! be forced to fail, and every call is counted so tests can assert which
//! native entry points were reached.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{BoeError, Result};
use crate::native::{
    NativeError, NativeModule, NativeOp, NativeResult, ProgressCallback, ACCOUNT_LEN,
    AUTH_SIGNATURE_LEN, CHALLENGER_ID_LEN, HOST_ID_LEN, HW_SIGNATURE_LEN, PUBLIC_KEY_LEN,
    RANDOM_LEN,
};
use crate::recovery::ecrecover;
use crate::types::{ModuleVersion, SignatureParts};

/// Error code reported for a forced failure
pub const SIM_ECODE_FORCED: u32 = 0x10;
/// Error code reported when an upgrade is aborted
pub const SIM_ECODE_ABORTED: u32 = 0x21;
/// Error code reported for an abort with nothing to abort
pub const SIM_ECODE_IDLE: u32 = 0x22;
/// Error code reported for a malformed request
pub const SIM_ECODE_BAD_INPUT: u32 = 0x30;

/// Settings for the simulated board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Version the board reports
    pub version: ModuleVersion,
    /// Bound account (at most 42 bytes)
    pub account: String,
    /// Board serial number
    pub serial: String,
    /// Hex seed for the board authentication key
    pub key_seed: String,
    /// Delay between upgrade progress reports (milliseconds)
    pub step_delay_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            version: ModuleVersion::new(1, 0, 0, 0),
            account: "0x0000000000000000000000000000000000000b0e".to_string(),
            serial: "BOE-SIM-0001".to_string(),
            key_seed: hex::encode([0x5e; 32]),
            step_delay_ms: 5,
        }
    }
}

/// In-process implementation of [`NativeModule`]
pub struct SimulatedModule {
    version: Mutex<ModuleVersion>,
    account: String,
    serial: String,
    seed: Zeroizing<[u8; 32]>,
    auth_key: SigningKey,
    step_delay: Duration,
    present: AtomicBool,
    failing: Mutex<HashSet<NativeOp>>,
    calls: Mutex<HashMap<NativeOp, usize>>,
    freed: AtomicUsize,
    callback: Mutex<Option<ProgressCallback>>,
    progress_script: Mutex<Vec<i32>>,
    upgrading: AtomicBool,
    abort_requested: AtomicBool,
    flashed: Mutex<Option<usize>>,
    init_delay: Mutex<Duration>,
}

impl SimulatedModule {
    /// Create a simulated board from its settings
    pub fn new(config: SimulatorConfig) -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(&config.key_seed, &mut seed[..])
            .map_err(|e| BoeError::Config(format!("Invalid simulator key seed: {}", e)))?;
        if config.account.len() > ACCOUNT_LEN {
            return Err(BoeError::Config(format!(
                "Simulator account is {} bytes, at most {} allowed",
                config.account.len(),
                ACCOUNT_LEN
            )));
        }

        Ok(Self::with_seed(config, seed))
    }

    fn with_seed(config: SimulatorConfig, seed: Zeroizing<[u8; 32]>) -> Self {
        Self {
            version: Mutex::new(config.version),
            account: config.account,
            serial: config.serial,
            auth_key: derive_auth_key(&seed),
            seed,
            step_delay: Duration::from_millis(config.step_delay_ms),
            present: AtomicBool::new(true),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            freed: AtomicUsize::new(0),
            callback: Mutex::new(None),
            progress_script: Mutex::new(default_progress_script()),
            upgrading: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            flashed: Mutex::new(None),
            init_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Force every later call of `op` to fail
    pub fn fail_on(&self, op: NativeOp) {
        lock(&self.failing).insert(op);
    }

    /// Let `op` succeed again
    pub fn clear_failure(&self, op: NativeOp) {
        lock(&self.failing).remove(&op);
    }

    /// Simulate plugging or unplugging the board
    /// Make `init` block for `delay` before answering
    pub fn set_init_delay(&self, delay: Duration) {
        *lock(&self.init_delay) = delay;
    }

    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    /// Replace the sequence of percentages reported while flashing
    pub fn set_progress_script(&self, script: Vec<i32>) {
        *lock(&self.progress_script) = script;
    }

    /// Change the version the board reports
    pub fn set_version(&self, version: ModuleVersion) {
        *lock(&self.version) = version;
    }

    /// Number of times `op` was invoked
    pub fn calls(&self, op: NativeOp) -> usize {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    /// Total number of native calls of any kind
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    /// Number of error contexts handed back through `free_error`
    pub fn freed_errors(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    /// Length of the last image flashed successfully
    pub fn flashed_len(&self) -> Option<usize> {
        *lock(&self.flashed)
    }

    /// Identifier other boards use to verify this board's signatures
    pub fn host_id(&self) -> [u8; HOST_ID_LEN] {
        Sha256::digest(self.serial.as_bytes()).into()
    }

    /// Authentication public key (X || Y)
    pub fn auth_public_key(&self) -> [u8; CHALLENGER_ID_LEN] {
        let point = self.auth_key.verifying_key().to_encoded_point(false);
        let mut out = [0u8; CHALLENGER_ID_LEN];
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }

    fn enter(&self, op: NativeOp) -> NativeResult<()> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
        if lock(&self.failing).contains(&op) {
            return Err(NativeError::new(
                SIM_ECODE_FORCED,
                format!("{} failed (simulated)", op),
            ));
        }
        Ok(())
    }
}

impl Default for SimulatedModule {
    fn default() -> Self {
        Self::with_seed(SimulatorConfig::default(), Zeroizing::new([0x5e; 32]))
    }
}

impl NativeModule for SimulatedModule {
    fn init(&self) -> NativeResult<()> {
        self.enter(NativeOp::Init)?;
        let delay = *lock(&self.init_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if !self.present.load(Ordering::SeqCst) {
            return Err(NativeError::new(SIM_ECODE_FORCED, "board not found"));
        }
        Ok(())
    }

    fn release(&self) -> NativeResult<()> {
        self.enter(NativeOp::Release)
    }

    fn get_bind_account(&self) -> NativeResult<[u8; ACCOUNT_LEN]> {
        self.enter(NativeOp::GetBindAccount)?;
        let mut out = [0u8; ACCOUNT_LEN];
        out[..self.account.len()].copy_from_slice(self.account.as_bytes());
        Ok(out)
    }

    fn get_serial_number(&self) -> NativeResult<Vec<u8>> {
        self.enter(NativeOp::GetSerialNumber)?;
        Ok(self.serial.as_bytes().to_vec())
    }

    fn get_version(&self) -> NativeResult<[u8; 4]> {
        self.enter(NativeOp::GetVersion)?;
        Ok(lock(&self.version).to_bytes())
    }

    fn get_random(&self) -> NativeResult<[u8; RANDOM_LEN]> {
        self.enter(NativeOp::GetRandom)?;
        let mut out = [0u8; RANDOM_LEN];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Ok(out)
    }

    fn hw_sign(&self, random: &[u8; RANDOM_LEN]) -> NativeResult<[u8; AUTH_SIGNATURE_LEN]> {
        self.enter(NativeOp::HwSign)?;
        let digest = auth_digest(random, &self.host_id());
        let (signature, _) = self
            .auth_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| NativeError::new(SIM_ECODE_BAD_INPUT, e.to_string()))?;
        let mut out = [0u8; AUTH_SIGNATURE_LEN];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }

    fn hw_verify(
        &self,
        random: &[u8; RANDOM_LEN],
        host_id: &[u8; HOST_ID_LEN],
        challenger_id: &[u8; CHALLENGER_ID_LEN],
        signature: &[u8; AUTH_SIGNATURE_LEN],
    ) -> NativeResult<()> {
        self.enter(NativeOp::HwVerify)?;
        let mut sec1 = [0u8; 1 + CHALLENGER_ID_LEN];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(challenger_id);

        let key = VerifyingKey::from_sec1_bytes(&sec1)
            .map_err(|e| NativeError::new(SIM_ECODE_BAD_INPUT, e.to_string()))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| NativeError::new(SIM_ECODE_BAD_INPUT, e.to_string()))?;
        key.verify_prehash(&auth_digest(random, host_id), &signature)
            .map_err(|e| NativeError::new(SIM_ECODE_BAD_INPUT, e.to_string()))
    }

    fn valid_sign(&self, packed: &[u8; HW_SIGNATURE_LEN]) -> NativeResult<[u8; PUBLIC_KEY_LEN]> {
        self.enter(NativeOp::ValidSign)?;
        let parts = SignatureParts::from_hardware_buffer(packed);
        let point = ecrecover(&parts.hash, &parts.to_software_buffer())
            .map_err(|e| NativeError::new(SIM_ECODE_BAD_INPUT, e.to_string()))?;
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(&point[1..]);
        Ok(out)
    }

    fn next_hash(&self, hash: &[u8; 32]) -> NativeResult<[u8; 32]> {
        self.enter(NativeOp::NextHash)?;
        let mut hasher = Sha256::new();
        hasher.update(&self.seed[..]);
        hasher.update(hash);
        Ok(hasher.finalize().into())
    }

    fn register_upgrade_callback(&self, callback: ProgressCallback) {
        *lock(&self.callback) = Some(callback);
    }

    fn upgrade(&self, image: &[u8]) -> NativeResult<()> {
        self.enter(NativeOp::Upgrade)?;
        if image.is_empty() {
            return Err(NativeError::new(SIM_ECODE_BAD_INPUT, "empty image"));
        }

        self.abort_requested.store(false, Ordering::SeqCst);
        self.upgrading.store(true, Ordering::SeqCst);

        let callback = lock(&self.callback).clone();
        let script = lock(&self.progress_script).clone();

        for progress in script {
            if self.abort_requested.load(Ordering::SeqCst) {
                self.upgrading.store(false, Ordering::SeqCst);
                return Err(NativeError::new(SIM_ECODE_ABORTED, "upgrade aborted"));
            }
            if let Some(cb) = &callback {
                cb(progress, "flashing");
            }
            std::thread::sleep(self.step_delay);
        }

        *lock(&self.flashed) = Some(image.len());
        self.upgrading.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn upgrade_abort(&self) -> NativeResult<()> {
        self.enter(NativeOp::UpgradeAbort)?;
        if !self.upgrading.load(Ordering::SeqCst) {
            return Err(NativeError::new(SIM_ECODE_IDLE, "no upgrade in progress"));
        }
        self.abort_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn hw_check(&self) -> NativeResult<()> {
        self.enter(NativeOp::HwCheck)?;
        if !self.present.load(Ordering::SeqCst) {
            return Err(NativeError::new(SIM_ECODE_FORCED, "board not found"));
        }
        Ok(())
    }

    fn free_error(&self, err: NativeError) {
        self.freed.fetch_add(1, Ordering::SeqCst);
        drop(err);
    }
}

/// Message digest signed during hardware authentication
fn auth_digest(random: &[u8; RANDOM_LEN], host_id: &[u8; HOST_ID_LEN]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(random);
    hasher.update(host_id);
    hasher.finalize().into()
}

/// Hash the seed until it yields a valid secp256k1 scalar
fn derive_auth_key(seed: &[u8; 32]) -> SigningKey {
    let mut counter = 0u32;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(b"boe-sim-auth-key");
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        let candidate: [u8; 32] = hasher.finalize().into();
        if let Ok(key) = SigningKey::from_bytes((&candidate).into()) {
            return key;
        }
        counter += 1;
    }
}

/// Each percentage is reported twice, as real boards do
fn default_progress_script() -> Vec<i32> {
    (0..=10).flat_map(|step| [step * 10, step * 10]).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
