//! Cryptographic operations backed by the board
//!
//! Every fixed-length input is validated before the native module is
//! called; an input of the wrong size never reaches the board.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use boe_core::native::{AUTH_SIGNATURE_LEN, RANDOM_LEN};
use boe_core::{
    map_native, AuthChallenge, BoeError, FallbackRecoverer, ModuleVersion, NativeOp,
    PublicKeyRecoverer, RecoveredPublicKey, Result, SignatureParts,
};

use crate::session::DeviceSession;

/// Crypto operations of the BOE module
pub struct CryptoFacade {
    session: Arc<DeviceSession>,
    recoverer: Box<dyn PublicKeyRecoverer>,
    recover_count: AtomicU64,
}

impl CryptoFacade {
    /// Facade that recovers keys on the board first and in software second
    pub fn new(session: Arc<DeviceSession>) -> Self {
        let recoverer = FallbackRecoverer::hardware_first(Arc::clone(session.native()));
        Self::with_recoverer(session, Box::new(recoverer))
    }

    /// Facade with an explicit recovery strategy
    pub fn with_recoverer(
        session: Arc<DeviceSession>,
        recoverer: Box<dyn PublicKeyRecoverer>,
    ) -> Self {
        Self {
            session,
            recoverer,
            recover_count: AtomicU64::new(0),
        }
    }

    /// Draw 32 bytes of hardware entropy
    pub fn get_random(&self) -> Result<[u8; RANDOM_LEN]> {
        let native = self.session.native();
        map_native(native.as_ref(), NativeOp::GetRandom, native.get_random())
    }

    /// Account bound to the board
    pub fn get_board_identity(&self) -> Result<String> {
        let native = self.session.native();
        let raw = map_native(
            native.as_ref(),
            NativeOp::GetBindAccount,
            native.get_bind_account(),
        )?;
        decode_text(&raw).map_err(BoeError::GetAccountFailed)
    }

    /// Board serial number
    pub fn get_serial_number(&self) -> Result<String> {
        let native = self.session.native();
        let raw = map_native(
            native.as_ref(),
            NativeOp::GetSerialNumber,
            native.get_serial_number(),
        )?;
        decode_text(&raw).map_err(BoeError::GetSnFailed)
    }

    /// Board and firmware version
    pub fn get_version(&self) -> Result<ModuleVersion> {
        self.session.module_version()
    }

    /// Sign a 32-byte challenge with the board authentication key
    pub fn hardware_auth_sign(&self, random: &[u8]) -> Result<[u8; AUTH_SIGNATURE_LEN]> {
        let random: &[u8; RANDOM_LEN] = random.try_into().map_err(|_| {
            BoeError::HwSignFailed(format!(
                "random is {} bytes, expected {}",
                random.len(),
                RANDOM_LEN
            ))
        })?;
        let native = self.session.native();
        map_native(native.as_ref(), NativeOp::HwSign, native.hw_sign(random))
    }

    /// Verify another board's authentication signature
    ///
    /// Any buffer of the wrong length yields `false` without a native call.
    pub fn hardware_auth_verify(
        &self,
        random: &[u8],
        host_id: &[u8],
        challenger_id: &[u8],
        signature: &[u8],
    ) -> bool {
        match AuthChallenge::from_slices(random, host_id, challenger_id, signature) {
            Some(challenge) => self.verify_challenge(&challenge),
            None => {
                debug!("Rejected auth challenge with malformed buffers");
                false
            }
        }
    }

    /// Verify a well-formed authentication challenge
    pub fn verify_challenge(&self, challenge: &AuthChallenge) -> bool {
        let native = self.session.native();
        let ret = native.hw_verify(
            &challenge.random,
            &challenge.host_id,
            &challenge.challenger_id,
            &challenge.signature,
        );
        map_native(native.as_ref(), NativeOp::HwVerify, ret).is_ok()
    }

    /// Recover the signer's public key, on the board if possible
    ///
    /// `hash`, `r` and `s` may be shorter than 32 bytes and are
    /// right-aligned. Fails with [`BoeError::SignCheckFailed`] only when
    /// both the board and the software path fail.
    pub fn validate_sign_and_recover(
        &self,
        hash: &[u8],
        r: &[u8],
        s: &[u8],
        v: u8,
    ) -> Result<RecoveredPublicKey> {
        self.recover_count.fetch_add(1, Ordering::Relaxed);
        let parts = SignatureParts::from_slices(hash, r, s, v)?;
        self.recoverer.recover(&parts)
    }

    /// Derive the successor value of a 32-byte hash
    pub fn get_next_hash(&self, hash: &[u8]) -> Result<[u8; 32]> {
        let hash: &[u8; 32] = hash.try_into().map_err(|_| {
            BoeError::GetNextHashFailed(format!("hash is {} bytes, expected 32", hash.len()))
        })?;
        let native = self.session.native();
        map_native(native.as_ref(), NativeOp::NextHash, native.next_hash(hash))
    }

    /// Number of recovery requests served so far
    pub fn recover_count(&self) -> u64 {
        self.recover_count.load(Ordering::Relaxed)
    }
}

/// Decode a NUL-padded text buffer
fn decode_text(raw: &[u8]) -> std::result::Result<String, String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec()).map_err(|e| format!("not valid text: {}", e))
}
