//! Public key recovery from ECDSA signatures
//!
//! Two interchangeable strategies sit behind [`PublicKeyRecoverer`]: the
//! board's native recovery and a software secp256k1 recovery. The
//! [`FallbackRecoverer`] tries the board first and only runs the software
//! path when the board fails, so results stay available when the module is
//! absent or locked.

use std::sync::Arc;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use tracing::debug;

use crate::error::{map_native, BoeError, Result};
use crate::native::{NativeModule, NativeOp};
use crate::types::{RecoveredPublicKey, SignatureParts, SW_SIGNATURE_LEN};

/// A strategy that recovers the signer's public key
pub trait PublicKeyRecoverer: Send + Sync {
    /// Recover the 64-byte public key for `parts`
    fn recover(&self, parts: &SignatureParts) -> Result<RecoveredPublicKey>;

    /// Short strategy name for logs
    fn name(&self) -> &'static str;
}

/// Recover an uncompressed SEC1 point from a prehashed message and a
/// `r || s || v` signature
///
/// `v` is the recovery id (0..=3). High-S signatures are normalized before
/// recovery, flipping the y parity of the recovery id accordingly.
pub fn ecrecover(hash: &[u8; 32], sig: &[u8; SW_SIGNATURE_LEN]) -> Result<[u8; SW_SIGNATURE_LEN]> {
    let signature = Signature::from_slice(&sig[..64])
        .map_err(|e| BoeError::SignCheckFailed(format!("Invalid signature: {}", e)))?;
    let recovery_id = RecoveryId::from_byte(sig[64])
        .ok_or_else(|| BoeError::SignCheckFailed(format!("Invalid recovery id: {}", sig[64])))?;

    let (signature, recovery_id) = match signature.normalize_s() {
        Some(normalized) => (
            normalized,
            RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced()),
        ),
        None => (signature, recovery_id),
    };

    let key = VerifyingKey::recover_from_prehash(hash, &signature, recovery_id)
        .map_err(|e| BoeError::SignCheckFailed(format!("Recovery failed: {}", e)))?;

    let point = key.to_encoded_point(false);
    let mut out = [0u8; SW_SIGNATURE_LEN];
    out.copy_from_slice(point.as_bytes());
    Ok(out)
}

/// Software secp256k1 recovery
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareRecoverer;

impl PublicKeyRecoverer for SoftwareRecoverer {
    fn recover(&self, parts: &SignatureParts) -> Result<RecoveredPublicKey> {
        let point = ecrecover(&parts.hash, &parts.to_software_buffer())?;
        RecoveredPublicKey::from_uncompressed(&point)
    }

    fn name(&self) -> &'static str {
        "software"
    }
}

/// Recovery performed by the board
pub struct HardwareRecoverer {
    native: Arc<dyn NativeModule>,
}

impl HardwareRecoverer {
    pub fn new(native: Arc<dyn NativeModule>) -> Self {
        Self { native }
    }
}

impl PublicKeyRecoverer for HardwareRecoverer {
    fn recover(&self, parts: &SignatureParts) -> Result<RecoveredPublicKey> {
        let packed = parts.to_hardware_buffer();
        let ret = self.native.valid_sign(&packed);
        let key = map_native(self.native.as_ref(), NativeOp::ValidSign, ret)?;
        Ok(RecoveredPublicKey::new(key))
    }

    fn name(&self) -> &'static str {
        "hardware"
    }
}

/// Primary strategy with a fallback used only when the primary fails
pub struct FallbackRecoverer {
    primary: Option<Arc<dyn PublicKeyRecoverer>>,
    fallback: Arc<dyn PublicKeyRecoverer>,
}

impl FallbackRecoverer {
    pub fn new(primary: Arc<dyn PublicKeyRecoverer>, fallback: Arc<dyn PublicKeyRecoverer>) -> Self {
        Self {
            primary: Some(primary),
            fallback,
        }
    }

    /// Board first, software second
    pub fn hardware_first(native: Arc<dyn NativeModule>) -> Self {
        Self::new(
            Arc::new(HardwareRecoverer::new(native)),
            Arc::new(SoftwareRecoverer),
        )
    }

    /// Skip the board entirely
    pub fn software_only() -> Self {
        Self {
            primary: None,
            fallback: Arc::new(SoftwareRecoverer),
        }
    }
}

impl PublicKeyRecoverer for FallbackRecoverer {
    fn recover(&self, parts: &SignatureParts) -> Result<RecoveredPublicKey> {
        if let Some(primary) = &self.primary {
            match primary.recover(parts) {
                Ok(key) => return Ok(key),
                Err(e) => debug!(
                    "{} recovery failed, using {}: {}",
                    primary.name(),
                    self.fallback.name(),
                    e
                ),
            }
        }
        self.fallback.recover(parts)
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedModule;
    use k256::ecdsa::SigningKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn signed_parts(secret: [u8; 32], hash: [u8; 32]) -> (SignatureParts, [u8; 64]) {
        let key = SigningKey::from_bytes((&secret).into()).unwrap();
        let (sig, recid) = key.sign_prehash_recoverable(&hash).unwrap();
        let bytes = sig.to_bytes();
        let parts =
            SignatureParts::from_slices(&hash, &bytes[..32], &bytes[32..], recid.to_byte())
                .unwrap();

        let point = key.verifying_key().to_encoded_point(false);
        let mut expected = [0u8; 64];
        expected.copy_from_slice(&point.as_bytes()[1..]);
        (parts, expected)
    }

    struct Counting {
        calls: AtomicUsize,
    }

    impl PublicKeyRecoverer for Counting {
        fn recover(&self, _parts: &SignatureParts) -> Result<RecoveredPublicKey> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BoeError::SignCheckFailed("stub".to_string()))
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Unreachable;

    impl PublicKeyRecoverer for Unreachable {
        fn recover(&self, _parts: &SignatureParts) -> Result<RecoveredPublicKey> {
            panic!("fallback must not run when the primary succeeds");
        }

        fn name(&self) -> &'static str {
            "unreachable"
        }
    }

    #[test]
    fn test_software_recovery_matches_signer() {
        let (parts, expected) = signed_parts([0x42; 32], [0x17; 32]);
        let key = SoftwareRecoverer.recover(&parts).unwrap();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn test_software_recovery_accepts_high_s() {
        let (parts, expected) = signed_parts([0x24; 32], [0x99; 32]);

        // Flip s to n - s and the recovery id parity
        let sig = Signature::from_scalars(parts.r, parts.s).unwrap();
        let (r, s) = sig.split_scalars();
        let high = Signature::from_scalars(r.to_bytes(), (-*s).to_bytes()).unwrap();
        let high_bytes = high.to_bytes();
        let flipped = SignatureParts::from_slices(
            &parts.hash,
            &high_bytes[..32],
            &high_bytes[32..],
            parts.v ^ 1,
        )
        .unwrap();

        let key = SoftwareRecoverer.recover(&flipped).unwrap();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn test_software_recovery_rejects_garbage() {
        let parts = SignatureParts::from_slices(&[1; 32], &[0; 32], &[0; 32], 0).unwrap();
        assert!(matches!(
            SoftwareRecoverer.recover(&parts),
            Err(BoeError::SignCheckFailed(_))
        ));

        let (mut parts, _) = signed_parts([0x42; 32], [0x17; 32]);
        parts.v = 9;
        assert!(SoftwareRecoverer.recover(&parts).is_err());
    }

    #[test]
    fn test_fallback_skips_software_when_hardware_succeeds() {
        let (parts, expected) = signed_parts([0x42; 32], [0x17; 32]);
        let module: Arc<dyn NativeModule> = Arc::new(SimulatedModule::default());
        let recoverer = FallbackRecoverer::new(
            Arc::new(HardwareRecoverer::new(module)),
            Arc::new(Unreachable),
        );
        assert_eq!(recoverer.recover(&parts).unwrap().as_bytes(), &expected);
    }

    #[test]
    fn test_fallback_uses_software_when_hardware_fails() {
        let (parts, _) = signed_parts([0x42; 32], [0x17; 32]);
        let module = Arc::new(SimulatedModule::default());
        module.fail_on(NativeOp::ValidSign);
        let recoverer = FallbackRecoverer::hardware_first(module.clone());

        let key = recoverer.recover(&parts).unwrap();
        assert_eq!(key, SoftwareRecoverer.recover(&parts).unwrap());
        assert_eq!(module.freed_errors(), 1);
    }

    #[test]
    fn test_fallback_reports_when_both_fail() {
        let primary = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let secondary = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let recoverer = FallbackRecoverer::new(primary.clone(), secondary.clone());
        let parts = SignatureParts::from_slices(&[1; 32], &[2; 32], &[3; 32], 0).unwrap();

        assert!(matches!(
            recoverer.recover(&parts),
            Err(BoeError::SignCheckFailed(_))
        ));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_software_only_never_touches_board() {
        let (parts, expected) = signed_parts([0x05; 32], [0x06; 32]);
        let key = FallbackRecoverer::software_only().recover(&parts).unwrap();
        assert_eq!(key.as_bytes(), &expected);
    }
}
