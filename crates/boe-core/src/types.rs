//! Core types exchanged with the BOE module

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BoeError, Result};
use crate::native::{
    AUTH_SIGNATURE_LEN, CHALLENGER_ID_LEN, HOST_ID_LEN, HW_SIGNATURE_LEN, PUBLIC_KEY_LEN,
    RANDOM_LEN,
};

/// Length of the buffer handed to software recovery (r || s || v)
pub const SW_SIGNATURE_LEN: usize = 65;

/// Width of each scalar slot in a packed signature
pub const SCALAR_LEN: usize = 32;

/// Board revision and firmware revision of a module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    /// Physical board revision
    pub hardware: u8,
    /// Firmware major revision
    pub major: u8,
    /// Firmware feature revision
    pub feature: u8,
    /// Firmware development revision
    pub dev: u8,
}

impl ModuleVersion {
    pub fn new(hardware: u8, major: u8, feature: u8, dev: u8) -> Self {
        Self {
            hardware,
            major,
            feature,
            dev,
        }
    }

    /// Build from the four bytes reported by the module
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [self.hardware, self.major, self.feature, self.dev]
    }

    /// Firmware revision only, ordered major first
    pub fn firmware(&self) -> (u8, u8, u8) {
        (self.major, self.feature, self.dev)
    }

    /// Whether `other` is firmware for the same board with a newer revision
    pub fn is_upgraded_by(&self, other: &ModuleVersion) -> bool {
        self.hardware == other.hardware && other.firmware() > self.firmware()
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.hardware, self.major, self.feature, self.dev
        )
    }
}

/// ECDSA signature components with the signed hash
///
/// Scalars shorter than 32 bytes are left-padded with zeros so they sit
/// right-aligned in their slot; longer inputs are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureParts {
    pub hash: [u8; SCALAR_LEN],
    pub r: [u8; SCALAR_LEN],
    pub s: [u8; SCALAR_LEN],
    pub v: u8,
}

impl SignatureParts {
    /// Right-align variable-length components into fixed slots
    pub fn from_slices(hash: &[u8], r: &[u8], s: &[u8], v: u8) -> Result<Self> {
        Ok(Self {
            hash: right_align(hash, "hash")?,
            r: right_align(r, "r")?,
            s: right_align(s, "s")?,
            v,
        })
    }

    /// Packing used by native recovery: `r || s || hash || v`
    pub fn to_hardware_buffer(&self) -> [u8; HW_SIGNATURE_LEN] {
        let mut buf = [0u8; HW_SIGNATURE_LEN];
        buf[0..32].copy_from_slice(&self.r);
        buf[32..64].copy_from_slice(&self.s);
        buf[64..96].copy_from_slice(&self.hash);
        buf[96] = self.v;
        buf
    }

    /// Packing used by software recovery: `r || s || v`, hash passed separately
    pub fn to_software_buffer(&self) -> [u8; SW_SIGNATURE_LEN] {
        let mut buf = [0u8; SW_SIGNATURE_LEN];
        buf[0..32].copy_from_slice(&self.r);
        buf[32..64].copy_from_slice(&self.s);
        buf[64] = self.v;
        buf
    }

    /// Inverse of [`SignatureParts::to_hardware_buffer`]
    pub fn from_hardware_buffer(buf: &[u8; HW_SIGNATURE_LEN]) -> Self {
        let mut parts = Self {
            hash: [0u8; SCALAR_LEN],
            r: [0u8; SCALAR_LEN],
            s: [0u8; SCALAR_LEN],
            v: buf[96],
        };
        parts.r.copy_from_slice(&buf[0..32]);
        parts.s.copy_from_slice(&buf[32..64]);
        parts.hash.copy_from_slice(&buf[64..96]);
        parts
    }
}

fn right_align(input: &[u8], field: &str) -> Result<[u8; SCALAR_LEN]> {
    if input.len() > SCALAR_LEN {
        return Err(BoeError::SignCheckFailed(format!(
            "{} is {} bytes, expected at most {}",
            field,
            input.len(),
            SCALAR_LEN
        )));
    }
    let mut slot = [0u8; SCALAR_LEN];
    slot[SCALAR_LEN - input.len()..].copy_from_slice(input);
    Ok(slot)
}

/// Uncompressed public key without the format prefix (X || Y)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoveredPublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl RecoveredPublicKey {
    pub fn new(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Strip the 0x04 prefix from a SEC1 uncompressed point
    pub fn from_uncompressed(point: &[u8; SW_SIGNATURE_LEN]) -> Result<Self> {
        if point[0] != 0x04 {
            return Err(BoeError::SignCheckFailed(format!(
                "unexpected point prefix 0x{:02x}",
                point[0]
            )));
        }
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(&point[1..]);
        Ok(Self(bytes))
    }
}

impl fmt::Debug for RecoveredPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoveredPublicKey({})", self.to_hex())
    }
}

impl AsRef<[u8]> for RecoveredPublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Inputs to board-to-board hardware authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthChallenge {
    pub random: [u8; RANDOM_LEN],
    pub host_id: [u8; HOST_ID_LEN],
    pub challenger_id: [u8; CHALLENGER_ID_LEN],
    pub signature: [u8; AUTH_SIGNATURE_LEN],
}

impl AuthChallenge {
    /// Build a challenge, or `None` when any buffer has the wrong length
    pub fn from_slices(
        random: &[u8],
        host_id: &[u8],
        challenger_id: &[u8],
        signature: &[u8],
    ) -> Option<Self> {
        Some(Self {
            random: random.try_into().ok()?,
            host_id: host_id.try_into().ok()?,
            challenger_id: challenger_id.try_into().ok()?,
            signature: signature.try_into().ok()?,
        })
    }
}
