//! BOE Core - Native call contract, error mapping, and signature recovery
//!
//! This crate provides the foundational pieces shared by every BOE client:
//! the synchronous contract of the native board module, translation of
//! native failures into [`BoeError`], the fixed-size data model, and the
//! hardware/software public key recovery strategies.

pub mod error;
pub mod native;
pub mod recovery;
pub mod simulator;
pub mod types;

pub use error::{map_native, BoeError, Result};
pub use native::{NativeError, NativeModule, NativeOp, NativeResult, ProgressCallback};
pub use recovery::{
    ecrecover, FallbackRecoverer, HardwareRecoverer, PublicKeyRecoverer, SoftwareRecoverer,
};
pub use simulator::{SimulatedModule, SimulatorConfig};
pub use types::{AuthChallenge, ModuleVersion, RecoveredPublicKey, SignatureParts};
