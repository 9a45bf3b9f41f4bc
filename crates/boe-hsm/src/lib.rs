//! BOE HSM client
//!
//! This crate provides:
//! - Device session lifecycle over the native module
//! - A typed event bus for module notifications
//! - Crypto operations (entropy, challenge-response auth, key recovery, hash chain)
//! - Firmware update orchestration with progress and abort
//! - Release resolution from a local mirror
//! - Client configuration

pub mod config;
pub mod crypto;
pub mod events;
pub mod firmware;
pub mod release;
pub mod session;

pub use config::BoeConfig;
pub use crypto::CryptoFacade;
pub use events::{EventBus, EventType, ModuleEvent, Subscription, EVENT_BASE, EVENT_MAX};
pub use firmware::{FirmwareUpdater, ProgressDeduplicator, UpgradeJob, UpgradeState};
pub use release::{DirectoryReleaseFetcher, ReleaseEntry, ReleaseFetcher, ReleaseIndex};
pub use session::DeviceSession;
