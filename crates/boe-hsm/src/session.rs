//! Device session lifecycle
//!
//! One [`DeviceSession`] owns the native module for the life of the process.
//! It is built once at the composition root and shared behind an `Arc`.
//! Initialization is idempotent and race-free; release clears the
//! "may continue" flag before the native module is closed so long-running
//! operations observe it and stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, info};

use boe_core::{map_native, BoeError, ModuleVersion, NativeModule, NativeOp, Result};

use crate::events::{EventBus, EventType, ModuleEvent, Subscription};

/// Owner of the native module handle
pub struct DeviceSession {
    native: Arc<dyn NativeModule>,
    initialized: AtomicBool,
    may_continue: AtomicBool,
    init_lock: Mutex<()>,
    events: EventBus,
}

impl DeviceSession {
    /// Wrap a native module; nothing is called until [`DeviceSession::init`]
    pub fn new(native: Arc<dyn NativeModule>) -> Self {
        Self {
            native,
            initialized: AtomicBool::new(false),
            may_continue: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            events: EventBus::new(),
        }
    }

    /// Open the native module
    ///
    /// Returns immediately when the session is already initialized; the
    /// native initializer runs at most once per successful init.
    pub fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self
            .init_lock
            .lock()
            .map_err(|e| BoeError::InitFailed(format!("Failed to lock session: {}", e)))?;

        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        map_native(self.native.as_ref(), NativeOp::Init, self.native.init())?;

        self.may_continue.store(true, Ordering::SeqCst);
        self.initialized.store(true, Ordering::Release);
        info!("BOE session initialized");
        Ok(())
    }

    /// Close the native module
    ///
    /// The "may continue" flag is cleared before the native call so any
    /// in-flight upgrade sees it. The native release is always attempted.
    pub fn release(&self) -> Result<()> {
        self.may_continue.store(false, Ordering::SeqCst);

        let _guard = self
            .init_lock
            .lock()
            .map_err(|e| BoeError::InitFailed(format!("Failed to lock session: {}", e)))?;
        // an init that held the lock may have set the flag again
        self.may_continue.store(false, Ordering::SeqCst);

        map_native(self.native.as_ref(), NativeOp::Release, self.native.release())?;

        self.initialized.store(false, Ordering::Release);
        self.events.publish(ModuleEvent::new(
            EventType::SessionReleased,
            json!({ "released": true }),
        ));
        info!("BOE session released");
        Ok(())
    }

    /// Whether a successful init has not yet been released
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Whether long-running operations may keep going
    pub fn may_continue(&self) -> bool {
        self.may_continue.load(Ordering::SeqCst)
    }

    /// Subscribe to a module event type
    pub fn subscribe_event(&self, event_type: EventType) -> Subscription {
        self.events.subscribe(event_type)
    }

    /// Subscribe by raw event code
    ///
    /// Fails with [`BoeError::UnknownEvent`] unless the code lies strictly
    /// inside the module's reserved range.
    pub fn subscribe_event_code(&self, code: u32) -> Result<Subscription> {
        let event_type = EventType::from_code(code)?;
        Ok(self.subscribe_event(event_type))
    }

    /// Read the board and firmware version
    pub fn module_version(&self) -> Result<ModuleVersion> {
        let bytes = map_native(
            self.native.as_ref(),
            NativeOp::GetVersion,
            self.native.get_version(),
        )?;
        let version = ModuleVersion::from_bytes(bytes);
        debug!("Module version {}", version);
        Ok(version)
    }

    /// The event bus owned by this session
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The native module behind this session
    pub fn native(&self) -> &Arc<dyn NativeModule> {
        &self.native
    }
}
