//! Firmware update orchestration
//!
//! An update moves through `Idle -> Downloading -> Flashing` and ends in
//! `Succeeded`, `Failed` or `Aborted`:
//! 1. Query the board version
//! 2. Fetch the matching release image
//! 3. Register a progress callback and flash the image on a blocking worker
//!
//! The native layer reports progress from its own thread. The callback only
//! de-duplicates and forwards `(percent, message)` over a channel; the
//! updater task consumes the channel, records progress and publishes it on
//! the event bus. While flashing, the updater watches the session's
//! "may continue" flag and asks the board to abort once it is cleared.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use boe_core::{map_native, BoeError, ModuleVersion, NativeOp, ProgressCallback, Result};

use crate::events::{EventType, ModuleEvent};
use crate::release::ReleaseFetcher;
use crate::session::DeviceSession;

/// How often the flashing loop re-checks the session flag
const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// State of an upgrade job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeState {
    Idle,
    Downloading,
    Flashing,
    Succeeded,
    Failed,
    Aborted,
}

impl UpgradeState {
    /// Whether the job is still in flight
    pub fn is_running(&self) -> bool {
        matches!(self, UpgradeState::Downloading | UpgradeState::Flashing)
    }
}

/// Snapshot of the current or last upgrade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeJob {
    pub id: Uuid,
    pub state: UpgradeState,
    /// Last reported percentage (0..=100)
    pub progress: u8,
    /// Length of the image being flashed
    pub image_len: usize,
    /// Version the board reported before the update
    pub from_version: Option<ModuleVersion>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for UpgradeJob {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            state: UpgradeState::Idle,
            progress: 0,
            image_len: 0,
            from_version: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Drops repeated progress values
///
/// Safe to call from any thread. Values outside `0..=100` are ignored.
#[derive(Debug)]
pub struct ProgressDeduplicator {
    last: AtomicI32,
}

impl ProgressDeduplicator {
    pub fn new() -> Self {
        Self {
            last: AtomicI32::new(-1),
        }
    }

    /// Returns the value if it differs from the previous accepted one
    pub fn accept(&self, progress: i32) -> Option<u8> {
        if !(0..=100).contains(&progress) {
            return None;
        }
        let previous = self.last.swap(progress, Ordering::SeqCst);
        if previous == progress {
            None
        } else {
            Some(progress as u8)
        }
    }
}

impl Default for ProgressDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the whole of one `update` call
///
/// The native upgrade may outlive an accepted abort, so the job state alone
/// cannot tell whether the board is still flashing.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives firmware updates of the board
pub struct FirmwareUpdater {
    session: Arc<DeviceSession>,
    fetcher: Arc<dyn ReleaseFetcher>,
    job: Mutex<UpgradeJob>,
    in_flight: AtomicBool,
}

impl FirmwareUpdater {
    pub fn new(session: Arc<DeviceSession>, fetcher: Arc<dyn ReleaseFetcher>) -> Self {
        Self {
            session,
            fetcher,
            job: Mutex::new(UpgradeJob::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Snapshot of the current or last job
    pub fn job(&self) -> UpgradeJob {
        self.lock_job().clone()
    }

    /// Run a full update: version query, image fetch, flashing
    ///
    /// Failures are terminal for the job; a new call starts a new job.
    pub async fn update(&self) -> Result<()> {
        if !self.session.may_continue() {
            return Err(BoeError::UpdateFailed(
                "session is not active".to_string(),
            ));
        }
        let (_in_flight, job_id) = self.begin()?;
        info!("Starting firmware update {}", job_id);

        let version = match self.session.module_version() {
            Ok(version) => version,
            Err(e) => return Err(self.fail(job_id, e)),
        };
        self.lock_job().from_version = Some(version);

        let image = match self.fetcher.fetch(&version).await {
            Ok(image) => image,
            Err(e) => {
                error!("Download firmware failed: {}", e);
                return Err(self.fail(job_id, e));
            }
        };
        info!("Image len = {}", image.len());

        if !self.session.may_continue() || self.job_state(job_id) == Some(UpgradeState::Aborted) {
            self.finish(
                job_id,
                UpgradeState::Aborted,
                Some("stopped before flashing".to_string()),
            );
            return Err(BoeError::UpdateFailed(
                "update stopped before flashing".to_string(),
            ));
        }

        self.flash(job_id, image).await
    }

    async fn flash(&self, job_id: Uuid, image: Vec<u8>) -> Result<()> {
        {
            let mut job = self.lock_job();
            job.state = UpgradeState::Flashing;
            job.image_len = image.len();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(u8, String)>();
        let dedup = Arc::new(ProgressDeduplicator::new());
        let callback: ProgressCallback = Arc::new(move |progress, message| {
            if let Some(progress) = dedup.accept(progress) {
                let _ = tx.send((progress, message.to_string()));
            }
        });

        let native = Arc::clone(self.session.native());
        native.register_upgrade_callback(callback);
        let mut flashing = tokio::task::spawn_blocking(move || native.upgrade(&image));

        let mut ticker = tokio::time::interval(RELEASE_POLL_INTERVAL);
        let mut interrupted = false;

        let joined = loop {
            tokio::select! {
                joined = &mut flashing => break joined,
                Some((progress, message)) = rx.recv() => self.report_progress(job_id, progress, &message),
                _ = ticker.tick() => {
                    if !interrupted && !self.session.may_continue() {
                        interrupted = true;
                        warn!("Session released during flashing, aborting upgrade");
                        self.mark_aborted(job_id);
                        let native = self.session.native();
                        if let Err(e) = map_native(
                            native.as_ref(),
                            NativeOp::UpgradeAbort,
                            native.upgrade_abort(),
                        ) {
                            warn!("Abort after release failed: {}", e);
                        }
                    }
                }
            }
        };

        while let Ok((progress, message)) = rx.try_recv() {
            self.report_progress(job_id, progress, &message);
        }

        let native = self.session.native();
        let outcome = joined
            .map_err(|e| BoeError::UpdateFailed(format!("Upgrade worker failed: {}", e)))
            .and_then(|ret| map_native(native.as_ref(), NativeOp::Upgrade, ret));

        match outcome {
            Ok(()) => {
                info!("Upgrade succeeded");
                self.finish(job_id, UpgradeState::Succeeded, None);
                Ok(())
            }
            Err(e) => Err(self.fail(job_id, e)),
        }
    }

    /// Ask the board to stop an in-flight upgrade
    ///
    /// The board decides whether flashing actually stops; on success the
    /// current job is marked aborted.
    pub fn abort(&self) -> Result<()> {
        let native = self.session.native();
        map_native(
            native.as_ref(),
            NativeOp::UpgradeAbort,
            native.upgrade_abort(),
        )?;
        let job_id = self.lock_job().id;
        self.mark_aborted(job_id);
        info!("Upgrade abort accepted");
        Ok(())
    }

    /// Probe for the board
    pub fn check_hardware_presence(&self) -> bool {
        let native = self.session.native();
        match map_native(native.as_ref(), NativeOp::HwCheck, native.hw_check()) {
            Ok(()) => {
                info!("boe board is ok.");
                true
            }
            Err(_) => {
                info!("boe board not found.");
                false
            }
        }
    }

    fn begin(&self) -> Result<(InFlight<'_>, Uuid)> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BoeError::UpdateFailed(format!(
                "update {} already in progress",
                self.lock_job().id
            )));
        }
        let guard = InFlight(&self.in_flight);

        let mut job = self.lock_job();
        *job = UpgradeJob {
            id: Uuid::new_v4(),
            state: UpgradeState::Downloading,
            started_at: Some(Utc::now()),
            ..UpgradeJob::default()
        };
        Ok((guard, job.id))
    }

    fn job_state(&self, job_id: Uuid) -> Option<UpgradeState> {
        let job = self.lock_job();
        (job.id == job_id).then_some(job.state)
    }

    fn report_progress(&self, job_id: Uuid, progress: u8, message: &str) {
        {
            let mut job = self.lock_job();
            if job.id != job_id {
                return;
            }
            job.progress = progress;
        }
        info!("Upgrade {}%, msg:{}", progress, message);
        self.session.events().publish(ModuleEvent::new(
            EventType::UpgradeProgress,
            json!({ "job": job_id, "progress": progress, "message": message }),
        ));
    }

    fn mark_aborted(&self, job_id: Uuid) {
        let mut job = self.lock_job();
        if job.id == job_id && job.state.is_running() {
            job.state = UpgradeState::Aborted;
        }
    }

    fn fail(&self, job_id: Uuid, err: BoeError) -> BoeError {
        self.finish(job_id, UpgradeState::Failed, Some(err.to_string()));
        err
    }

    fn finish(&self, job_id: Uuid, state: UpgradeState, detail: Option<String>) {
        let event = {
            let mut job = self.lock_job();
            if job.id != job_id {
                return;
            }
            // an accepted abort wins over the failure it causes
            if !(state == UpgradeState::Failed && job.state == UpgradeState::Aborted) {
                job.state = state;
            }
            job.error = detail;
            job.finished_at = Some(Utc::now());

            let event_type = if job.state == UpgradeState::Aborted {
                EventType::UpgradeAborted
            } else {
                EventType::UpgradeFinished
            };
            ModuleEvent::new(
                event_type,
                json!({ "job": job.id, "state": job.state, "error": job.error }),
            )
        };
        self.session.events().publish(event);
    }

    fn lock_job(&self) -> MutexGuard<'_, UpgradeJob> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
