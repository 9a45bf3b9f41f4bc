//! End-to-end workflow tests for the BOE client
//!
//! These tests drive a simulated board through the whole client stack:
//! session setup, crypto operations, firmware update from a release mirror,
//! and session release.

use std::path::Path;
use std::sync::Arc;

use k256::ecdsa::SigningKey;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use boe_core::{
    BoeError, FallbackRecoverer, ModuleVersion, NativeModule, NativeOp, PublicKeyRecoverer,
    SignatureParts, SimulatedModule, SimulatorConfig, SoftwareRecoverer,
};
use boe_hsm::{
    BoeConfig, CryptoFacade, DeviceSession, DirectoryReleaseFetcher, EventType, FirmwareUpdater,
    ReleaseEntry, ReleaseIndex, UpgradeState, EVENT_BASE, EVENT_MAX,
};

/// Write a release mirror holding one image per entry
fn write_mirror(root: &Path, releases: &[((u8, u8, u8, u8), Vec<u8>)]) {
    let mut index = ReleaseIndex::default();
    for (i, (version, image)) in releases.iter().enumerate() {
        let file = format!("boe-fw-{}.bin", i);
        std::fs::write(root.join(&file), image).unwrap();
        index.releases.push(ReleaseEntry {
            hardware: version.0,
            major: version.1,
            feature: version.2,
            dev: version.3,
            file,
            sha256: hex::encode(Sha256::digest(image)),
        });
    }
    std::fs::write(
        root.join("releases.json"),
        serde_json::to_string_pretty(&index).unwrap(),
    )
    .unwrap();
}

fn board(config: SimulatorConfig) -> (Arc<SimulatedModule>, Arc<DeviceSession>) {
    let module = Arc::new(SimulatedModule::new(config).unwrap());
    let session = Arc::new(DeviceSession::new(module.clone()));
    session.init().unwrap();
    (module, session)
}

fn sign_recoverable(secret: [u8; 32], hash: &[u8; 32]) -> ([u8; 32], [u8; 32], u8, [u8; 64]) {
    let key = SigningKey::from_bytes((&secret).into()).unwrap();
    let (sig, recid) = key.sign_prehash_recoverable(hash).unwrap();
    let bytes = sig.to_bytes();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..]);
    let point = key.verifying_key().to_encoded_point(false);
    let mut pubkey = [0u8; 64];
    pubkey.copy_from_slice(&point.as_bytes()[1..]);
    (r, s, recid.to_byte(), pubkey)
}

/// Runs a board through its complete client lifecycle
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_module_lifecycle() {
    // ==========================================
    // STEP 1: Configure and open the board
    // ==========================================
    let mirror = TempDir::new().unwrap();
    let config = BoeConfig {
        release_dir: mirror.path().to_path_buf(),
        simulator: SimulatorConfig {
            version: ModuleVersion::new(1, 0, 3, 0),
            serial: "BOE-E2E-0042".to_string(),
            ..SimulatorConfig::default()
        },
        ..BoeConfig::default()
    };
    config.ensure_directories().unwrap();

    let (module, session) = board(config.simulator.clone());
    assert!(session.init().is_ok());
    assert_eq!(module.calls(NativeOp::Init), 1);

    // ==========================================
    // STEP 2: Identity and entropy
    // ==========================================
    let crypto = CryptoFacade::new(Arc::clone(&session));
    assert_eq!(crypto.get_serial_number().unwrap(), "BOE-E2E-0042");
    assert_eq!(crypto.get_board_identity().unwrap().len(), 42);
    assert_eq!(crypto.get_version().unwrap(), ModuleVersion::new(1, 0, 3, 0));
    let random = crypto.get_random().unwrap();

    // ==========================================
    // STEP 3: Challenge-response authentication
    // ==========================================
    let signature = crypto.hardware_auth_sign(&random).unwrap();
    assert_eq!(signature.len(), 64);
    assert!(crypto.hardware_auth_verify(
        &random,
        &module.host_id(),
        &module.auth_public_key(),
        &signature
    ));

    let mut tampered = signature;
    tampered[0] ^= 0xff;
    assert!(!crypto.hardware_auth_verify(
        &random,
        &module.host_id(),
        &module.auth_public_key(),
        &tampered
    ));

    // ==========================================
    // STEP 4: Signature recovery and hash chain
    // ==========================================
    let hash: [u8; 32] = Sha256::digest(b"boe transfer").into();
    let (r, s, v, pubkey) = sign_recoverable([0x17; 32], &hash);
    let recovered = crypto.validate_sign_and_recover(&hash, &r, &s, v).unwrap();
    assert_eq!(recovered.as_bytes(), &pubkey);

    let first = crypto.get_next_hash(&hash).unwrap();
    let second = crypto.get_next_hash(&first).unwrap();
    assert_ne!(first, second);
    assert_eq!(first, crypto.get_next_hash(&hash).unwrap());

    // ==========================================
    // STEP 5: Firmware update from the mirror
    // ==========================================
    let image = vec![0x5a; 4096];
    write_mirror(
        mirror.path(),
        &[
            ((1, 0, 2, 0), vec![0x01; 16]),
            ((1, 1, 0, 0), image.clone()),
            ((2, 9, 9, 9), vec![0x02; 16]),
        ],
    );
    module.set_progress_script(vec![0, 0, 25, 25, 50, 75, 75, 100, 100]);

    let updater = FirmwareUpdater::new(
        Arc::clone(&session),
        Arc::new(DirectoryReleaseFetcher::new(&config.release_dir)),
    );
    assert!(updater.check_hardware_presence());

    let mut progress = session.subscribe_event(EventType::UpgradeProgress);
    let mut finished = session.subscribe_event(EventType::UpgradeFinished);

    updater.update().await.unwrap();

    let mut seen = Vec::new();
    while let Some(event) = progress.try_recv() {
        seen.push(event.payload["progress"].as_u64().unwrap());
    }
    assert_eq!(seen, vec![0, 25, 50, 75, 100]);
    assert_eq!(module.flashed_len(), Some(image.len()));

    let job = updater.job();
    assert_eq!(job.state, UpgradeState::Succeeded);
    assert_eq!(job.from_version, Some(ModuleVersion::new(1, 0, 3, 0)));
    assert_eq!(finished.recv().await.unwrap().payload["state"], "Succeeded");

    // ==========================================
    // STEP 6: Release
    // ==========================================
    let mut released = session.subscribe_event(EventType::SessionReleased);
    session.release().unwrap();
    assert!(!session.may_continue());
    assert!(released.recv().await.is_some());

    let upgrades = module.calls(NativeOp::Upgrade);
    assert!(matches!(
        updater.update().await,
        Err(BoeError::UpdateFailed(_))
    ));
    assert_eq!(module.calls(NativeOp::Upgrade), upgrades);
}

/// Hardware and software recovery agree, including for short inputs
#[test]
fn test_recovery_paths_agree() {
    let (module, session) = board(SimulatorConfig::default());
    let hardware = CryptoFacade::new(Arc::clone(&session));
    let software = CryptoFacade::with_recoverer(
        Arc::clone(&session),
        Box::new(FallbackRecoverer::software_only()),
    );

    for seed in 1u8..=8 {
        let hash: [u8; 32] = Sha256::digest([seed]).into();
        let (r, s, v, pubkey) = sign_recoverable([seed; 32], &hash);

        let on_board = hardware.validate_sign_and_recover(&hash, &r, &s, v).unwrap();
        let in_software = software.validate_sign_and_recover(&hash, &r, &s, v).unwrap();
        assert_eq!(on_board, in_software);
        assert_eq!(on_board.as_bytes(), &pubkey);
    }
    assert_eq!(module.calls(NativeOp::ValidSign), 8);

    // leading zero bytes may be stripped by callers; slots are right-aligned
    let mut hash = [0u8; 32];
    hash[31] = 0x07;
    let (r, s, v, _) = sign_recoverable([0x33; 32], &hash);
    let short = hardware.validate_sign_and_recover(&hash[31..], &r, &s, v).unwrap();
    let full = hardware.validate_sign_and_recover(&hash, &r, &s, v).unwrap();
    assert_eq!(short, full);
}

/// With the board failing, recovery falls through to software
#[test]
fn test_recovery_fallback_matches_software() {
    let (module, session) = board(SimulatorConfig::default());
    let crypto = CryptoFacade::new(Arc::clone(&session));
    module.fail_on(NativeOp::ValidSign);

    let hash = [0x44; 32];
    let (r, s, v, _) = sign_recoverable([0x45; 32], &hash);

    let key = crypto.validate_sign_and_recover(&hash, &r, &s, v).unwrap();
    let parts = SignatureParts::from_slices(&hash, &r, &s, v).unwrap();
    assert_eq!(key, SoftwareRecoverer.recover(&parts).unwrap());
    assert_eq!(module.freed_errors(), 1);
}

/// Releasing the session while flashing stops the upgrade
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_during_update() {
    let mirror = TempDir::new().unwrap();
    write_mirror(mirror.path(), &[((1, 2, 0, 0), vec![0x11; 512])]);

    let (module, session) = board(SimulatorConfig::default());
    module.set_progress_script((0..=100).collect());
    let updater = Arc::new(FirmwareUpdater::new(
        Arc::clone(&session),
        Arc::new(DirectoryReleaseFetcher::new(mirror.path())),
    ));

    let mut progress = session.subscribe_event(EventType::UpgradeProgress);
    let mut aborted = session.subscribe_event(EventType::UpgradeAborted);
    let task = {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move { updater.update().await })
    };

    progress.recv().await.unwrap();
    session.release().unwrap();

    assert!(task.await.unwrap().is_err());
    assert_eq!(updater.job().state, UpgradeState::Aborted);
    assert_eq!(module.flashed_len(), None);
    assert!(aborted.recv().await.is_some());
}

/// A tampered image never reaches the board
#[tokio::test]
async fn test_tampered_release_is_not_flashed() {
    let mirror = TempDir::new().unwrap();
    write_mirror(mirror.path(), &[((1, 2, 0, 0), vec![0x11; 512])]);
    std::fs::write(mirror.path().join("boe-fw-0.bin"), vec![0x12; 512]).unwrap();

    let (module, session) = board(SimulatorConfig::default());
    let updater = FirmwareUpdater::new(
        Arc::clone(&session),
        Arc::new(DirectoryReleaseFetcher::new(mirror.path())),
    );

    assert!(matches!(
        updater.update().await,
        Err(BoeError::ReleaseFetch(_))
    ));
    assert_eq!(updater.job().state, UpgradeState::Failed);
    assert_eq!(module.calls(NativeOp::Upgrade), 0);
}

/// Event subscriptions only accept codes strictly inside the reserved range
#[test]
fn test_event_code_range() {
    let (_, session) = board(SimulatorConfig::default());

    assert!(matches!(
        session.subscribe_event_code(EVENT_BASE),
        Err(BoeError::UnknownEvent(_))
    ));
    assert!(matches!(
        session.subscribe_event_code(EVENT_MAX),
        Err(BoeError::UnknownEvent(_))
    ));
    for code in (EVENT_BASE + 1)..EVENT_MAX {
        assert!(session.subscribe_event_code(code).is_ok());
    }
}

/// Malformed auth buffers are rejected before the board sees them
#[test]
fn test_auth_verify_rejects_malformed_buffers() {
    let (module, session) = board(SimulatorConfig::default());
    let crypto = CryptoFacade::new(Arc::clone(&session));

    assert!(!crypto.hardware_auth_verify(&[0; 32], &[0; 32], &[0; 64], &[0; 63]));
    assert!(!crypto.hardware_auth_verify(&[], &[0; 32], &[0; 64], &[0; 64]));
    assert_eq!(module.calls(NativeOp::HwVerify), 0);

    // the board itself is still reachable
    assert!(module.hw_verify(&[0; 32], &[0; 32], &[0; 64], &[0; 64]).is_err());
    assert_eq!(module.calls(NativeOp::HwVerify), 1);
}
