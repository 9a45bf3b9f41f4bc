//! BOE - Command-line client for the BOE hardware security module
//!
//! Drives the simulated board through the same session, crypto and update
//! layers a hardware-backed build uses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boe_core::{FallbackRecoverer, SimulatedModule};
use boe_hsm::{
    BoeConfig, CryptoFacade, DeviceSession, DirectoryReleaseFetcher, EventType, FirmwareUpdater,
    ModuleEvent,
};

#[derive(Parser)]
#[command(name = "boe")]
#[command(about = "Client for the BOE hardware security module", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to $BOE_CONFIG or the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe for the board
    Check,

    /// Show version, serial number and bound account
    Info,

    /// Draw 32 bytes of hardware entropy
    Random,

    /// Derive the next value of a hash chain
    NextHash {
        /// Current hash (32 bytes, hex)
        hash: String,
    },

    /// Sign a challenge with the board authentication key
    Sign {
        /// Challenge (32 bytes, hex)
        random: String,
    },

    /// Verify a challenge-response signature
    Verify {
        /// Challenge (32 bytes, hex)
        #[arg(long)]
        random: String,

        /// Signature (64 bytes, hex)
        #[arg(long)]
        signature: String,

        /// Host identity (32 bytes, hex); defaults to this board's
        #[arg(long)]
        host_id: Option<String>,

        /// Challenger public key (64 bytes, hex); defaults to this board's
        #[arg(long)]
        challenger_id: Option<String>,
    },

    /// Recover the signer's public key from a signature
    Recover {
        /// Message hash (hex, up to 32 bytes)
        #[arg(long)]
        hash: String,

        /// Signature r (hex, up to 32 bytes)
        #[arg(short)]
        r: String,

        /// Signature s (hex, up to 32 bytes)
        #[arg(short)]
        s: String,

        /// Recovery id
        #[arg(short, default_value_t = 0)]
        v: u8,
    },

    /// Flash the newest firmware from the release mirror
    Update {
        /// Release mirror directory (overrides the config)
        #[arg(long)]
        release_dir: Option<PathBuf>,

        /// Abort the update after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boe_hsm=info,boe_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var_os("BOE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(BoeConfig::default_path);
    let config = BoeConfig::load_or_create(&config_path)
        .with_context(|| format!("Failed to load config {:?}", config_path))?;

    let module = Arc::new(SimulatedModule::new(config.simulator.clone())?);
    let session = Arc::new(DeviceSession::new(module.clone()));
    session.init()?;

    let result = run(cli.command, &config, &module, &session).await;

    if let Err(e) = session.release() {
        error!("Release failed: {}", e);
    }
    session.events().close();
    result
}

async fn run(
    command: Commands,
    config: &BoeConfig,
    module: &Arc<SimulatedModule>,
    session: &Arc<DeviceSession>,
) -> Result<()> {
    let crypto = if config.hardware_recovery {
        CryptoFacade::new(Arc::clone(session))
    } else {
        CryptoFacade::with_recoverer(
            Arc::clone(session),
            Box::new(FallbackRecoverer::software_only()),
        )
    };

    match command {
        Commands::Check => {
            let updater = FirmwareUpdater::new(
                Arc::clone(session),
                Arc::new(DirectoryReleaseFetcher::new(&config.release_dir)),
            );
            if updater.check_hardware_presence() {
                println!("Board present");
            } else {
                bail!("Board not found");
            }
        }

        Commands::Info => {
            println!("Module Information:");
            println!("  Version: {}", crypto.get_version()?);
            println!("  Serial Number: {}", crypto.get_serial_number()?);
            println!("  Bound Account: {}", crypto.get_board_identity()?);
        }

        Commands::Random => {
            println!("{}", hex::encode(crypto.get_random()?));
        }

        Commands::NextHash { hash } => {
            let hash = hex::decode(hash).context("hash is not hex")?;
            println!("{}", hex::encode(crypto.get_next_hash(&hash)?));
        }

        Commands::Sign { random } => {
            let random = hex::decode(random).context("random is not hex")?;
            println!("{}", hex::encode(crypto.hardware_auth_sign(&random)?));
        }

        Commands::Verify {
            random,
            signature,
            host_id,
            challenger_id,
        } => {
            let random = hex::decode(random).context("random is not hex")?;
            let signature = hex::decode(signature).context("signature is not hex")?;
            let host_id = match host_id {
                Some(h) => hex::decode(h).context("host id is not hex")?,
                None => module.host_id().to_vec(),
            };
            let challenger_id = match challenger_id {
                Some(c) => hex::decode(c).context("challenger id is not hex")?,
                None => module.auth_public_key().to_vec(),
            };

            if crypto.hardware_auth_verify(&random, &host_id, &challenger_id, &signature) {
                println!("✓ Signature valid");
            } else {
                bail!("Signature invalid");
            }
        }

        Commands::Recover { hash, r, s, v } => {
            let hash = hex::decode(hash).context("hash is not hex")?;
            let r = hex::decode(r).context("r is not hex")?;
            let s = hex::decode(s).context("s is not hex")?;
            let key = crypto.validate_sign_and_recover(&hash, &r, &s, v)?;
            println!("{}", key.to_hex());
        }

        Commands::Update {
            release_dir,
            timeout_secs,
        } => {
            let release_dir = release_dir.unwrap_or_else(|| config.release_dir.clone());
            let timeout_secs = timeout_secs.or(config.update_timeout_secs);
            update(session, release_dir, timeout_secs).await?;
        }
    }

    Ok(())
}

async fn update(
    session: &Arc<DeviceSession>,
    release_dir: PathBuf,
    timeout_secs: Option<u64>,
) -> Result<()> {
    info!("Using release mirror {:?}", release_dir);
    let updater = Arc::new(FirmwareUpdater::new(
        Arc::clone(session),
        Arc::new(DirectoryReleaseFetcher::new(release_dir)),
    ));

    let mut progress = session.subscribe_event(EventType::UpgradeProgress);
    let mut task = {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move { updater.update().await })
    };

    let deadline = async {
        match timeout_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut abort_sent = false;

    let result = loop {
        tokio::select! {
            joined = &mut task => break joined?,
            Some(event) = progress.recv() => print_progress(&event),
            _ = &mut deadline, if !abort_sent => {
                abort_sent = true;
                warn!("Update exceeded its deadline, requesting abort");
                if let Err(e) = updater.abort() {
                    error!("Abort failed: {}", e);
                }
            }
        }
    };
    while let Some(event) = progress.try_recv() {
        print_progress(&event);
    }

    let job = updater.job();
    match result {
        Ok(()) => {
            println!("✓ Firmware updated");
            println!("  Job: {}", job.id);
            println!("  Image: {} bytes", job.image_len);
            Ok(())
        }
        Err(e) => bail!("Update {} ended {:?}: {}", job.id, job.state, e),
    }
}

fn print_progress(event: &ModuleEvent) {
    println!(
        "  {:>3}% {}",
        event.payload["progress"],
        event.payload["message"].as_str().unwrap_or_default()
    );
}
