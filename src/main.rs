//! Botster E2E CLI - inspect the device identity and pairing data.
//!
//! See the `botster_e2e` library for the session layer itself.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use botster_e2e::{identity, parse_pairing_token, pairing_url, Config, FileKeyStore, KeyStore};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "botster-e2e")]
#[command(version)]
#[command(about = "End-to-end session security for the botster terminal relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this device's public key and fingerprint (creates the identity on first run)
    Identity,
    /// Print the pairing URL the browser should open
    PairingUrl {
        /// Hub page URL
        #[arg(long)]
        base: String,
        /// Relay session identifier
        #[arg(long)]
        session: String,
    },
    /// Parse a pairing URL or fragment and show what it pairs with
    InspectToken {
        /// Full pairing URL or bare fragment
        token: String,
    },
    /// List paired peer keys, newest first
    Peers,
    /// Show the effective settings, optionally saving a new display name
    Settings {
        /// Name announced to peers during the handshake
        #[arg(long)]
        display_name: Option<String>,
    },
}

fn init_logging() {
    // Use BOTSTER_LOG_FILE or {config_dir}/botster-e2e.log, falling back to stderr
    let log_path = std::env::var("BOTSTER_LOG_FILE")
        .map(std::path::PathBuf::from)
        .ok()
        .or_else(|| {
            Config::config_dir()
                .ok()
                .map(|dir| dir.join("botster-e2e.log"))
        });

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Some(file) = log_path.and_then(|path| std::fs::File::create(path).ok()) {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load E2E settings")?;

    match cli.command {
        Commands::Identity => {
            let identity = identity::shared()?;
            println!("Name:        {}", config.display_name);
            println!("Fingerprint: {}", identity.fingerprint());
            println!(
                "Public key:  {}",
                BASE64.encode(identity.encryption_public_key())
            );
        }
        Commands::PairingUrl { base, session } => {
            let identity = identity::shared()?;
            println!(
                "{}",
                pairing_url(&base, &session, &identity.encryption_public_key())
            );
            println!("Fingerprint: {}", identity.fingerprint());
        }
        Commands::InspectToken { token } => match parse_pairing_token(&token) {
            Ok(token) => {
                println!("Session:     {}", token.session_id);
                println!("Fingerprint: {}", token.fingerprint());
            }
            Err(e) => {
                eprintln!("{}", e.user_message());
                return Err(e).context("Pairing token rejected");
            }
        },
        Commands::Peers => {
            let store = FileKeyStore::open_default()?;
            let peers = store.list_peer_keys()?;
            if peers.is_empty() {
                println!("No paired peers");
            }
            for peer in peers {
                println!(
                    "{}  {}  {}",
                    peer.fingerprint,
                    peer.paired_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    peer.display_name
                );
            }
        }
        Commands::Settings { display_name } => {
            let mut config = config;
            if let Some(name) = display_name {
                // Save the file's values, not ones overridden from the environment
                let path = Config::config_path()?;
                let mut stored = Config::load_from(&path)?;
                stored.display_name = name.clone();
                stored.save()?;
                log::info!("Saved display name to {}", path.display());
                config.display_name = name;
            }
            println!("Display name:         {}", config.display_name);
            println!("Max skipped keys:     {}", config.max_skipped_keys);
            println!("Max skip per message: {}", config.max_skip_per_message);
            println!("Max decrypt failures: {}", config.max_decrypt_failures);
            println!("Max envelope size:    {}", config.max_envelope_size);
        }
    }

    Ok(())
}
