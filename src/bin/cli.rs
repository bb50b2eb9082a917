//! Tether CLI tool
//!
//! A command-line client for sessions and secure device linking.

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether::{
    transport::ConnectionState, Config, Device, FileStore, HttpBackend, LinkAction, Sdk,
    SdkError, SdkOptions, SecureActionKind, WebSocketConnector,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

/// Tether: session and device-linking client
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to device key file (default: ~/.tether/device.key)
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Directory for persisted state (default: ~/.tether/state)
    #[arg(long)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new device key
    Init {
        /// Force overwrite existing key
        #[arg(short, long)]
        force: bool,
    },

    /// Display your device address
    Address,

    /// Decode a link URL and print the action
    Decode {
        /// Link URL carrying an `action` parameter
        url: String,
    },

    /// Authenticate and hold the relay connection open
    Connect {
        /// Path to TOML config
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Issue a secure-link challenge and wait for another device to answer
    Link {
        /// Path to TOML config
        #[arg(short, long)]
        config: PathBuf,

        /// What answering the challenge does
        #[arg(short, long, value_enum, default_value_t = Kind::CreateAccountDevice)]
        kind: Kind,
    },

    /// Answer a secure-link challenge from another device
    Accept {
        /// Path to TOML config
        #[arg(short, long)]
        config: PathBuf,

        /// Link URL produced by `tether link`
        url: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    /// Add the answering device to this account
    CreateAccountDevice,
}

impl From<Kind> for SecureActionKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::CreateAccountDevice => SecureActionKind::CreateAccountDevice,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tether=info")),
        )
        .init();

    let cli = Cli::parse();

    let device_path = cli.device.unwrap_or_else(|| tether_dir().join("device.key"));
    let state_dir = cli.state.unwrap_or_else(|| tether_dir().join("state"));

    match cli.command {
        Commands::Init { force } => cmd_init(&device_path, force),
        Commands::Address => cmd_address(&device_path),
        Commands::Decode { url } => cmd_decode(&url),
        Commands::Connect { config } => {
            let (sdk, mut errors) = start(&device_path, &state_dir, &config);
            cmd_connect(&sdk, &mut errors).await
        }
        Commands::Link { config, kind } => {
            let (sdk, mut errors) = start(&device_path, &state_dir, &config);
            cmd_link(&sdk, &mut errors, kind.into()).await
        }
        Commands::Accept { config, url } => {
            let (sdk, mut errors) = start(&device_path, &state_dir, &config);
            cmd_accept(&sdk, &mut errors, &url).await
        }
    }
}

fn exit_with(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn tether_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| exit_with("Could not find home directory"))
        .join(".tether")
}

fn load_device(path: &Path) -> Device {
    let bytes = fs::read(path).unwrap_or_else(|_| {
        eprintln!("Error: No device key found at {:?}", path);
        eprintln!("Run 'tether init' to create one.");
        std::process::exit(1);
    });

    Device::from_bytes(&bytes)
        .unwrap_or_else(|e| exit_with(format!("Invalid device key file: {}", e)))
}

fn save_device(device: &Device, path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .unwrap_or_else(|e| exit_with(format!("Error creating directory: {}", e)));
    }

    fs::write(path, device.to_bytes())
        .unwrap_or_else(|e| exit_with(format!("Error saving device key: {}", e)));
}

fn start(
    device_path: &Path,
    state_dir: &Path,
    config_path: &Path,
) -> (Sdk, UnboundedReceiver<SdkError>) {
    let device = load_device(device_path);
    let config =
        Config::load(config_path).unwrap_or_else(|e| exit_with(format!("Config: {}", e)));
    let backend = HttpBackend::new().unwrap_or_else(|e| exit_with(e));

    let sdk = Sdk::new(SdkOptions {
        backend: Arc::new(backend),
        connector: Arc::new(WebSocketConnector),
        store: Arc::new(FileStore::new(state_dir)),
    });
    let errors = sdk
        .take_errors()
        .unwrap_or_else(|| exit_with("error channel already taken"));

    sdk.configure(Some(config));
    sdk.set_device(Some(Arc::new(device)));
    (sdk, errors)
}

/// Wait for the relay connection, reporting engine errors as they come
async fn wait_until_open(sdk: &Sdk, errors: &mut UnboundedReceiver<SdkError>) {
    let mut state = sdk.connection().subscribe_state();
    loop {
        tokio::select! {
            opened = state.wait_for(|s| *s == ConnectionState::Opened) => {
                if opened.is_err() {
                    exit_with("connection manager stopped");
                }
                return;
            }
            Some(error) = errors.recv() => eprintln!("Error: {}", error),
            _ = tokio::signal::ctrl_c() => std::process::exit(130),
        }
    }
}

fn cmd_init(path: &Path, force: bool) {
    if path.exists() && !force {
        eprintln!("Device key already exists at {:?}", path);
        eprintln!("Use --force to overwrite.");
        std::process::exit(1);
    }

    let device = Device::generate();
    save_device(&device, path);

    println!("Device key created successfully!");
    println!();
    println!("Your device address:");
    println!("{}", device.address());
    println!();
    println!("Key saved to: {:?}", path);
    println!();
    println!("IMPORTANT: Back up your device key securely!");
}

fn cmd_address(path: &Path) {
    let device = load_device(path);

    println!("Your device address:");
    println!("{}", device.address());
}

fn cmd_decode(url: &str) {
    let action = LinkAction::from_url(url).unwrap_or_else(|e| exit_with(e));
    let json = serde_json::to_string_pretty(&action).unwrap_or_else(|e| exit_with(e));
    println!("{}", json);
}

async fn cmd_connect(sdk: &Sdk, errors: &mut UnboundedReceiver<SdkError>) {
    let mut session = sdk.subscribe_session();

    println!("=== Tether Session ===");
    println!("Device: {}", sdk.device_address().map(|a| a.to_hex()).unwrap_or_default());
    println!("Press Ctrl-C to disconnect.");
    println!();

    loop {
        tokio::select! {
            changed = session.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = session.borrow_and_update().state();
                println!("Session: {:?}", state);
            }
            Some(error) = errors.recv() => eprintln!("Error: {}", error),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    sdk.destroy_session();
    println!("Disconnected.");
}

async fn cmd_link(
    sdk: &Sdk,
    errors: &mut UnboundedReceiver<SdkError>,
    kind: SecureActionKind,
) {
    wait_until_open(sdk, errors).await;

    let mut resolved = sdk.subscribe_link_actions();
    let action = sdk
        .create_challenge(kind)
        .await
        .unwrap_or_else(|e| exit_with(e));
    let base = sdk.config().map(|c| c.link_base().to_string()).unwrap_or_default();
    let url = action.to_url(&base).unwrap_or_else(|e| exit_with(e));

    println!("Open this link on the other device:");
    println!("{}", url);
    println!();
    println!("Waiting for an answer (Ctrl-C to cancel)...");

    loop {
        tokio::select! {
            action = resolved.recv() => match action {
                Ok(action) => {
                    let json = serde_json::to_string_pretty(&action).unwrap_or_else(|e| exit_with(e));
                    println!("Challenge answered:");
                    println!("{}", json);
                    break;
                }
                Err(e) => exit_with(e),
            },
            Some(error) = errors.recv() => eprintln!("Error: {}", error),
            _ = tokio::signal::ctrl_c() => {
                sdk.cancel_challenge().await;
                println!("Challenge cancelled.");
                break;
            }
        }
    }
}

async fn cmd_accept(sdk: &Sdk, errors: &mut UnboundedReceiver<SdkError>, url: &str) {
    let action = LinkAction::from_url(url).unwrap_or_else(|e| exit_with(e));
    wait_until_open(sdk, errors).await;

    sdk.accept_link_action(&action)
        .await
        .unwrap_or_else(|e| exit_with(e));
    info!("answer sent");

    println!("Challenge answered. The other device should now show this device:");
    println!("{}", sdk.device_address().map(|a| a.to_hex()).unwrap_or_default());
}
