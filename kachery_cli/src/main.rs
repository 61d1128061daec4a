use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use directories::ProjectDirs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use kachery_core::KeyPair;
use kachery_node::{KacheryNode, NodeConfig, NullPubsubTransport, NullSignedUrlMinter};

#[derive(Parser)]
#[command(version, about = "Kachery daemon command-line client", long_about = None)]
struct Cli {
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the kachery daemon
    Start {
        /// Label for this node
        #[arg(long)]
        label: String,

        /// Owner of this node
        #[arg(long, default_value = "")]
        owner: String,

        /// Override the storage directory
        #[arg(long, value_name = "DIR")]
        storage_dir: Option<PathBuf>,
    },
    /// Print information about this node
    Info,
    /// Display the kachery daemon version and exit
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let dirs = ProjectDirs::from("org", "kachery", "kachery-daemon")
        .context("failed to determine config directory path")?;

    match cli.cmd {
        Commands::Start {
            label,
            owner,
            storage_dir,
        } => {
            let keypair = load_or_create_keypair(dirs.config_dir())?;
            let mut config = load_or_default_config(&dirs)?;
            config.label = label;
            config.owner = if owner.is_empty() { None } else { Some(owner) };
            if let Some(dir) = storage_dir {
                config.storage_dir = dir;
            }
            write_config(&dirs, &config)?;

            let node = KacheryNode::start(
                config,
                keypair,
                Arc::new(NullPubsubTransport::default()),
                Arc::new(NullSignedUrlMinter),
            )
            .await?;
            node.run_until_shutdown().await?;
        }
        Commands::Info => {
            let keypair = load_or_create_keypair(dirs.config_dir())?;
            println!("Node ID: {}", keypair.public_key());
        }
        Commands::Version => {
            println!(
                "This is kachery-daemon version {}",
                env!("CARGO_PKG_VERSION")
            );
        }
    }

    Ok(())
}

/// The node's identity is an Ed25519 keypair persisted as 32 raw bytes;
/// generated on first use.
fn load_or_create_keypair(config_dir: &Path) -> anyhow::Result<KeyPair> {
    let path = config_dir.join("node.secretkey");
    if path.exists() {
        let bytes = std::fs::read(&path)?;
        return KeyPair::from_secret_bytes(&bytes)
            .with_context(|| format!("invalid secret key file {path:?}"));
    }
    std::fs::create_dir_all(config_dir)?;
    info!("generating secure random secret key for node");
    let keypair = KeyPair::generate();
    std::fs::write(&path, keypair.secret_bytes())?;
    Ok(keypair)
}

fn config_file(dirs: &ProjectDirs) -> PathBuf {
    dirs.config_dir().join("node.toml")
}

fn load_or_default_config(dirs: &ProjectDirs) -> anyhow::Result<NodeConfig> {
    let path = config_file(dirs);
    if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        return toml::from_str(&text).with_context(|| format!("could not parse {path:?}"));
    }
    Ok(NodeConfig {
        label: String::new(),
        owner: None,
        storage_dir: dirs.data_dir().join("storage"),
        channels: Vec::new(),
    })
}

fn write_config(dirs: &ProjectDirs, config: &NodeConfig) -> anyhow::Result<()> {
    let path = config_file(dirs);
    std::fs::create_dir_all(path.parent().unwrap())?;
    let tmp_path = path.with_extension("tmp");
    let mut tmp = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    tmp.write_all(toml::to_string(config)?.as_bytes())?;
    tmp.sync_all()?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}
