//! mqttd - multi-listener MQTT broker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mqttd::{AuthSource, ConfigFile, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cert;

const DEFAULT_CONFIG: &str = "mqttd.yaml";
const DEFAULT_AUTH: &str = "auth.yaml";

/// MQTT broker for MQTT 3.1.1 and 5.0 clients.
///
/// Serves plain MQTT, MQTT over TLS, MQTT over websocket and an HTTP status
/// page, each enabled by its port in the config file.
#[derive(Parser, Debug)]
#[command(name = "mqttd")]
#[command(about = "Multi-listener MQTT broker")]
#[command(version)]
struct Cli {
    /// Config file (default is mqttd.yaml next to the executable)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Auth file with users and topic ACLs
    #[arg(long, global = true)]
    auth: Option<PathBuf>,

    /// Allow every client and topic, ignoring --auth
    #[arg(long, global = true)]
    disable_auth: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the broker (default)
    Run,
    /// Generate a self-signed ECC certificate
    Genecc {
        /// Output directory
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Write the sample auth file
    Initauth {
        /// Output path
        #[arg(default_value = DEFAULT_AUTH)]
        path: PathBuf,
    },
    /// Write a config file with default values
    DefaultConfig {
        /// Output path (default is the --config path)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    match cli.command.as_ref().unwrap_or(&Command::Run) {
        Command::Run => run(&cli).await,
        Command::Genecc { dir } => {
            let (cert, key) = cert::generate(dir)?;
            println!("wrote {} and {}", cert.display(), key.display());
            Ok(())
        }
        Command::Initauth { path } => {
            mqttd::auth::write_sample(path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Command::DefaultConfig { path } => {
            let path = match path {
                Some(path) => path.clone(),
                None => config_path(&cli),
            };
            ConfigFile::with_defaults(&path)
                .save()
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let path = config_path(cli);
    let file = ConfigFile::load_or_create(&path)
        .with_context(|| format!("loading config {}", path.display()))?;
    info!(config = %path.display(), "config loaded");

    let mut config = file.to_server_config();
    config.auth = auth_source(cli);

    let server = Server::new(config)?;
    server.run().await?;
    Ok(())
}

fn auth_source(cli: &Cli) -> AuthSource {
    if cli.disable_auth {
        AuthSource::Disabled
    } else {
        AuthSource::File(cli.auth.clone())
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG)))
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG).to_path_buf())
}
