//! cloudsftp: SFTP access to CS3 storage spaces.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use cloudsftp_server::constants::DEFAULT_CONFIG_FILE;
use cloudsftp_server::{AuthMode, Config, host_key};

#[derive(Parser, Debug)]
#[command(name = "cloudsftp")]
#[command(about = "SFTP gateway onto CS3 storage spaces")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Server flags when no subcommand is given
    #[command(flatten)]
    server: ServerArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SFTP server (default)
    Server(ServerArgs),
    /// Generate an Ed25519 host key in OpenSSH format
    Keygen {
        /// Where to write the private key
        path: PathBuf,
    },
    /// Print the effective configuration as RON
    Config(ServerArgs),
    /// Print version information
    Version,
}

/// Overrides applied on top of the config file.
#[derive(Args, Debug, Default)]
struct ServerArgs {
    /// RON config file (default: ./cloudsftp.ron when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Host key path; generated when missing
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// Gateway base URL
    #[arg(long)]
    gateway: Option<String>,

    /// Shared secret for machine impersonation
    #[arg(long, env = "CLOUDSFTP_MACHINE_AUTH_API_KEY", hide_env_values = true)]
    machine_auth_api_key: Option<String>,

    /// Verify TLS certificates of the gateway and data endpoints
    #[arg(long)]
    verify_tls: bool,

    /// Gateway request timeout in seconds
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Largest file an open handle will buffer, in bytes
    #[arg(long)]
    max_object_bytes: Option<u64>,

    /// Login method
    #[arg(long, value_enum)]
    auth_mode: Option<AuthMode>,

    /// Seconds to reuse a user's loaded public keys (0 disables)
    #[arg(long)]
    key_cache_ttl: Option<u64>,

    /// Log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Multi-line log output
    #[arg(long)]
    log_pretty: bool,

    /// Disable ANSI colors
    #[arg(long)]
    no_color: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl ServerArgs {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(path) = self.host_key {
            config.host_key_path = path;
        }
        if let Some(address) = self.gateway {
            config.gateway.address = address;
        }
        if let Some(key) = self.machine_auth_api_key {
            config.gateway.machine_auth_api_key = key;
        }
        if self.verify_tls {
            config.gateway.insecure = false;
        }
        if let Some(secs) = self.request_timeout {
            config.gateway.request_timeout_secs = secs;
        }
        if let Some(bytes) = self.max_object_bytes {
            config.gateway.max_object_bytes = bytes;
        }
        if let Some(mode) = self.auth_mode {
            config.auth.mode = mode;
        }
        if let Some(ttl) = self.key_cache_ttl {
            config.auth.key_cache_ttl_secs = ttl;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if self.log_pretty {
            config.log.pretty = true;
        }
        if self.no_color {
            config.log.color = false;
        }
        if let Some(file) = self.log_file {
            config.log.file = Some(file);
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Config::load(Path::new(DEFAULT_CONFIG_FILE))
            .with_context(|| format!("config {DEFAULT_CONFIG_FILE}")),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Server(cli.server)) {
        Command::Server(args) => {
            let mut config = load_config(args.config.as_deref())?;
            args.apply(&mut config);
            config.validate()?;

            let _guard = cloudsftp_server::logging::init(&config.log)?;
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "cloudsftp starting");
            cloudsftp_server::run(config).await
        }
        Command::Keygen { path } => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            let key = host_key::generate()?;
            host_key::save(&key, &path).await?;
            println!("{}", key.public_key().to_openssh()?);
            Ok(())
        }
        Command::Config(args) => {
            let mut config = load_config(args.config.as_deref())?;
            args.apply(&mut config);
            print!("{}", config.to_ron()?);
            Ok(())
        }
        Command::Version => {
            println!("cloudsftp {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
