//! SFTP gateway server.
//!
//! Wires the pieces together: an SSH listener whose logins go through the
//! [`AuthGate`], and an `sftp` subsystem backed by one
//! [`cloudsftp_vfs::Dispatcher`] per session.

pub mod auth;
pub mod config;
pub mod constants;
pub mod host_key;
pub mod logging;
pub mod sftp;
pub mod ssh;

use std::sync::Arc;

use anyhow::Context;
use cloudsftp_backend::{DataTransport, HttpGateway, HttpTransport, RoundRobinSelector, Selector};

pub use auth::{AuthGate, KeyCache};
pub use config::{AuthMode, Config, ConfigError};
pub use sftp::SftpSession;
pub use ssh::{SshServer, SshServerConfig};

/// Build the server described by `config` and serve until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let options = config.gateway.transport_options();
    let gateway = HttpGateway::new(&config.gateway.address, &options)
        .context("failed to build gateway client")?;
    let selector: Arc<dyn Selector> = Arc::new(RoundRobinSelector::single(Arc::new(gateway)));
    let transport: Arc<dyn DataTransport> =
        Arc::new(HttpTransport::new(&options).context("failed to build transfer client")?);

    let auth = AuthGate::new(
        config.auth.mode,
        selector.clone(),
        transport.clone(),
        config.gateway.machine_auth_api_key.clone(),
        config.key_cache_ttl(),
    );

    let host_key = host_key::load_or_generate(&config.host_key_path)
        .await
        .with_context(|| format!("host key {}", config.host_key_path.display()))?;
    let server = SshServer::new(
        SshServerConfig {
            bind_addr: config.bind_addr,
            host_key,
            max_object_bytes: config.gateway.max_object_bytes,
        },
        auth,
        selector,
        transport,
    );

    tokio::select! {
        result = server.run() => result.context("SSH server failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
