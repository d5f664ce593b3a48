//! SSH server for the gateway
//!
//! Accepts SSH connections, authenticates them through the [`AuthGate`] and
//! serves the `sftp` subsystem on session channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use cloudsftp_backend::{DataTransport, Selector};
use cloudsftp_vfs::{DEFAULT_MAX_OBJECT_BYTES, Dispatcher, SessionIdentity};
use russh::keys::PrivateKey;
use russh::keys::ssh_key;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::net::TcpListener;

use crate::auth::AuthGate;
use crate::config::AuthMode;
use crate::constants::{SFTP_SUBSYSTEM, SSH_AUTH_REJECTION_DELAY};
use crate::host_key::{self, HostKeyError};
use crate::sftp::SftpSession;

/// SSH server configuration
#[derive(Clone)]
pub struct SshServerConfig {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
    /// Per-handle buffer cap for every SFTP session.
    pub max_object_bytes: u64,
}

impl SshServerConfig {
    /// Create config with an ephemeral key (for testing)
    pub fn ephemeral(port: u16) -> Result<Self, HostKeyError> {
        Ok(Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            host_key: host_key::generate()?,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
        })
    }
}

/// Shared by every connection.
struct Backend {
    auth: AuthGate,
    selector: Arc<dyn Selector>,
    transport: Arc<dyn DataTransport>,
    max_object_bytes: u64,
}

/// SSH server
pub struct SshServer {
    config: SshServerConfig,
    backend: Arc<Backend>,
}

impl SshServer {
    pub fn new(
        config: SshServerConfig,
        auth: AuthGate,
        selector: Arc<dyn Selector>,
        transport: Arc<dyn DataTransport>,
    ) -> Self {
        let backend = Arc::new(Backend {
            auth,
            selector,
            transport,
            max_object_bytes: config.max_object_bytes,
        });
        Self { config, backend }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let socket = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(socket).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, socket: TcpListener) -> Result<(), std::io::Error> {
        let config = russh::server::Config {
            auth_rejection_time: SSH_AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            methods: auth_methods(self.backend.auth.mode()),
            keys: vec![self.config.host_key.clone()],
            ..Default::default()
        };

        tracing::info!(
            addr = %socket.local_addr()?,
            mode = ?self.backend.auth.mode(),
            "starting SSH server"
        );

        let mut server = Server {
            backend: self.backend.clone(),
        };
        server
            .run_on_socket(Arc::new(config), &socket)
            .await
            .map_err(std::io::Error::other)
    }
}

fn auth_methods(mode: AuthMode) -> MethodSet {
    let mut methods = MethodSet::empty();
    match mode {
        AuthMode::PublicKey => methods.push(MethodKind::PublicKey),
        AuthMode::Password => methods.push(MethodKind::Password),
    }
    methods
}

/// Server factory - creates handlers for each connection
struct Server {
    backend: Arc<Backend>,
}

impl server::Server for Server {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        tracing::debug!(?peer_addr, "new connection");
        ConnectionHandler::new(self.backend.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        tracing::error!("Session error: {:?}", error);
    }
}

/// Handler for a single SSH connection
struct ConnectionHandler {
    backend: Arc<Backend>,
    peer_addr: Option<SocketAddr>,
    /// Bound only after a successful login.
    identity: Option<SessionIdentity>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    fn new(backend: Arc<Backend>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            backend,
            peer_addr,
            identity: None,
            channels: HashMap::new(),
        }
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(auth_methods(self.backend.auth.mode())),
            partial_success: false,
        }
    }

    fn accept(&mut self, identity: Option<SessionIdentity>) -> Auth {
        match identity {
            Some(identity) => {
                self.identity = Some(identity);
                Auth::Accept
            }
            None => self.reject(),
        }
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(self.reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(user, peer = ?self.peer_addr, "password auth attempt");
        if self.backend.auth.mode() != AuthMode::Password {
            return Ok(self.reject());
        }
        let identity = self.backend.auth.authenticate_password(user, password).await;
        Ok(self.accept(identity))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::debug!(user, peer = ?self.peer_addr, "public key auth attempt");
        if self.backend.auth.mode() != AuthMode::PublicKey {
            return Ok(self.reject());
        }
        let identity = self
            .backend
            .auth
            .authenticate_public_key(user, public_key)
            .await;
        Ok(self.accept(identity))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.identity.is_none() {
            return Ok(false);
        }
        tracing::debug!("Channel {} opened", channel.id());
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != SFTP_SUBSYSTEM {
            tracing::debug!(subsystem = name, "refusing subsystem");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let (Some(identity), Some(channel)) =
            (self.identity.clone(), self.channels.remove(&channel_id))
        else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        tracing::info!(user = %identity.user_id, peer = ?self.peer_addr, "sftp session started");
        let dispatcher = Dispatcher::new(
            self.backend.selector.clone(),
            self.backend.transport.clone(),
            identity,
        )
        .with_max_object_bytes(self.backend.max_object_bytes);
        session.channel_success(channel_id)?;
        russh_sftp::server::run(channel.into_stream(), SftpSession::new(dispatcher)).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel {} closed", channel);
        self.channels.remove(&channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_config() {
        let config = SshServerConfig::ephemeral(0).unwrap();
        assert!(config.bind_addr.ip().is_loopback());
    }
}
