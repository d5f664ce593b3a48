//! SSH login gate.
//!
//! Every login starts with machine impersonation: the gateway is asked for a
//! token for the claimed username. In public-key mode the offered key must
//! then match one of the `.pub` files in the user's personal space under
//! `/.ssh`. In password mode the password itself is the machine secret.
//!
//! Every failure, whatever its cause, surfaces as the same `None`: callers
//! cannot tell an unknown user from a missing space or a wrong key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cloudsftp_backend::{
    AuthenticateRequest, Code, DataTransport, GatewayError, Reference, ResourceType, Selector,
    SpaceFilter, Status, select_protocol,
};
use cloudsftp_vfs::SessionIdentity;
use parking_lot::Mutex;
use russh::keys::ssh_key::{AuthorizedKeys, PublicKey};

use crate::config::AuthMode;
use crate::constants::{PUBLIC_KEY_SUFFIX, SSH_KEYS_DIR};

/// Why a login was refused. Logged, never shown to the client.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("{op} failed: {code:?} {message}")]
    Status {
        op: &'static str,
        code: Code,
        message: String,
    },
    #[error("expected exactly one personal space, found {0}")]
    PersonalSpace(usize),
    #[error("method not enabled in {0:?} mode")]
    WrongMode(AuthMode),
    #[error("no matching key")]
    NoMatchingKey,
}

impl AuthError {
    fn status(op: &'static str, status: &Status) -> Self {
        Self::Status {
            op,
            code: status.code,
            message: status.message.clone(),
        }
    }
}

struct CachedKeys {
    keys: Arc<Vec<PublicKey>>,
    loaded_at: Instant,
}

/// Per-username public keys with a time-to-live. A zero TTL disables it.
pub struct KeyCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedKeys>>,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Keys loaded within the TTL, if any. Expired entries are dropped.
    pub fn get(&self, username: &str) -> Option<Arc<Vec<PublicKey>>> {
        let mut entries = self.entries.lock();
        match entries.get(username) {
            Some(entry) if entry.loaded_at.elapsed() < self.ttl => Some(entry.keys.clone()),
            Some(_) => {
                entries.remove(username);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, username: &str, keys: Vec<PublicKey>) -> Arc<Vec<PublicKey>> {
        let keys = Arc::new(keys);
        if !self.ttl.is_zero() {
            self.entries.lock().insert(
                username.to_string(),
                CachedKeys {
                    keys: keys.clone(),
                    loaded_at: Instant::now(),
                },
            );
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns SSH credentials into backend session identities.
pub struct AuthGate {
    mode: AuthMode,
    selector: Arc<dyn Selector>,
    transport: Arc<dyn DataTransport>,
    machine_auth_key: String,
    cache: KeyCache,
}

impl AuthGate {
    pub fn new(
        mode: AuthMode,
        selector: Arc<dyn Selector>,
        transport: Arc<dyn DataTransport>,
        machine_auth_key: impl Into<String>,
        key_cache_ttl: Duration,
    ) -> Self {
        Self {
            mode,
            selector,
            transport,
            machine_auth_key: machine_auth_key.into(),
            cache: KeyCache::new(key_cache_ttl),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Public-key login. `Some` only when the offered key is stored in the
    /// user's personal space.
    pub async fn authenticate_public_key(
        &self,
        username: &str,
        offered: &PublicKey,
    ) -> Option<SessionIdentity> {
        match self.check_public_key(username, offered).await {
            Ok(identity) => {
                tracing::info!(user = username, "public key accepted");
                Some(identity)
            }
            Err(e) => {
                tracing::debug!(user = username, error = %e, "public key rejected");
                None
            }
        }
    }

    /// Password login. The password is used as the machine-auth secret.
    pub async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
    ) -> Option<SessionIdentity> {
        let result = match self.mode {
            AuthMode::Password => self.impersonate(username, password).await,
            mode => Err(AuthError::WrongMode(mode)),
        };
        match result {
            Ok(identity) => {
                tracing::info!(user = username, "password accepted");
                Some(identity)
            }
            Err(e) => {
                tracing::debug!(user = username, error = %e, "password rejected");
                None
            }
        }
    }

    async fn check_public_key(
        &self,
        username: &str,
        offered: &PublicKey,
    ) -> Result<SessionIdentity, AuthError> {
        if self.mode != AuthMode::PublicKey {
            return Err(AuthError::WrongMode(self.mode));
        }
        let identity = self.impersonate(username, &self.machine_auth_key).await?;

        if let Some(keys) = self.cache.get(username) {
            if contains_key(&keys, offered) {
                return Ok(identity);
            }
            tracing::debug!(user = username, "cached keys do not match, reloading");
        }

        let keys = self.load_keys(username, &identity).await?;
        let keys = self.cache.insert(username, keys);
        if contains_key(&keys, offered) {
            Ok(identity)
        } else {
            Err(AuthError::NoMatchingKey)
        }
    }

    async fn impersonate(&self, username: &str, secret: &str) -> Result<SessionIdentity, AuthError> {
        let client = self.selector.next()?;
        let resp = client
            .authenticate(AuthenticateRequest::machine(username, secret))
            .await?;
        if !resp.status.is_ok() {
            return Err(AuthError::status("authenticate", &resp.status));
        }
        Ok(SessionIdentity::new(resp.user_id, resp.token))
    }

    /// Read every public key stored under `/.ssh` in the user's personal
    /// space. A missing `/.ssh` yields no keys. Files that fail to download
    /// or parse are skipped.
    pub async fn load_keys(
        &self,
        username: &str,
        identity: &SessionIdentity,
    ) -> Result<Vec<PublicKey>, AuthError> {
        let token = identity.token.as_str();

        let client = self.selector.next()?;
        let filters = [
            SpaceFilter::SpaceType("personal".to_string()),
            SpaceFilter::Owner(identity.user_id.clone()),
        ];
        let resp = client.list_storage_spaces(token, &filters).await?;
        if !resp.status.is_ok() {
            return Err(AuthError::status("list spaces", &resp.status));
        }
        let [space] = resp.storage_spaces.as_slice() else {
            return Err(AuthError::PersonalSpace(resp.storage_spaces.len()));
        };

        let client = self.selector.next()?;
        let dir = Reference::new(space, SSH_KEYS_DIR)?;
        let listing = client.list_container(token, &dir).await?;
        if listing.status.code == Code::NotFound {
            return Ok(Vec::new());
        }
        if !listing.status.is_ok() {
            return Err(AuthError::status("list keys", &listing.status));
        }

        let mut keys = Vec::new();
        for info in &listing.infos {
            let name = info.name();
            if info.resource_type != ResourceType::File || !name.ends_with(PUBLIC_KEY_SUFFIX) {
                continue;
            }
            let path = format!("{SSH_KEYS_DIR}/{name}");
            match self.download(identity, &Reference::new(space, &path)?).await {
                Ok(text) => {
                    let parsed = parse_keys(&text);
                    if parsed.is_empty() {
                        tracing::warn!(user = username, file = name, "no usable key in file");
                    }
                    keys.extend(parsed);
                }
                Err(e) => {
                    tracing::warn!(user = username, file = name, error = %e, "failed to fetch key file");
                }
            }
        }

        tracing::debug!(user = username, count = keys.len(), "loaded public keys");
        Ok(keys)
    }

    async fn download(
        &self,
        identity: &SessionIdentity,
        reference: &Reference,
    ) -> Result<String, AuthError> {
        let client = self.selector.next()?;
        let resp = client
            .initiate_file_download(&identity.token, reference)
            .await?;
        if !resp.status.is_ok() {
            return Err(AuthError::status("download", &resp.status));
        }
        let endpoint = select_protocol(&resp.protocols)?;
        let download = self.transport.download(endpoint, &identity.token).await?;
        Ok(String::from_utf8_lossy(&download.body).into_owned())
    }
}

/// Parse authorized-keys formatted text. Bad lines are logged and skipped.
pub fn parse_keys(text: &str) -> Vec<PublicKey> {
    AuthorizedKeys::new(text)
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.public_key().clone()),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable key line");
                None
            }
        })
        .collect()
}

fn contains_key(keys: &[PublicKey], offered: &PublicKey) -> bool {
    keys.iter().any(|k| k.key_data() == offered.key_data())
}

#[cfg(test)]
mod tests {
    use super::*;

    use russh::keys::PrivateKey;

    fn sample_key() -> PublicKey {
        PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn test_parse_keys_skips_garbage() {
        let key = sample_key();
        let line = key.to_openssh().unwrap();
        let text = format!("# comment\n\nnot a key\n{line} user@example.com\n");
        let keys = parse_keys(&text);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_data(), key.key_data());
    }

    #[test]
    fn test_contains_key_ignores_comment() {
        let key = sample_key();
        let mut other = key.clone();
        other.set_comment("different");
        assert!(contains_key(&[key], &other));
        assert!(!contains_key(&[], &other));
        assert!(!contains_key(&[sample_key()], &other));
    }

    #[test]
    fn test_cache_ttl() {
        let cache = KeyCache::new(Duration::from_secs(60));
        assert!(cache.get("alice").is_none());
        cache.insert("alice", vec![sample_key()]);
        assert_eq!(cache.get("alice").map(|k| k.len()), Some(1));
        assert!(cache.get("bob").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_disabled() {
        let cache = KeyCache::new(Duration::ZERO);
        let keys = cache.insert("alice", vec![sample_key()]);
        assert_eq!(keys.len(), 1);
        assert!(cache.get("alice").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_expiry() {
        let cache = KeyCache::new(Duration::from_millis(1));
        cache.insert("alice", vec![sample_key()]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("alice").is_none());
        assert!(cache.is_empty());
    }
}
