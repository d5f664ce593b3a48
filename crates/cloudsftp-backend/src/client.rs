//! Gateway RPC surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{Protocol, Reference, ResourceInfo, SpaceFilter, Status, StorageSpace};

/// Credential exchange request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    #[serde(rename = "type")]
    pub auth_type: String,
    pub client_id: String,
    pub client_secret: String,
}

impl AuthenticateRequest {
    /// Machine impersonation of `username` using a pre-shared secret.
    pub fn machine(username: &str, secret: &str) -> Self {
        Self {
            auth_type: "machine".to_string(),
            client_id: format!("username:{username}"),
            client_secret: secret.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub status: Status,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListStorageSpacesResponse {
    pub status: Status,
    #[serde(default)]
    pub storage_spaces: Vec<StorageSpace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatResponse {
    pub status: Status,
    #[serde(default)]
    pub info: Option<ResourceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListContainerResponse {
    pub status: Status,
    #[serde(default)]
    pub infos: Vec<ResourceInfo>,
}

/// Reply to `InitiateFileDownload` / `InitiateFileUpload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub status: Status,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
}

/// Upload negotiation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Total body length, sent as the `Upload-Length` opaque entry.
    pub upload_length: u64,
    /// Etag precondition; the upload is refused if the object changed.
    #[serde(default)]
    pub if_match: Option<String>,
}

/// Backend RPC client.
///
/// Every call except [`authenticate`](GatewayClient::authenticate) runs as the
/// user that owns `token`. A returned `Ok` carries the backend's status; only
/// transport-level failures are `Err`.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn authenticate(&self, request: AuthenticateRequest)
    -> GatewayResult<AuthenticateResponse>;

    async fn list_storage_spaces(
        &self,
        token: &str,
        filters: &[SpaceFilter],
    ) -> GatewayResult<ListStorageSpacesResponse>;

    async fn stat(&self, token: &str, reference: &Reference) -> GatewayResult<StatResponse>;

    async fn list_container(
        &self,
        token: &str,
        reference: &Reference,
    ) -> GatewayResult<ListContainerResponse>;

    async fn create_container(&self, token: &str, reference: &Reference) -> GatewayResult<Status>;

    async fn delete(&self, token: &str, reference: &Reference) -> GatewayResult<Status>;

    async fn move_resource(
        &self,
        token: &str,
        source: &Reference,
        destination: &Reference,
    ) -> GatewayResult<Status>;

    /// Create an empty file if nothing exists at `reference`.
    async fn touch_file(&self, token: &str, reference: &Reference) -> GatewayResult<Status>;

    async fn initiate_file_download(
        &self,
        token: &str,
        reference: &Reference,
    ) -> GatewayResult<TransferResponse>;

    async fn initiate_file_upload(
        &self,
        token: &str,
        reference: &Reference,
        options: UploadOptions,
    ) -> GatewayResult<TransferResponse>;
}

/// Hands out a gateway client per call.
///
/// Shared process-wide; implementations must be safe for concurrent use.
pub trait Selector: Send + Sync {
    fn next(&self) -> GatewayResult<Arc<dyn GatewayClient>>;
}

/// Rotates across a fixed set of clients.
pub struct RoundRobinSelector {
    clients: Vec<Arc<dyn GatewayClient>>,
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(clients: Vec<Arc<dyn GatewayClient>>) -> Self {
        Self {
            clients,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn single(client: Arc<dyn GatewayClient>) -> Self {
        Self::new(vec![client])
    }
}

impl Selector for RoundRobinSelector {
    fn next(&self) -> GatewayResult<Arc<dyn GatewayClient>> {
        if self.clients.is_empty() {
            return Err(GatewayError::NoClient);
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Ok(Arc::clone(&self.clients[i]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGateway;

    #[test]
    fn test_machine_request() {
        let req = AuthenticateRequest::machine("alice", "k3y");
        assert_eq!(req.auth_type, "machine");
        assert_eq!(req.client_id, "username:alice");
        assert_eq!(req.client_secret, "k3y");
    }

    #[test]
    fn test_empty_selector() {
        let selector = RoundRobinSelector::new(Vec::new());
        assert!(matches!(selector.next(), Err(GatewayError::NoClient)));
    }

    #[test]
    fn test_round_robin_rotates() {
        let a: Arc<dyn GatewayClient> = Arc::new(MemoryGateway::new("k"));
        let b: Arc<dyn GatewayClient> = Arc::new(MemoryGateway::new("k"));
        let selector = RoundRobinSelector::new(vec![a.clone(), b.clone()]);

        let first = selector.next().unwrap();
        let second = selector.next().unwrap();
        let third = selector.next().unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        assert!(Arc::ptr_eq(&second, &b));
        assert!(Arc::ptr_eq(&third, &a));
    }
}
