//! In-memory gateway.
//!
//! Implements both [`GatewayClient`] and [`DataTransport`] over a process-local
//! tree so the VFS and auth layers can be exercised without a backend. Tokens,
//! space visibility, etag preconditions and single-use transfer tickets behave
//! like the real service; everything is lost when dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::client::{
    AuthenticateRequest, AuthenticateResponse, GatewayClient, ListContainerResponse,
    ListStorageSpacesResponse, StatResponse, TransferResponse, UploadOptions,
};
use crate::error::{GatewayError, GatewayResult};
use crate::transport::{DataTransport, Download};
use crate::types::{
    Code, Protocol, Reference, ResourceInfo, ResourceType, SpaceFilter, SpaceId, Status,
    StorageSpace,
};

const ENDPOINT_PREFIX: &str = "memory://transfer/";

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        mtime: u64,
        etag: String,
    },
    Container {
        mtime: u64,
    },
}

impl Node {
    fn info(&self, path: &str) -> ResourceInfo {
        match self {
            Node::File { data, mtime, etag } => ResourceInfo {
                path: path.to_string(),
                size: data.len() as u64,
                mtime: Some(*mtime),
                resource_type: ResourceType::File,
                etag: Some(etag.clone()),
            },
            Node::Container { mtime } => ResourceInfo {
                path: path.to_string(),
                size: 0,
                mtime: Some(*mtime),
                resource_type: ResourceType::Container,
                etag: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct SpaceEntry {
    space: StorageSpace,
    key: String,
    members: HashSet<String>,
}

#[derive(Debug, Clone)]
enum TicketKind {
    Download,
    Upload,
}

#[derive(Debug, Clone)]
struct Ticket {
    kind: TicketKind,
    space_key: String,
    path: String,
    user_id: String,
}

#[derive(Debug, Default)]
struct State {
    /// username -> user id
    users: HashMap<String, String>,
    /// access token -> user id
    tokens: HashMap<String, String>,
    spaces: Vec<SpaceEntry>,
    /// (space key, normalized path) -> node
    nodes: BTreeMap<(String, String), Node>,
    tickets: HashMap<String, Ticket>,
}

/// In-memory backend.
#[derive(Debug)]
pub struct MemoryGateway {
    machine_key: String,
    state: RwLock<State>,
    generation: AtomicU64,
    offline: AtomicBool,
    fail_uploads: AtomicBool,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Collapse a reference or user path to `/a/b` form.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
        None => None,
    }
}

fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor == "/" || path == ancestor || path.starts_with(&format!("{ancestor}/"))
}

impl MemoryGateway {
    /// Create an empty backend that accepts `machine_key` for impersonation.
    pub fn new(machine_key: impl Into<String>) -> Self {
        Self {
            machine_key: machine_key.into(),
            state: RwLock::new(State::default()),
            generation: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }

    // ========================================================================
    // Fixture setup
    // ========================================================================

    /// Register a user and return its id.
    pub fn add_user(&self, username: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.state
            .write()
            .users
            .insert(username.to_string(), id.clone());
        id
    }

    /// Create a space owned by `owner` with an empty root container.
    pub fn add_space(&self, name: &str, space_type: &str, owner: &str) -> StorageSpace {
        let space_id = uuid::Uuid::new_v4().to_string();
        let space = StorageSpace {
            id: format!("storage-users-1${space_id}!{space_id}"),
            name: name.to_string(),
            owner: owner.to_string(),
            mtime: Some(now()),
            space_type: space_type.to_string(),
        };
        self.insert_space(space.clone());
        space
    }

    /// Insert a space with a caller-chosen id.
    pub fn insert_space(&self, space: StorageSpace) {
        let key = SpaceId::parse(&space.id)
            .map(|id| id.space_id)
            .unwrap_or_else(|_| space.id.clone());
        let mut state = self.state.write();
        state
            .nodes
            .insert((key.clone(), "/".to_string()), Node::Container { mtime: now() });
        let mut members = HashSet::new();
        members.insert(space.owner.clone());
        state.spaces.push(SpaceEntry {
            space,
            key,
            members,
        });
    }

    /// Make `space` visible to another user.
    pub fn share_space(&self, space: &StorageSpace, user_id: &str) {
        let mut state = self.state.write();
        if let Some(entry) = state.spaces.iter_mut().find(|e| e.space.id == space.id) {
            entry.members.insert(user_id.to_string());
        }
    }

    /// Drop a space and everything in it.
    pub fn remove_space(&self, space: &StorageSpace) {
        let mut state = self.state.write();
        if let Some(pos) = state.spaces.iter().position(|e| e.space.id == space.id) {
            let entry = state.spaces.remove(pos);
            state.nodes.retain(|(key, _), _| key != &entry.key);
        }
    }

    /// Write a file, creating parent containers as needed.
    pub fn put_file(&self, space: &StorageSpace, path: &str, data: &[u8]) {
        let key = self.key_of(space);
        let path = normalize(path);
        self.mkdir_all_locked(&key, parent_of(&path).as_deref().unwrap_or("/"));
        let etag = self.next_etag();
        self.state.write().nodes.insert(
            (key, path),
            Node::File {
                data: data.to_vec(),
                mtime: now(),
                etag,
            },
        );
    }

    /// Create a container and its parents.
    pub fn mkdir_all(&self, space: &StorageSpace, path: &str) {
        let key = self.key_of(space);
        self.mkdir_all_locked(&key, &normalize(path));
    }

    pub fn file_content(&self, space: &StorageSpace, path: &str) -> Option<Vec<u8>> {
        let key = self.key_of(space);
        match self.state.read().nodes.get(&(key, normalize(path))) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, space: &StorageSpace, path: &str) -> bool {
        let key = self.key_of(space);
        self.state.read().nodes.contains_key(&(key, normalize(path)))
    }

    /// Current etag of a file.
    pub fn etag(&self, space: &StorageSpace, path: &str) -> Option<String> {
        let key = self.key_of(space);
        match self.state.read().nodes.get(&(key, normalize(path))) {
            Some(Node::File { etag, .. }) => Some(etag.clone()),
            _ => None,
        }
    }

    /// Make every RPC and transfer fail at the transport level.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every PUT fail with a 500.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Number of completed uploads.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Number of completed downloads.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn key_of(&self, space: &StorageSpace) -> String {
        let state = self.state.read();
        state
            .spaces
            .iter()
            .find(|e| e.space.id == space.id)
            .map(|e| e.key.clone())
            .unwrap_or_else(|| space.id.clone())
    }

    fn next_etag(&self) -> String {
        format!("\"{}\"", self.generation.fetch_add(1, Ordering::SeqCst))
    }

    fn mkdir_all_locked(&self, key: &str, path: &str) {
        let mut state = self.state.write();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            state
                .nodes
                .entry((key.to_string(), current.clone()))
                .or_insert(Node::Container { mtime: now() });
        }
    }

    fn check_online(&self) -> GatewayResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::unavailable("memory gateway is offline"));
        }
        Ok(())
    }

    /// Resolve token and reference to (user id, space key, normalized path).
    fn locate(
        state: &State,
        token: &str,
        reference: &Reference,
    ) -> Result<(String, String, String), Status> {
        let user_id = state
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Status::new(Code::Unauthenticated, "invalid token"))?;
        let entry = state
            .spaces
            .iter()
            .find(|e| e.key == reference.resource_id.space_id)
            .ok_or_else(|| Status::not_found("space not found"))?;
        if !entry.members.contains(&user_id) {
            return Err(Status::new(Code::PermissionDenied, "no access to space"));
        }
        Ok((user_id, entry.key.clone(), normalize(&reference.path)))
    }

    fn require_container(state: &State, key: &str, path: &str) -> Result<(), Status> {
        match state.nodes.get(&(key.to_string(), path.to_string())) {
            Some(Node::Container { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(Status::new(Code::FailedPrecondition, "not a container")),
            None => Err(Status::not_found(format!("{path} not found"))),
        }
    }

    fn issue_ticket(state: &mut State, ticket: Ticket) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        state.tickets.insert(id.clone(), ticket);
        id
    }

    fn take_ticket(&self, endpoint: &Protocol, token: &str, kind: &str) -> GatewayResult<Ticket> {
        let url = endpoint.endpoint.clone();
        let id = endpoint
            .endpoint
            .strip_prefix(ENDPOINT_PREFIX)
            .ok_or_else(|| GatewayError::UnexpectedStatus {
                url: url.clone(),
                status: 404,
            })?;

        let mut state = self.state.write();
        let user_id = state.tokens.get(token).cloned();
        let ticket = state
            .tickets
            .remove(id)
            .ok_or_else(|| GatewayError::UnexpectedStatus {
                url: url.clone(),
                status: 404,
            })?;
        let kind_matches = matches!(
            (&ticket.kind, kind),
            (TicketKind::Download, "GET") | (TicketKind::Upload, "PUT")
        );
        if user_id.as_deref() != Some(ticket.user_id.as_str()) || !kind_matches {
            return Err(GatewayError::UnexpectedStatus { url, status: 401 });
        }
        Ok(ticket)
    }
}

#[async_trait]
impl GatewayClient for MemoryGateway {
    async fn authenticate(
        &self,
        request: AuthenticateRequest,
    ) -> GatewayResult<AuthenticateResponse> {
        self.check_online()?;
        let denied = |msg: &str| AuthenticateResponse {
            status: Status::new(Code::Unauthenticated, msg),
            user_id: String::new(),
            token: String::new(),
        };

        if request.auth_type != "machine" || request.client_secret != self.machine_key {
            return Ok(denied("invalid credentials"));
        }
        let Some(username) = request.client_id.strip_prefix("username:") else {
            return Ok(denied("unsupported client id"));
        };

        let mut state = self.state.write();
        let Some(user_id) = state.users.get(username).cloned() else {
            return Ok(denied("unknown user"));
        };
        let token = uuid::Uuid::new_v4().to_string();
        state.tokens.insert(token.clone(), user_id.clone());

        Ok(AuthenticateResponse {
            status: Status::ok(),
            user_id,
            token,
        })
    }

    async fn list_storage_spaces(
        &self,
        token: &str,
        filters: &[SpaceFilter],
    ) -> GatewayResult<ListStorageSpacesResponse> {
        self.check_online()?;
        let state = self.state.read();
        let Some(user_id) = state.tokens.get(token) else {
            return Ok(ListStorageSpacesResponse {
                status: Status::new(Code::Unauthenticated, "invalid token"),
                storage_spaces: Vec::new(),
            });
        };

        let storage_spaces = state
            .spaces
            .iter()
            .filter(|e| e.members.contains(user_id))
            .filter(|e| filters.iter().all(|f| f.matches(&e.space)))
            .map(|e| e.space.clone())
            .collect();

        Ok(ListStorageSpacesResponse {
            status: Status::ok(),
            storage_spaces,
        })
    }

    async fn stat(&self, token: &str, reference: &Reference) -> GatewayResult<StatResponse> {
        self.check_online()?;
        let state = self.state.read();
        let (_, key, path) = match Self::locate(&state, token, reference) {
            Ok(found) => found,
            Err(status) => return Ok(StatResponse { status, info: None }),
        };

        Ok(match state.nodes.get(&(key, path.clone())) {
            Some(node) => StatResponse {
                status: Status::ok(),
                info: Some(node.info(&path)),
            },
            None => StatResponse {
                status: Status::not_found(format!("{path} not found")),
                info: None,
            },
        })
    }

    async fn list_container(
        &self,
        token: &str,
        reference: &Reference,
    ) -> GatewayResult<ListContainerResponse> {
        self.check_online()?;
        let state = self.state.read();
        let (_, key, path) = match Self::locate(&state, token, reference)
            .and_then(|(u, k, p)| Self::require_container(&state, &k, &p).map(|_| (u, k, p)))
        {
            Ok(found) => found,
            Err(status) => {
                return Ok(ListContainerResponse {
                    status,
                    infos: Vec::new(),
                });
            }
        };

        let infos = state
            .nodes
            .iter()
            .filter(|((k, p), _)| k == &key && parent_of(p).as_deref() == Some(path.as_str()))
            .map(|((_, p), node)| node.info(p))
            .collect();

        Ok(ListContainerResponse {
            status: Status::ok(),
            infos,
        })
    }

    async fn create_container(&self, token: &str, reference: &Reference) -> GatewayResult<Status> {
        self.check_online()?;
        let mut state = self.state.write();
        let (_, key, path) = match Self::locate(&state, token, reference) {
            Ok(found) => found,
            Err(status) => return Ok(status),
        };
        if state.nodes.contains_key(&(key.clone(), path.clone())) {
            return Ok(Status::new(Code::AlreadyExists, format!("{path} already exists")));
        }
        if let Some(parent) = parent_of(&path) {
            if let Err(status) = Self::require_container(&state, &key, &parent) {
                return Ok(status);
            }
        }
        state.nodes.insert((key, path), Node::Container { mtime: now() });
        Ok(Status::ok())
    }

    async fn delete(&self, token: &str, reference: &Reference) -> GatewayResult<Status> {
        self.check_online()?;
        let mut state = self.state.write();
        let (_, key, path) = match Self::locate(&state, token, reference) {
            Ok(found) => found,
            Err(status) => return Ok(status),
        };
        if path == "/" {
            return Ok(Status::new(Code::PermissionDenied, "cannot delete space root"));
        }
        if !state.nodes.contains_key(&(key.clone(), path.clone())) {
            return Ok(Status::not_found(format!("{path} not found")));
        }
        state
            .nodes
            .retain(|(k, p), _| !(k == &key && is_within(p, &path)));
        Ok(Status::ok())
    }

    async fn move_resource(
        &self,
        token: &str,
        source: &Reference,
        destination: &Reference,
    ) -> GatewayResult<Status> {
        self.check_online()?;
        let mut state = self.state.write();
        let (_, src_key, src) = match Self::locate(&state, token, source) {
            Ok(found) => found,
            Err(status) => return Ok(status),
        };
        let (_, dst_key, dst) = match Self::locate(&state, token, destination) {
            Ok(found) => found,
            Err(status) => return Ok(status),
        };
        if src_key != dst_key {
            return Ok(Status::new(Code::Unimplemented, "cross storage move"));
        }
        if src == "/" || dst == "/" {
            return Ok(Status::new(Code::PermissionDenied, "cannot move space root"));
        }
        let Some(src_node) = state.nodes.get(&(src_key.clone(), src.clone())).cloned() else {
            return Ok(Status::not_found(format!("{src} not found")));
        };
        if src == dst {
            return Ok(Status::ok());
        }
        if is_within(&dst, &src) {
            return Ok(Status::new(Code::FailedPrecondition, "cannot move into itself"));
        }
        if let Some(parent) = parent_of(&dst) {
            if let Err(status) = Self::require_container(&state, &dst_key, &parent) {
                return Ok(status);
            }
        }
        match (state.nodes.get(&(dst_key.clone(), dst.clone())), &src_node) {
            (Some(Node::Container { .. }), _) | (Some(Node::File { .. }), Node::Container { .. }) => {
                return Ok(Status::new(Code::AlreadyExists, format!("{dst} already exists")));
            }
            _ => {}
        }

        let moved: Vec<(String, Node)> = state
            .nodes
            .iter()
            .filter(|((k, p), _)| k == &src_key && is_within(p, &src))
            .map(|((_, p), node)| (p.clone(), node.clone()))
            .collect();
        state
            .nodes
            .retain(|(k, p), _| !(k == &src_key && is_within(p, &src)));
        for (path, node) in moved {
            let rebased = format!("{dst}{}", &path[src.len()..]);
            state.nodes.insert((dst_key.clone(), rebased), node);
        }
        Ok(Status::ok())
    }

    async fn touch_file(&self, token: &str, reference: &Reference) -> GatewayResult<Status> {
        self.check_online()?;
        let (key, path) = {
            let state = self.state.read();
            let (_, key, path) = match Self::locate(&state, token, reference) {
                Ok(found) => found,
                Err(status) => return Ok(status),
            };
            if state.nodes.contains_key(&(key.clone(), path.clone())) {
                return Ok(Status::new(Code::AlreadyExists, format!("{path} already exists")));
            }
            let parent = parent_of(&path).unwrap_or_else(|| "/".to_string());
            if let Err(status) = Self::require_container(&state, &key, &parent) {
                return Ok(status);
            }
            (key, path)
        };
        let etag = self.next_etag();
        self.state.write().nodes.insert(
            (key, path),
            Node::File {
                data: Vec::new(),
                mtime: now(),
                etag,
            },
        );
        Ok(Status::ok())
    }

    async fn initiate_file_download(
        &self,
        token: &str,
        reference: &Reference,
    ) -> GatewayResult<TransferResponse> {
        self.check_online()?;
        let mut state = self.state.write();
        let located = Self::locate(&state, token, reference).and_then(|(user_id, key, path)| {
            match state.nodes.get(&(key.clone(), path.clone())) {
                Some(Node::File { .. }) => Ok((user_id, key, path)),
                Some(Node::Container { .. }) => {
                    Err(Status::new(Code::FailedPrecondition, "is a container"))
                }
                None => Err(Status::not_found(format!("{path} not found"))),
            }
        });
        let (user_id, space_key, path) = match located {
            Ok(found) => found,
            Err(status) => {
                return Ok(TransferResponse {
                    status,
                    protocols: Vec::new(),
                });
            }
        };

        let ticket = Self::issue_ticket(
            &mut state,
            Ticket {
                kind: TicketKind::Download,
                space_key,
                path,
                user_id,
            },
        );
        Ok(TransferResponse {
            status: Status::ok(),
            protocols: vec![Protocol {
                protocol: "spaces".to_string(),
                endpoint: format!("{ENDPOINT_PREFIX}{ticket}"),
                token: Some(ticket),
            }],
        })
    }

    async fn initiate_file_upload(
        &self,
        token: &str,
        reference: &Reference,
        options: UploadOptions,
    ) -> GatewayResult<TransferResponse> {
        self.check_online()?;
        let mut state = self.state.write();
        let fail = |status| TransferResponse {
            status,
            protocols: Vec::new(),
        };
        let (user_id, space_key, path) = match Self::locate(&state, token, reference) {
            Ok(found) => found,
            Err(status) => return Ok(fail(status)),
        };
        let parent = parent_of(&path).unwrap_or_else(|| "/".to_string());
        if let Err(status) = Self::require_container(&state, &space_key, &parent) {
            return Ok(fail(status));
        }
        match (state.nodes.get(&(space_key.clone(), path.clone())), &options.if_match) {
            (Some(Node::Container { .. }), _) => {
                return Ok(fail(Status::new(Code::FailedPrecondition, "is a container")));
            }
            (Some(Node::File { etag, .. }), Some(expected)) if etag != expected => {
                return Ok(fail(Status::new(Code::FailedPrecondition, "etag mismatch")));
            }
            _ => {}
        }

        let ticket = Self::issue_ticket(
            &mut state,
            Ticket {
                kind: TicketKind::Upload,
                space_key,
                path,
                user_id,
            },
        );
        Ok(TransferResponse {
            status: Status::ok(),
            protocols: vec![
                Protocol {
                    protocol: "tus".to_string(),
                    endpoint: "memory://tus-unsupported".to_string(),
                    token: None,
                },
                Protocol {
                    protocol: "simple".to_string(),
                    endpoint: format!("{ENDPOINT_PREFIX}{ticket}"),
                    token: Some(ticket),
                },
            ],
        })
    }
}

#[async_trait]
impl DataTransport for MemoryGateway {
    async fn download(&self, endpoint: &Protocol, access_token: &str) -> GatewayResult<Download> {
        self.check_online()?;
        let ticket = self.take_ticket(endpoint, access_token, "GET")?;
        let state = self.state.read();
        match state.nodes.get(&(ticket.space_key, ticket.path)) {
            Some(Node::File { data, etag, .. }) => {
                self.downloads.fetch_add(1, Ordering::SeqCst);
                Ok(Download {
                    body: data.clone(),
                    etag: Some(etag.clone()),
                })
            }
            _ => Err(GatewayError::UnexpectedStatus {
                url: endpoint.endpoint.clone(),
                status: 404,
            }),
        }
    }

    async fn upload(
        &self,
        endpoint: &Protocol,
        access_token: &str,
        body: Vec<u8>,
    ) -> GatewayResult<Option<String>> {
        self.check_online()?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(GatewayError::UnexpectedStatus {
                url: endpoint.endpoint.clone(),
                status: 500,
            });
        }
        let ticket = self.take_ticket(endpoint, access_token, "PUT")?;
        let etag = self.next_etag();
        self.state.write().nodes.insert(
            (ticket.space_key, ticket.path),
            Node::File {
                data: body,
                mtime: now(),
                etag: etag.clone(),
            },
        );
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(etag))
    }
}
