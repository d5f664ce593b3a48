//! Backend plumbing for cloudsftp.
//!
//! The backend is a multi-tenant storage service reached only through
//! request/response RPC ([`GatewayClient`]) and short-lived HTTP transfer
//! endpoints ([`DataTransport`]). Nothing here knows about SFTP.
//!
//! - [`types`]: spaces, references, resource metadata, status codes
//! - [`client`]: the RPC trait and the [`Selector`] that hands out clients
//! - [`transport`]: negotiated GET/PUT data transfer over reqwest
//! - [`http`]: JSON-over-HTTP gateway client
//! - [`memory`]: in-process backend used by tests and local runs

pub mod client;
pub mod error;
pub mod http;
pub mod memory;
pub mod transport;
pub mod types;

pub use client::{
    AuthenticateRequest, AuthenticateResponse, GatewayClient, ListContainerResponse,
    ListStorageSpacesResponse, RoundRobinSelector, Selector, StatResponse, TransferResponse,
    UploadOptions,
};
pub use error::{GatewayError, GatewayResult};
pub use http::HttpGateway;
pub use memory::MemoryGateway;
pub use transport::{DataTransport, Download, HttpTransport, TransportOptions, select_protocol};
pub use types::{
    Code, Protocol, Reference, ResourceInfo, ResourceType, SHARES_SPACE_ID, SpaceFilter, SpaceId,
    Status, StorageSpace,
};
