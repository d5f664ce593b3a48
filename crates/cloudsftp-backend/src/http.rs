//! JSON-over-HTTP gateway client.
//!
//! Each RPC is a unary POST of a JSON body to `{address}/{service}/{Method}`,
//! the Connect protocol's JSON mapping. The access token rides in the same
//! header the data-transfer endpoints use.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::client::{
    AuthenticateRequest, AuthenticateResponse, GatewayClient, ListContainerResponse,
    ListStorageSpacesResponse, StatResponse, TransferResponse, UploadOptions,
};
use crate::error::{GatewayError, GatewayResult};
use crate::transport::{ACCESS_TOKEN_HEADER, TransportOptions};
use crate::types::{Reference, SpaceFilter, Status};

/// Fully qualified gateway service name.
pub const GATEWAY_SERVICE: &str = "cs3.gateway.v1beta1.GatewayAPI";

#[derive(Debug, Clone)]
pub struct HttpGateway {
    base: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RefRequest<'a> {
    #[serde(rename = "ref")]
    reference: &'a Reference,
}

#[derive(Serialize)]
struct ListSpacesRequest<'a> {
    filters: &'a [SpaceFilter],
}

#[derive(Serialize)]
struct MoveRequest<'a> {
    source: &'a Reference,
    destination: &'a Reference,
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    #[serde(rename = "ref")]
    reference: &'a Reference,
    opaque: UploadOpaque,
    #[serde(skip_serializing_if = "Option::is_none")]
    if_match: Option<&'a str>,
}

#[derive(Serialize)]
struct UploadOpaque {
    #[serde(rename = "Upload-Length")]
    upload_length: String,
}

#[derive(serde::Deserialize)]
struct StatusOnly {
    status: Status,
}

impl HttpGateway {
    pub fn new(address: &str, options: &TransportOptions) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .danger_accept_invalid_certs(options.insecure)
            .build()?;
        Ok(Self {
            base: address.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call<Req, Resp>(&self, method: &str, token: Option<&str>, body: &Req) -> GatewayResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}/{}", self.base, GATEWAY_SERVICE, method);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = token {
            request = request.header(ACCESS_TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            tracing::warn!(%url, status = %response.status(), "gateway call failed");
            return Err(GatewayError::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn call_status<Req: Serialize>(
        &self,
        method: &str,
        token: &str,
        body: &Req,
    ) -> GatewayResult<Status> {
        let reply: StatusOnly = self.call(method, Some(token), body).await?;
        Ok(reply.status)
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn authenticate(
        &self,
        request: AuthenticateRequest,
    ) -> GatewayResult<AuthenticateResponse> {
        self.call("Authenticate", None, &request).await
    }

    async fn list_storage_spaces(
        &self,
        token: &str,
        filters: &[SpaceFilter],
    ) -> GatewayResult<ListStorageSpacesResponse> {
        self.call("ListStorageSpaces", Some(token), &ListSpacesRequest { filters })
            .await
    }

    async fn stat(&self, token: &str, reference: &Reference) -> GatewayResult<StatResponse> {
        self.call("Stat", Some(token), &RefRequest { reference }).await
    }

    async fn list_container(
        &self,
        token: &str,
        reference: &Reference,
    ) -> GatewayResult<ListContainerResponse> {
        self.call("ListContainer", Some(token), &RefRequest { reference })
            .await
    }

    async fn create_container(&self, token: &str, reference: &Reference) -> GatewayResult<Status> {
        self.call_status("CreateContainer", token, &RefRequest { reference })
            .await
    }

    async fn delete(&self, token: &str, reference: &Reference) -> GatewayResult<Status> {
        self.call_status("Delete", token, &RefRequest { reference }).await
    }

    async fn move_resource(
        &self,
        token: &str,
        source: &Reference,
        destination: &Reference,
    ) -> GatewayResult<Status> {
        self.call_status(
            "Move",
            token,
            &MoveRequest {
                source,
                destination,
            },
        )
        .await
    }

    async fn touch_file(&self, token: &str, reference: &Reference) -> GatewayResult<Status> {
        self.call_status("TouchFile", token, &RefRequest { reference })
            .await
    }

    async fn initiate_file_download(
        &self,
        token: &str,
        reference: &Reference,
    ) -> GatewayResult<TransferResponse> {
        self.call("InitiateFileDownload", Some(token), &RefRequest { reference })
            .await
    }

    async fn initiate_file_upload(
        &self,
        token: &str,
        reference: &Reference,
        options: UploadOptions,
    ) -> GatewayResult<TransferResponse> {
        let body = UploadRequest {
            reference,
            opaque: UploadOpaque {
                upload_length: options.upload_length.to_string(),
            },
            if_match: options.if_match.as_deref(),
        };
        self.call("InitiateFileUpload", Some(token), &body).await
    }
}
