//! Data-transfer endpoints.
//!
//! File bodies never travel over RPC. The gateway negotiates a short-lived
//! HTTP endpoint (plus optional transfer token) and the body goes through a
//! plain GET or PUT against it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ETAG;

use crate::error::{GatewayError, GatewayResult};
use crate::types::Protocol;

/// Header carrying the session's access token.
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

/// Header carrying the per-transfer token.
pub const TRANSFER_TOKEN_HEADER: &str = "X-Reva-Transfer";

/// Transfer protocols we know how to speak, in preference order.
pub const SUPPORTED_PROTOCOLS: &[&str] = &["simple", "spaces"];

/// Pick the first offered endpoint whose protocol is supported.
pub fn select_protocol(protocols: &[Protocol]) -> GatewayResult<&Protocol> {
    protocols
        .iter()
        .find(|p| SUPPORTED_PROTOCOLS.contains(&p.protocol.as_str()))
        .ok_or(GatewayError::NoTransferProtocol)
}

/// Downloaded object body.
#[derive(Debug, Clone, Default)]
pub struct Download {
    pub body: Vec<u8>,
    pub etag: Option<String>,
}

#[async_trait]
pub trait DataTransport: Send + Sync {
    /// GET the whole object behind `endpoint`.
    async fn download(&self, endpoint: &Protocol, access_token: &str) -> GatewayResult<Download>;

    /// PUT `body` as the whole object. Returns the new etag when the server
    /// reports one.
    async fn upload(
        &self,
        endpoint: &Protocol,
        access_token: &str,
        body: Vec<u8>,
    ) -> GatewayResult<Option<String>>;
}

/// HTTP client policy.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    /// Skip certificate verification.
    pub insecure: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            insecure: true,
        }
    }
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(options: &TransportOptions) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .danger_accept_invalid_certs(options.insecure)
            .build()?;
        Ok(Self { client })
    }

    fn request(
        &self,
        method: reqwest::Method,
        endpoint: &Protocol,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, endpoint.endpoint.as_str())
            .header(ACCESS_TOKEN_HEADER, access_token);
        if let Some(token) = endpoint.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.header(TRANSFER_TOKEN_HEADER, token);
        }
        request
    }
}

fn etag_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl DataTransport for HttpTransport {
    #[tracing::instrument(skip(self, access_token), fields(endpoint = %endpoint.endpoint))]
    async fn download(&self, endpoint: &Protocol, access_token: &str) -> GatewayResult<Download> {
        let response = self
            .request(reqwest::Method::GET, endpoint, access_token)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(GatewayError::UnexpectedStatus {
                url: endpoint.endpoint.clone(),
                status: response.status().as_u16(),
            });
        }

        let etag = etag_of(&response);
        let body = response.bytes().await?.to_vec();
        tracing::debug!(bytes = body.len(), "downloaded object");
        Ok(Download { body, etag })
    }

    #[tracing::instrument(skip(self, access_token, body), fields(endpoint = %endpoint.endpoint, bytes = body.len()))]
    async fn upload(
        &self,
        endpoint: &Protocol,
        access_token: &str,
        body: Vec<u8>,
    ) -> GatewayResult<Option<String>> {
        let response = self
            .request(reqwest::Method::PUT, endpoint, access_token)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::UnexpectedStatus {
                url: endpoint.endpoint.clone(),
                status: response.status().as_u16(),
            });
        }

        Ok(etag_of(&response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto(name: &str) -> Protocol {
        Protocol {
            protocol: name.to_string(),
            endpoint: format!("https://dp/{name}"),
            token: None,
        }
    }

    #[test]
    fn test_select_first_supported() {
        let offered = vec![proto("tus"), proto("spaces"), proto("simple")];
        let chosen = select_protocol(&offered).unwrap();
        assert_eq!(chosen.protocol, "spaces");
    }

    #[test]
    fn test_select_none_supported() {
        let offered = vec![proto("tus")];
        assert!(matches!(
            select_protocol(&offered),
            Err(GatewayError::NoTransferProtocol)
        ));
        assert!(select_protocol(&[]).is_err());
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new(&TransportOptions::default()).is_ok());
    }
}
