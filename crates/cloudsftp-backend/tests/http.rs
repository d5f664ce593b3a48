//! HTTP gateway client and data transport against a local listener.
//!
//! Each test serves exactly one canned HTTP/1.1 response and records the
//! request that reached it.

use std::collections::HashMap;

use cloudsftp_backend::{
    AuthenticateRequest, Code, DataTransport, GatewayClient, GatewayError, HttpGateway,
    HttpTransport, Protocol, Reference, ResourceType, SpaceId, TransportOptions,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// ============================================================================
// One-shot HTTP listener
// ============================================================================

#[derive(Debug)]
struct Recorded {
    method: String,
    path: String,
    /// Keys are lowercased.
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct Reply {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Bind a local port, answer one request with `reply`, and hand back what
/// was received.
async fn serve_once(reply: Reply) -> (String, JoinHandle<Recorded>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_len = loop {
            if let Some(end) = find_header_end(&buf) {
                break end;
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8(buf[..head_len].to_vec()).unwrap();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap().split(' ');
        let method = request_line.next().unwrap().to_string();
        let path = request_line.next().unwrap().to_string();
        let headers: HashMap<String, String> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let content_length = headers
            .get("content-length")
            .map(|v| v.parse::<usize>().unwrap())
            .unwrap_or(0);
        let mut body = buf[head_len + 4..].to_vec();
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before body");
            body.extend_from_slice(&chunk[..n]);
        }

        let mut response = format!("HTTP/1.1 {} Canned\r\n", reply.status);
        for (name, value) in &reply.headers {
            response.push_str(&format!("{name}: {value}\r\n"));
        }
        response.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            reply.body.len()
        ));
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.write_all(&reply.body).await.unwrap();
        stream.flush().await.unwrap();

        Recorded {
            method,
            path,
            headers,
            body,
        }
    });

    (base, task)
}

fn transport() -> HttpTransport {
    HttpTransport::new(&TransportOptions::default()).unwrap()
}

fn endpoint(base: &str, token: Option<&str>) -> Protocol {
    Protocol {
        protocol: "simple".to_string(),
        endpoint: format!("{base}/data/obj-1"),
        token: token.map(str::to_string),
    }
}

// ============================================================================
// Data transport
// ============================================================================

#[tokio::test]
async fn test_download_sends_tokens_and_reads_etag() {
    let reply = Reply::status(200)
        .header("ETag", "\"v1\"")
        .body("file body");
    let (base, server) = serve_once(reply).await;

    let download = transport()
        .download(&endpoint(&base, Some("xfer-token")), "access-token")
        .await
        .unwrap();
    assert_eq!(download.body, b"file body");
    assert_eq!(download.etag.as_deref(), Some("\"v1\""));

    let seen = server.await.unwrap();
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.path, "/data/obj-1");
    assert_eq!(seen.headers["x-access-token"], "access-token");
    assert_eq!(seen.headers["x-reva-transfer"], "xfer-token");
}

#[tokio::test]
async fn test_empty_transfer_token_is_not_sent() {
    for token in [None, Some("")] {
        let (base, server) = serve_once(Reply::status(200).body("x")).await;

        let download = transport()
            .download(&endpoint(&base, token), "access-token")
            .await
            .unwrap();
        assert_eq!(download.etag, None);

        let seen = server.await.unwrap();
        assert_eq!(seen.headers["x-access-token"], "access-token");
        assert!(!seen.headers.contains_key("x-reva-transfer"), "{token:?}");
    }
}

#[tokio::test]
async fn test_download_requires_200() {
    for status in [206, 404] {
        let (base, server) = serve_once(Reply::status(status).body("partial")).await;

        let err = transport()
            .download(&endpoint(&base, None), "access-token")
            .await
            .unwrap_err();
        match err {
            GatewayError::UnexpectedStatus { url, status: got } => {
                assert_eq!(got, status);
                assert!(url.ends_with("/data/obj-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        server.await.unwrap();
    }
}

#[tokio::test]
async fn test_upload_accepts_any_success() {
    let reply = Reply::status(201).header("ETag", "\"v2\"");
    let (base, server) = serve_once(reply).await;

    let etag = transport()
        .upload(&endpoint(&base, Some("xfer-token")), "access-token", b"new body".to_vec())
        .await
        .unwrap();
    assert_eq!(etag.as_deref(), Some("\"v2\""));

    let seen = server.await.unwrap();
    assert_eq!(seen.method, "PUT");
    assert_eq!(seen.body, b"new body");
    assert_eq!(seen.headers["x-access-token"], "access-token");
    assert_eq!(seen.headers["x-reva-transfer"], "xfer-token");

    // No ETag header means no etag, not an error.
    let (base, server) = serve_once(Reply::status(200)).await;
    let etag = transport()
        .upload(&endpoint(&base, None), "access-token", Vec::new())
        .await
        .unwrap();
    assert_eq!(etag, None);
    server.await.unwrap();
}

#[tokio::test]
async fn test_upload_failure_status() {
    let (base, server) = serve_once(Reply::status(500)).await;

    let err = transport()
        .upload(&endpoint(&base, None), "access-token", b"x".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnexpectedStatus { status: 500, .. }));
    server.await.unwrap();
}

// ============================================================================
// Gateway RPC
// ============================================================================

fn gateway(base: &str) -> HttpGateway {
    HttpGateway::new(&format!("{base}/"), &TransportOptions::default()).unwrap()
}

#[tokio::test]
async fn test_stat_request_and_response() {
    let reply = Reply::status(200)
        .header("Content-Type", "application/json")
        .body(r#"{"status":{"code":"CODE_OK"},"info":{"path":"/a.txt","size":3,"type":"FILE","etag":"\"e\""}}"#);
    let (base, server) = serve_once(reply).await;

    let reference = Reference::from_parts(SpaceId::parse("store$space").unwrap(), "/a.txt");
    let response = gateway(&base).stat("access-token", &reference).await.unwrap();
    assert_eq!(response.status.code, Code::Ok);
    let info = response.info.unwrap();
    assert_eq!(info.path, "/a.txt");
    assert_eq!(info.size, 3);
    assert_eq!(info.resource_type, ResourceType::File);
    assert_eq!(info.etag.as_deref(), Some("\"e\""));

    let seen = server.await.unwrap();
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.path, "/cs3.gateway.v1beta1.GatewayAPI/Stat");
    assert_eq!(seen.headers["x-access-token"], "access-token");
    assert!(seen.headers["content-type"].starts_with("application/json"));

    let body: serde_json::Value = serde_json::from_slice(&seen.body).unwrap();
    assert_eq!(body["ref"]["path"], "./a.txt");
    assert_eq!(body["ref"]["resource_id"]["storage_id"], "store");
    assert_eq!(body["ref"]["resource_id"]["space_id"], "space");
}

#[tokio::test]
async fn test_authenticate_sends_no_access_token() {
    let reply = Reply::status(200)
        .body(r#"{"status":{"code":"CODE_OK"},"user_id":"u-1","token":"t-1"}"#);
    let (base, server) = serve_once(reply).await;

    let response = gateway(&base)
        .authenticate(AuthenticateRequest::machine("alice", "secret"))
        .await
        .unwrap();
    assert!(response.status.is_ok());
    assert_eq!(response.user_id, "u-1");
    assert_eq!(response.token, "t-1");

    let seen = server.await.unwrap();
    assert_eq!(seen.path, "/cs3.gateway.v1beta1.GatewayAPI/Authenticate");
    assert!(!seen.headers.contains_key("x-access-token"));
    let body: serde_json::Value = serde_json::from_slice(&seen.body).unwrap();
    assert_eq!(body["type"], "machine");
    assert_eq!(body["client_id"], "username:alice");
    assert_eq!(body["client_secret"], "secret");
}

#[tokio::test]
async fn test_backend_status_is_not_an_error() {
    let reply = Reply::status(200)
        .body(r#"{"status":{"code":"CODE_NOT_FOUND","message":"gone"}}"#);
    let (base, server) = serve_once(reply).await;

    let reference = Reference::from_parts(SpaceId::parse("space").unwrap(), "/gone");
    let response = gateway(&base).stat("access-token", &reference).await.unwrap();
    assert_eq!(response.status.code, Code::NotFound);
    assert_eq!(response.status.message, "gone");
    assert!(response.info.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn test_rpc_http_failure() {
    let (base, server) = serve_once(Reply::status(500).body("boom")).await;

    let reference = Reference::from_parts(SpaceId::parse("space").unwrap(), "/");
    let err = gateway(&base)
        .list_container("access-token", &reference)
        .await
        .unwrap_err();
    match err {
        GatewayError::UnexpectedStatus { url, status } => {
            assert_eq!(status, 500);
            assert!(url.ends_with("/cs3.gateway.v1beta1.GatewayAPI/ListContainer"));
        }
        other => panic!("unexpected error: {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_undecodable_reply() {
    let (base, server) = serve_once(Reply::status(200).body("not json")).await;

    let reference = Reference::from_parts(SpaceId::parse("space").unwrap(), "/");
    let err = gateway(&base)
        .delete("access-token", &reference)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Decode(_)));
    server.await.unwrap();
}
