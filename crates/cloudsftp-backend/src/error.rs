//! Gateway error types.
//!
//! A [`GatewayError`] means the call itself failed. A call that reached the
//! backend and got an answer returns `Ok` with a [`crate::Status`] inside,
//! even when that status is not OK.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// HTTP client failure (connect, TLS, timeout, body).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// An HTTP endpoint answered with a status the caller does not accept.
    #[error("unexpected http status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Malformed storage space id.
    #[error("invalid space id: {0:?}")]
    InvalidSpaceId(String),

    /// None of the offered transfer protocols is acceptable.
    #[error("no supported transfer protocol offered")]
    NoTransferProtocol,

    /// Selector has nothing to hand out.
    #[error("no gateway client available")]
    NoClient,

    /// Backend unreachable.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
