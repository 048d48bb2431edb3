//! Outbound call collaborator.
//!
//! The executor only needs `perform_request(method, url)`; status interpretation happens in
//! the executor, so transports report every response they receive.

use crate::error::CallError;
use async_trait::async_trait;
use std::sync::Arc;

/// A response as seen by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Response with `status` and `body`.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, body: body.into() }
    }

    /// Whether the status counts as a successful call (below 299).
    pub fn is_success(&self) -> bool {
        self.status < 299
    }
}

/// Performs a single outbound request.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Issue `method` against `url`. Connection-level failures map to
    /// [`CallError::Transport`].
    async fn perform_request(&self, method: &str, url: &str) -> Result<TransportResponse, CallError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn perform_request(&self, method: &str, url: &str) -> Result<TransportResponse, CallError> {
        (**self).perform_request(method, url).await
    }
}

#[cfg(feature = "http")]
pub use self::http::ReqwestTransport;

#[cfg(feature = "http")]
mod http {
    use super::{Transport, TransportResponse};
    use crate::error::CallError;
    use async_trait::async_trait;

    /// HTTP transport backed by `reqwest`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        /// Transport with a default client.
        pub fn new() -> Self {
            Self::default()
        }

        /// Transport reusing an existing client.
        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn perform_request(
            &self,
            method: &str,
            url: &str,
        ) -> Result<TransportResponse, CallError> {
            let method = reqwest::Method::from_bytes(method.as_bytes())
                .map_err(|e| CallError::Transport(format!("invalid method '{method}': {e}")))?;
            let response = self
                .client
                .request(method, url)
                .send()
                .await
                .map_err(|e| CallError::Transport(e.to_string()))?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|e| CallError::Transport(e.to_string()))?;
            Ok(TransportResponse { status, body: body.to_vec() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_boundary() {
        assert!(TransportResponse::new(200, "ok").is_success());
        assert!(TransportResponse::new(298, "").is_success());
        assert!(!TransportResponse::new(299, "").is_success());
        assert!(!TransportResponse::new(500, "").is_success());
    }
}
