//! Boundary with the HTTP stack.
//!
//! The dispatcher only needs "send this, tell me the status and payload, or
//! tell me it failed". Per-attempt deadlines are enforced by the dispatcher
//! as well, so a transport that never answers still times out.

use serde_json::Value;

use crate::envelope::Method;
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[cfg(feature = "http")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "http")]
mod reqwest_transport {
    use std::time::Duration;

    use reqwest::Client;
    use tracing::debug;

    use super::{Transport, TransportRequest, TransportResponse};
    use crate::envelope::Method;
    use crate::error::{DispatchError, TransportError};

    /// [`Transport`] backed by a shared `reqwest` client.
    pub struct ReqwestTransport {
        client: Client,
    }

    impl ReqwestTransport {
        pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| DispatchError::Transport(e.to_string()))?;
            Ok(Self { client })
        }

        pub fn with_client(client: Client) -> Self {
            Self { client }
        }

        fn method(method: Method) -> reqwest::Method {
            match method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Patch => reqwest::Method::PATCH,
                Method::Delete => reqwest::Method::DELETE,
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ReqwestTransport {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            debug!(method = %request.method, url = %request.url, "Sending request");

            let mut builder = self
                .client
                .request(Self::method(request.method), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?.to_vec();

            Ok(TransportResponse { status, body })
        }
    }

}
