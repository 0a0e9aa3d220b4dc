//! HTTP transport used by request steps.

use crate::error::TransportError;
use crate::model::{HttpMethod, ResponseInfo};
use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// A fully materialized request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

/// Sends requests on behalf of the executor. Implementations must
/// return [`TransportError::Cancelled`] promptly once `cancel` fires.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: &TransportRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponseInfo, TransportError>;
}

/// Default transport backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }

    async fn perform(&self, request: &TransportRequest) -> Result<ResponseInfo, TransportError> {
        let mut req_builder = self
            .client
            .request(Self::convert_method(request.method), &request.url)
            .timeout(request.timeout);

        for (name, value) in &request.headers {
            req_builder = req_builder.header(name, value);
        }
        if let Some(body) = &request.body {
            req_builder = req_builder.body(body.clone());
        }

        debug!("Sending request to {}", request.url);
        let response = req_builder
            .send()
            .await
            .map_err(|e| classify(e, request.timeout))?;
        debug!("Received response with status: {}", response.status());

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| classify(e, request.timeout))?;

        Ok(ResponseInfo {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout.as_secs())
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request, cancel), fields(url = %request.url, method = request.method.as_str()))]
    async fn send(
        &self,
        request: &TransportRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponseInfo, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.perform(request) => result,
        }
    }
}
