// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for the Dispatch API.
//!
//! Used by non-durable code to originate work: it enqueues executions at the
//! scheduler and returns their dispatch ids. There are no suspension
//! semantics here; this is a thin boundary over the request/response
//! transport with retry on transient failures.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use dispatch_proto::{codec, DispatchRequest};

use crate::config::Config;
use crate::error::{Result, SdkError, TransportError};
use crate::types::{Call, DispatchId, RetryPolicy};

/// Path of the dispatch endpoint, relative to the scheduler base URL.
const DISPATCH_PATH: &str = "dispatch.sdk.v1.DispatchService/Dispatch";

/// The request/response channel the client rides on.
///
/// Abstracted so tests can inject a recording transport; production uses
/// [`HttpTransport`].
#[async_trait]
pub trait DispatchTransport: Send + Sync {
    async fn round_trip(
        &self,
        url: &str,
        api_key: &str,
        body: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, TransportError>;
}

/// HTTP transport speaking protobuf over POST.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SdkError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl DispatchTransport for HttpTransport {
    async fn round_trip(
        &self,
        url: &str,
        api_key: &str,
        body: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/proto")
            .body(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                code: status.as_u16(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        let message = e.to_string();
        if message.contains("dns") {
            TransportError::Dns(message)
        } else if message.contains("tls") || message.contains("certificate") {
            TransportError::Tls(message)
        } else {
            TransportError::Connect(message)
        }
    } else {
        TransportError::Connect(e.to_string())
    }
}

/// Client for the Dispatch API.
///
/// # Example
///
/// ```ignore
/// use dispatch_sdk::{Call, Client, Config, Value};
///
/// let client = Client::from_env()?;
/// let dispatch_id = client
///     .dispatch(Call::new("app.resize", Value::Str("image-1".into())))
///     .await?;
/// ```
pub struct Client {
    endpoint_url: String,
    api_key: String,
    retry: RetryPolicy,
    transport: Arc<dyn DispatchTransport>,
}

impl Client {
    /// Create a client from a configuration.
    ///
    /// Fails when the endpoint URL or API key is missing.
    pub fn new(config: &Config) -> Result<Self> {
        if config.endpoint_url.is_empty() {
            return Err(SdkError::Config(
                "missing endpoint URL: set it with the DISPATCH_ENDPOINT_URL environment variable"
                    .to_string(),
            ));
        }
        if config.api_key.is_empty() {
            return Err(SdkError::Config(
                "missing API key: set it with the DISPATCH_API_KEY environment variable"
                    .to_string(),
            ));
        }
        Ok(Self {
            endpoint_url: config.endpoint_url.clone(),
            api_key: config.api_key.clone(),
            retry: RetryPolicy::default(),
            transport: Arc::new(HttpTransport::new()?),
        })
    }

    /// Create a client from `DISPATCH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(&Config::from_env()?)
    }

    /// Replace the transport. Used by tests.
    pub fn with_transport(mut self, transport: Arc<dyn DispatchTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enqueue one execution. Returns its dispatch id.
    pub async fn dispatch(&self, call: Call) -> Result<DispatchId> {
        let mut ids = self.batch_dispatch(vec![call]).await?;
        ids.pop()
            .ok_or_else(|| SdkError::InvalidResponse("no dispatch id in response".to_string()))
    }

    /// Enqueue a batch of executions. Returns their dispatch ids in request
    /// order.
    pub async fn batch_dispatch(&self, calls: Vec<Call>) -> Result<Vec<DispatchId>> {
        let count = calls.len();
        let mut proto_calls = Vec::with_capacity(count);
        for call in &calls {
            proto_calls.push(call.to_proto(0)?);
        }
        let body = codec::encode_dispatch_request(&DispatchRequest { calls: proto_calls });
        let url = format!(
            "{}/{}",
            self.endpoint_url.trim_end_matches('/'),
            DISPATCH_PATH
        );
        debug!(count, url = %url, "dispatching calls");

        let mut failures: u32 = 0;
        let response_body = loop {
            match self
                .transport
                .round_trip(&url, &self.api_key, body.clone())
                .await
            {
                Ok(bytes) => break bytes,
                Err(e) => {
                    failures += 1;
                    if !e.is_transient() || !self.retry.should_retry(failures) {
                        return Err(e.into());
                    }
                    let delay = self.retry.backoff(failures);
                    warn!(%e, failures, delay_ms = delay.as_millis() as u64, "transient dispatch failure, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let response = codec::decode_dispatch_response(&response_body)
            .map_err(|e| SdkError::InvalidResponse(e.to_string()))?;
        if response.dispatch_ids.len() != count {
            return Err(SdkError::InvalidResponse(format!(
                "dispatched {} call(s) but received {} id(s)",
                count,
                response.dispatch_ids.len()
            )));
        }
        debug!(count, "dispatch acknowledged");
        Ok(response.dispatch_ids)
    }
}
