//! Caller-facing request surface
//!
//! [`Client`] fixes a base URL, default headers and transport options, then
//! forwards every call to a [`RequestOrchestrator`]. Option precedence is
//! client defaults, then per-call overrides, then the `content-length` the
//! orchestrator derives from the body.

use std::{sync::Arc, time::Duration};

use http::{header::HeaderName, HeaderMap, HeaderValue, Method, Uri};

use crate::{
    body::BodySource,
    config::{ClientConfig, ContentLengthPolicy},
    core::{RequestDescriptor, RequestResult, Response, TransportOptions},
    orchestration::RequestOrchestrator,
    telemetry::TelemetrySink,
    transport::{TcpTransport, Transport},
    utils::request::{merge_headers, resolve_target},
};

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub transport: TransportOptions,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.transport.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct Client {
    base: Option<Uri>,
    headers: HeaderMap,
    options: TransportOptions,
    orchestrator: RequestOrchestrator,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            base: None,
            headers: HeaderMap::new(),
            options: TransportOptions::default(),
            orchestrator: RequestOrchestrator::new(transport),
            telemetry: None,
        }
    }

    /// Build a client over [`TcpTransport`] from configuration.
    pub fn from_config(config: &ClientConfig) -> RequestResult<Self> {
        let mut transport = TcpTransport::new().with_write_buffer(config.write_buffer);
        if let Some(timeout) = &config.timeout {
            if let Some(connect) = timeout.connect_duration() {
                transport = transport.with_connect_timeout(connect);
            }
            if let Some(read) = timeout.read_duration() {
                transport = transport.with_timeout(read);
            }
        }

        let mut client = Client::new(Arc::new(transport))
            .with_default_headers(config.header_map()?)
            .with_content_length_policy(config.content_length);
        client.base = config.base_uri()?;

        log::debug!(
            "client configured: base {:?}, {} default headers",
            config.base_url,
            client.headers.len()
        );
        Ok(client)
    }

    /// Resolve relative targets against `base`.
    pub fn with_base(mut self, base: Uri) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = merge_headers(&self.headers, &headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn with_content_length_policy(mut self, policy: ContentLengthPolicy) -> Self {
        self.orchestrator = self.orchestrator.with_content_length_policy(policy);
        self
    }

    /// Publish the lifecycle of every request issued by this client.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Assemble the descriptor a call would send, before body-derived headers.
    pub fn descriptor(
        &self,
        method: Method,
        target: &str,
        options: &RequestOptions,
    ) -> RequestResult<RequestDescriptor> {
        let uri = resolve_target(self.base.as_ref(), target)?;
        let mut descriptor = RequestDescriptor::new(method, uri)
            .with_options(self.options.merged_with(&options.transport));
        descriptor.headers = merge_headers(&self.headers, &options.headers);
        Ok(descriptor)
    }

    pub async fn execute(
        &self,
        method: Method,
        target: &str,
        body: impl Into<BodySource>,
        options: RequestOptions,
    ) -> RequestResult<Response> {
        let descriptor = self.descriptor(method, target, &options)?;
        self.orchestrator
            .execute(descriptor, body.into(), self.telemetry.clone())
            .await
    }

    pub async fn get(&self, target: &str) -> RequestResult<Response> {
        self.execute(Method::GET, target, BodySource::None, RequestOptions::default())
            .await
    }

    pub async fn post(&self, target: &str, body: impl Into<BodySource>) -> RequestResult<Response> {
        self.execute(Method::POST, target, body, RequestOptions::default())
            .await
    }

    pub async fn put(&self, target: &str, body: impl Into<BodySource>) -> RequestResult<Response> {
        self.execute(Method::PUT, target, body, RequestOptions::default())
            .await
    }

    pub async fn delete(&self, target: &str) -> RequestResult<Response> {
        self.execute(Method::DELETE, target, BodySource::None, RequestOptions::default())
            .await
    }
}
