//! HTTP transport for the progress collector
//!
//! Posts gzip-compressed snapshots with the token as a query parameter.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;

use crate::config::ReporterConfig;
use crate::error::{Error, Result};
use crate::session::Snapshot;

use super::{encode, DeliveryFailure, Exchange, Transport};

/// reqwest-backed [`Transport`]
pub struct HttpTransport {
    http_client: reqwest::Client,
    server_url: Url,
}

impl HttpTransport {
    /// Create a transport from configuration
    ///
    /// Returns an error if the server URL is invalid or the client cannot be built.
    pub fn new(config: &ReporterConfig) -> Result<Self> {
        config.validate()?;

        let server_url = Url::parse(&config.server_url)
            .map_err(|e| Error::Config(format!("invalid reporter.server_url: {}", e)))?;

        // Build default headers
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            server_url,
        })
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }
}

fn classify(error: &reqwest::Error) -> DeliveryFailure {
    if error.is_timeout() {
        DeliveryFailure::Timeout
    } else {
        DeliveryFailure::Network(error.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, snapshot: &Snapshot, token: &str) -> Exchange {
        let body = match encode(snapshot) {
            Ok(body) => body,
            Err(e) => return Exchange::Failure(DeliveryFailure::Encode(e.to_string())),
        };

        tracing::trace!(
            session = %snapshot.id,
            bytes = body.len(),
            steps = snapshot.steps.len(),
            msgs = snapshot.messages.len(),
            "Posting snapshot"
        );

        let response = match self
            .http_client
            .post(self.server_url.clone())
            .query(&[("token", token)])
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Exchange::Failure(classify(&e)),
        };

        let status = response.status().as_u16();

        // Read the whole body so completion means the exchange is over
        match response.text().await {
            Ok(body) => Exchange::from_response(status, body),
            Err(e) => Exchange::Failure(classify(&e)),
        }
    }
}
