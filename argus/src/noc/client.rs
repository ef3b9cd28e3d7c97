//! HTTP transport to the NOC endpoints.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use super::payload::{NocFilter, NocPayload};
use crate::config::NocHttpClientConfig;

/// Indicates an error talking to the NOC
#[derive(Debug, Error)]
pub enum NocError {
    /// The request could not be performed (connect, timeout, body decode)
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The send endpoint returned a non-2xx status
    #[error("NOC send returned {0}")]
    SendStatus(StatusCode),

    /// The verify endpoint returned a non-2xx status
    #[error("NOC verify returned {0}")]
    VerifyStatus(StatusCode),
}

/// The seam between the dispatch logic and the NOC HTTP API.
#[async_trait]
pub trait NocTransport: Send + Sync {
    /// Phase 1: POSTs the payload to the send endpoint. `Ok` iff the receiver
    /// answered 200 or 204.
    async fn send(&self, payload: &NocPayload) -> Result<(), NocError>;

    /// Phase 2: POSTs the filter to the verify endpoint and returns the
    /// payload the receiver echoes back.
    async fn verify(&self, filter: &NocFilter) -> Result<NocPayload, NocError>;
}

pub struct HttpNocClient {
    client: reqwest::Client,
    config: NocHttpClientConfig,
}

// === impl HttpNocClient ===

impl HttpNocClient {
    pub fn new(config: NocHttpClientConfig) -> Result<Self, NocError> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_seconds.max(1)));

        if config.bypass_ssl_validation {
            warn!("NOC TLS certificate validation is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        // The (ConnectIpAddress, ConnectPort) override pins the endpoint
        // hosts to a fixed address, bypassing DNS.
        if let (Some(ip), Some(port)) = (config.connect_ip_address.as_deref(), config.connect_port)
        {
            match ip.parse() {
                Ok(ip) => {
                    let addr = SocketAddr::new(ip, port);
                    for endpoint in [&config.send_endpoint, &config.verify_endpoint] {
                        if let Some(host) =
                            reqwest::Url::parse(endpoint).ok().and_then(|url| {
                                url.host_str().map(str::to_string)
                            })
                        {
                            debug!(%host, %addr, "Pinning NOC endpoint host");
                            builder = builder.resolve(&host, addr);
                        }
                    }
                }
                Err(_) => warn!(ip, "Ignoring unparseable Noc.HttpClient.ConnectIpAddress"),
            }
        }

        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.post(url);
        if let Some(username) = self.config.username.as_deref() {
            request = request.basic_auth(username, self.config.password.as_deref());
        }
        request
    }
}

#[async_trait]
impl NocTransport for HttpNocClient {
    async fn send(&self, payload: &NocPayload) -> Result<(), NocError> {
        let response = self
            .post(&self.config.send_endpoint)
            .json(payload)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(NocError::SendStatus(status)),
        }
    }

    async fn verify(&self, filter: &NocFilter) -> Result<NocPayload, NocError> {
        let response = self
            .post(&self.config.verify_endpoint)
            .json(filter)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NocError::VerifyStatus(status));
        }
        Ok(response.json().await?)
    }
}
