//! Network probes backing configured connections.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::config::ProbeConfig;
use crate::scheduler::source::{ConnectionTester, ProbeReport};

/// Build the tester described by a probe configuration.
pub fn build(config: &ProbeConfig) -> anyhow::Result<Arc<dyn ConnectionTester>> {
    match config {
        ProbeConfig::Tcp { address } => Ok(Arc::new(TcpProbe::new(address.clone()))),
        ProbeConfig::Http { url, expect_status } => {
            Ok(Arc::new(HttpProbe::new(url, *expect_status)?))
        }
    }
}

/// Succeeds when a TCP connection to `address` can be opened.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl ConnectionTester for TcpProbe {
    async fn test(&self) -> anyhow::Result<ProbeReport> {
        let start = Instant::now();
        let report = match TcpStream::connect(&self.address).await {
            Ok(_) => ProbeReport {
                is_successful: true,
                message: format!("Connected to {}", self.address),
                response_time: start.elapsed(),
            },
            Err(e) => ProbeReport {
                is_successful: false,
                message: format!("Could not connect to {}: {e}", self.address),
                response_time: start.elapsed(),
            },
        };
        Ok(report)
    }
}

/// Issues a GET and checks the response status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: url::Url,
    /// Required status; any 2xx when unset.
    expect_status: Option<u16>,
}

impl HttpProbe {
    pub fn new(url: &str, expect_status: Option<u16>) -> anyhow::Result<Self> {
        let url = url::Url::parse(url).with_context(|| format!("Invalid probe URL: {url}"))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("connection-health/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            expect_status,
        })
    }

    fn accepts(&self, status: reqwest::StatusCode) -> bool {
        match self.expect_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        }
    }
}

#[async_trait]
impl ConnectionTester for HttpProbe {
    async fn test(&self) -> anyhow::Result<ProbeReport> {
        let start = Instant::now();
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        let status = response.status();

        Ok(ProbeReport {
            is_successful: self.accepts(status),
            message: format!("GET {} returned {status}", self.url),
            response_time: start.elapsed(),
        })
    }
}
