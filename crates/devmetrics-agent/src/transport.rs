use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use devmetrics_common::codec::{Envelope, REAL_IP};
use devmetrics_common::proto::metric_collector_client::MetricCollectorClient;
use devmetrics_common::proto::EnvelopeRequest;
use reqwest::Client;
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};

/// Delivers one encoded chunk to the server's batch endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, envelope: &Envelope) -> Result<()>;
}

fn with_scheme(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Local address of the interface that routes to `target`, used as the
/// default `X-Real-IP`. No packet is sent.
pub fn detect_outbound_ip(target: &str) -> Option<IpAddr> {
    let host_port = target
        .split_once("://")
        .map_or(target, |(_, rest)| rest)
        .trim_end_matches('/');
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(host_port).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// `POST /updates` over HTTP.
pub struct HttpTransport {
    client: Client,
    url: String,
    real_ip: Option<String>,
}

impl HttpTransport {
    pub fn new(address: &str, real_ip: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}/updates", with_scheme(address)),
            real_ip,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        for (name, value) in envelope.headers.pairs() {
            request = request.header(name, value);
        }
        if let Some(ip) = &self.real_ip {
            request = request.header(REAL_IP, ip.as_str());
        }

        let resp = request
            .body(envelope.body.clone())
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("server answered {status}: {}", body.trim());
        }
        Ok(())
    }
}

/// The `UpdatesJson` RPC. The channel is opened on first use and dropped
/// after a failed call so the next send reconnects.
pub struct GrpcTransport {
    endpoint: String,
    real_ip: Option<String>,
    timeout: Duration,
    client: Mutex<Option<MetricCollectorClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new(address: &str, real_ip: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: with_scheme(address),
            real_ip,
            timeout,
            client: Mutex::new(None),
        }
    }

    async fn try_connect(&self) -> Result<MetricCollectorClient<Channel>> {
        let channel = Endpoint::from_shared(self.endpoint.clone())
            .with_context(|| format!("invalid gRPC endpoint '{}'", self.endpoint))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {}", self.endpoint))?;
        tracing::info!(endpoint = %self.endpoint, "Connected to server");
        Ok(MetricCollectorClient::new(channel))
    }

    fn request(&self, envelope: &Envelope) -> Result<tonic::Request<EnvelopeRequest>> {
        let mut request = tonic::Request::new(EnvelopeRequest {
            body: envelope.body.clone(),
        });
        let metadata = request.metadata_mut();
        for (name, value) in envelope.headers.pairs() {
            let value: MetadataValue<Ascii> = value.parse()?;
            metadata.insert(name, value);
        }
        if let Some(ip) = &self.real_ip {
            let value: MetadataValue<Ascii> = ip.parse()?;
            metadata.insert(REAL_IP, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn name(&self) -> &'static str {
        "grpc"
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let request = self.request(envelope)?;
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.try_connect().await?);
        }
        let Some(client) = guard.as_mut() else {
            bail!("no connection to {}", self.endpoint);
        };
        match client.updates_json(request).await {
            Ok(_) => Ok(()),
            Err(status) => {
                if status.code() == tonic::Code::Unavailable {
                    *guard = None;
                }
                bail!("server answered {:?}: {}", status.code(), status.message())
            }
        }
    }
}
