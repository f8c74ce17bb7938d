//! Agent reporter: a bounded queue of snapshots drained by `rate_limit`
//! worker tasks, each handing its batch to one of two transport variants.
//! The HTTP transport composes (JSON → HMAC → encrypt → gzip) before
//! sending; the RPC transport ships the batch as a typed protobuf message
//! with no such framing, since the wire contract already carries types.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::codec::{compress, crypto::Encryptor, hash};
use crate::metric::{Metric, MetricDto};

/// Fixed retry schedule for a failed delivery attempt, matching the
/// relational storage backend's own retry schedule.
const TRANSPORT_RETRY_SCHEDULE: &[Duration] =
    &[Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(5)];

/// Transport abstraction so the queue/worker machinery is agnostic to
/// HTTP vs RPC; the transport must never call back into the reporter
/// (one-directional close path).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &[Metric]) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failed(String),
    #[error("composing outbound payload failed: {0}")]
    Compose(#[from] ComposeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("encryption failed: {0}")]
    Encrypt(#[from] crate::codec::crypto::CryptoError),
    #[error("compression failed: {0}")]
    Compress(#[from] compress::CompressError),
}

/// A fully composed outbound HTTP request: body bytes plus the headers
/// whose presence depends on which transforms actually ran.
struct OutboundPayload {
    body: Vec<u8>,
    hash_header: Option<String>,
    encrypted: bool,
    outbound_ip: Option<IpAddr>,
}

/// HTTP transport: `POST {base}/updates/`, composing the body itself so
/// the queue/worker machinery stays transport-agnostic.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    hash_key: Option<String>,
    encryptor: Option<Encryptor>,
}

pub struct HttpTransportConfig {
    pub addr: String,
    pub hash_key: Option<String>,
    pub public_key_pem: Option<String>,
}

impl HttpTransport {
    pub fn new(cfg: HttpTransportConfig) -> Result<Self, crate::codec::crypto::CryptoError> {
        let base_url = if cfg.addr.starts_with("http") { cfg.addr } else { format!("http://{}", cfg.addr) };
        let encryptor = cfg.public_key_pem.as_deref().map(Encryptor::from_public_key_pem).transpose()?;
        Ok(Self { client: reqwest::Client::new(), base_url, hash_key: cfg.hash_key, encryptor })
    }

    /// Composes the outbound payload in the exact order the reference
    /// agent fixes: serialize to JSON → compute HMAC (if a hash key is
    /// configured) → encrypt (if a public key is configured) → gzip
    /// compress. The hash is always computed over the plaintext JSON,
    /// never over the encrypted bytes.
    fn compose(&self, batch: &[Metric]) -> Result<OutboundPayload, ComposeError> {
        let dtos: Vec<MetricDto> = batch.iter().map(MetricDto::from).collect();
        let json = serde_json::to_vec(&dtos).map_err(ComposeError::Serialize)?;

        let hash_header = self.hash_key.as_deref().map(|k| hash::hmac_sha256_base64url(k, &json));

        let (payload_bytes, encrypted) = match &self.encryptor {
            Some(enc) => (enc.encrypt(&json)?, true),
            None => (json, false),
        };

        let gzipped = compress::gzip(&payload_bytes)?;

        Ok(OutboundPayload { body: gzipped, hash_header, encrypted, outbound_ip: outbound_ip() })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[Metric]) -> Result<(), TransportError> {
        let payload = self.compose(batch)?;
        let url = format!("{}/updates/", self.base_url.trim_end_matches('/'));
        let mut attempt = 0usize;
        loop {
            let mut req = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Content-Encoding", "gzip")
                .header("Accept-Encoding", "gzip")
                .body(payload.body.clone());
            if let Some(hash) = &payload.hash_header {
                req = req.header(hash::HEADER_HASH, hash);
            }
            if payload.encrypted {
                req = req.header("Encryption", "");
            }
            if let Some(ip) = payload.outbound_ip {
                req = req.header("X-Real-IP", ip.to_string());
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    if attempt >= TRANSPORT_RETRY_SCHEDULE.len() {
                        return Err(TransportError::Failed(format!("server returned {}", resp.status())));
                    }
                }
                Err(e) => {
                    if attempt >= TRANSPORT_RETRY_SCHEDULE.len() {
                        return Err(TransportError::Failed(e.to_string()));
                    }
                }
            }
            tokio::time::sleep(TRANSPORT_RETRY_SCHEDULE[attempt]).await;
            attempt += 1;
        }
    }
}

/// RPC transport: a single unary `MetricService.Update` call per batch,
/// tagging the outbound IP via request metadata the same way the HTTP
/// transport tags it via a header. No hashing, encryption, or compression —
/// the generated contract already types the payload.
pub struct RpcTransport {
    client: tokio::sync::Mutex<crate::server::rpc::pb::metric_service_client::MetricServiceClient<tonic::transport::Channel>>,
}

impl RpcTransport {
    pub async fn connect(addr: &str) -> Result<Self, tonic::transport::Error> {
        let endpoint = if addr.starts_with("http") { addr.to_string() } else { format!("http://{addr}") };
        let client = crate::server::rpc::pb::metric_service_client::MetricServiceClient::connect(endpoint).await?;
        Ok(Self { client: tokio::sync::Mutex::new(client) })
    }
}

#[async_trait]
impl Transport for RpcTransport {
    async fn send(&self, batch: &[Metric]) -> Result<(), TransportError> {
        use crate::server::rpc::pb::{Metric as PbMetric, MetricType, UpdateRequest};

        let metrics: Vec<PbMetric> = batch
            .iter()
            .map(|m| match m {
                Metric::Gauge { name, value } => {
                    PbMetric { name: name.clone(), r#type: MetricType::Gauge as i32, delta: None, value: Some(*value) }
                }
                Metric::Counter { name, delta } => {
                    PbMetric { name: name.clone(), r#type: MetricType::Counter as i32, delta: Some(*delta), value: None }
                }
            })
            .collect();

        let mut request = tonic::Request::new(UpdateRequest { metrics });
        if let Some(ip) = outbound_ip() {
            if let Ok(value) = ip.to_string().parse() {
                request.metadata_mut().insert("x-real-ip", value);
            }
        }

        self.client
            .lock()
            .await
            .update(request)
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        Ok(())
    }
}

pub struct ReporterConfig {
    pub rate_limit: usize,
}

/// Owns the bounded queue and the worker pool. `enqueue` is a safe drop
/// once closed (a separately tracked flag), not a panic on a closed channel.
pub struct Reporter {
    tx: mpsc::Sender<Vec<Metric>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    token: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    transport: Arc<dyn Transport>,
}

impl Reporter {
    pub fn new(cfg: ReporterConfig, transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::channel(cfg.rate_limit.max(1));
        let token = CancellationToken::new();
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let workers = spawn_workers(cfg.rate_limit.max(1), rx, transport.clone(), token.clone());

        Self { tx, closed, token, workers: std::sync::Mutex::new(workers), transport }
    }

    /// Drops silently if the queue is closed; otherwise blocks until a
    /// slot frees up — natural backpressure against collection.
    pub async fn enqueue(&self, snapshot: Vec<Metric>) {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        if self.tx.send(snapshot).await.is_err() {
            debug!("reporter queue closed mid-send, dropping batch");
        }
    }

    /// Idempotent: closes the queue, cancels workers, waits for them to
    /// drain, then closes the transport. One-directional: the transport
    /// never calls back into the reporter.
    pub async fn close(&self) {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for h in handles {
            let _ = h.await;
        }
        if let Err(e) = self.transport.close().await {
            error!(error = %e, "failed to close transport");
        }
    }
}

fn spawn_workers(
    count: usize,
    rx: mpsc::Receiver<Vec<Metric>>,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..count)
        .map(|worker_number| {
            let rx = rx.clone();
            let transport = transport.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let batch = tokio::select! {
                        _ = token.cancelled() => None,
                        item = async { rx.lock().await.recv().await } => item,
                    };
                    let Some(batch) = batch else {
                        debug!(worker_number, "worker stopped");
                        return;
                    };
                    if batch.is_empty() {
                        continue;
                    }
                    match transport.send(&batch).await {
                        Ok(()) => debug!(worker_number, "metrics reported"),
                        Err(e) => error!(worker_number, error = %e, "reporting metrics failed"),
                    }
                }
            })
        })
        .collect()
}

/// Best-effort local outbound address, mirroring the reference agent's
/// `GetOutboundIP` helper (dial a well-known address and read the local
/// socket endpoint without sending any traffic).
fn outbound_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingTransport {
        count: AtomicUsize,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, _batch: &[Metric]) -> Result<(), TransportError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_after_close_is_a_silent_drop() {
        let transport = Arc::new(RecordingTransport { count: AtomicUsize::new(0) });
        let reporter = Reporter::new(ReporterConfig { rate_limit: 1 }, transport.clone());

        reporter.close().await;
        reporter.enqueue(vec![Metric::Gauge { name: "x".into(), value: 1.0 }]).await;
        // Closing again is a no-op (idempotent), not a panic.
        reporter.close().await;
    }

    #[tokio::test]
    async fn http_transport_posts_composed_body_to_updates_endpoint() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/updates/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = HttpTransport::new(HttpTransportConfig {
            addr: mock_server.uri(),
            hash_key: None,
            public_key_pem: None,
        })
        .unwrap();

        transport
            .send(&[Metric::Gauge { name: "heap".into(), value: 1.0 }])
            .await
            .unwrap();
    }

    #[test]
    fn compose_sets_hash_header_only_when_key_configured() {
        let batch = vec![Metric::Gauge { name: "test".into(), value: 0.5 }];
        let without_key =
            HttpTransport::new(HttpTransportConfig { addr: "x".into(), hash_key: None, public_key_pem: None }).unwrap();
        let without = without_key.compose(&batch).unwrap();
        assert!(without.hash_header.is_none());
        assert!(!without.encrypted);

        let with_key =
            HttpTransport::new(HttpTransportConfig { addr: "x".into(), hash_key: Some("secret".into()), public_key_pem: None })
                .unwrap();
        let with = with_key.compose(&batch).unwrap();
        assert!(with.hash_header.is_some());
    }
}
