//! Two-tier instance health check: TCP reachability, then the version endpoint.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::FleetConfig;
use crate::domain::Status;

#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
    connect_timeout: Duration,
    version_path: String,
    version_field: String,
    fast: bool,
}

impl Prober {
    pub fn new(cfg: &FleetConfig, fast: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.probe_http_timeout)
            .connect_timeout(cfg.probe_http_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            connect_timeout: cfg.probe_connect_timeout,
            version_path: cfg.version_path.clone(),
            version_field: cfg.version_field.clone(),
            fast,
        })
    }

    pub async fn reachable(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Application version reported by the instance, if it answers in time.
    pub async fn version(&self, port: u16) -> Option<String> {
        let url = format!("http://127.0.0.1:{port}{}", self.version_path);
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            debug!(port, status = %resp.status(), "version endpoint not ready");
            return None;
        }
        let body: Value = resp.json().await.ok()?;
        extract_version(&body, &self.version_field)
    }

    /// Status together with the reported version (never fetched in fast mode).
    pub async fn check(&self, port: u16) -> (Status, Option<String>) {
        if !self.reachable(port).await {
            return (Status::Down, None);
        }
        if self.fast {
            return (Status::Up, None);
        }
        match self.version(port).await {
            Some(v) => (Status::Up, Some(v)),
            None => (Status::Degraded, None),
        }
    }

    pub async fn probe(&self, port: u16) -> Status {
        self.check(port).await.0
    }

    /// Poll until the instance reports `Up`, backing off between attempts.
    pub async fn wait_ready(&self, port: u16, limit: Duration) -> anyhow::Result<()> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(100);
        loop {
            let status = self.probe(port).await;
            if status == Status::Up {
                debug!(port, elapsed = ?start.elapsed(), "instance ready");
                return Ok(());
            }
            if start.elapsed() + delay > limit {
                anyhow::bail!("instance on port {port} not ready within {limit:?} (last status: {status})");
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(2));
        }
    }
}

fn extract_version(body: &Value, field: &str) -> Option<String> {
    let found = body
        .get(field)
        .or_else(|| body.get("result").and_then(|r| r.get(field)))?;
    match found {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}
