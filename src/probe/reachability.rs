//! Stage 1: reachability probing
//!
//! A TCP connect decides the outcome; ICMP runs alongside and is advisory.
//! UDP/QUIC schemes have no TCP service on their port, so for them the host
//! counts as reachable when ping answers or any common fallback port accepts.

use crate::error::{FailureKind, ProbeError};
use crate::probe::run_bounded;
use crate::proxy::models::{Network, ProxyCandidate, Tier};
use chrono::Utc;
use futures::future::select_ok;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1500;

/// Default ping timeout in milliseconds
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 1000;

/// Default number of concurrent probes
pub const DEFAULT_CONCURRENCY: usize = 64;

/// Ports tried for hosts whose proxy port is UDP-only
pub const FALLBACK_PORTS: [u16; 8] = [80, 443, 8080, 8443, 2052, 2082, 2086, 2095];

/// Well-known endpoints used to tell a dead network from dead proxies
const CONNECTIVITY_TARGETS: [(&str, u16); 2] = [("1.1.1.1", 443), ("8.8.8.8", 53)];

/// Configuration for the reachability prober
#[derive(Debug, Clone)]
pub struct ReachabilityConfig {
    pub connect_timeout: Duration,
    pub ping_timeout: Duration,
    pub concurrency: usize,
    /// Run the system `ping` alongside the TCP connect
    pub icmp_enabled: bool,
    pub ping_program: String,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            concurrency: DEFAULT_CONCURRENCY,
            icmp_enabled: true,
            ping_program: "ping".to_string(),
        }
    }
}

impl ReachabilityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_icmp(mut self, enabled: bool) -> Self {
        self.icmp_enabled = enabled;
        self
    }
}

/// Result of probing one candidate
#[derive(Debug)]
pub struct ReachabilityOutcome {
    /// Connect latency in milliseconds on success
    pub result: Result<u64, ProbeError>,
    pub icmp_ok: Option<bool>,
}

/// Stage 1 prober
#[derive(Debug, Clone, Default)]
pub struct ReachabilityProber {
    config: ReachabilityConfig,
}

impl ReachabilityProber {
    pub fn new(config: ReachabilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReachabilityConfig {
        &self.config
    }

    /// Probe a single candidate
    pub async fn probe(&self, candidate: &ProxyCandidate) -> ReachabilityOutcome {
        let icmp = async {
            if self.config.icmp_enabled {
                Some(ping(&self.config.ping_program, &candidate.host, self.config.ping_timeout).await)
            } else {
                None
            }
        };

        match candidate.scheme.network() {
            Network::Tcp => {
                let (icmp, tcp) = tokio::join!(
                    icmp,
                    tcp_connect(&candidate.host, candidate.port, self.config.connect_timeout)
                );
                ReachabilityOutcome {
                    result: tcp,
                    icmp_ok: icmp.map(|latency| latency.is_some()),
                }
            }
            Network::Udp => {
                let (icmp, fallback) = tokio::join!(
                    icmp,
                    fallback_connect(&candidate.host, self.config.connect_timeout)
                );
                let result = match (icmp.flatten(), fallback) {
                    (_, Ok(latency)) => Ok(latency),
                    (Some(latency), Err(_)) => Ok(latency),
                    (None, Err(e)) => Err(e),
                };
                ReachabilityOutcome {
                    result,
                    icmp_ok: icmp.map(|latency| latency.is_some()),
                }
            }
        }
    }

    /// Probe every candidate and record the outcome in place
    pub async fn probe_all(&self, candidates: &mut [ProxyCandidate], deadline: Option<Instant>) {
        let outcomes = run_bounded(
            candidates.iter().collect::<Vec<_>>(),
            self.config.concurrency,
            deadline,
            |candidate| self.probe(candidate),
        )
        .await;

        let tested_at = Utc::now();
        let mut reachable = 0;
        for (candidate, outcome) in candidates.iter_mut().zip(outcomes) {
            candidate.test_result.tested_at = Some(tested_at);
            match outcome {
                Some(outcome) => {
                    candidate.test_result.icmp_ok = outcome.icmp_ok;
                    match outcome.result {
                        Ok(latency) => {
                            candidate.promote(Tier::ReachableOnly, Some(latency));
                            reachable += 1;
                        }
                        Err(e) => {
                            debug!("{} unreachable: {}", candidate, e);
                            candidate.record_failure(e.kind());
                        }
                    }
                }
                None => candidate.record_failure(FailureKind::ProbeTimeout),
            }
        }

        info!(
            "Stage 1: {}/{} candidates reachable",
            reachable,
            candidates.len()
        );
    }
}

/// TCP connect with a bounded timeout, returning latency in milliseconds
pub async fn tcp_connect(host: &str, port: u16, timeout: Duration) -> Result<u64, ProbeError> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Ok(start.elapsed().as_millis() as u64),
        Ok(Err(e)) => Err(ProbeError::from(e)),
        Err(_) => Err(ProbeError::Timeout),
    }
}

async fn fallback_connect(host: &str, timeout: Duration) -> Result<u64, ProbeError> {
    let attempts = FALLBACK_PORTS
        .iter()
        .map(|&port| Box::pin(tcp_connect(host, port, timeout)));
    select_ok(attempts).await.map(|(latency, _)| latency)
}

/// One echo request through the system `ping`; `None` when it fails or is missing
async fn ping(program: &str, host: &str, timeout: Duration) -> Option<u64> {
    let wait_secs = timeout.as_secs().max(1).to_string();
    let start = Instant::now();
    let mut command = Command::new(program);
    command
        .args(["-c", "1", "-W", wait_secs.as_str(), host])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout + Duration::from_millis(500), command.status()).await {
        Ok(Ok(status)) if status.success() => Some(start.elapsed().as_millis() as u64),
        _ => None,
    }
}

/// Whether this machine can reach the internet at all
pub async fn connectivity_check(timeout: Duration) -> bool {
    let attempts = CONNECTIVITY_TARGETS
        .iter()
        .map(|&(host, port)| Box::pin(tcp_connect(host, port, timeout)));
    select_ok(attempts).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::Scheme;
    use tokio::net::TcpListener;

    fn candidate(scheme: Scheme, host: &str, port: u16) -> ProxyCandidate {
        ProxyCandidate::new(
            &format!("{}://x@{}:{}", scheme, host, port),
            scheme,
            host.to_string(),
            port,
        )
    }

    fn prober() -> ReachabilityProber {
        ReachabilityProber::new(
            ReachabilityConfig::new()
                .with_icmp(false)
                .with_connect_timeout(Duration::from_millis(500)),
        )
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_config_builder() {
        let config = ReachabilityConfig::new()
            .with_concurrency(8)
            .with_ping_timeout(Duration::from_millis(200))
            .with_icmp(false);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.ping_timeout, Duration::from_millis(200));
        assert!(!config.icmp_enabled);
        assert_eq!(
            ReachabilityConfig::default().connect_timeout,
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)
        );
    }

    #[tokio::test]
    async fn test_open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut candidates = vec![candidate(Scheme::Vless, "127.0.0.1", port)];
        prober().probe_all(&mut candidates, None).await;

        assert_eq!(candidates[0].tier(), Tier::ReachableOnly);
        assert!(candidates[0].test_result.latency_ms.is_some());
        assert!(candidates[0].test_result.tested_at.is_some());
        assert_eq!(candidates[0].test_result.icmp_ok, None);
    }

    #[tokio::test]
    async fn test_closed_port_is_refused() {
        let port = closed_port().await;
        let mut candidates = vec![candidate(Scheme::Trojan, "127.0.0.1", port)];
        prober().probe_all(&mut candidates, None).await;

        assert_eq!(candidates[0].tier(), Tier::Unreached);
        assert_eq!(
            candidates[0].test_result.failure,
            Some(FailureKind::ProbeConnectionRefused)
        );
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_unreached() {
        let mut candidates = vec![candidate(Scheme::Vmess, "host.invalid", 443)];
        prober().probe_all(&mut candidates, None).await;
        assert_eq!(candidates[0].tier(), Tier::Unreached);
        assert!(candidates[0].test_result.failure.is_some());
    }

    #[tokio::test]
    async fn test_deadline_marks_unfinished_as_timeout() {
        let mut candidates = vec![candidate(Scheme::Vless, "127.0.0.1", 9)];
        let expired = Instant::now();
        prober().probe_all(&mut candidates, Some(expired)).await;

        assert_eq!(candidates[0].tier(), Tier::Unreached);
        assert_eq!(candidates[0].test_result.failure, Some(FailureKind::ProbeTimeout));
    }
}
