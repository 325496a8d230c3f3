//! Stage 2: protocol probing
//!
//! Each reachable candidate gets the cheapest probe that says something about
//! the protocol behind the port:
//! - TLS handshake for TLS-bearing endpoints (certificates are not verified)
//! - websocket upgrade for plain ws transports
//! - "silent server" exchange for raw encrypted protocols
//! - a single datagram for UDP/QUIC schemes

use crate::error::{FailureKind, ProbeError};
use crate::probe::run_bounded;
use crate::proxy::models::{Network, ProxyCandidate, Tier};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info};

/// Default per-probe timeout in milliseconds
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1200;

/// Default wait for an unsolicited banner in milliseconds
pub const DEFAULT_BANNER_WAIT_MS: u64 = 300;

/// Default number of concurrent probes
pub const DEFAULT_CONCURRENCY: usize = 64;

/// Ports where TLS is assumed regardless of URI parameters
pub const TLS_PORTS: [u16; 8] = [443, 8443, 2053, 2083, 2087, 2096, 444, 10443];

/// Plaintext greetings that mark a port as something other than a proxy
const PLAINTEXT_BANNERS: &[&[u8]] = &[
    b"HTTP/",
    b"SSH-",
    b"220 ",
    b"220-",
    b"+OK",
    b"* OK",
    b"<html",
    b"<!DOCTYPE",
];

/// Configuration for the protocol prober
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub timeout: Duration,
    pub banner_wait: Duration,
    pub concurrency: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            banner_wait: Duration::from_millis(DEFAULT_BANNER_WAIT_MS),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_banner_wait(mut self, wait: Duration) -> Self {
        self.banner_wait = wait;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Which probe a candidate receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Tls,
    WebSocket,
    Silent,
    Datagram,
}

impl ProbeKind {
    pub fn for_candidate(candidate: &ProxyCandidate) -> Self {
        if candidate.scheme.network() == Network::Udp {
            ProbeKind::Datagram
        } else if candidate.tls_enabled || TLS_PORTS.contains(&candidate.port) {
            ProbeKind::Tls
        } else if candidate.transport == "ws" {
            ProbeKind::WebSocket
        } else {
            ProbeKind::Silent
        }
    }
}

/// Stage 2 prober
#[derive(Debug, Clone, Default)]
pub struct ProtocolProber {
    config: ProtocolConfig,
}

impl ProtocolProber {
    pub fn new(config: ProtocolConfig) -> Self {
        Self { config }
    }

    /// Probe a single candidate
    pub async fn probe(&self, candidate: &ProxyCandidate) -> Result<(), ProbeError> {
        let kind = ProbeKind::for_candidate(candidate);
        let probe = async {
            match kind {
                ProbeKind::Tls => tls_handshake(candidate).await,
                ProbeKind::WebSocket => websocket_upgrade(candidate).await,
                ProbeKind::Silent => silent_exchange(candidate, &self.config).await,
                ProbeKind::Datagram => datagram(candidate, self.config.timeout).await,
            }
        };

        // the datagram probe treats its own timeout as success
        let budget = match kind {
            ProbeKind::Datagram | ProbeKind::Silent => self.config.timeout * 3,
            _ => self.config.timeout,
        };
        match tokio::time::timeout(budget, probe).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        }
    }

    /// Probe every `ReachableOnly` candidate and promote passes to `ProtocolOk`
    pub async fn probe_all(&self, candidates: &mut [ProxyCandidate], deadline: Option<Instant>) {
        let eligible: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.tier() == Tier::ReachableOnly)
            .map(|(i, _)| i)
            .collect();

        let snapshot: &[ProxyCandidate] = candidates;
        let outcomes = run_bounded(
            eligible.iter().map(|&i| &snapshot[i]).collect::<Vec<_>>(),
            self.config.concurrency,
            deadline,
            |candidate| self.probe(candidate),
        )
        .await;

        let mut passed = 0;
        for (index, outcome) in eligible.iter().zip(outcomes) {
            let candidate = &mut candidates[*index];
            match outcome {
                Some(Ok(())) => {
                    candidate.promote(Tier::ProtocolOk, None);
                    passed += 1;
                }
                Some(Err(e)) => {
                    debug!("{} failed protocol probe: {}", candidate, e);
                    candidate.record_failure(e.kind());
                }
                None => candidate.record_failure(FailureKind::ProbeTimeout),
            }
        }

        info!("Stage 2: {}/{} candidates passed", passed, eligible.len());
    }
}

fn is_domain(host: &str) -> bool {
    host.parse::<std::net::IpAddr>().is_err()
}

async fn tls_handshake(candidate: &ProxyCandidate) -> Result<(), ProbeError> {
    let server_name = candidate
        .sni
        .clone()
        .filter(|s| is_domain(s))
        .or_else(|| is_domain(&candidate.host).then(|| candidate.host.clone()));

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .use_sni(server_name.is_some())
        .build()
        .map_err(|e| ProbeError::Handshake(e.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let stream = TcpStream::connect((candidate.host.as_str(), candidate.port)).await?;
    let domain = server_name.unwrap_or_else(|| candidate.host.clone());
    connector
        .connect(&domain, stream)
        .await
        .map_err(|e| ProbeError::Handshake(e.to_string()))?;
    Ok(())
}

async fn websocket_upgrade(candidate: &ProxyCandidate) -> Result<(), ProbeError> {
    let path = candidate.param("path").unwrap_or("/");
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    let host_header = candidate
        .param("host")
        .map(String::from)
        .or_else(|| candidate.sni.clone())
        .unwrap_or_else(|| candidate.host.clone());

    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        path,
        host_header,
        STANDARD.encode(key)
    );

    let mut stream = TcpStream::connect((candidate.host.as_str(), candidate.port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf[..n]);
    let status_line = response.lines().next().unwrap_or_default();
    if status_line.starts_with("HTTP/") && status_line.split_whitespace().nth(1) == Some("101") {
        Ok(())
    } else if n == 0 {
        Err(ProbeError::Handshake("connection closed before upgrade".to_string()))
    } else {
        Err(ProbeError::Handshake(format!("unexpected response: {}", status_line)))
    }
}

fn looks_like_banner(data: &[u8]) -> bool {
    PLAINTEXT_BANNERS.iter().any(|banner| {
        data.len() >= banner.len() && data[..banner.len()].eq_ignore_ascii_case(banner)
    })
}

/// Read once with a timeout; `Ok(None)` means the peer stayed silent
async fn read_with_wait(
    stream: &mut TcpStream,
    buf: &mut [u8],
    wait: Duration,
) -> io::Result<Option<usize>> {
    match tokio::time::timeout(wait, stream.read(buf)).await {
        Ok(Ok(n)) => Ok(Some(n)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}

async fn silent_exchange(candidate: &ProxyCandidate, config: &ProtocolConfig) -> Result<(), ProbeError> {
    let mut stream = TcpStream::connect((candidate.host.as_str(), candidate.port)).await?;
    let mut buf = [0u8; 512];

    // servers like SSH and SMTP greet first
    match read_with_wait(&mut stream, &mut buf, config.banner_wait).await {
        Ok(Some(n)) if n > 0 && looks_like_banner(&buf[..n]) => {
            return Err(ProbeError::NotAProxy(banner_text(&buf[..n])));
        }
        Ok(Some(_)) | Err(_) => return Ok(()),
        Ok(None) => {}
    }

    let mut payload = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut payload);
    if stream.write_all(&payload).await.is_err() {
        return Ok(());
    }

    match read_with_wait(&mut stream, &mut buf, config.timeout).await {
        Ok(Some(n)) if n > 0 && looks_like_banner(&buf[..n]) => {
            Err(ProbeError::NotAProxy(banner_text(&buf[..n])))
        }
        _ => Ok(()),
    }
}

fn banner_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(64)
        .collect()
}

async fn datagram(candidate: &ProxyCandidate, wait: Duration) -> Result<(), ProbeError> {
    let addr = lookup_host((candidate.host.as_str(), candidate.port))
        .await?
        .next()
        .ok_or_else(|| ProbeError::Io(io::Error::new(io::ErrorKind::NotFound, "no address")))?;
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let mut payload = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut payload);
    socket.send(&payload).await?;

    let mut buf = [0u8; 512];
    match tokio::time::timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(ProbeError::ConnectionRefused)
        }
        Ok(Err(e)) => Err(ProbeError::Io(e)),
        // open or filtered
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::Scheme;
    use crate::proxy::parser::ProxyParser;
    use tokio::net::TcpListener;

    fn prober() -> ProtocolProber {
        ProtocolProber::new(
            ProtocolConfig::new()
                .with_timeout(Duration::from_millis(300))
                .with_banner_wait(Duration::from_millis(100)),
        )
    }

    fn reachable(uri: &str) -> ProxyCandidate {
        let mut c = ProxyParser::parse_uri(uri).unwrap();
        c.promote(Tier::ReachableOnly, Some(1));
        c
    }

    #[test]
    fn test_probe_kind_selection() {
        let tls = ProxyParser::parse_uri("vless://id@1.2.3.4:8080?security=tls").unwrap();
        assert_eq!(ProbeKind::for_candidate(&tls), ProbeKind::Tls);

        let tls_port = ProxyParser::parse_uri("ss://aes-128-gcm:pw@1.2.3.4:443").unwrap();
        assert_eq!(ProbeKind::for_candidate(&tls_port), ProbeKind::Tls);

        let ws = ProxyParser::parse_uri("vless://id@1.2.3.4:8080?type=ws&path=%2F").unwrap();
        assert_eq!(ProbeKind::for_candidate(&ws), ProbeKind::WebSocket);

        let raw = ProxyParser::parse_uri("ss://aes-128-gcm:pw@1.2.3.4:8388").unwrap();
        assert_eq!(ProbeKind::for_candidate(&raw), ProbeKind::Silent);

        let quic = ProxyParser::parse_uri("hysteria2://pw@1.2.3.4:8443").unwrap();
        assert_eq!(ProbeKind::for_candidate(&quic), ProbeKind::Datagram);
    }

    #[test]
    fn test_banner_detection() {
        assert!(looks_like_banner(b"SSH-2.0-OpenSSH_9.6\r\n"));
        assert!(looks_like_banner(b"http/1.1 400 Bad Request\r\n"));
        assert!(looks_like_banner(b"220 mail.example.com ESMTP\r\n"));
        assert!(!looks_like_banner(&[0x17, 0x03, 0x03, 0x00, 0x20]));
        assert!(!looks_like_banner(b"HT"));
    }

    /// Local TLS server with a self-signed certificate
    async fn tls_listener() -> u16 {
        let identity = native_tls::Identity::from_pkcs8(
            include_bytes!("testdata/localhost.crt"),
            include_bytes!("testdata/localhost.key"),
        )
        .unwrap();
        let acceptor =
            tokio_native_tls::TlsAcceptor::from(native_tls::TlsAcceptor::new(identity).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut stream) = acceptor.accept(socket).await {
                        let mut buf = [0u8; 64];
                        let _ = stream.read(&mut buf).await;
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_tls_endpoint_passes_with_self_signed_cert() {
        let port = tls_listener().await;
        let mut candidates = vec![
            reachable(&format!("trojan://pw@127.0.0.1:{}", port)),
            reachable(&format!("vless://id@localhost:{}?security=tls&sni=localhost", port)),
        ];
        assert_eq!(ProbeKind::for_candidate(&candidates[0]), ProbeKind::Tls);

        let prober =
            ProtocolProber::new(ProtocolConfig::new().with_timeout(Duration::from_secs(5)));
        prober.probe_all(&mut candidates, None).await;
        assert_eq!(candidates[0].tier(), Tier::ProtocolOk);
        assert_eq!(candidates[1].tier(), Tier::ProtocolOk);
    }

    #[tokio::test]
    async fn test_plain_server_fails_tls_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let candidate = reachable(&format!("trojan://pw@127.0.0.1:{}", port));
        let result = prober().probe(&candidate).await;
        assert!(matches!(result, Err(ProbeError::Handshake(_))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_silent_server_passes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            // swallow everything, never answer
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let mut candidates = vec![reachable(&format!("ss://aes-128-gcm:pw@127.0.0.1:{}", port))];
        let prober =
            ProtocolProber::new(ProtocolConfig::new().with_timeout(Duration::from_secs(5)));
        prober.probe_all(&mut candidates, None).await;
        assert_eq!(candidates[0].tier(), Tier::ProtocolOk);
        assert_eq!(candidates[0].test_result.failure, None);
    }

    #[tokio::test]
    async fn test_http_server_is_not_a_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let mut candidates = vec![reachable(&format!("ss://aes-128-gcm:pw@127.0.0.1:{}", port))];
        prober().probe_all(&mut candidates, None).await;
        assert_eq!(candidates[0].tier(), Tier::ReachableOnly);
        assert_eq!(candidates[0].test_result.failure, Some(FailureKind::ProbeFailed));
    }

    #[tokio::test]
    async fn test_ssh_banner_is_not_a_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let c = reachable(&format!("vless://id@127.0.0.1:{}", port));
        assert!(matches!(prober().probe(&c).await, Err(ProbeError::NotAProxy(_))));
    }

    #[tokio::test]
    async fn test_websocket_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = if request.starts_with("GET /ws HTTP/1.1") && request.contains("Host: cdn.test") {
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
            } else {
                "HTTP/1.1 404 Not Found\r\n\r\n"
            };
            let _ = socket.write_all(response.as_bytes()).await;
        });

        let c = reachable(&format!(
            "vless://id@127.0.0.1:{}?type=ws&path=%2Fws&host=cdn.test",
            port
        ));
        assert_eq!(ProbeKind::for_candidate(&c), ProbeKind::WebSocket);
        assert!(prober().probe(&c).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_udp_port_is_refused() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let c = reachable(&format!("hysteria2://pw@127.0.0.1:{}", port));
        assert!(matches!(
            prober().probe(&c).await,
            Err(ProbeError::ConnectionRefused)
        ));
    }

    #[tokio::test]
    async fn test_silent_udp_port_passes() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();

        let c = reachable(&format!("tuic://id:pw@127.0.0.1:{}", port));
        assert!(prober().probe(&c).await.is_ok());
        drop(socket);
    }

    #[tokio::test]
    async fn test_unreached_candidates_are_skipped() {
        let mut c = ProxyParser::parse_uri("vless://id@127.0.0.1:1").unwrap();
        c.record_failure(FailureKind::ProbeConnectionRefused);
        let mut candidates = vec![c];
        prober().probe_all(&mut candidates, None).await;
        assert_eq!(candidates[0].tier(), Tier::Unreached);
        assert_eq!(
            candidates[0].test_result.failure,
            Some(FailureKind::ProbeConnectionRefused)
        );
        assert_eq!(candidates[0].scheme, Scheme::Vless);
    }
}
