//! Stage 3: end-to-end validation through a local proxy core
//!
//! For every candidate a throwaway Xray config is written with a SOCKS
//! inbound on a free loopback port, the core is started against it, and the
//! test URLs are fetched through `socks5h://127.0.0.1:<port>`. The process and
//! its config file live inside a [`CoreProcess`] guard and are released when
//! the guard drops, whichever way validation ends.

use crate::error::{CoreError, FailureKind};
use crate::probe::run_bounded;
use crate::proxy::models::{ProxyCandidate, Tier};
use crate::proxy::xray;
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default timeout for each request through the core in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default wait for the core's local port in milliseconds
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 3000;

/// Default number of concurrent core processes
const DEFAULT_CONCURRENCY: usize = 8;

/// Default cap on candidates sent to the core per run
const DEFAULT_MAX_CANDIDATES: usize = 5000;

/// URLs fetched through the core; any 2xx counts
pub const DEFAULT_TEST_URLS: [&str; 2] = [
    "https://www.google.com/generate_204",
    "https://cp.cloudflare.com/generate_204",
];

/// Core starts per candidate when the process exits before listening
const CORE_START_ATTEMPTS: u32 = 3;

/// Binary names looked up when no explicit path is configured
const CORE_NAMES: [&str; 2] = ["xray", "v2ray"];

/// Configuration for the core validator
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Explicit core binary; auto-detected when absent
    pub core_path: Option<PathBuf>,
    pub test_urls: Vec<String>,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
    pub concurrency: usize,
    pub max_candidates: usize,
    /// Directories searched after `PATH`
    pub search_dirs: Vec<PathBuf>,
    /// Where temporary configs are written
    pub work_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            core_path: None,
            test_urls: DEFAULT_TEST_URLS.iter().map(|u| u.to_string()).collect(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            concurrency: DEFAULT_CONCURRENCY,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            search_dirs: vec![
                PathBuf::from("."),
                PathBuf::from("bin"),
                PathBuf::from("tools"),
            ],
            work_dir: std::env::temp_dir(),
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_core_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.core_path = Some(path.into());
        self
    }

    pub fn with_test_urls(mut self, urls: Vec<String>) -> Self {
        self.test_urls = urls;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max;
        self
    }

    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }
}

/// Counters for one Stage 3 pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoreStats {
    pub attempted: usize,
    pub passed: usize,
    /// Eligible candidates whose scheme the core config cannot express
    pub unsupported: usize,
}

/// Temporary core config, removed when dropped
struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    fn write(work_dir: &Path, json: &str) -> Result<Self, CoreError> {
        let file = Self {
            path: work_dir.join(format!("proxy-sieve-{}.json", Uuid::new_v4())),
        };
        std::fs::write(&file.path, json)
            .map_err(|e| CoreError::Start(format!("writing {}: {}", file.path.display(), e)))?;
        Ok(file)
    }
}

impl Drop for ConfigFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Running core process plus its config file
struct CoreProcess {
    child: Child,
    _config: ConfigFile,
}

impl CoreProcess {
    /// Start the core; `reserved` holds the inbound port until just before spawn
    fn start(
        binary: &Path,
        config: ConfigFile,
        reserved: std::net::TcpListener,
    ) -> Result<Self, CoreError> {
        drop(reserved);
        let child = Command::new(binary)
            .arg("run")
            .arg("-c")
            .arg(&config.path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::Start(format!("spawning {}: {}", binary.display(), e)))?;
        Ok(Self {
            child,
            _config: config,
        })
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Wait until the SOCKS inbound accepts connections
    async fn wait_ready(&mut self, port: u16, timeout: Duration) -> Result<(), CoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(CoreError::Start(format!("core exited early with {}", status)));
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::Start(format!(
                    "local port {} never became ready",
                    port
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for CoreProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Stage 3 validator bound to one detected core binary
#[derive(Debug, Clone)]
pub struct CoreValidator {
    binary: PathBuf,
    config: CoreConfig,
}

impl CoreValidator {
    /// Locate the core binary; `None` means Stage 3 is skipped for the run
    pub fn detect(config: CoreConfig) -> Option<Self> {
        let binary = find_core(&config)?;
        info!("Using proxy core at {}", binary.display());
        Some(Self { binary, config })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Validate one candidate, returning round-trip latency in milliseconds
    pub async fn validate(&self, candidate: &ProxyCandidate) -> Result<u64, CoreError> {
        if !xray::supports(candidate.scheme) {
            return Err(CoreError::Unsupported(candidate.scheme));
        }

        let (_process, port) = self.start_core(candidate).await?;
        let proxy_url = format!("socks5h://127.0.0.1:{}", port);
        fetch_through_proxy(&proxy_url, &self.config.test_urls, self.config.request_timeout).await
    }

    /// Start a core for `candidate`, retrying with a fresh port when it exits early
    async fn start_core(&self, candidate: &ProxyCandidate) -> Result<(CoreProcess, u16), CoreError> {
        let mut attempt = 1;
        loop {
            let reserved =
                reserve_port().map_err(|e| CoreError::Start(format!("no free port: {}", e)))?;
            let port = reserved
                .local_addr()
                .map_err(|e| CoreError::Start(format!("no free port: {}", e)))?
                .port();
            let json = xray::validation_config(candidate, port)
                .ok_or(CoreError::Unsupported(candidate.scheme))?
                .to_json_pretty()
                .map_err(|e| CoreError::Start(e.to_string()))?;
            let config = ConfigFile::write(&self.config.work_dir, &json)?;

            let mut process = CoreProcess::start(&self.binary, config, reserved)?;
            match process.wait_ready(port, self.config.startup_timeout).await {
                Ok(()) => return Ok((process, port)),
                Err(e) if attempt < CORE_START_ATTEMPTS && process.has_exited() => {
                    debug!("{}: {} (attempt {})", candidate, e, attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate eligible candidates (tier >= `min_tier`) in input order, up to the configured cap
    pub async fn validate_all(
        &self,
        candidates: &mut [ProxyCandidate],
        min_tier: Tier,
        deadline: Option<Instant>,
    ) -> CoreStats {
        let mut stats = CoreStats::default();
        let mut eligible = Vec::new();
        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.tier() < min_tier {
                continue;
            }
            if !xray::supports(candidate.scheme) {
                stats.unsupported += 1;
                continue;
            }
            if eligible.len() < self.config.max_candidates {
                eligible.push(index);
            }
        }
        stats.attempted = eligible.len();

        let snapshot: &[ProxyCandidate] = candidates;
        let outcomes = run_bounded(
            eligible.iter().map(|&i| &snapshot[i]).collect::<Vec<_>>(),
            self.config.concurrency,
            deadline,
            |candidate| self.validate(candidate),
        )
        .await;

        for (index, outcome) in eligible.iter().zip(outcomes) {
            let candidate = &mut candidates[*index];
            match outcome {
                Some(Ok(latency)) => {
                    candidate.promote(Tier::FullyValidated, Some(latency));
                    stats.passed += 1;
                }
                Some(Err(CoreError::Unsupported(_))) => {}
                Some(Err(e)) => {
                    debug!("{} failed core validation: {}", candidate, e);
                    candidate.record_failure(e.kind());
                }
                None => candidate.record_failure(FailureKind::ProbeTimeout),
            }
        }

        info!(
            "Stage 3: {}/{} candidates fully validated ({} unsupported)",
            stats.passed, stats.attempted, stats.unsupported
        );
        stats
    }
}

/// Fetch `test_urls` in order through `proxy_url`; the first 2xx wins and
/// yields its round-trip latency in milliseconds
pub async fn fetch_through_proxy(
    proxy_url: &str,
    test_urls: &[String],
    timeout: Duration,
) -> Result<u64, CoreError> {
    let proxy = ReqwestProxy::all(proxy_url).map_err(|e| CoreError::Start(e.to_string()))?;
    let client = Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
        .map_err(|e| CoreError::Start(e.to_string()))?;

    let mut last_error = CoreError::Response("no test URLs configured".to_string());
    for url in test_urls {
        let start = Instant::now();
        match tokio::time::timeout(timeout, client.get(url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => {
                return Ok(start.elapsed().as_millis() as u64);
            }
            Ok(Ok(response)) => {
                last_error = CoreError::Response(format!("HTTP status: {}", response.status()));
            }
            Ok(Err(e)) => last_error = CoreError::Response(e.to_string()),
            Err(_) => last_error = CoreError::Timeout,
        }
    }

    Err(last_error)
}

/// Bind a loopback port; the listener is held until the core is spawned
fn reserve_port() -> std::io::Result<std::net::TcpListener> {
    std::net::TcpListener::bind("127.0.0.1:0")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Explicit path, then `PATH`, then the configured search directories
fn find_core(config: &CoreConfig) -> Option<PathBuf> {
    if let Some(path) = &config.core_path {
        if is_executable(path) {
            return Some(path.clone());
        }
        warn!("Configured core {} is not executable, searching", path.display());
    }

    let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();

    path_dirs
        .iter()
        .chain(config.search_dirs.iter())
        .flat_map(|dir| CORE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::proxy::parser::ProxyParser;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn validator(script: &Path, work_dir: &Path) -> CoreValidator {
        CoreValidator::detect(
            CoreConfig::new()
                .with_core_path(script)
                .with_work_dir(work_dir)
                .with_startup_timeout(Duration::from_millis(300))
                .with_request_timeout(Duration::from_millis(300)),
        )
        .unwrap()
    }

    fn vless() -> ProxyCandidate {
        let mut c = ProxyParser::parse_uri("vless://id@127.0.0.1:9?type=tcp").unwrap();
        c.promote(Tier::ProtocolOk, Some(5));
        c
    }

    #[test]
    fn test_core_config_default() {
        let config = CoreConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.test_urls.len(), 2);
        assert_eq!(config.max_candidates, DEFAULT_MAX_CANDIDATES);
    }

    #[test]
    fn test_detect_prefers_explicit_path() {
        let bin = tempfile::tempdir().unwrap();
        let script = write_script(bin.path(), "my-core", "exit 0");
        let validator = CoreValidator::detect(CoreConfig::new().with_core_path(&script)).unwrap();
        assert_eq!(validator.binary(), script.as_path());
    }

    #[test]
    fn test_detect_searches_directories() {
        let bin = tempfile::tempdir().unwrap();
        let script = write_script(bin.path(), "xray", "exit 0");
        let config = CoreConfig::new()
            .with_core_path(bin.path().join("missing"))
            .with_search_dirs(vec![bin.path().to_path_buf()]);
        let found = find_core(&config).unwrap();
        // an xray on PATH would win, which is also a valid outcome
        assert!(found == script || found.ends_with("xray") || found.ends_with("v2ray"));
    }

    #[tokio::test]
    async fn test_core_that_never_listens_is_cleaned_up() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let script = write_script(bin.path(), "core", "sleep 5");

        let result = validator(&script, work.path()).validate(&vless()).await;
        assert!(matches!(result, Err(CoreError::Start(_))));
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_core_that_exits_early_is_a_start_failure() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let starts = bin.path().join("starts");
        let script = write_script(
            bin.path(),
            "core",
            &format!("echo started >> {}\nexit 3", starts.display()),
        );

        let mut candidates = vec![vless()];
        let stats = validator(&script, work.path())
            .validate_all(&mut candidates, Tier::ProtocolOk, None)
            .await;

        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.passed, 0);
        assert_eq!(candidates[0].tier(), Tier::ProtocolOk);
        assert_eq!(candidates[0].test_result.failure, Some(FailureKind::CoreStartFailure));
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);

        // each early exit is retried on a fresh port
        let runs = std::fs::read_to_string(&starts).unwrap();
        assert_eq!(runs.lines().count(), CORE_START_ATTEMPTS as usize);
    }

    #[test]
    fn test_reserved_port_is_held_until_released() {
        let reserved = reserve_port().unwrap();
        let port = reserved.local_addr().unwrap().port();
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_err());

        drop(reserved);
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_config_file_is_removed_on_drop() {
        let work = tempfile::tempdir().unwrap();
        let file = ConfigFile::write(work.path(), "{}").unwrap();
        assert!(file.path.exists());
        drop(file);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);

        let missing = work.path().join("missing");
        let result = ConfigFile::write(&missing, "{}");
        assert!(matches!(result, Err(CoreError::Start(_))));
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn test_cancelled_validation_leaves_no_config() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let script = write_script(bin.path(), "core", "sleep 5");
        let validator = CoreValidator::detect(
            CoreConfig::new()
                .with_core_path(&script)
                .with_work_dir(work.path())
                .with_startup_timeout(Duration::from_secs(5)),
        )
        .unwrap();

        let candidate = vless();
        let result =
            tokio::time::timeout(Duration::from_millis(200), validator.validate(&candidate)).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    /// Minimal SOCKS5 server that answers every HTTP request with `status`,
    /// or never answers when `status` is `None`
    async fn socks_stub(status: Option<u16>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut greeting = [0u8; 2];
                    socket.read_exact(&mut greeting).await?;
                    let mut methods = vec![0u8; greeting[1] as usize];
                    socket.read_exact(&mut methods).await?;
                    socket.write_all(&[5, 0]).await?;

                    let mut request = [0u8; 4];
                    socket.read_exact(&mut request).await?;
                    let address_len = match request[3] {
                        1 => 4,
                        4 => 16,
                        _ => socket.read_u8().await? as usize,
                    };
                    let mut address = vec![0u8; address_len + 2];
                    socket.read_exact(&mut address).await?;
                    socket.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 80]).await?;

                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut buf).await?;
                        if n == 0 {
                            return Ok(());
                        }
                        head.extend_from_slice(&buf[..n]);
                    }

                    match status {
                        Some(code) => {
                            let response = format!(
                                "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                                code
                            );
                            socket.write_all(response.as_bytes()).await?;
                        }
                        None => tokio::time::sleep(Duration::from_secs(10)).await,
                    }
                    Ok::<_, std::io::Error>(())
                });
            }
        });
        format!("socks5h://127.0.0.1:{}", port)
    }

    fn test_urls() -> Vec<String> {
        vec!["http://connectivity.sieve.test/generate_204".to_string()]
    }

    #[tokio::test]
    async fn test_fetch_through_proxy_accepts_204() {
        let proxy = socks_stub(Some(204)).await;
        let result = fetch_through_proxy(&proxy, &test_urls(), Duration::from_secs(5)).await;
        assert!(result.is_ok(), "{:?}", result);
    }

    #[tokio::test]
    async fn test_fetch_through_proxy_rejects_server_error() {
        let proxy = socks_stub(Some(500)).await;
        let result = fetch_through_proxy(&proxy, &test_urls(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(CoreError::Response(_))), "{:?}", result);
        assert_eq!(result.unwrap_err().kind(), FailureKind::CoreResponseError);
    }

    #[tokio::test]
    async fn test_fetch_through_proxy_times_out() {
        let proxy = socks_stub(None).await;
        let result = fetch_through_proxy(&proxy, &test_urls(), Duration::from_millis(300)).await;
        assert_eq!(result.unwrap_err().kind(), FailureKind::CoreResponseError);
    }

    #[tokio::test]
    async fn test_fetch_reports_last_failure() {
        let failing = socks_stub(Some(500)).await;
        let urls = vec![
            "http://first.sieve.test/".to_string(),
            "http://second.sieve.test/".to_string(),
        ];
        let result = fetch_through_proxy(&failing, &urls, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(CoreError::Response(ref m)) if m.contains("500")));

        let result = fetch_through_proxy(&failing, &[], Duration::from_secs(5)).await;
        assert!(matches!(result, Err(CoreError::Response(_))));
    }

    #[tokio::test]
    async fn test_unsupported_and_ineligible_are_skipped() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let script = write_script(bin.path(), "core", "exit 1");

        let mut tuic = ProxyParser::parse_uri("tuic://id:pw@127.0.0.1:443").unwrap();
        tuic.promote(Tier::ProtocolOk, Some(1));
        let mut low = ProxyParser::parse_uri("vless://id@127.0.0.1:10").unwrap();
        low.promote(Tier::ReachableOnly, Some(1));
        let mut candidates = vec![tuic, low];

        let stats = validator(&script, work.path())
            .validate_all(&mut candidates, Tier::ProtocolOk, None)
            .await;

        assert_eq!(stats, CoreStats { attempted: 0, passed: 0, unsupported: 1 });
        assert_eq!(candidates[0].test_result.failure, None);
        assert_eq!(candidates[1].test_result.failure, None);
    }

    #[tokio::test]
    async fn test_cap_limits_attempts_in_input_order() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let script = write_script(bin.path(), "core", "exit 1");
        let validator = CoreValidator::detect(
            CoreConfig::new()
                .with_core_path(&script)
                .with_work_dir(work.path())
                .with_max_candidates(1),
        )
        .unwrap();

        let mut candidates = vec![vless(), vless()];
        let stats = validator
            .validate_all(&mut candidates, Tier::ReachableOnly, None)
            .await;
        assert_eq!(stats.attempted, 1);
        assert!(candidates[0].test_result.failure.is_some());
        assert!(candidates[1].test_result.failure.is_none());
    }
}
