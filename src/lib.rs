//! Proxy Sieve - discovery, validation and ranking of public proxy endpoints
//!
//! Raw URIs and subscription blobs go through three escalating probe stages
//! (TCP/ICMP reachability, protocol handshake, end-to-end request through a
//! proxy core), are merged with per-endpoint history in a SQLite store and
//! written out as ranked per-scheme and per-country lists.

pub mod database;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod probe;
pub mod proxy;
pub mod stability;

pub use error::{FailureKind, PipelineError};
pub use pipeline::{Pipeline, RunSummary};
pub use proxy::*;

use output::OutputConfig;
use probe::{CoreConfig, ProtocolConfig, ReachabilityConfig};
use proxy::models::{FingerprintMode, Tier};
use stability::StabilityConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Default stability database path
pub const DEFAULT_DATABASE_PATH: &str = "proxy_sieve.db";

/// Default timeout of the connectivity pre-flight and outage checks
pub const DEFAULT_CONNECTIVITY_TIMEOUT_SECS: u64 = 3;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub reachability: ReachabilityConfig,
    pub protocol: ProtocolConfig,
    pub core: CoreConfig,
    pub stability: StabilityConfig,
    pub output: OutputConfig,
    /// Run Stage 2
    pub protocol_probe: bool,
    /// Run Stage 3 when a core binary is found
    pub core_validation: bool,
    /// Global deadline for all probe stages
    pub run_deadline: Option<Duration>,
    pub database_path: PathBuf,
    /// Pre-flight and outage connectivity checks
    pub connectivity_check: bool,
    pub connectivity_timeout: Duration,
    /// MaxMind country database; takes precedence over `ip_api_lookup`
    pub geoip_database: Option<PathBuf>,
    pub ip_api_lookup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reachability: ReachabilityConfig::default(),
            protocol: ProtocolConfig::default(),
            core: CoreConfig::default(),
            stability: StabilityConfig::default(),
            output: OutputConfig::default(),
            protocol_probe: true,
            core_validation: true,
            run_deadline: None,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            connectivity_check: true,
            connectivity_timeout: Duration::from_secs(DEFAULT_CONNECTIVITY_TIMEOUT_SECS),
            geoip_database: None,
            ip_api_lookup: false,
        }
    }
}

impl Config {
    /// Defaults overridden by `SIEVE_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `SIEVE_*` key.
    ///
    /// Numeric values are clamped into sane ranges; unparsable values are
    /// ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };
        let mut config = Self::default();

        if let Some(path) = env.string("SIEVE_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(secs) = env.clamped("SIEVE_DEADLINE_SECS", 0u64, 86_400) {
            config.run_deadline = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(enabled) = env.flag("SIEVE_CONNECTIVITY_CHECK") {
            config.connectivity_check = enabled;
        }
        if let Some(path) = env.string("SIEVE_GEOIP_DB") {
            config.geoip_database = Some(PathBuf::from(path));
        }
        if let Some(enabled) = env.flag("SIEVE_IP_API") {
            config.ip_api_lookup = enabled;
        }

        // Stage 1
        if let Some(ms) = env.clamped("SIEVE_CONNECT_TIMEOUT_MS", 100u64, 30_000) {
            config.reachability.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env.clamped("SIEVE_PING_TIMEOUT_MS", 100u64, 10_000) {
            config.reachability.ping_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env.clamped("SIEVE_CONCURRENCY", 1usize, 1024) {
            config.reachability.concurrency = n;
        }
        if let Some(enabled) = env.flag("SIEVE_ICMP") {
            config.reachability.icmp_enabled = enabled;
        }

        // Stage 2
        if let Some(enabled) = env.flag("SIEVE_PROTOCOL_PROBE") {
            config.protocol_probe = enabled;
        }
        if let Some(ms) = env.clamped("SIEVE_PROTOCOL_TIMEOUT_MS", 100u64, 30_000) {
            config.protocol.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env.clamped("SIEVE_PROTOCOL_CONCURRENCY", 1usize, 1024) {
            config.protocol.concurrency = n;
        }

        // Stage 3
        if let Some(enabled) = env.flag("SIEVE_CORE_VALIDATION") {
            config.core_validation = enabled;
        }
        if let Some(path) = env.string("SIEVE_CORE_PATH") {
            config.core.core_path = Some(PathBuf::from(path));
        }
        if let Some(n) = env.clamped("SIEVE_CORE_CONCURRENCY", 1usize, 64) {
            config.core.concurrency = n;
        }
        if let Some(n) = env.clamped("SIEVE_CORE_MAX", 1usize, 100_000) {
            config.core.max_candidates = n;
        }
        if let Some(ms) = env.clamped("SIEVE_CORE_TIMEOUT_MS", 500u64, 60_000) {
            config.core.request_timeout = Duration::from_millis(ms);
        }
        if let Some(urls) = env.string("SIEVE_TEST_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                config.core.test_urls = urls;
            }
        }

        // stability
        if let Some(tier) = env.parsed::<Tier>("SIEVE_SUCCESS_TIER") {
            config.stability.success_tier = tier;
        }
        if let Some(n) = env.clamped("SIEVE_MAX_FAILURE_STREAK", 0u32, 1000) {
            config.stability.max_failure_streak = n;
        }
        if let Some(n) = env.clamped("SIEVE_MIN_SUCCESS_STREAK", 0u32, 1000) {
            config.stability.min_success_streak = n;
        }
        if let Some(n) = env.clamped("SIEVE_STABLE_STREAK", 1u32, 1000) {
            config.stability.stable_streak = n;
        }
        if let Some(n) = env.clamped("SIEVE_STABLE_LIMIT", 1usize, 100_000) {
            config.stability.stable_limit = n;
        }
        if let Some(hours) = env.clamped("SIEVE_RECENT_HOURS", 1i64, 720) {
            config.stability.recent_window = chrono::Duration::hours(hours);
        }
        if let Some(mode) = env.parsed::<FingerprintMode>("SIEVE_FINGERPRINT") {
            config.stability.fingerprint_mode = mode;
        }

        // output
        if let Some(dir) = env.string("SIEVE_OUTPUT_DIR") {
            config.output.output_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = env.string("SIEVE_REMARK_PREFIX") {
            config.output.remark_prefix = prefix;
        }
        if let Some(enabled) = env.flag("SIEVE_XRAY_CONFIG") {
            config.output.write_xray_config = enabled;
        }
        if let Some(n) = env.clamped("SIEVE_XRAY_TOP_N", 1usize, 10_000) {
            config.output.xray_top_n = n;
        }
        if let Some(enabled) = env.flag("SIEVE_CORE_CONFIGS") {
            config.output.export_core_configs = enabled;
        }

        config
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.string(key).and_then(|v| v.parse().ok())
    }

    fn clamped<T: FromStr + Ord>(&self, key: &str, min: T, max: T) -> Option<T> {
        self.parsed::<T>(key).map(|v| v.clamp(min, max))
    }

    fn flag(&self, key: &str) -> Option<bool> {
        match self.string(key)?.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = config_from(&[]);
        assert!(config.protocol_probe);
        assert!(config.core_validation);
        assert!(config.connectivity_check);
        assert_eq!(config.run_deadline, None);
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(config.stability.success_tier, Tier::ReachableOnly);
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("SIEVE_CONCURRENCY", "32"),
            ("SIEVE_PROTOCOL_PROBE", "off"),
            ("SIEVE_SUCCESS_TIER", "ProtocolOk"),
            ("SIEVE_FINGERPRINT", "uri"),
            ("SIEVE_DEADLINE_SECS", "90"),
            ("SIEVE_TEST_URLS", "http://a/204, http://b/204,"),
            ("SIEVE_REMARK_PREFIX", "[Mine]"),
        ]);
        assert_eq!(config.reachability.concurrency, 32);
        assert!(!config.protocol_probe);
        assert_eq!(config.stability.success_tier, Tier::ProtocolOk);
        assert_eq!(config.stability.fingerprint_mode, FingerprintMode::Uri);
        assert_eq!(config.run_deadline, Some(Duration::from_secs(90)));
        assert_eq!(config.core.test_urls, vec!["http://a/204", "http://b/204"]);
        assert_eq!(config.output.remark_prefix, "[Mine]");
    }

    #[test]
    fn test_env_values_are_clamped() {
        let config = config_from(&[
            ("SIEVE_CONCURRENCY", "0"),
            ("SIEVE_CORE_CONCURRENCY", "500"),
            ("SIEVE_CONNECT_TIMEOUT_MS", "5"),
        ]);
        assert_eq!(config.reachability.concurrency, 1);
        assert_eq!(config.core.concurrency, 64);
        assert_eq!(config.reachability.connect_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let config = config_from(&[
            ("SIEVE_CONCURRENCY", "many"),
            ("SIEVE_ICMP", "maybe"),
            ("SIEVE_DEADLINE_SECS", "0"),
            ("SIEVE_SUCCESS_TIER", "Excellent"),
        ]);
        let defaults = Config::default();
        assert_eq!(config.reachability.concurrency, defaults.reachability.concurrency);
        assert_eq!(config.reachability.icmp_enabled, defaults.reachability.icmp_enabled);
        assert_eq!(config.run_deadline, None);
        assert_eq!(config.stability.success_tier, Tier::ReachableOnly);
    }
}
