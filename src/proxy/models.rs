//! Proxy candidate data models

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Country code used when resolution fails
pub const UNKNOWN_COUNTRY: &str = "XX";

/// Supported proxy schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Vmess,
    Vless,
    Trojan,
    Ss,
    Ssr,
    Hysteria,
    Hysteria2,
    Tuic,
    Juicity,
}

/// Transport-layer protocol a scheme listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Scheme {
    pub const ALL: [Scheme; 9] = [
        Scheme::Vmess,
        Scheme::Vless,
        Scheme::Trojan,
        Scheme::Ss,
        Scheme::Ssr,
        Scheme::Hysteria,
        Scheme::Hysteria2,
        Scheme::Tuic,
        Scheme::Juicity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Vmess => "vmess",
            Scheme::Vless => "vless",
            Scheme::Trojan => "trojan",
            Scheme::Ss => "ss",
            Scheme::Ssr => "ssr",
            Scheme::Hysteria => "hysteria",
            Scheme::Hysteria2 => "hysteria2",
            Scheme::Tuic => "tuic",
            Scheme::Juicity => "juicity",
        }
    }

    /// QUIC based schemes have no TCP service on their port
    pub fn network(&self) -> Network {
        match self {
            Scheme::Hysteria | Scheme::Hysteria2 | Scheme::Tuic | Scheme::Juicity => Network::Udp,
            _ => Network::Tcp,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vmess" => Ok(Scheme::Vmess),
            "vless" => Ok(Scheme::Vless),
            "trojan" => Ok(Scheme::Trojan),
            "ss" => Ok(Scheme::Ss),
            "ssr" => Ok(Scheme::Ssr),
            "hysteria" => Ok(Scheme::Hysteria),
            "hysteria2" | "hy2" => Ok(Scheme::Hysteria2),
            "tuic" => Ok(Scheme::Tuic),
            "juicity" => Ok(Scheme::Juicity),
            other => Err(format!("unknown scheme: {}", other)),
        }
    }
}

/// Highest validation stage a candidate passed in the current run
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum Tier {
    #[default]
    Unreached,
    ReachableOnly,
    ProtocolOk,
    FullyValidated,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Unreached => "Unreached",
            Tier::ReachableOnly => "ReachableOnly",
            Tier::ProtocolOk => "ProtocolOk",
            Tier::FullyValidated => "FullyValidated",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unreached" => Ok(Tier::Unreached),
            "ReachableOnly" => Ok(Tier::ReachableOnly),
            "ProtocolOk" => Ok(Tier::ProtocolOk),
            "FullyValidated" => Ok(Tier::FullyValidated),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// Outcome of the most recent run for one candidate
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub tier: Tier,
    pub latency_ms: Option<u64>,
    pub tested_at: Option<DateTime<Utc>>,
    /// Failure that stopped further promotion, if any
    pub failure: Option<FailureKind>,
    /// Advisory ICMP result; never decides the tier
    pub icmp_ok: Option<bool>,
}

/// How candidates are identified across runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// scheme + host + port; survives credential rotation and remark edits
    #[default]
    Endpoint,
    /// the raw URI itself
    Uri,
}

impl FromStr for FingerprintMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "endpoint" => Ok(FingerprintMode::Endpoint),
            "uri" => Ok(FingerprintMode::Uri),
            other => Err(format!("unknown fingerprint mode: {}", other)),
        }
    }
}

/// One discovered proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCandidate {
    /// Original string form; identity of the candidate
    pub raw_uri: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Transport name (tcp, ws, grpc, quic, ...)
    pub transport: String,
    pub tls_enabled: bool,
    pub sni: Option<String>,
    /// uuid, password or auth string depending on the scheme
    pub auth_secret: String,
    pub remark: Option<String>,
    /// Remaining scheme parameters, kept for re-serialization
    pub params: BTreeMap<String, String>,
    pub test_result: TestResult,
    pub country_code: Option<String>,
}

impl ProxyCandidate {
    pub fn new(raw_uri: &str, scheme: Scheme, host: String, port: u16) -> Self {
        Self {
            raw_uri: raw_uri.to_string(),
            scheme,
            host,
            port,
            transport: match scheme.network() {
                Network::Tcp => "tcp".to_string(),
                Network::Udp => "quic".to_string(),
            },
            tls_enabled: false,
            sni: None,
            auth_secret: String::new(),
            remark: None,
            params: BTreeMap::new(),
            test_result: TestResult::default(),
            country_code: None,
        }
    }

    /// Get the address in HOST:PORT form, bracketing IPv6 hosts
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn tier(&self) -> Tier {
        self.test_result.tier
    }

    /// Stable identity key for the stability store
    pub fn fingerprint(&self, mode: FingerprintMode) -> String {
        let mut hasher = Sha1::new();
        match mode {
            FingerprintMode::Endpoint => {
                hasher.update(self.scheme.as_str().as_bytes());
                hasher.update(b"|");
                hasher.update(self.host.to_ascii_lowercase().as_bytes());
                hasher.update(b"|");
                hasher.update(self.port.to_string().as_bytes());
            }
            FingerprintMode::Uri => hasher.update(self.raw_uri.as_bytes()),
        }
        hex::encode(hasher.finalize())
    }

    /// Record that a stage passed. Tiers only ever move upwards.
    pub fn promote(&mut self, tier: Tier, latency_ms: Option<u64>) {
        if tier > self.test_result.tier {
            self.test_result.tier = tier;
            self.test_result.failure = None;
            if latency_ms.is_some() {
                self.test_result.latency_ms = latency_ms;
            }
        }
    }

    /// Record that a stage failed without touching the tier
    pub fn record_failure(&mut self, kind: FailureKind) {
        self.test_result.failure = Some(kind);
    }

    pub fn country(&self) -> &str {
        self.country_code.as_deref().unwrap_or(UNKNOWN_COUNTRY)
    }
}

impl fmt::Display for ProxyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address())
    }
}

/// Regional indicator flag for a country code, globe for unknown codes
pub fn country_flag(code: &str) -> String {
    let bytes = code.as_bytes();
    if bytes.len() != 2
        || !bytes.iter().all(u8::is_ascii_alphabetic)
        || code.eq_ignore_ascii_case(UNKNOWN_COUNTRY)
    {
        return "\u{1F310}".to_string();
    }
    code.to_ascii_uppercase()
        .chars()
        .filter_map(|c| char::from_u32(0x1F1E6 + (c as u32 - 'A' as u32)))
        .collect()
}
