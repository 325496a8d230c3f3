//! Country resolution for validated endpoints
//!
//! Resolvers map an IP address to an ISO 3166-1 alpha-2 code. Domain hosts
//! are resolved through DNS first; [`CountryLookup`] caches one answer per
//! host for the duration of a run. Every failure ends up as `XX`.

use crate::probe::run_bounded;
use crate::proxy::models::UNKNOWN_COUNTRY;
use crate::Result;
use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default timeout for HTTP country lookups
pub const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 5;

/// Pluggable IP -> country resolver
#[async_trait]
pub trait CountryResolver: Send + Sync {
    async fn resolve(&self, ip: IpAddr) -> Option<String>;
}

/// GeoLocator for looking up IP addresses in MMDB databases
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the country code for an IpAddr
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<Option<String>> {
        let lookup_result = self.reader.lookup(ip)?;
        let country: Option<geoip2::Country> = lookup_result.decode()?;
        Ok(country.and_then(|c| c.country.iso_code.map(String::from)))
    }
}

impl Clone for GeoLocator {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

#[async_trait]
impl CountryResolver for GeoLocator {
    async fn resolve(&self, ip: IpAddr) -> Option<String> {
        match self.lookup_ip(ip) {
            Ok(code) => code,
            Err(e) => {
                debug!("mmdb lookup failed for {}: {}", ip, e);
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    country_code: Option<String>,
}

/// Resolver backed by the ip-api.com JSON endpoint
#[derive(Clone)]
pub struct IpApiResolver {
    client: reqwest::Client,
    base_url: String,
}

impl IpApiResolver {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: "http://ip-api.com/json".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch(&self, ip: IpAddr) -> Result<Option<String>> {
        let url = format!("{}/{}?fields=status,countryCode", self.base_url, ip);
        let response: IpApiResponse = self.client.get(&url).send().await?.json().await?;
        Ok(if response.status == "success" {
            response.country_code
        } else {
            None
        })
    }
}

#[async_trait]
impl CountryResolver for IpApiResolver {
    async fn resolve(&self, ip: IpAddr) -> Option<String> {
        match self.fetch(ip).await {
            Ok(code) => code,
            Err(e) => {
                debug!("ip-api lookup failed for {}: {}", ip, e);
                None
            }
        }
    }
}

/// Resolver that knows nothing; every host maps to `XX`
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResolver;

#[async_trait]
impl CountryResolver for NullResolver {
    async fn resolve(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Default budget for one host: DNS plus resolver
pub const DEFAULT_HOST_TIMEOUT_MS: u64 = 3000;

/// Default number of hosts resolved at once
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 32;

/// Per-run host -> country cache in front of a resolver
pub struct CountryLookup {
    resolver: Arc<dyn CountryResolver>,
    cache: HashMap<String, String>,
    host_timeout: Duration,
    concurrency: usize,
}

impl CountryLookup {
    pub fn new(resolver: Arc<dyn CountryResolver>) -> Self {
        Self {
            resolver,
            cache: HashMap::new(),
            host_timeout: Duration::from_millis(DEFAULT_HOST_TIMEOUT_MS),
            concurrency: DEFAULT_LOOKUP_CONCURRENCY,
        }
    }

    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Country code for a host, `XX` when DNS or the resolver fails
    pub async fn country_for_host(&mut self, host: &str) -> String {
        let key = host.to_ascii_lowercase();
        if let Some(code) = self.cache.get(&key) {
            return code.clone();
        }

        let code = lookup_country(self.resolver.as_ref(), &key, self.host_timeout).await;
        self.cache.insert(key, code.clone());
        code
    }

    /// Resolve every distinct uncached host with bounded concurrency.
    ///
    /// Hosts still pending when `deadline` passes are cached as `XX`.
    pub async fn resolve_hosts<'a, I>(&mut self, hosts: I, deadline: Option<Instant>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        let pending: Vec<String> = hosts
            .into_iter()
            .map(str::to_ascii_lowercase)
            .filter(|h| !self.cache.contains_key(h) && seen.insert(h.clone()))
            .collect();
        if pending.is_empty() {
            return;
        }

        let resolver = self.resolver.as_ref();
        let timeout = self.host_timeout;
        let codes = run_bounded(
            pending.iter().map(String::as_str).collect::<Vec<_>>(),
            self.concurrency,
            deadline,
            |host| lookup_country(resolver, host, timeout),
        )
        .await;

        for (host, code) in pending.into_iter().zip(codes) {
            let code = code.unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
            self.cache.insert(host, code);
        }
    }

    /// Cached code for a host, `XX` when it was never resolved
    pub fn cached_country(&self, host: &str) -> String {
        self.cache
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// DNS then resolver, bounded by `timeout`
async fn lookup_country(resolver: &dyn CountryResolver, host: &str, timeout: Duration) -> String {
    let lookup = async {
        match resolve_ip(host).await {
            Some(ip) => resolver.resolve(ip).await,
            None => None,
        }
    };
    match tokio::time::timeout(timeout, lookup).await {
        Ok(code) => normalize_code(code),
        Err(_) => {
            debug!("country lookup timed out for {}", host);
            UNKNOWN_COUNTRY.to_string()
        }
    }
}

/// IP literal as-is, otherwise the first DNS answer preferring IPv4
async fn resolve_ip(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => {
            let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or(addrs.first())
                .copied()
        }
        Err(e) => {
            debug!("dns lookup failed for {}: {}", host, e);
            None
        }
    }
}

fn normalize_code(code: Option<String>) -> String {
    code.map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| c.len() == 2 && c.chars().all(|ch| ch.is_ascii_uppercase()))
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
}
