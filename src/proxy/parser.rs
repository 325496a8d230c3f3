//! Proxy parser module for turning raw links and subscriptions into candidates
//!
//! Supports:
//! - vmess://base64(json)
//! - vless://uuid@host:port?params#remark
//! - trojan://password@host:port?params#remark
//! - ss:// in SIP002, legacy base64 and plain forms
//! - ssr://base64(host:port:protocol:method:obfs:base64pass/?params)
//! - hysteria://, hysteria2:// (hy2://), tuic://, juicity:// generic URL forms
//!
//! Input may be a single URI, a plain list, text with embedded links, or a
//! base64 subscription blob (up to two layers deep).

use crate::error::ParseError;
use crate::proxy::models::{ProxyCandidate, Scheme};
use crate::Result;
use base64::alphabet;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;

/// Any `scheme://...` token in free text
static URI_TOKEN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b([a-z][a-z0-9+.\-]*)://[^\s<>"']+"#).expect("Invalid URI token regex")
});

/// Characters that commonly trail a link in prose or markup
const TRAILING_PUNCTUATION: &[char] = &[')', '>', ',', ';', '.', '"', '\''];

/// Accepts missing padding and stray trailing bits
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

type ParseFn = fn(&str, Scheme, &str) -> std::result::Result<ProxyCandidate, ParseError>;
type RenderFn = fn(&ProxyCandidate, Option<&str>) -> String;

/// One row of the scheme table
struct SchemeEntry {
    prefix: &'static str,
    scheme: Scheme,
    parse: ParseFn,
    render: RenderFn,
}

/// Scheme-specific parse/render functions, looked up by URI prefix.
/// Aliases come after the canonical entry so rendering picks the canonical prefix.
static SCHEME_TABLE: &[SchemeEntry] = &[
    SchemeEntry { prefix: "vmess", scheme: Scheme::Vmess, parse: parse_vmess, render: render_vmess },
    SchemeEntry { prefix: "vless", scheme: Scheme::Vless, parse: parse_generic, render: render_generic },
    SchemeEntry { prefix: "trojan", scheme: Scheme::Trojan, parse: parse_generic, render: render_generic },
    SchemeEntry { prefix: "ss", scheme: Scheme::Ss, parse: parse_ss, render: render_ss },
    SchemeEntry { prefix: "ssr", scheme: Scheme::Ssr, parse: parse_ssr, render: render_ssr },
    SchemeEntry { prefix: "hysteria", scheme: Scheme::Hysteria, parse: parse_generic, render: render_generic },
    SchemeEntry { prefix: "hysteria2", scheme: Scheme::Hysteria2, parse: parse_generic, render: render_generic },
    SchemeEntry { prefix: "hy2", scheme: Scheme::Hysteria2, parse: parse_generic, render: render_generic },
    SchemeEntry { prefix: "tuic", scheme: Scheme::Tuic, parse: parse_generic, render: render_generic },
    SchemeEntry { prefix: "juicity", scheme: Scheme::Juicity, parse: parse_generic, render: render_generic },
];

fn lookup_prefix(prefix: &str) -> Option<&'static SchemeEntry> {
    SCHEME_TABLE
        .iter()
        .find(|entry| entry.prefix.eq_ignore_ascii_case(prefix))
}

fn lookup_render(scheme: Scheme) -> RenderFn {
    SCHEME_TABLE
        .iter()
        .find(|entry| entry.scheme == scheme)
        .map(|entry| entry.render)
        .unwrap_or(render_generic)
}

/// Result of parsing a batch of raw inputs
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub candidates: Vec<ProxyCandidate>,
    /// Entries with a supported scheme that failed to decode
    pub malformed: usize,
    /// Entries with a scheme outside the table
    pub unsupported: usize,
    /// Repeated raw URIs collapsed into their first occurrence
    pub duplicates: usize,
}

/// Proxy parser for parsing candidates from strings and files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy URI
    pub fn parse_uri(raw: &str) -> std::result::Result<ProxyCandidate, ParseError> {
        let raw = raw.trim();
        let (prefix, body) = raw
            .split_once("://")
            .ok_or_else(|| ParseError::malformed(raw, "missing scheme separator"))?;
        let entry = lookup_prefix(prefix)
            .ok_or_else(|| ParseError::UnsupportedScheme(prefix.to_ascii_lowercase()))?;
        (entry.parse)(raw, entry.scheme, body)
    }

    /// Re-serialize a candidate into its scheme URI form, optionally replacing the remark
    pub fn render(candidate: &ProxyCandidate, remark: Option<&str>) -> String {
        lookup_render(candidate.scheme)(candidate, remark)
    }

    /// Decode a subscription blob when it does not already contain proxy links.
    ///
    /// With `hinted_base64` the blob is decoded even if links were detected.
    /// Up to two base64 layers are peeled; the original text is returned when
    /// no layer yields links.
    pub fn decode_subscription(content: &str, hinted_base64: bool) -> String {
        if !hinted_base64 && contains_known_uri(content) {
            return content.to_string();
        }

        let mut layer = content.to_string();
        for _ in 0..2 {
            match decode_base64_string(&layer) {
                Some(decoded) if contains_known_uri(&decoded) => return decoded,
                Some(decoded) => layer = decoded,
                None => break,
            }
        }
        content.to_string()
    }

    /// Extract every `scheme://` token from text, de-duplicated in order of appearance
    pub fn extract_uris(text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        uri_tokens(text)
            .filter(|uri| seen.insert(uri.clone()))
            .collect()
    }

    /// Parse one raw input: a URI, a list, or a subscription blob
    pub fn parse_string(content: &str) -> ParseOutcome {
        let decoded = Self::decode_subscription(content, false);
        let mut outcome = ParseOutcome::default();
        let mut seen = HashSet::new();

        for uri in uri_tokens(&decoded) {
            if !seen.insert(uri.clone()) {
                outcome.duplicates += 1;
                continue;
            }
            match Self::parse_uri(&uri) {
                Ok(candidate) => outcome.candidates.push(candidate),
                Err(e @ ParseError::Malformed { .. }) => {
                    debug!("skipping {}", e);
                    outcome.malformed += 1;
                }
                Err(e @ ParseError::UnsupportedScheme(_)) => {
                    debug!("skipping {}", e);
                    outcome.unsupported += 1;
                }
            }
        }

        outcome
    }

    /// Parse an ordered set of raw inputs; a raw URI seen twice keeps its first position
    pub fn parse_inputs<S: AsRef<str>>(inputs: &[S]) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();
        let mut seen = HashSet::new();

        for input in inputs {
            let parsed = Self::parse_string(input.as_ref());
            outcome.malformed += parsed.malformed;
            outcome.unsupported += parsed.unsupported;
            outcome.duplicates += parsed.duplicates;
            for candidate in parsed.candidates {
                if seen.insert(candidate.raw_uri.clone()) {
                    outcome.candidates.push(candidate);
                } else {
                    outcome.duplicates += 1;
                }
            }
        }

        outcome
    }

    /// Parse candidates from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<ParseOutcome> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_inputs(&[content]))
    }
}

fn uri_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    URI_TOKEN_REGEX
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION).to_string())
}

/// Lenient base64: whitespace, URL-safe alphabet and missing padding are accepted
pub fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let compact: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let compact = compact.trim_end_matches('=');
    if compact.is_empty() {
        return None;
    }
    LENIENT_BASE64.decode(compact).ok()
}

fn decode_base64_string(input: &str) -> Option<String> {
    decode_base64(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

fn contains_known_uri(text: &str) -> bool {
    URI_TOKEN_REGEX
        .captures_iter(text)
        .any(|caps| lookup_prefix(&caps[1]).is_some())
}

fn percent_decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// Split `main?query#fragment`, decoding the fragment into a remark
fn split_body(body: &str) -> (&str, Option<&str>, Option<String>) {
    let (rest, remark) = match body.split_once('#') {
        Some((rest, fragment)) => (rest, Some(percent_decode(fragment))),
        None => (body, None),
    };
    let remark = remark.filter(|r| !r.trim().is_empty());
    match rest.split_once('?') {
        Some((main, query)) => (main, Some(query), remark),
        None => (rest, None, remark),
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), percent_decode(value)))
            }
        })
        .collect()
}

fn render_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn normalize_host(raw: &str, host: &str) -> std::result::Result<String, ParseError> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ParseError::malformed(raw, "missing host"));
    }
    // a leading dash reads as an option in ping's argv
    if host.starts_with('-') {
        return Err(ParseError::malformed(raw, format!("invalid host {}", host)));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    if host.is_ascii() {
        return Ok(host.to_ascii_lowercase());
    }
    url::Host::parse(host)
        .map(|h| h.to_string())
        .map_err(|e| ParseError::malformed(raw, format!("invalid host {}: {}", host, e)))
}

/// Port-hopping lists (`443,20000-30000`) keep their first port
fn parse_port(raw: &str, port: &str) -> std::result::Result<u16, ParseError> {
    let digits: String = port.chars().take_while(char::is_ascii_digit).collect();
    match digits.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ParseError::malformed(raw, format!("invalid port {:?}", port))),
    }
}

/// Split `[userinfo@]host:port[/path]`
fn split_authority(
    raw: &str,
    authority: &str,
) -> std::result::Result<(Option<String>, String, u16), ParseError> {
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((userinfo, hostport)) => (Some(percent_decode(userinfo)), hostport),
        None => (None, authority),
    };
    let hostport = hostport.split('/').next().unwrap_or("");

    let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::malformed(raw, "unterminated IPv6 host"))?;
        (host, after.strip_prefix(':').unwrap_or(""))
    } else {
        hostport
            .split_once(':')
            .ok_or_else(|| ParseError::malformed(raw, "missing port"))?
    };

    Ok((userinfo, normalize_host(raw, host)?, parse_port(raw, port)?))
}

fn push_remark(uri: &mut String, remark: Option<&str>) {
    if let Some(remark) = remark.filter(|r| !r.is_empty()) {
        uri.push('#');
        uri.push_str(&urlencoding::encode(remark));
    }
}

/// Encode `user[:password]` keeping the separator readable
fn encode_userinfo(secret: &str) -> String {
    match secret.split_once(':') {
        Some((user, pass)) => format!(
            "{}:{}",
            urlencoding::encode(user),
            urlencoding::encode(pass)
        ),
        None => urlencoding::encode(secret).into_owned(),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "tls" | "reality" | "xtls" | "1" | "true" | "on"
    )
}

// ---------------------------------------------------------------------------
// vless, trojan, hysteria, hysteria2, tuic, juicity
// ---------------------------------------------------------------------------

fn parse_generic(
    raw: &str,
    scheme: Scheme,
    body: &str,
) -> std::result::Result<ProxyCandidate, ParseError> {
    let (main, query, remark) = split_body(body);
    let (userinfo, host, port) = split_authority(raw, main)?;

    let mut candidate = ProxyCandidate::new(raw, scheme, host, port);
    candidate.params = query.map(parse_query).unwrap_or_default();
    candidate.remark = remark;
    candidate.auth_secret = userinfo.unwrap_or_default();

    // hysteria v1 carries its credential in the query
    if candidate.auth_secret.is_empty() {
        if let Some(auth) = candidate.param("auth").or(candidate.param("auth_str")) {
            candidate.auth_secret = auth.to_string();
        }
    }

    if candidate.auth_secret.is_empty()
        && matches!(
            scheme,
            Scheme::Vless | Scheme::Trojan | Scheme::Tuic | Scheme::Juicity
        )
    {
        return Err(ParseError::malformed(raw, "missing credentials"));
    }

    let transport = candidate
        .param("type")
        .or(candidate.param("network"))
        .map(str::to_ascii_lowercase);
    if let Some(transport) = transport {
        candidate.transport = transport;
    }

    let security = candidate.param("security").map(str::to_ascii_lowercase);
    candidate.tls_enabled = match security.as_deref() {
        Some("none") => false,
        Some(value) => is_truthy(value),
        None => {
            candidate.param("tls").map(is_truthy).unwrap_or(false)
                || scheme != Scheme::Vless
        }
    };

    candidate.sni = candidate
        .param("sni")
        .or(candidate.param("peer"))
        .or(candidate.param("serverName"))
        .map(String::from);

    Ok(candidate)
}

fn render_generic(candidate: &ProxyCandidate, remark: Option<&str>) -> String {
    let mut uri = format!("{}://", candidate.scheme);
    if !candidate.auth_secret.is_empty() {
        uri.push_str(&encode_userinfo(&candidate.auth_secret));
        uri.push('@');
    }
    uri.push_str(&candidate.address());
    if !candidate.params.is_empty() {
        uri.push('?');
        uri.push_str(&render_query(&candidate.params));
    }
    push_remark(&mut uri, remark.or(candidate.remark.as_deref()));
    uri
}

// ---------------------------------------------------------------------------
// vmess
// ---------------------------------------------------------------------------

/// Fields lifted out of the vmess JSON into dedicated candidate fields
const VMESS_LIFTED: &[&str] = &["add", "address", "port", "id", "ps"];

fn json_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_vmess(
    raw: &str,
    scheme: Scheme,
    body: &str,
) -> std::result::Result<ProxyCandidate, ParseError> {
    let payload = body.split(|c: char| c == '#' || c == '?').next().unwrap_or("");
    let bytes =
        decode_base64(payload).ok_or_else(|| ParseError::malformed(raw, "invalid base64 payload"))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ParseError::malformed(raw, format!("invalid JSON payload: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| ParseError::malformed(raw, "payload is not a JSON object"))?;

    let field = |key: &str| {
        object
            .get(key)
            .and_then(json_to_string)
            .filter(|v| !v.is_empty())
    };

    let host = field("add")
        .or_else(|| field("address"))
        .ok_or_else(|| ParseError::malformed(raw, "missing host"))?;
    let port = field("port").ok_or_else(|| ParseError::malformed(raw, "missing port"))?;
    let id = field("id").ok_or_else(|| ParseError::malformed(raw, "missing id"))?;

    let mut candidate =
        ProxyCandidate::new(raw, scheme, normalize_host(raw, &host)?, parse_port(raw, &port)?);
    candidate.auth_secret = id;
    candidate.remark = field("ps");
    candidate.params = object
        .iter()
        .filter(|(key, _)| !VMESS_LIFTED.contains(&key.as_str()))
        .filter_map(|(key, value)| json_to_string(value).map(|v| (key.clone(), v)))
        .collect();

    if let Some(net) = candidate.param("net").map(str::to_ascii_lowercase) {
        candidate.transport = net;
    }
    candidate.tls_enabled = candidate.param("tls").map(is_truthy).unwrap_or(false);
    candidate.sni = candidate
        .param("sni")
        .or(candidate.param("host"))
        .map(String::from);

    Ok(candidate)
}

fn render_vmess(candidate: &ProxyCandidate, remark: Option<&str>) -> String {
    let mut object: Map<String, Value> = candidate
        .params
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect();
    object
        .entry("v")
        .or_insert_with(|| Value::String("2".to_string()));
    object.insert("add".to_string(), Value::String(candidate.host.clone()));
    object.insert("port".to_string(), Value::from(candidate.port));
    object.insert(
        "id".to_string(),
        Value::String(candidate.auth_secret.clone()),
    );
    object.insert(
        "ps".to_string(),
        Value::String(
            remark
                .or(candidate.remark.as_deref())
                .unwrap_or_default()
                .to_string(),
        ),
    );

    format!(
        "vmess://{}",
        STANDARD.encode(Value::Object(object).to_string())
    )
}

// ---------------------------------------------------------------------------
// shadowsocks
// ---------------------------------------------------------------------------

fn parse_ss(
    raw: &str,
    scheme: Scheme,
    body: &str,
) -> std::result::Result<ProxyCandidate, ParseError> {
    let (main, query, remark) = split_body(body);
    let main = main.trim_end_matches('/');

    let (credentials, hostport) = match main.rsplit_once('@') {
        Some((userinfo, hostport)) => {
            let credentials = if userinfo.contains(':') {
                percent_decode(userinfo)
            } else {
                decode_base64_string(&percent_decode(userinfo))
                    .ok_or_else(|| ParseError::malformed(raw, "invalid base64 userinfo"))?
            };
            (credentials, hostport.to_string())
        }
        None => {
            let decoded = decode_base64_string(main)
                .ok_or_else(|| ParseError::malformed(raw, "invalid base64 payload"))?;
            let (credentials, hostport) = decoded
                .rsplit_once('@')
                .ok_or_else(|| ParseError::malformed(raw, "missing server address"))?;
            (credentials.to_string(), hostport.to_string())
        }
    };

    let (method, password) = credentials
        .split_once(':')
        .ok_or_else(|| ParseError::malformed(raw, "missing method or password"))?;
    if method.is_empty() || password.is_empty() {
        return Err(ParseError::malformed(raw, "missing method or password"));
    }

    let (_, host, port) = split_authority(raw, &hostport)?;
    let mut candidate = ProxyCandidate::new(raw, scheme, host, port);
    candidate.auth_secret = password.to_string();
    candidate.remark = remark;
    candidate.params = query.map(parse_query).unwrap_or_default();
    candidate
        .params
        .insert("method".to_string(), method.to_ascii_lowercase());

    Ok(candidate)
}

fn render_ss(candidate: &ProxyCandidate, remark: Option<&str>) -> String {
    let method = candidate.param("method").unwrap_or("none");
    let userinfo = URL_SAFE_NO_PAD.encode(format!("{}:{}", method, candidate.auth_secret));
    let mut uri = format!("ss://{}@{}", userinfo, candidate.address());
    if let Some(plugin) = candidate.param("plugin") {
        uri.push_str("/?plugin=");
        uri.push_str(&urlencoding::encode(plugin));
    }
    push_remark(&mut uri, remark.or(candidate.remark.as_deref()));
    uri
}

// ---------------------------------------------------------------------------
// shadowsocksR
// ---------------------------------------------------------------------------

const SSR_FIELDS: &[&str] = &["protocol", "method", "obfs"];

fn parse_ssr(
    raw: &str,
    scheme: Scheme,
    body: &str,
) -> std::result::Result<ProxyCandidate, ParseError> {
    let payload = body.split('#').next().unwrap_or("");
    let decoded = decode_base64_string(payload)
        .ok_or_else(|| ParseError::malformed(raw, "invalid base64 payload"))?;
    let (main, query) = match decoded.split_once("/?") {
        Some((main, query)) => (main, query),
        None => (decoded.trim_end_matches('/'), ""),
    };

    // host may be IPv6, so split from the right
    let mut parts = main.rsplitn(6, ':');
    let mut next = |what: &str| {
        parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ParseError::malformed(raw, format!("missing {}", what)))
    };
    let password = next("password")?;
    let obfs = next("obfs")?;
    let method = next("method")?;
    let protocol = next("protocol")?;
    let port = next("port")?;
    let host = next("host")?;

    let mut candidate =
        ProxyCandidate::new(raw, scheme, normalize_host(raw, host)?, parse_port(raw, port)?);
    candidate.auth_secret = decode_base64_string(password)
        .ok_or_else(|| ParseError::malformed(raw, "invalid base64 password"))?;

    for (key, value) in parse_query(query) {
        if key == "remarks" {
            candidate.remark = decode_base64_string(&value).filter(|r| !r.is_empty());
        } else {
            candidate.params.insert(key, value);
        }
    }
    for (key, value) in SSR_FIELDS.iter().zip([protocol, method, obfs]) {
        candidate.params.insert(key.to_string(), value.to_string());
    }

    Ok(candidate)
}

fn render_ssr(candidate: &ProxyCandidate, remark: Option<&str>) -> String {
    let mut plain = format!(
        "{}:{}:{}:{}:{}:{}",
        candidate.host,
        candidate.port,
        candidate.param("protocol").unwrap_or("origin"),
        candidate.param("method").unwrap_or("none"),
        candidate.param("obfs").unwrap_or("plain"),
        URL_SAFE_NO_PAD.encode(&candidate.auth_secret)
    );

    let mut query: Vec<String> = candidate
        .params
        .iter()
        .filter(|(key, _)| !SSR_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    if let Some(remark) = remark.or(candidate.remark.as_deref()) {
        query.push(format!("remarks={}", URL_SAFE_NO_PAD.encode(remark)));
    }
    if !query.is_empty() {
        plain.push_str("/?");
        plain.push_str(&query.join("&"));
    }

    format!("ssr://{}", URL_SAFE_NO_PAD.encode(plain))
}
