//! Xray configuration builder
//!
//! Turns candidates into Xray outbounds, either as a single-outbound config
//! behind a local SOCKS inbound (used for end-to-end validation) or as an
//! aggregate config with a balancer over the top-ranked candidates.

use crate::proxy::models::{ProxyCandidate, Scheme};
use serde::Serialize;
use serde_json::{json, Value};

/// Tag of the outbound under test in a validation config
pub const VALIDATION_TAG: &str = "proxy";

#[derive(Debug, Clone, Serialize)]
pub struct XrayConfig {
    pub log: XrayLog,
    pub inbounds: Vec<XrayInbound>,
    pub outbounds: Vec<XrayOutbound>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<XrayRouting>,
}

#[derive(Debug, Clone, Serialize)]
pub struct XrayLog {
    pub loglevel: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct XrayInbound {
    pub tag: String,
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct XrayOutbound {
    pub tag: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct XrayRouting {
    #[serde(rename = "domainStrategy")]
    pub domain_strategy: String,
    pub rules: Vec<Value>,
    pub balancers: Vec<Value>,
}

impl XrayConfig {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Whether an Xray outbound can be built for this scheme
pub fn supports(scheme: Scheme) -> bool {
    matches!(
        scheme,
        Scheme::Vmess | Scheme::Vless | Scheme::Trojan | Scheme::Ss
    )
}

/// Build the outbound for a candidate; `None` for schemes Xray does not carry
pub fn outbound(candidate: &ProxyCandidate, tag: &str) -> Option<XrayOutbound> {
    let (protocol, settings, stream_settings) = match candidate.scheme {
        Scheme::Vmess => ("vmess", vmess_settings(candidate), stream_settings(candidate)),
        Scheme::Vless => ("vless", vless_settings(candidate), stream_settings(candidate)),
        Scheme::Trojan => ("trojan", trojan_settings(candidate), stream_settings(candidate)),
        Scheme::Ss => ("shadowsocks", shadowsocks_settings(candidate), None),
        _ => return None,
    };

    Some(XrayOutbound {
        tag: tag.to_string(),
        protocol: protocol.to_string(),
        settings: Some(settings),
        stream_settings,
    })
}

/// Single candidate behind a SOCKS inbound on `127.0.0.1:socks_port`
pub fn validation_config(candidate: &ProxyCandidate, socks_port: u16) -> Option<XrayConfig> {
    let proxy = outbound(candidate, VALIDATION_TAG)?;
    Some(XrayConfig {
        log: XrayLog {
            loglevel: "warning".to_string(),
        },
        inbounds: vec![socks_inbound(socks_port)],
        outbounds: vec![proxy, direct_outbound()],
        routing: None,
    })
}

/// Aggregate config over ranked candidates with a leastPing balancer
pub fn aggregate_config<'a, I>(candidates: I, socks_port: u16) -> XrayConfig
where
    I: IntoIterator<Item = &'a ProxyCandidate>,
{
    let outbounds: Vec<XrayOutbound> = candidates
        .into_iter()
        .filter(|c| supports(c.scheme))
        .enumerate()
        .filter_map(|(i, c)| outbound(c, &format!("{}-{}", c.scheme, i + 1)))
        .collect();
    let tags: Vec<String> = outbounds.iter().map(|o| o.tag.clone()).collect();

    let (rules, balancers) = if tags.is_empty() {
        (Vec::new(), Vec::new())
    } else {
        (
            vec![json!({
                "type": "field",
                "network": "tcp,udp",
                "balancerTag": "best_ping"
            })],
            vec![json!({
                "tag": "best_ping",
                "selector": tags,
                "strategy": { "type": "leastPing" }
            })],
        )
    };

    let mut all = outbounds;
    all.push(direct_outbound());

    XrayConfig {
        log: XrayLog {
            loglevel: "warning".to_string(),
        },
        inbounds: vec![socks_inbound(socks_port)],
        outbounds: all,
        routing: Some(XrayRouting {
            domain_strategy: "AsIs".to_string(),
            rules,
            balancers,
        }),
    }
}

fn socks_inbound(port: u16) -> XrayInbound {
    XrayInbound {
        tag: "socks-in".to_string(),
        port,
        listen: "127.0.0.1".to_string(),
        protocol: "socks".to_string(),
        settings: Some(json!({ "auth": "noauth", "udp": false })),
    }
}

fn direct_outbound() -> XrayOutbound {
    XrayOutbound {
        tag: "direct".to_string(),
        protocol: "freedom".to_string(),
        settings: None,
        stream_settings: None,
    }
}

fn vmess_settings(c: &ProxyCandidate) -> Value {
    let alter_id: u32 = c.param("aid").and_then(|a| a.parse().ok()).unwrap_or(0);
    json!({
        "vnext": [{
            "address": c.host,
            "port": c.port,
            "users": [{
                "id": c.auth_secret,
                "alterId": alter_id,
                "security": c.param("scy").unwrap_or("auto")
            }]
        }]
    })
}

fn vless_settings(c: &ProxyCandidate) -> Value {
    let mut user = json!({
        "id": c.auth_secret,
        "encryption": c.param("encryption").unwrap_or("none")
    });
    if let Some(flow) = c.param("flow") {
        user["flow"] = json!(flow);
    }
    json!({
        "vnext": [{
            "address": c.host,
            "port": c.port,
            "users": [user]
        }]
    })
}

fn trojan_settings(c: &ProxyCandidate) -> Value {
    json!({
        "servers": [{
            "address": c.host,
            "port": c.port,
            "password": c.auth_secret
        }]
    })
}

fn shadowsocks_settings(c: &ProxyCandidate) -> Value {
    json!({
        "servers": [{
            "address": c.host,
            "port": c.port,
            "method": c.param("method").unwrap_or("aes-128-gcm"),
            "password": c.auth_secret
        }]
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

fn stream_settings(c: &ProxyCandidate) -> Option<Value> {
    let network = match c.transport.as_str() {
        "" => "tcp",
        other => other,
    };
    let mut settings = json!({ "network": network });

    let security = match c.param("security") {
        Some(s) => s.to_ascii_lowercase(),
        None if c.tls_enabled => "tls".to_string(),
        None => "none".to_string(),
    };
    let server_name = c
        .sni
        .clone()
        .or_else(|| c.host_ip().is_none().then(|| c.host.clone()))
        .unwrap_or_default();

    match security.as_str() {
        "tls" | "xtls" => {
            let mut tls = json!({
                "serverName": server_name,
                "allowInsecure": true
            });
            if let Some(alpn) = c.param("alpn") {
                tls["alpn"] = json!(split_list(alpn));
            }
            if let Some(fp) = c.param("fp") {
                tls["fingerprint"] = json!(fp);
            }
            settings["security"] = json!("tls");
            settings["tlsSettings"] = tls;
        }
        "reality" => {
            settings["security"] = json!("reality");
            settings["realitySettings"] = json!({
                "serverName": server_name,
                "publicKey": c.param("pbk").unwrap_or_default(),
                "shortId": c.param("sid").unwrap_or_default(),
                "spiderX": c.param("spx").unwrap_or_default(),
                "fingerprint": c.param("fp").unwrap_or("chrome")
            });
        }
        _ => {}
    }

    match network {
        "ws" => {
            settings["wsSettings"] = json!({
                "path": c.param("path").unwrap_or("/"),
                "headers": { "Host": c.param("host").unwrap_or_default() }
            });
        }
        "grpc" => {
            settings["grpcSettings"] = json!({
                "serviceName": c.param("serviceName").or(c.param("path")).unwrap_or_default()
            });
        }
        "h2" | "http" => {
            let hosts = c.param("host").map(split_list).unwrap_or_default();
            settings["httpSettings"] = json!({
                "path": c.param("path").unwrap_or("/"),
                "host": hosts
            });
        }
        _ => {}
    }

    Some(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::parser::ProxyParser;

    fn parse(uri: &str) -> ProxyCandidate {
        ProxyParser::parse_uri(uri).unwrap()
    }

    #[test]
    fn test_vless_reality_outbound() {
        let c = parse("vless://uuid-1@1.2.3.4:443?security=reality&sni=www.microsoft.com&pbk=PUBKEY&sid=ab12&fp=firefox&type=grpc&serviceName=svc&flow=xtls-rprx-vision");
        let out = outbound(&c, "t").unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["protocol"], "vless");
        assert_eq!(json["settings"]["vnext"][0]["users"][0]["flow"], "xtls-rprx-vision");
        let stream = &json["streamSettings"];
        assert_eq!(stream["network"], "grpc");
        assert_eq!(stream["security"], "reality");
        assert_eq!(stream["realitySettings"]["publicKey"], "PUBKEY");
        assert_eq!(stream["realitySettings"]["fingerprint"], "firefox");
        assert_eq!(stream["grpcSettings"]["serviceName"], "svc");
    }

    #[test]
    fn test_trojan_tls_defaults_server_name_to_domain() {
        let c = parse("trojan://pw@t.example.com:443?type=ws&path=%2Fws&alpn=h2,http/1.1");
        let json = serde_json::to_value(outbound(&c, "t").unwrap()).unwrap();
        let stream = &json["streamSettings"];
        assert_eq!(stream["security"], "tls");
        assert_eq!(stream["tlsSettings"]["serverName"], "t.example.com");
        assert_eq!(stream["tlsSettings"]["alpn"][1], "http/1.1");
        assert_eq!(stream["wsSettings"]["path"], "/ws");
    }

    #[test]
    fn test_shadowsocks_outbound_has_no_stream_settings() {
        let c = parse("ss://chacha20-ietf-poly1305:pw@5.6.7.8:8388");
        let json = serde_json::to_value(outbound(&c, "ss").unwrap()).unwrap();
        assert_eq!(json["protocol"], "shadowsocks");
        assert_eq!(json["settings"]["servers"][0]["method"], "chacha20-ietf-poly1305");
        assert!(json.get("streamSettings").is_none());
    }

    #[test]
    fn test_unsupported_schemes() {
        let c = parse("tuic://uuid:pw@1.2.3.4:443");
        assert!(!supports(c.scheme));
        assert!(outbound(&c, "x").is_none());
        assert!(validation_config(&c, 1080).is_none());
    }

    #[test]
    fn test_validation_config_shape() {
        let c = parse("vless://uuid-1@1.2.3.4:8080?type=tcp");
        let config = validation_config(&c, 23456).unwrap();
        let json: Value = serde_json::from_str(&config.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["inbounds"][0]["port"], 23456);
        assert_eq!(json["inbounds"][0]["listen"], "127.0.0.1");
        assert_eq!(json["inbounds"][0]["protocol"], "socks");
        assert_eq!(json["outbounds"][0]["tag"], VALIDATION_TAG);
        assert_eq!(json["outbounds"][1]["protocol"], "freedom");
        assert!(json.get("routing").is_none());
    }

    #[test]
    fn test_aggregate_config_skips_unsupported() {
        let a = parse("vless://uuid-1@1.2.3.4:8080");
        let b = parse("hysteria2://pw@1.2.3.4:443");
        let config = aggregate_config([&a, &b], 10808);
        assert_eq!(config.outbounds.len(), 2);
        let routing = config.routing.unwrap();
        assert_eq!(routing.balancers.len(), 1);
        assert_eq!(routing.balancers[0]["selector"][0], config.outbounds[0].tag);
    }
}
