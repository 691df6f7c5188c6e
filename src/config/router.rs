//! Routing table configuration
//!
//! Outlets are declared as proxy URLs, rules as `kind,key,target` strings
//! and aliases as `canonical:[alias,alias]` strings.

use crate::router::{RouteKind, RouteRule};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;
use url::Url;

/// Routing table configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RouterConfig {
    /// Outlet definitions, e.g. `socks://10.0.0.2:1080?name=us`
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Rules, e.g. `domain,google.com,us`
    #[serde(default)]
    pub rules: Vec<String>,

    /// Alias groups, e.g. `us:[fast,foreign]`
    #[serde(default)]
    pub mappings: Vec<String>,

    /// Default outlet name; `direct`, `none` or absent means no default
    #[serde(default)]
    pub default: Option<String>,
}

/// Outlet protocol named by a proxy URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    /// Plain TCP to the destination
    Direct,
    /// HTTP CONNECT proxy
    Http,
    /// SOCKS5 proxy
    Socks5,
}

impl ProxyScheme {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "direct" => Some(ProxyScheme::Direct),
            "http" => Some(ProxyScheme::Http),
            "socks" | "socks5" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }
}

/// A parsed outlet definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    /// Outlet protocol
    pub scheme: ProxyScheme,
    /// Unique outlet name
    pub name: String,
    /// Proxy server host
    pub server: String,
    /// Proxy server port
    pub port: u16,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Stream multiplexer name (`yamux`), enables session pooling
    pub mux: Option<String>,
}

impl RouterConfig {
    /// Parse every proxy URL; unparsable or unknown entries are skipped
    pub fn proxy_specs(&self) -> Result<Vec<ProxySpec>> {
        let mut specs = Vec::with_capacity(self.proxies.len());
        for raw in &self.proxies {
            match parse_proxy_url(raw.trim())? {
                Some(spec) => specs.push(spec),
                None => warn!("Skipping unsupported proxy definition: {}", raw),
            }
        }
        Ok(specs)
    }

    /// Parse the rule strings; malformed entries are skipped
    pub fn route_rules(&self) -> Vec<RouteRule> {
        self.rules
            .iter()
            .filter_map(|raw| {
                let rule = parse_rule(raw);
                if rule.is_none() {
                    warn!("Skipping malformed rule: {}", raw);
                }
                rule
            })
            .collect()
    }

    /// Expand the alias groups into an alias -> outlet mapping
    pub fn alias_mapping(&self) -> HashMap<String, String> {
        let mut mapping = HashMap::new();
        for raw in &self.mappings {
            let Some((canonical, aliases)) = raw.split_once(':') else {
                warn!("Skipping malformed mapping: {}", raw);
                continue;
            };
            let aliases = aliases.trim().trim_start_matches('[').trim_end_matches(']');
            for alias in aliases.split(',').map(str::trim).filter(|a| !a.is_empty()) {
                mapping.insert(alias.to_string(), canonical.trim().to_string());
            }
        }
        mapping
    }

    /// Default outlet name, with `direct`/`none` normalized to no default
    pub fn default_outlet(&self) -> Option<String> {
        self.default
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != "direct" && *name != "none")
            .map(str::to_string)
    }
}

/// Parse a `kind,key,target` rule string
pub fn parse_rule(raw: &str) -> Option<RouteRule> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let kind: RouteKind = parts[0].parse().ok()?;
    Some(RouteRule::new(kind, parts[1], parts[2]))
}

/// Parse a proxy URL such as `http://10.0.0.1:3128?name=hk`
///
/// Returns `Ok(None)` for URLs that cannot be parsed or use an unknown
/// scheme, and an error when a recognised outlet has no name.
pub fn parse_proxy_url(raw: &str) -> Result<Option<ProxySpec>> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            warn!("Invalid proxy url {}: {}", raw, e);
            return Ok(None);
        }
    };

    let Some(scheme) = ProxyScheme::from_scheme(url.scheme()) else {
        return Ok(None);
    };

    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

    let name = match params.get("name") {
        Some(name) if !name.is_empty() => name.clone(),
        _ => bail!("proxy name is required: {}", raw),
    };

    let server = url.host_str().unwrap_or_default().to_string();
    let port = url.port_or_known_default().unwrap_or(0);
    if scheme != ProxyScheme::Direct && (server.is_empty() || port == 0) {
        bail!("proxy server address is required: {}", raw);
    }

    let username = params
        .get("username")
        .cloned()
        .or_else(|| Some(url.username().to_string()).filter(|u| !u.is_empty()));
    let password = params
        .get("password")
        .cloned()
        .or_else(|| url.password().map(str::to_string));

    let mux = params
        .get("mux")
        .filter(|m| !m.eq_ignore_ascii_case("none") && !m.eq_ignore_ascii_case("no"))
        .cloned();

    Ok(Some(ProxySpec {
        scheme,
        name,
        server,
        port,
        username,
        password,
        mux,
    }))
}

/// Parse a `[geoip]` table into country code -> CIDR strings
pub fn geoip_entries(table: &HashMap<String, Vec<String>>) -> Result<Vec<(String, ipnet::IpNet)>> {
    let mut entries = Vec::new();
    for (code, nets) in table {
        for net in nets {
            let parsed = net
                .parse::<ipnet::IpNet>()
                .with_context(|| format!("Invalid CIDR for {}: {}", code, net))?;
            entries.push((code.to_uppercase(), parsed));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule() {
        let rule = parse_rule("domain,google.com,hk").unwrap();
        assert_eq!(rule.kind, RouteKind::Domain);
        assert_eq!(rule.key, "google.com");
        assert_eq!(rule.target, "hk");

        let rule = parse_rule(" exact , 1.1.1.1 , direct ").unwrap();
        assert_eq!(rule.kind, RouteKind::Exact);
        assert_eq!(rule.key, "1.1.1.1");
    }

    #[test]
    fn test_parse_rule_malformed() {
        assert!(parse_rule("domain,google.com").is_none());
        assert!(parse_rule("domain,,hk").is_none());
        assert!(parse_rule("regex,.*,hk").is_none());
    }

    #[test]
    fn test_route_rules_skips_bad_entries() {
        let config = RouterConfig {
            rules: vec![
                "domain,example.com,a".to_string(),
                "garbage".to_string(),
                "ip,10.0.0.1,direct".to_string(),
            ],
            ..Default::default()
        };
        let rules = config.route_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].kind, RouteKind::Ip);
    }

    #[test]
    fn test_alias_mapping() {
        let config = RouterConfig {
            mappings: vec!["hk:[fast, foreign]".to_string(), "us:[slow]".to_string()],
            ..Default::default()
        };
        let mapping = config.alias_mapping();
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping["fast"], "hk");
        assert_eq!(mapping["foreign"], "hk");
        assert_eq!(mapping["slow"], "us");
    }

    #[test]
    fn test_default_outlet_normalization() {
        let mut config = RouterConfig::default();
        assert_eq!(config.default_outlet(), None);

        config.default = Some("none".to_string());
        assert_eq!(config.default_outlet(), None);

        config.default = Some("direct".to_string());
        assert_eq!(config.default_outlet(), None);

        config.default = Some("hk".to_string());
        assert_eq!(config.default_outlet(), Some("hk".to_string()));
    }

    #[test]
    fn test_parse_proxy_url_http() {
        let spec = parse_proxy_url("http://10.0.0.1:3128?name=hk")
            .unwrap()
            .unwrap();
        assert_eq!(spec.scheme, ProxyScheme::Http);
        assert_eq!(spec.name, "hk");
        assert_eq!(spec.server, "10.0.0.1");
        assert_eq!(spec.port, 3128);
        assert_eq!(spec.mux, None);
    }

    #[test]
    fn test_parse_proxy_url_socks_with_credentials() {
        let spec = parse_proxy_url("socks://proxy.local:1080?name=us&username=u&password=p&mux=yamux")
            .unwrap()
            .unwrap();
        assert_eq!(spec.scheme, ProxyScheme::Socks5);
        assert_eq!(spec.server, "proxy.local");
        assert_eq!(spec.port, 1080);
        assert_eq!(spec.username.as_deref(), Some("u"));
        assert_eq!(spec.password.as_deref(), Some("p"));
        assert_eq!(spec.mux.as_deref(), Some("yamux"));
    }

    #[test]
    fn test_parse_proxy_url_mux_none() {
        let spec = parse_proxy_url("http://10.0.0.1:3128?name=hk&mux=none")
            .unwrap()
            .unwrap();
        assert_eq!(spec.mux, None);
    }

    #[test]
    fn test_parse_proxy_url_requires_name() {
        assert!(parse_proxy_url("http://10.0.0.1:3128").is_err());
    }

    #[test]
    fn test_parse_proxy_url_unknown_scheme() {
        assert!(parse_proxy_url("trojan://10.0.0.1:443?name=t")
            .unwrap()
            .is_none());
        assert!(parse_proxy_url("not a url").unwrap().is_none());
    }

    #[test]
    fn test_geoip_entries() {
        let mut table = HashMap::new();
        table.insert("cn".to_string(), vec!["1.0.1.0/24".to_string()]);
        let entries = geoip_entries(&table).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "CN");

        table.insert("us".to_string(), vec!["bogus".to_string()]);
        assert!(geoip_entries(&table).is_err());
    }
}
