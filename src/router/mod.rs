//! Router module for Switchyard
//!
//! Maps a destination host to an outlet. Lookups run against an immutable
//! [`RoutingSnapshot`]; every mutation builds a new snapshot and swaps it in,
//! so a lookup sees either the old table or the new one, never a mix.
//!
//! Precedence: exact rules, then the domain-suffix trie, then geo rules for
//! literal IPs, then the default outlet.

mod geo;
mod trie;

pub use geo::{CidrGeoClassifier, GeoClassifier};
pub use trie::{DomainTrie, TrieMatch};

use crate::error::RouterError;
use crate::helper::DIRECT;
use crate::outlet::ProxyClient;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const NONE: &str = "none";

/// Kind of a routing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Domain suffix, walked label by label
    Domain,
    /// IP address, stored in the trie like a domain
    Ip,
    /// Whole-host override, bypasses the trie
    Exact,
    /// Country code of a literal IP destination
    Geoip,
}

impl FromStr for RouteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "domain" => Ok(RouteKind::Domain),
            "ip" => Ok(RouteKind::Ip),
            "exact" => Ok(RouteKind::Exact),
            "geoip" => Ok(RouteKind::Geoip),
            other => Err(format!("unknown rule kind: {}", other)),
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            RouteKind::Domain => "domain",
            RouteKind::Ip => "ip",
            RouteKind::Exact => "exact",
            RouteKind::Geoip => "geoip",
        };
        f.write_str(kind)
    }
}

/// A single `kind,key,target` rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Rule kind
    pub kind: RouteKind,
    /// Domain, IP, host or country code
    pub key: String,
    /// Outlet name, alias or `direct`
    pub target: String,
}

impl RouteRule {
    /// Create a rule
    pub fn new(kind: RouteKind, key: &str, target: &str) -> Self {
        RouteRule {
            kind,
            key: key.to_string(),
            target: target.to_string(),
        }
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.kind, self.key, self.target)
    }
}

/// Outcome of [`Router::route`]
#[derive(Debug, Clone, Default)]
pub struct RouteDecision {
    /// Selected outlet; `None` means dial the destination directly
    pub outlet: Option<Arc<dyn ProxyClient>>,
    /// Rule labels consumed while matching, empty on default fallback
    pub matched_rule: String,
    /// Whether the default outlet was used
    pub used_default: bool,
}

impl RouteDecision {
    /// Name of the selected outlet, `direct` when none
    pub fn outlet_name(&self) -> &str {
        self.outlet.as_ref().map(|o| o.name()).unwrap_or(DIRECT)
    }
}

/// Routing table as last supplied to [`Router::initialize`]
#[derive(Debug, Clone, Default)]
pub struct RoutingInfo {
    /// Outlets in the order they were supplied
    pub outlets: Vec<Arc<dyn ProxyClient>>,
    /// Current alias mapping
    pub mappings: HashMap<String, String>,
    /// Rules exactly as supplied, including skipped ones
    pub rules: Vec<RouteRule>,
    /// Current default outlet
    pub default: Option<Arc<dyn ProxyClient>>,
}

/// One complete, immutable routing table
#[derive(Clone, Default)]
pub struct RoutingSnapshot {
    outlets: HashMap<String, Arc<dyn ProxyClient>>,
    original_outlets: Vec<Arc<dyn ProxyClient>>,
    aliases: HashMap<String, String>,
    original_rules: Vec<RouteRule>,
    trie: DomainTrie,
    exact: HashMap<String, String>,
    geo: HashMap<String, String>,
    default: Option<Arc<dyn ProxyClient>>,
    classifier: Option<Arc<dyn GeoClassifier>>,
}

impl fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("outlets", &self.outlets.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .field("trie_keys", &self.trie.len())
            .field("exact", &self.exact)
            .field("geo", &self.geo)
            .field("default", &self.default.as_ref().map(|o| o.name()))
            .finish()
    }
}

impl RoutingSnapshot {
    /// Outlet bound to `name`, directly or through one alias hop
    fn outlet(&self, name: &str) -> Option<&Arc<dyn ProxyClient>> {
        self.outlets
            .get(name)
            .or_else(|| self.aliases.get(name).and_then(|c| self.outlets.get(c)))
    }

    fn resolve(&self, target: &str, rule: String) -> RouteDecision {
        if target == DIRECT {
            return RouteDecision {
                outlet: None,
                matched_rule: rule,
                used_default: false,
            };
        }
        match self.outlet(target) {
            Some(outlet) => RouteDecision {
                outlet: Some(outlet.clone()),
                matched_rule: rule,
                used_default: false,
            },
            None => {
                if !target.is_empty() {
                    debug!("Route target {} (rule {}) is unresolved, using default", target, rule);
                }
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> RouteDecision {
        RouteDecision {
            outlet: self.default.clone(),
            matched_rule: String::new(),
            used_default: true,
        }
    }

    /// Select an outlet for an already lowercased host
    pub fn route(&self, host: &str) -> RouteDecision {
        if let Some(target) = self.exact.get(host) {
            return self.resolve(target, host.to_string());
        }

        if let Some(m) = self.trie.lookup(host) {
            return self.resolve(m.target, m.rule);
        }

        if let (Ok(ip), Some(classifier)) = (host.parse::<IpAddr>(), self.classifier.as_ref()) {
            if let Some(code) = classifier.classify(ip) {
                if let Some(target) = self.geo.get(&code) {
                    return self.resolve(target, format!("geoip:{}", code));
                }
            }
        }

        self.fallback()
    }

    fn validate_default(&self, name: &str) -> Result<Option<Arc<dyn ProxyClient>>, RouterError> {
        if name == DIRECT || name == NONE {
            return Ok(None);
        }
        self.outlet(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| RouterError::OutletNotFound(name.to_string()))
    }
}

/// Builtin rule router
#[derive(Debug, Default)]
pub struct Router {
    snapshot: RwLock<Arc<RoutingSnapshot>>,
}

impl Router {
    /// Create a router with an empty table: everything goes direct
    pub fn new() -> Self {
        Self::default()
    }

    /// Router implementation name
    pub fn name(&self) -> &str {
        "builtin"
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.read().clone()
    }

    /// Select an outlet for `host`
    ///
    /// Never fails: unresolved targets fall back to the default outlet.
    pub fn route(&self, host: &str) -> RouteDecision {
        let host = host.trim_end_matches('.').to_lowercase();
        let snapshot = self.snapshot();
        snapshot.route(&host)
    }

    /// Replace the whole routing table
    ///
    /// On error the previous table stays active. Rules whose target is not
    /// an outlet, an alias or `direct` are skipped but still reported by
    /// [`Router::get_original_info`].
    ///
    /// The geo classifier of the current table is carried over.
    pub fn initialize(
        &self,
        rules: Vec<RouteRule>,
        outlets: Vec<Arc<dyn ProxyClient>>,
        mappings: HashMap<String, String>,
        default: Option<&str>,
    ) -> Result<(), RouterError> {
        let next = self.build(rules, outlets, mappings, default)?;
        let mut guard = self.snapshot.write();
        let next = RoutingSnapshot {
            classifier: guard.classifier.clone(),
            ..next
        };
        *guard = Arc::new(next);
        Ok(())
    }

    /// Replace the whole routing table together with its geo classifier
    ///
    /// Routes see either the previous table and classifier or both new ones.
    pub fn initialize_with_classifier(
        &self,
        rules: Vec<RouteRule>,
        outlets: Vec<Arc<dyn ProxyClient>>,
        mappings: HashMap<String, String>,
        default: Option<&str>,
        classifier: Arc<dyn GeoClassifier>,
    ) -> Result<(), RouterError> {
        let mut next = self.build(rules, outlets, mappings, default)?;
        next.classifier = Some(classifier);
        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }

    /// Build a snapshot without a classifier
    fn build(
        &self,
        rules: Vec<RouteRule>,
        outlets: Vec<Arc<dyn ProxyClient>>,
        mappings: HashMap<String, String>,
        default: Option<&str>,
    ) -> Result<RoutingSnapshot, RouterError> {
        let mut next = RoutingSnapshot::default();

        for outlet in &outlets {
            let name = outlet.name().to_string();
            if next.outlets.insert(name.clone(), outlet.clone()).is_some() {
                return Err(RouterError::DuplicateOutlet(name));
            }
        }
        next.original_outlets = outlets;

        for (alias, target) in &mappings {
            if next.outlets.contains_key(target) {
                continue;
            }
            if mappings.contains_key(target) {
                return Err(RouterError::AliasChain {
                    alias: alias.clone(),
                    target: target.clone(),
                });
            }
        }
        next.aliases = mappings
            .into_iter()
            .filter(|(alias, target)| {
                let known = next.outlets.contains_key(target);
                if !known {
                    warn!("Skipping mapping {} -> {}: unknown outlet", alias, target);
                }
                known
            })
            .collect();

        if let Some(name) = default {
            next.default = next.validate_default(name)?;
        }

        for rule in &rules {
            let key = rule.key.trim().trim_end_matches('.').to_lowercase();
            if key.is_empty() {
                return Err(RouterError::InvalidRule(rule.to_string()));
            }
            // a wildcard label ends the trie walk, so it must be the leftmost
            let inner_wildcard = key.split('.').skip(1).any(|label| label.starts_with('*'));
            if inner_wildcard && matches!(rule.kind, RouteKind::Domain | RouteKind::Ip) {
                return Err(RouterError::InvalidRule(rule.to_string()));
            }
            if rule.target != DIRECT && next.outlet(&rule.target).is_none() {
                warn!("Skipping rule {}: unknown outlet {}", rule, rule.target);
                continue;
            }
            match rule.kind {
                RouteKind::Domain | RouteKind::Ip => next.trie.insert(&key, &rule.target),
                RouteKind::Exact => {
                    next.exact.insert(key, rule.target.clone());
                }
                RouteKind::Geoip => {
                    next.geo.insert(key.to_uppercase(), rule.target.clone());
                }
            }
        }
        next.original_rules = rules;

        info!(
            "Router {} loaded {} outlets, {} aliases, {} trie rules, {} exact rules, {} geo rules",
            self.name(),
            next.outlets.len(),
            next.aliases.len(),
            next.trie.len(),
            next.exact.len(),
            next.geo.len()
        );

        Ok(next)
    }

    /// Apply `f` to a copy of the current snapshot and swap it in on success
    fn update<F>(&self, f: F) -> Result<(), RouterError>
    where
        F: FnOnce(&mut RoutingSnapshot) -> Result<(), RouterError>,
    {
        let mut guard = self.snapshot.write();
        let mut next = RoutingSnapshot::clone(&guard);
        f(&mut next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Use `name` as default outlet; `direct` or `none` clears it
    pub fn set_default_outlet_if_exists(&self, name: &str) -> Result<(), RouterError> {
        self.update(|snapshot| {
            snapshot.default = snapshot.validate_default(name)?;
            Ok(())
        })
    }

    /// Make `alias` resolve to the outlet `outlet`
    pub fn set_mapping(&self, alias: &str, outlet: &str) -> Result<(), RouterError> {
        self.update(|snapshot| {
            if !snapshot.outlets.contains_key(outlet) {
                return Err(RouterError::OutletNotFound(outlet.to_string()));
            }
            snapshot.aliases.insert(alias.to_string(), outlet.to_string());
            Ok(())
        })
    }

    /// Register `client` under `name`
    ///
    /// When `name` differs from the client's own name it becomes an alias
    /// for that client instead.
    pub fn set_proxy(&self, name: &str, client: Arc<dyn ProxyClient>) -> Result<(), RouterError> {
        if name.is_empty() {
            return Err(RouterError::InvalidRule("empty outlet name".to_string()));
        }
        self.update(|snapshot| {
            let own = client.name().to_string();
            if name != own && name != DIRECT {
                snapshot.aliases.insert(name.to_string(), own.clone());
                snapshot.outlets.entry(own).or_insert(client);
            } else {
                snapshot.outlets.insert(name.to_string(), client);
            }
            Ok(())
        })
    }

    /// Classifier consulted by geo rules
    pub fn set_geo_classifier(&self, classifier: Arc<dyn GeoClassifier>) {
        let mut guard = self.snapshot.write();
        let mut next = RoutingSnapshot::clone(&guard);
        next.classifier = Some(classifier);
        *guard = Arc::new(next);
    }

    /// Outlets, aliases, rules and default as currently configured
    pub fn get_original_info(&self) -> RoutingInfo {
        let snapshot = self.snapshot();
        RoutingInfo {
            outlets: snapshot.original_outlets.clone(),
            mappings: snapshot.aliases.clone(),
            rules: snapshot.original_rules.clone(),
            default: snapshot.default.clone(),
        }
    }
}
