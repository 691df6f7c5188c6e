//! Geo classification for literal IP destinations

use ipnet::IpNet;
use std::net::IpAddr;

/// Maps an IP address to a country code
pub trait GeoClassifier: Send + Sync {
    /// Country code for `ip`, if known
    fn classify(&self, ip: IpAddr) -> Option<String>;
}

/// Classifier backed by a list of CIDR blocks; the longest prefix wins
#[derive(Debug, Clone, Default)]
pub struct CidrGeoClassifier {
    entries: Vec<(IpNet, String)>,
}

impl CidrGeoClassifier {
    /// Create an empty classifier
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a classifier from `(code, network)` pairs
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, IpNet)>,
    {
        let mut classifier = Self::new();
        for (code, net) in entries {
            classifier.insert(&code, net);
        }
        classifier
    }

    /// Add a network for a country code
    pub fn insert(&mut self, code: &str, net: IpNet) {
        self.entries.push((net.trunc(), code.to_uppercase()));
    }

    /// Number of networks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the classifier has no networks
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoClassifier for CidrGeoClassifier {
    fn classify(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .filter(|(net, _)| net.contains(&ip))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, code)| code.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify() {
        let classifier = CidrGeoClassifier::from_entries(vec![
            ("cn".to_string(), net("1.0.1.0/24")),
            ("us".to_string(), net("8.8.0.0/16")),
        ]);
        assert_eq!(classifier.len(), 2);
        assert_eq!(classifier.classify("1.0.1.7".parse().unwrap()), Some("CN".to_string()));
        assert_eq!(classifier.classify("8.8.8.8".parse().unwrap()), Some("US".to_string()));
        assert_eq!(classifier.classify("9.9.9.9".parse().unwrap()), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut classifier = CidrGeoClassifier::new();
        classifier.insert("AA", net("10.0.0.0/8"));
        classifier.insert("BB", net("10.1.0.0/16"));
        assert_eq!(classifier.classify("10.1.2.3".parse().unwrap()), Some("BB".to_string()));
        assert_eq!(classifier.classify("10.2.2.3".parse().unwrap()), Some("AA".to_string()));
    }

    #[test]
    fn test_ipv6() {
        let mut classifier = CidrGeoClassifier::new();
        classifier.insert("jp", net("2001:db8::/32"));
        assert_eq!(classifier.classify("2001:db8::1".parse().unwrap()), Some("JP".to_string()));
        assert_eq!(classifier.classify("1.2.3.4".parse().unwrap()), None);
    }
}
