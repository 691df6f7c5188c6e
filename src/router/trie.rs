//! Domain-suffix trie
//!
//! Keys are inserted label by label starting at the top-level domain, so
//! `mail.example.com` lives at root -> `com` -> `example` -> `mail`. A label
//! starting with `*` becomes a wildcard child that matches any single label
//! ending with the rest of the pattern and terminates the walk.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct TrieNode {
    label: String,
    children: HashMap<String, TrieNode>,
    /// Kept in insertion order; the first matching pattern wins
    wildcards: Vec<TrieNode>,
    target: Option<String>,
}

impl TrieNode {
    fn new(label: &str) -> Self {
        TrieNode {
            label: label.to_string(),
            ..Default::default()
        }
    }

    fn wildcard_matches(&self, label: &str) -> bool {
        label.ends_with(&self.label[1..])
    }
}

/// Result of a trie walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieMatch<'a> {
    /// Target bound at the deepest matching node
    pub target: &'a str,
    /// Labels consumed up to that node, in host order
    pub rule: String,
}

/// Domain-suffix trie mapping rule keys to outlet targets
#[derive(Debug, Clone, Default)]
pub struct DomainTrie {
    root: TrieNode,
    len: usize,
}

impl DomainTrie {
    /// Create an empty trie
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bound keys
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no key has been inserted
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bind `target` to `key`; a later insert of the same key overwrites it
    pub fn insert(&mut self, key: &str, target: &str) {
        let mut node = &mut self.root;
        for label in key.rsplit('.') {
            if label.starts_with('*') {
                let idx = match node.wildcards.iter().position(|w| w.label == label) {
                    Some(idx) => idx,
                    None => {
                        node.wildcards.push(TrieNode::new(label));
                        node.wildcards.len() - 1
                    }
                };
                node = &mut node.wildcards[idx];
                break;
            }
            node = node
                .children
                .entry(label.to_string())
                .or_insert_with(|| TrieNode::new(label));
        }

        if node.target.replace(target.to_string()).is_none() {
            self.len += 1;
        }
    }

    /// Walk `host` from its top-level label and return the deepest bound target
    ///
    /// A static child is preferred over wildcard children at each level.
    /// The walk stops at the first label with no matching child.
    pub fn lookup(&self, host: &str) -> Option<TrieMatch<'_>> {
        let mut node = &self.root;
        let mut consumed: Vec<&str> = Vec::new();
        let mut best: Option<(&str, usize)> = None;

        for label in host.rsplit('.') {
            if let Some(child) = node.children.get(label) {
                node = child;
                consumed.push(&node.label);
                if let Some(target) = node.target.as_deref() {
                    best = Some((target, consumed.len()));
                }
                continue;
            }

            if let Some(wildcard) = node.wildcards.iter().find(|w| w.wildcard_matches(label)) {
                consumed.push(&wildcard.label);
                if let Some(target) = wildcard.target.as_deref() {
                    best = Some((target, consumed.len()));
                }
            }
            break;
        }

        best.map(|(target, depth)| {
            let mut labels = consumed[..depth].to_vec();
            labels.reverse();
            TrieMatch {
                target,
                rule: labels.join("."),
            }
        })
    }
}
