//! Per-host path trie answering "longest `from_url.path` prefix of the
//! request path", with a secondary discriminator on scheme and port so that
//! `http` and `https` rules can share a host key (spec §3 / §4.4).

use std::collections::HashMap;
use std::sync::Arc;

use crate::remap::rule::RemapRule;
use crate::url::Scheme;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct SchemePort {
	scheme: Option<Scheme>,
	port: u16,
}

#[derive(Default)]
struct Node {
	children: HashMap<String, Node>,
	/// Rules that terminate exactly at this node, keyed by scheme+port.
	rules: HashMap<SchemePort, Arc<RemapRule>>,
}

/// A path is split into `/`-delimited segments for trie insertion so that
/// matches always land on a segment boundary, per spec §3.
fn segments(path: &str) -> Vec<&str> {
	path.split('/').filter(|s| !s.is_empty()).collect()
}

#[derive(Default)]
pub struct PathTrie {
	root: Node,
}

impl PathTrie {
	pub fn new() -> Self {
		PathTrie::default()
	}

	pub fn len(&self) -> usize {
		fn count(node: &Node) -> usize {
			node.rules.len() + node.children.values().map(count).sum::<usize>()
		}
		count(&self.root)
	}

	pub fn insert(&mut self, rule: Arc<RemapRule>) {
		let key = SchemePort {
			scheme: rule.from_url.scheme,
			port: rule.from_url.effective_port(),
		};
		let segs = segments(&rule.from_url.path);
		let mut node = &mut self.root;
		for seg in segs {
			node = node.children.entry(seg.to_string()).or_default();
		}
		node.rules.insert(key, rule);
	}

	/// Returns the rule bound to the longest `from_url.path` prefix of
	/// `request_path` whose scheme/port also match, preferring the
	/// deepest (most specific) matching node.
	pub fn longest_prefix_match(&self, request_path: &str, scheme: Option<Scheme>, port: u16) -> Option<Arc<RemapRule>> {
		let key = SchemePort { scheme, port };
		let segs = segments(request_path);

		let mut node = &self.root;
		let mut best: Option<Arc<RemapRule>> = None;
		if let Some(r) = node.rules.get(&key) {
			best = Some(r.clone());
		}
		for seg in segs {
			match node.children.get(seg) {
				Some(next) => {
					node = next;
					if let Some(r) = node.rules.get(&key) {
						best = Some(r.clone());
					}
				},
				None => break,
			}
		}
		best
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::remap::rule::{RemapKind, RemapRule};
	use crate::url::Url;

	fn rule(path: &str, rank: u32) -> Arc<RemapRule> {
		let mut from = Url::parse("http://example/", false).unwrap();
		from.path = path.to_string();
		let to = Url::parse("http://backend/", false).unwrap();
		Arc::new(RemapRule::new(RemapKind::Forward, from, to, rank))
	}

	#[test]
	fn longest_prefix_wins() {
		let mut trie = PathTrie::new();
		trie.insert(rule("/foo/", 1));
		trie.insert(rule("/foo/bar/", 2));
		let hit = trie
			.longest_prefix_match("/foo/bar/baz", Some(Scheme::Http), 80)
			.unwrap();
		assert_eq!(hit.rank, 2);
	}

	#[test]
	fn respects_segment_boundaries() {
		let mut trie = PathTrie::new();
		trie.insert(rule("/foo/", 1));
		// "/foobar" should NOT match "/foo/" since it isn't segment-aligned.
		let hit = trie.longest_prefix_match("/foobar", Some(Scheme::Http), 80);
		assert!(hit.is_none());
	}

	#[test]
	fn scheme_and_port_are_discriminators() {
		let mut trie = PathTrie::new();
		trie.insert(rule("/foo/", 1));
		let hit = trie.longest_prefix_match("/foo/bar", Some(Scheme::Https), 443);
		assert!(hit.is_none());
	}
}
