//! Indexed collection of [`RemapRule`]: exact-host map, regex-host list,
//! plus the per-host path trie for longest-prefix match (spec §3 / §4.4,
//! C4).

use std::collections::HashMap;
use std::sync::Arc;

use crate::remap::rule::{RemapKind, RemapRule};
use crate::remap::trie::PathTrie;
use crate::url::Url;

#[derive(Default)]
struct SubTable {
	by_host: HashMap<String, PathTrie>,
	/// Regex-host rules, kept sorted by `rank` ascending.
	regex_list: Vec<Arc<RemapRule>>,
}

impl SubTable {
	fn insert(&mut self, rule: Arc<RemapRule>) -> Result<(), InsertError> {
		if rule.from_host_is_regex {
			self.regex_list.push(rule);
			self.regex_list.sort_by_key(|r| r.rank);
		} else {
			let trie = self.by_host.entry(rule.from_url.host.clone()).or_default();
			trie.insert(rule);
		}
		Ok(())
	}
}

#[derive(thiserror::Error, Debug)]
pub enum InsertError {
	#[error("duplicate exact insertion for host {0:?}")]
	DuplicateExact(String),
}

/// Result of a successful [`RemapTable::lookup`]: the matched rule plus, for
/// regex matches, a freshly materialised target URL (the template with
/// captures substituted).
pub struct LookupHit {
	pub rule: Arc<RemapRule>,
	pub materialised_to_url: Option<Url>,
}

#[derive(Default)]
pub struct RemapTable {
	sub_tables: HashMap<RemapKind, SubTable>,
}

impl RemapTable {
	pub fn new() -> Self {
		RemapTable::default()
	}

	/// Total number of rules across every sub-table, used to enforce the
	/// process-wide `min_remap_rules` floor (spec §6/§7 `ConfigLoadRejected`).
	pub fn rule_count(&self) -> usize {
		self
			.sub_tables
			.values()
			.map(|sub| sub.by_host.values().map(PathTrie::len).sum::<usize>() + sub.regex_list.len())
			.sum()
	}

	pub fn insert(&mut self, rule: RemapRule) -> Result<(), InsertError> {
		let kind = rule.kind;
		let is_regex = rule.from_host_is_regex;
		let host = rule.from_url.host.clone();
		let rule = Arc::new(rule);
		let sub = self.sub_tables.entry(kind).or_default();
		if !is_regex && sub.by_host.contains_key(&host) {
			// Duplicate exact host insertion at the identical path is a
			// parse error; same host with a different path is fine since
			// the trie discriminates by path. We only reject an exact
			// collision at the same path+scheme+port, which the trie
			// itself would silently overwrite, so check here.
			let existing_exact = sub
				.by_host
				.get(&host)
				.map(|t| t.longest_prefix_match(&rule.from_url.path, rule.from_url.scheme, rule.from_url.effective_port()))
				.flatten();
			if let Some(existing) = existing_exact {
				if existing.from_url.path == rule.from_url.path {
					return Err(InsertError::DuplicateExact(host));
				}
			}
		}
		sub.insert(rule)
	}

	/// Implements spec §4.4's lookup algorithm against a single sub-table
	/// (callers pick which `kind` table to search, e.g. forward vs reverse).
	pub fn lookup(
		&self,
		kind: RemapKind,
		request_url: &Url,
		rank_ceiling: Option<u32>,
	) -> Option<LookupHit> {
		let sub = self.sub_tables.get(&kind)?;
		let request_port = request_url.effective_port();
		let mut rank_ceiling = rank_ceiling;
		let mut exact_hit: Option<Arc<RemapRule>> = None;

		if let Some(trie) = sub.by_host.get(&request_url.host) {
			if let Some(hit) = trie.longest_prefix_match(&request_url.path, request_url.scheme, request_port) {
				rank_ceiling = Some(hit.rank);
				exact_hit = Some(hit);
			}
		}

		let mut regex_hit: Option<(Arc<RemapRule>, Url)> = None;
		for candidate in &sub.regex_list {
			if let Some(ceiling) = rank_ceiling {
				if candidate.rank > ceiling {
					break;
				}
			}
			if candidate.from_url.scheme.is_some() && candidate.from_url.scheme != request_url.scheme {
				continue;
			}
			if candidate.from_url.effective_port() != request_port {
				continue;
			}
			if !request_url.path.as_bytes().starts_with(candidate.from_url.path.as_bytes()) {
				continue;
			}
			let Some(regex) = &candidate.compiled_regex else { continue };
			if let Some(captures) = regex.captures(&request_url.host) {
				let new_host = candidate.expand_target_host(&captures);
				let mut materialised = candidate.to_url.clone();
				materialised.host = new_host;
				regex_hit = Some((candidate.clone(), materialised));
				break;
			}
		}

		match (exact_hit, regex_hit) {
			(Some(exact), Some((regex_rule, url))) => {
				if regex_rule.rank < exact.rank {
					Some(LookupHit { rule: regex_rule, materialised_to_url: Some(url) })
				} else {
					Some(LookupHit { rule: exact, materialised_to_url: None })
				}
			},
			(Some(exact), None) => Some(LookupHit { rule: exact, materialised_to_url: None }),
			(None, Some((regex_rule, url))) => Some(LookupHit { rule: regex_rule, materialised_to_url: Some(url) }),
			(None, None) => None,
		}
	}

	/// Applies a matched rule's rewrite to `request_url` in place (spec
	/// §4.4 "URL rewrite application"). `to_url_override` is the
	/// materialised target URL for regex hits; `None` uses `rule.to_url`
	/// verbatim.
	pub fn apply_rewrite(rule: &RemapRule, to_url_override: Option<&Url>, request_url: &mut Url, is_connect: bool) {
		let to_url = to_url_override.unwrap_or(&rule.to_url);
		request_url.host = to_url.host.clone();
		request_url.port = to_url.port;
		if !is_connect {
			if let Some(scheme) = to_url.scheme {
				request_url.scheme = Some(scheme);
			}
		}

		let from_len = rule.from_url.path.len();
		let suffix = if request_url.path.len() >= from_len {
			&request_url.path[from_len..]
		} else {
			""
		};
		let mut new_path = to_url.path.clone();
		let needs_sep = !new_path.ends_with('/') && !suffix.starts_with('/') && !suffix.is_empty();
		if needs_sep {
			new_path.push('/');
		}
		if new_path.ends_with('/') && suffix.starts_with('/') {
			new_path.push_str(&suffix[1..]);
		} else {
			new_path.push_str(suffix);
		}
		request_url.path = new_path;
		// query and fragment are untouched.
	}

	/// Reverse-maps one of `{Location, Content-Location, URI, Destination}`.
	/// Returns `Some(rewritten)` if the reverse sub-table matched.
	/// `is_location` controls whether this invocation is allowed to signal
	/// "a reverse map fired" to the caller; only `Location` does.
	pub fn reverse_map(&self, header_value: &str, is_location: bool) -> Option<(Url, bool)> {
		let url = Url::parse(header_value, false).ok()?;
		let hit = self.lookup(RemapKind::Reverse, &url, None)?;
		let mut rewritten = url;
		Self::apply_rewrite(&hit.rule, hit.materialised_to_url.as_ref(), &mut rewritten, false);
		Some((rewritten, is_location))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::remap::rule::RemapKind;

	fn make_rule(kind: RemapKind, from: &str, to: &str, rank: u32) -> RemapRule {
		RemapRule::new(kind, Url::parse(from, false).unwrap(), Url::parse(to, false).unwrap(), rank)
	}

	// E1
	#[test]
	fn forward_exact_host_rewrite() {
		let mut table = RemapTable::new();
		table
			.insert(make_rule(RemapKind::Forward, "http://a.example/foo/", "http://backend/bar/", 1))
			.unwrap();
		let mut req = Url::parse("http://a.example/foo/index.html", false).unwrap();
		let hit = table.lookup(RemapKind::Forward, &req, None).unwrap();
		RemapTable::apply_rewrite(&hit.rule, hit.materialised_to_url.as_ref(), &mut req, false);
		assert_eq!(req.host, "backend");
		assert_eq!(req.path, "/bar/index.html");
	}

	// E2
	#[test]
	fn regex_capture_rewrite() {
		use crate::remap::parser::compile_regex_rule;
		let mut rule = make_rule(RemapKind::Forward, "http://(a|b)\\.example/", "http://$1.backend/", 1);
		compile_regex_rule(&mut rule).unwrap();
		let mut table = RemapTable::new();
		table.insert(rule).unwrap();

		let mut req = Url::parse("http://b.example/", false).unwrap();
		let hit = table.lookup(RemapKind::Forward, &req, None).unwrap();
		RemapTable::apply_rewrite(&hit.rule, hit.materialised_to_url.as_ref(), &mut req, false);
		assert_eq!(req.host, "b.backend");
	}

	#[test]
	fn reverse_round_trip() {
		let mut forward = RemapTable::new();
		forward
			.insert(make_rule(RemapKind::Forward, "http://a.example/", "http://backend/", 1))
			.unwrap();
		let mut req = Url::parse("http://a.example/x", false).unwrap();
		let hit = forward.lookup(RemapKind::Forward, &req, None).unwrap();
		RemapTable::apply_rewrite(&hit.rule, hit.materialised_to_url.as_ref(), &mut req, false);

		let mut reverse = RemapTable::new();
		reverse
			.insert(make_rule(RemapKind::Reverse, "http://backend/", "http://a.example/", 1))
			.unwrap();
		let (rewritten, is_location) = reverse.reverse_map(&req.to_string(), true).unwrap();
		assert_eq!(rewritten.host, "a.example");
		assert!(is_location);
	}

	#[test]
	fn regex_wins_only_when_strictly_lower_rank() {
		use crate::remap::parser::compile_regex_rule;
		let mut table = RemapTable::new();
		table
			.insert(make_rule(RemapKind::Forward, "http://a.example/", "http://exact-backend/", 2))
			.unwrap();
		let mut regex_rule = make_rule(RemapKind::Forward, "http://a\\.example/", "http://regex-backend/", 1);
		compile_regex_rule(&mut regex_rule).unwrap();
		table.insert(regex_rule).unwrap();

		let req = Url::parse("http://a.example/", false).unwrap();
		let hit = table.lookup(RemapKind::Forward, &req, None).unwrap();
		assert_eq!(hit.materialised_to_url.unwrap().host, "regex-backend");
	}

	#[test]
	fn rule_count_spans_exact_and_regex_sub_tables() {
		use crate::remap::parser::compile_regex_rule;
		let mut table = RemapTable::new();
		table
			.insert(make_rule(RemapKind::Forward, "http://a.example/", "http://backend/", 1))
			.unwrap();
		table
			.insert(make_rule(RemapKind::Forward, "http://a.example/foo/", "http://backend2/", 2))
			.unwrap();
		let mut regex_rule = make_rule(RemapKind::Forward, "http://b\\.example/", "http://backend3/", 3);
		compile_regex_rule(&mut regex_rule).unwrap();
		table.insert(regex_rule).unwrap();
		assert_eq!(table.rule_count(), 3);
	}
}
