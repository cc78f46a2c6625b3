//! Reads `remap.config` text into a [`RemapTable`] (spec §4.3, C5).
//!
//! DNS resolution for tunnel-scheme rules (step 7) is delegated to a
//! [`DnsResolve`] implementor; actual resolution is out of scope for this
//! core (spec §1) so the default resolver here is a no-op.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::acl::{self, AclFilter, AclRule, IpCategoryPredicate, IpPredicate, IpRangeOrAll, Policy};
use crate::remap::method::method_idx;
use crate::remap::rule::{HostPlaceholder, PluginInstance, RemapKind, RemapRule};
use crate::remap::table::{InsertError, RemapTable};
use crate::url::{Scheme, Url, UrlParseError};

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
	#[error("{file}:{line}: {reason}")]
	Line { file: String, line: usize, reason: String },
	#[error("io error reading {0:?}: {1}")]
	Io(PathBuf, std::io::Error),
	#[error("duplicate insertion: {0}")]
	Insert(#[from] InsertError),
}

/// Hook for resolving tunnel-scheme hosts to additional per-address rules
/// (spec §4.3 step 7). Out of scope to implement; default is a no-op.
pub trait DnsResolve {
	fn resolve(&self, host: &str) -> Vec<IpAddr> {
		let _ = host;
		Vec::new()
	}
}

pub struct NoDnsResolve;
impl DnsResolve for NoDnsResolve {}

struct ParserState {
	policy: Policy,
	named_filters: HashMap<String, AclFilter>,
	active_filter_names: Vec<String>,
	ip_allow_active: bool,
	rank_counter: u32,
}

pub struct RemapConfigParser<'a> {
	state: ParserState,
	dns: &'a dyn DnsResolve,
}

impl<'a> RemapConfigParser<'a> {
	pub fn new(policy: Policy) -> Self {
		RemapConfigParser {
			state: ParserState {
				policy,
				named_filters: HashMap::new(),
				active_filter_names: Vec::new(),
				ip_allow_active: false,
				rank_counter: 0,
			},
			dns: &NoDnsResolve,
		}
	}

	pub fn with_dns(mut self, dns: &'a dyn DnsResolve) -> Self {
		self.dns = dns;
		self
	}

	pub fn parse_str(&mut self, text: &str, file: &str) -> Result<RemapTable, ParseError> {
		let mut table = RemapTable::new();
		self.parse_into(text, file, &mut table)?;
		Ok(table)
	}

	/// Reads `path` and parses it as a top-level `remap.config` (spec §6).
	pub fn parse_file(&mut self, path: &Path) -> Result<RemapTable, ParseError> {
		let text = fs_err::read_to_string(path).map_err(|e| ParseError::Io(path.to_path_buf(), e.into()))?;
		self.parse_str(&text, &path.to_string_lossy())
	}

	fn parse_into(&mut self, text: &str, file: &str, table: &mut RemapTable) -> Result<(), ParseError> {
		for (line_no, raw) in join_continuations(text) {
			let trimmed = raw.trim();
			if trimmed.is_empty() || trimmed.starts_with('#') {
				continue;
			}
			if trimmed.starts_with('.') {
				self.parse_directive(trimmed, file, line_no, table)?;
			} else {
				self.parse_rule_line(trimmed, file, line_no, table)?;
			}
		}
		Ok(())
	}

	fn parse_directive(&mut self, line: &str, file: &str, line_no: usize, table: &mut RemapTable) -> Result<(), ParseError> {
		let mut toks = tokenize(line);
		let directive = toks.remove(0);
		match directive {
			".definefilter" => {
				if toks.is_empty() {
					return Err(err(file, line_no, "missing filter name"));
				}
				let name = toks.remove(0).to_string();
				let rule = parse_filter_options(&toks, self.state.policy, file, line_no)?;
				self.state.named_filters.insert(name.clone(), AclFilter { name: Some(name), rules: vec![rule] });
			},
			".activatefilter" => {
				let name = toks.first().ok_or_else(|| err(file, line_no, "missing filter name"))?;
				if *name == "ip_allow" {
					self.state.ip_allow_active = true;
				} else if !self.state.named_filters.contains_key(*name) {
					return Err(err(file, line_no, format!("undefined filter {name:?}")));
				} else {
					self.state.active_filter_names.push(name.to_string());
				}
			},
			".deactivatefilter" => {
				let name = toks.first().ok_or_else(|| err(file, line_no, "missing filter name"))?;
				if *name == "ip_allow" {
					self.state.ip_allow_active = false;
				} else {
					self.state.active_filter_names.retain(|n| n != name);
				}
			},
			".deletefilter" => {
				let name = toks.first().ok_or_else(|| err(file, line_no, "missing filter name"))?;
				self.state.named_filters.remove(*name);
			},
			".include" => {
				let path = toks.first().ok_or_else(|| err(file, line_no, "missing include path"))?;
				self.include(Path::new(path), table)?;
			},
			other => return Err(err(file, line_no, format!("unknown directive {other:?}"))),
		}
		Ok(())
	}

	/// `.include` inherits the parent's named-filter table but parses the
	/// included text(s) into a fresh builder state otherwise (spec §4.3).
	fn include(&mut self, path: &Path, table: &mut RemapTable) -> Result<(), ParseError> {
		let mut files = Vec::new();
		if path.is_dir() {
			let mut entries: Vec<_> = std::fs::read_dir(path)
				.map_err(|e| ParseError::Io(path.to_path_buf(), e))?
				.filter_map(|e| e.ok())
				.map(|e| e.path())
				.filter(|p| p.is_file())
				.collect();
			entries.sort();
			files.extend(entries);
		} else {
			files.push(path.to_path_buf());
		}
		for file_path in files {
			let text = std::fs::read_to_string(&file_path).map_err(|e| ParseError::Io(file_path.clone(), e))?;
			let mut child = ParserState {
				policy: self.state.policy,
				named_filters: self.state.named_filters.clone(),
				active_filter_names: Vec::new(),
				ip_allow_active: self.state.ip_allow_active,
				rank_counter: self.state.rank_counter,
			};
			std::mem::swap(&mut self.state, &mut child);
			let result = self.parse_into(&text, &file_path.to_string_lossy(), table);
			let rank_after = self.state.rank_counter;
			std::mem::swap(&mut self.state, &mut child);
			self.state.rank_counter = rank_after;
			result?;
		}
		Ok(())
	}

	fn parse_rule_line(&mut self, line: &str, file: &str, line_no: usize, table: &mut RemapTable) -> Result<(), ParseError> {
		let toks = tokenize(line);
		let (positional, options): (Vec<&str>, Vec<&str>) = toks.into_iter().partition(|t| !t.starts_with('@'));
		if positional.len() < 3 {
			return Err(err(file, line_no, "expected: <kind> <from_url> <to_url> [...]"));
		}
		let kind_tok = positional[0];
		let (kind, is_regex) = parse_kind(kind_tok).ok_or_else(|| err(file, line_no, format!("unknown rule kind {kind_tok:?}")))?;

		let mut from_raw = positional[1].to_string();
		let unique = from_raw.ends_with("//");
		if unique {
			from_raw.truncate(from_raw.len() - 1);
		}
		if let Some(idx) = from_raw.find("://") {
			if !from_raw[idx + 3..].contains('/') {
				from_raw.push('/');
			}
		}

		let mut from_url = Url::parse(&from_raw, is_regex).map_err(|e| err(file, line_no, e.to_string()))?;
		// `regex_host = true` here only suppresses the from-host regex syntax
		// from failing scheme/host validation (step 2, "ignoring
		// host-check"); the target's host and scheme are still required
		// below, independently of that suppression.
		let to_url = Url::parse(positional[2], true).map_err(|e| err(file, line_no, e.to_string()))?;

		let mut wildcard_from_scheme = false;
		if from_url.scheme.is_none() && !is_regex {
			from_url.scheme = Some(Scheme::Http);
			wildcard_from_scheme = true;
		}

		// spec §3 invariant: "a rule's to_url.host is non-empty".
		if to_url.host.is_empty() {
			return Err(err(file, line_no, format!("target url {:?} has an empty host", positional[2])));
		}
		// spec §4.3 step 4: target scheme must be in the allowed set. With
		// `regex_host = true`, `Url::parse` returns `scheme: None` instead of
		// erroring on an unrecognised scheme token, so that case has to be
		// rejected here explicitly rather than relying on `Url::parse` alone.
		let to_scheme = to_url
			.scheme
			.ok_or_else(|| err(file, line_no, format!("target url {:?} has an unrecognised scheme", positional[2])))?;
		if let Some(fs) = from_url.scheme {
			validate_scheme_pairing(fs, to_scheme).map_err(|e| err(file, line_no, e))?;
		}

		from_url.host = from_url.host.to_ascii_lowercase();

		let mut rule = RemapRule::new(kind, from_url, to_url.clone(), self.next_rank());
		rule.wildcard_from_scheme = wildcard_from_scheme;
		rule.unique = unique;
		rule.from_host_is_regex = is_regex;
		if matches!(kind, RemapKind::PermRedirect | RemapKind::TempRedirect | RemapKind::ForwardReferer) && positional.len() > 3 {
			rule.redirect_url_chunks = Some(positional[3].to_string());
		} else if positional.len() > 3 {
			rule.tag = Some(positional[3].to_string());
		}
		if kind == RemapKind::ForwardReferer {
			for raw in positional.iter().skip(4) {
				parse_referer_predicate(raw, &mut rule).map_err(|e| err(file, line_no, e))?;
			}
		}

		if is_regex {
			compile_regex_rule(&mut rule).map_err(|e| err(file, line_no, e))?;
		}

		let mut inline_rule = AclRule::default();
		let mut saw_action = false;
		let mut current_plugin: Option<PluginInstance> = None;
		for opt in &options {
			let (key, value) = split_option(opt);
			match key {
				"method" => {
					inline_rule.method_restriction_enabled = true;
					match method_idx(value) {
						-1 => {
							inline_rule.nonstandard_methods.insert(value.to_string());
						},
						idx => inline_rule.method_bitset |= 1 << idx,
					}
				},
				"src_ip" | "src_ip~" => {
					let invert = key.ends_with('~');
					inline_rule.src_ip.push(parse_ip_predicate(value, invert).map_err(|e| err(file, line_no, e))?);
				},
				"src_ip_category" | "src_ip_category~" => {
					let invert = key.ends_with('~');
					inline_rule.src_ip_category.push(IpCategoryPredicate { category: value.to_string(), invert });
				},
				"in_ip" | "in_ip~" => {
					let invert = key.ends_with('~');
					inline_rule.in_ip.push(parse_ip_predicate(value, invert).map_err(|e| err(file, line_no, e))?);
				},
				"action" => {
					if saw_action {
						if self.state.policy == Policy::Legacy {
							// last one wins (spec §9 open question)
						} else {
							return Err(err(file, line_no, "multiple @action= on one rule"));
						}
					}
					saw_action = true;
					let action = acl::parse_action(value, self.state.policy).map_err(|e| err(file, line_no, e.to_string()))?;
					inline_rule.allow_flag = action.allow_flag;
					inline_rule.add_flag = action.add_flag;
				},
				"mapid" => {
					rule.map_id = Some(value.parse().map_err(|_| err(file, line_no, format!("invalid mapid {value:?}")))?);
				},
				"internal" => inline_rule.internal = true,
				"map_with_referer" => {},
				"strategy" => {},
				"plugin" => {
					if let Some(p) = current_plugin.take() {
						rule.plugins.push(p);
					}
					current_plugin = Some(PluginInstance { path: value.to_string(), params: Vec::new() });
				},
				"pparam" => {
					if let Some(p) = current_plugin.as_mut() {
						p.params.push(value.to_string());
					}
				},
				other => {
					tracing::warn!(option = other, "unrecognised @option, ignoring");
				},
			}
		}
		if let Some(p) = current_plugin.take() {
			rule.plugins.push(p);
		}

		rule.ip_allow_check_enabled = self.state.ip_allow_active;
		for name in &self.state.active_filter_names {
			if let Some(f) = self.state.named_filters.get(name) {
				rule.filters.push(f.clone());
			}
		}
		rule.filters.push(AclFilter::anonymous(vec![inline_rule]));

		if let RemapKind::Forward = kind {
			if rule.from_url.scheme == Some(Scheme::Tunnel) && rule.from_url.host.parse::<IpAddr>().is_err() {
				for addr in self.dns.resolve(&rule.from_url.host) {
					let mut resolved = rule.clone();
					resolved.from_url.host = addr.to_string();
					table.insert(resolved)?;
				}
			}
		}

		table.insert(rule)?;
		Ok(())
	}

	fn next_rank(&mut self) -> u32 {
		self.state.rank_counter += 1;
		self.state.rank_counter
	}
}

fn err(file: &str, line: usize, reason: impl Into<String>) -> ParseError {
	ParseError::Line { file: file.to_string(), line, reason: reason.into() }
}

fn validate_scheme_pairing(from: Scheme, to: Scheme) -> Result<(), String> {
	match from {
		Scheme::Ws | Scheme::Wss if !matches!(to, Scheme::Ws | Scheme::Wss) => {
			Err("ws/wss source requires ws/wss target".to_string())
		},
		_ => Ok(()),
	}
}

fn parse_kind(tok: &str) -> Option<(RemapKind, bool)> {
	let (base, is_regex) = match tok.strip_prefix("regex_") {
		Some(rest) => (rest, true),
		None => (tok, false),
	};
	let kind = match base {
		"map" => RemapKind::Forward,
		"reverse_map" => RemapKind::Reverse,
		"redirect" => RemapKind::PermRedirect,
		"redirect_temporary" => RemapKind::TempRedirect,
		"map_with_referer" => RemapKind::ForwardReferer,
		"map_with_recv_port" => RemapKind::ForwardRecvPort,
		_ => return None,
	};
	Some((kind, is_regex))
}

/// Splits an `@key=value` or `@key~value` option body. `~` stands in for
/// `=` with inverted-predicate meaning (spec §4.3 `src_ip[=~]`) and is kept
/// as part of the returned key (`"src_ip~"`) so callers can dispatch on it;
/// in both forms the separator itself is exactly one byte.
fn split_option(opt: &str) -> (&str, &str) {
	let body = &opt[1..]; // strip '@'
	match body.find(['=', '~']) {
		Some(idx) => {
			let key_end = if body.as_bytes()[idx] == b'~' { idx + 1 } else { idx };
			(&body[..key_end], &body[idx + 1..])
		},
		None => (body, ""),
	}
}

/// Parses one trailing positional argument of a `map_with_referer` line
/// into the rule's referer policy, grounded on `RemapConfig.cc`'s
/// `referer_info` construction: a leading `~` negates the predicate; the
/// literal pattern `*` means "any referer"; `~*` (negated + any) means the
/// Referer header is allowed to be absent entirely rather than being
/// tracked as a regular predicate.
fn parse_referer_predicate(raw: &str, rule: &mut RemapRule) -> Result<(), String> {
	let negated = raw.starts_with('~');
	let pattern = raw.strip_prefix('~').unwrap_or(raw);
	let any = pattern == "*";

	if negated && any {
		rule.optional_referer = true;
		return Ok(());
	}
	if negated {
		rule.negative_referer = true;
	}
	let regex_src = if any { ".*" } else { pattern };
	let regex = Regex::new(regex_src).map_err(|e| format!("invalid referer regex {pattern:?}: {e}"))?;
	rule.referer_predicates.push(crate::remap::rule::RefererPredicate { regex, negated, any });
	Ok(())
}

fn parse_ip_predicate(value: &str, invert: bool) -> Result<IpPredicate, String> {
	if value == "all" {
		return Ok(IpPredicate { range: IpRangeOrAll::All, invert });
	}
	let net = if value.contains('/') {
		value.parse().map_err(|_| format!("invalid cidr {value:?}"))?
	} else {
		let ip: IpAddr = value.parse().map_err(|_| format!("invalid ip {value:?}"))?;
		ipnet::IpNet::from(ip)
	};
	Ok(IpPredicate { range: IpRangeOrAll::Range(net), invert })
}

fn parse_filter_options(toks: &[&str], policy: Policy, file: &str, line_no: usize) -> Result<AclRule, ParseError> {
	let mut rule = AclRule::default();
	for opt in toks {
		let (key, value) = split_option(opt);
		match key {
			"method" => {
				rule.method_restriction_enabled = true;
				match method_idx(value) {
					-1 => {
						rule.nonstandard_methods.insert(value.to_string());
					},
					idx => rule.method_bitset |= 1 << idx,
				}
			},
			"src_ip" | "src_ip~" => {
				let invert = key.ends_with('~');
				rule.src_ip.push(parse_ip_predicate(value, invert).map_err(|e| err(file, line_no, e))?);
			},
			"in_ip" | "in_ip~" => {
				let invert = key.ends_with('~');
				rule.in_ip.push(parse_ip_predicate(value, invert).map_err(|e| err(file, line_no, e))?);
			},
			"action" => {
				let action = acl::parse_action(value, policy).map_err(|e| err(file, line_no, e.to_string()))?;
				rule.allow_flag = action.allow_flag;
				rule.add_flag = action.add_flag;
			},
			"internal" => rule.internal = true,
			_ => {},
		}
	}
	Ok(rule)
}

/// Splits `text` into `(line_number, joined_line)` pairs, folding any line
/// ending in `\` into the next (spec §4.3 "line-continuation").
fn join_continuations(text: &str) -> Vec<(usize, String)> {
	let mut out = Vec::new();
	let mut pending = String::new();
	let mut start_line = 0usize;
	for (idx, raw) in text.lines().enumerate() {
		if pending.is_empty() {
			start_line = idx + 1;
		}
		if let Some(stripped) = raw.strip_suffix('\\') {
			pending.push_str(stripped);
			pending.push(' ');
		} else {
			pending.push_str(raw);
			out.push((start_line, std::mem::take(&mut pending)));
		}
	}
	if !pending.is_empty() {
		out.push((start_line, pending));
	}
	out
}

/// Whitespace tokenizer respecting the remap grammar's quoting-free
/// simplicity (the source's `Tokenizer` `ALLOW_SPACES` quirk only matters
/// for quoted values, which this core does not need — spec §9).
fn tokenize(line: &str) -> Vec<&str> {
	line.split_whitespace().collect()
}

/// Compiles a regex-host rule's `from_url.host` pattern and enumerates
/// `$N` placeholders in the target host template, validating each against
/// the regex's capture count (spec §4.3 step 6).
pub fn compile_regex_rule(rule: &mut RemapRule) -> Result<(), String> {
	let pattern = rule.from_url.host.clone();
	let regex = Regex::new(&pattern).map_err(|e| format!("invalid regex {pattern:?}: {e}"))?;
	let capture_count = regex.captures_len() - 1;

	let template = rule.to_url.host.clone();
	let mut placeholders = Vec::new();
	let bytes = template.as_bytes();
	let mut i = 0;
	while i + 1 < bytes.len() {
		if bytes[i] == b'$' && bytes[i + 1].is_ascii_digit() {
			let capture_id = bytes[i + 1] - b'0';
			if (capture_id as usize) > capture_count {
				return Err(format!("regex placeholder ${capture_id} exceeds capture count {capture_count}"));
			}
			placeholders.push(HostPlaceholder { marker_offset: i, capture_id });
			i += 2;
		} else {
			i += 1;
		}
	}
	rule.host_placeholders = placeholders;
	rule.compiled_regex = Some(regex);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_e1_config() {
		let cfg = "map http://a.example/foo/ http://backend/bar/\n";
		let mut parser = RemapConfigParser::new(Policy::Modern);
		let table = parser.parse_str(cfg, "remap.config").unwrap();
		let req = Url::parse("http://a.example/foo/index.html", false).unwrap();
		assert!(table.lookup(RemapKind::Forward, &req, None).is_some());
	}

	#[test]
	fn parses_named_filter_and_activation() {
		let cfg = ".definefilter denyall @action=set_deny @src_ip=all\n.activatefilter denyall\nmap http://x/ http://y/\n";
		let mut parser = RemapConfigParser::new(Policy::Modern);
		let table = parser.parse_str(cfg, "remap.config").unwrap();
		let req = Url::parse("http://x/", false).unwrap();
		let hit = table.lookup(RemapKind::Forward, &req, None).unwrap();
		assert_eq!(hit.rule.filters.len(), 2); // named filter + inline
	}

	#[test]
	fn rejects_duplicate_action_under_modern() {
		let cfg = "map http://x/ http://y/ @action=set_allow @action=set_deny\n";
		let mut parser = RemapConfigParser::new(Policy::Modern);
		assert!(parser.parse_str(cfg, "remap.config").is_err());
	}

	#[test]
	fn legacy_last_action_wins() {
		let cfg = "map http://x/ http://y/ @action=allow @action=deny\n";
		let mut parser = RemapConfigParser::new(Policy::Legacy);
		let table = parser.parse_str(cfg, "remap.config").unwrap();
		let req = Url::parse("http://x/", false).unwrap();
		let hit = table.lookup(RemapKind::Forward, &req, None).unwrap();
		let inline = &hit.rule.filters.last().unwrap().rules[0];
		assert!(!inline.allow_flag);
	}

	#[test]
	fn unique_flag_from_trailing_double_slash() {
		let cfg = "map http://x// http://y/\n";
		let mut parser = RemapConfigParser::new(Policy::Modern);
		let table = parser.parse_str(cfg, "remap.config").unwrap();
		let req = Url::parse("http://x/", false).unwrap();
		let hit = table.lookup(RemapKind::Forward, &req, None).unwrap();
		assert!(hit.rule.unique);
	}

	#[test]
	fn map_with_referer_parses_redirect_and_predicates() {
		let cfg = r#"map_with_referer http://a.example/ http://backend/ http://a.example/denied .*\.a\.example ~.*evil.example ~*
"#;
		let mut parser = RemapConfigParser::new(Policy::Modern);
		let table = parser.parse_str(cfg, "remap.config").unwrap();
		let req = Url::parse("http://a.example/", false).unwrap();
		let hit = table.lookup(RemapKind::ForwardReferer, &req, None).unwrap();
		assert_eq!(hit.rule.redirect_url_chunks.as_deref(), Some("http://a.example/denied"));
		// `.*\.a\.example` (not negated) and `~.*evil.example` (negated) both
		// become predicates; the trailing bare `~*` sets optional_referer and
		// is not added to the predicate list.
		assert_eq!(hit.rule.referer_predicates.len(), 2);
		assert!(!hit.rule.referer_predicates[0].negated);
		assert!(hit.rule.referer_predicates[1].negated);
		assert!(hit.rule.negative_referer);
		assert!(hit.rule.optional_referer);
	}

	#[test]
	fn rejects_empty_target_host() {
		let cfg = "map http://a.example/ /justpath/\n";
		let mut parser = RemapConfigParser::new(Policy::Modern);
		assert!(parser.parse_str(cfg, "remap.config").is_err());
	}

	#[test]
	fn rejects_target_scheme_outside_allowed_set() {
		let cfg = "map http://a.example/ gopher://backend/\n";
		let mut parser = RemapConfigParser::new(Policy::Modern);
		assert!(parser.parse_str(cfg, "remap.config").is_err());
	}

	#[test]
	fn allows_ws_source_with_wss_target() {
		let cfg = "map ws://a.example/ wss://backend/\n";
		let mut parser = RemapConfigParser::new(Policy::Modern);
		let table = parser.parse_str(cfg, "remap.config").unwrap();
		let req = Url::parse("ws://a.example/", false).unwrap();
		assert!(table.lookup(RemapKind::Forward, &req, None).is_some());
	}
}
