use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;

use crate::acl::AclFilter;
use crate::url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemapKind {
	Forward,
	ForwardReferer,
	ForwardRecvPort,
	Reverse,
	PermRedirect,
	TempRedirect,
}

/// One `(marker_offset, capture_id)` pair extracted from a `$N` placeholder
/// in a regex rule's target host template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPlaceholder {
	pub marker_offset: usize,
	pub capture_id: u8,
}

#[derive(Clone, Debug)]
pub struct RefererPredicate {
	pub regex: Regex,
	pub negated: bool,
	pub any: bool,
}

/// Opaque handle to a loaded remap plugin. Plugin execution is out of
/// scope (spec §1); the core only tracks instances and their parameters.
#[derive(Clone, Debug)]
pub struct PluginInstance {
	pub path: String,
	pub params: Vec<String>,
}

/// An owned node in a [`crate::remap::table::RemapTable`] (spec §3, C3).
///
/// `Clone` resets `hit_count`: cloning only happens for tunnel-scheme
/// per-address expansion (spec §4.3 step 7) where each clone is a distinct
/// table entry that should start counting fresh.
#[derive(Debug)]
pub struct RemapRule {
	pub kind: RemapKind,
	pub from_url: Url,
	pub to_url: Url,

	pub from_host_is_regex: bool,
	pub compiled_regex: Option<Regex>,
	pub host_placeholders: Vec<HostPlaceholder>,

	pub wildcard_from_scheme: bool,
	pub home_page_redirect: bool,
	pub tag: Option<String>,

	pub referer_predicates: Vec<RefererPredicate>,
	pub optional_referer: bool,
	pub negative_referer: bool,
	pub redirect_url_chunks: Option<String>,

	pub filters: Vec<AclFilter>,
	pub plugins: Vec<PluginInstance>,

	pub ip_allow_check_enabled: bool,
	pub rank: u32,
	pub map_id: Option<u32>,
	pub unique: bool,

	hit_count: AtomicU64,
}

impl RemapRule {
	pub fn new(kind: RemapKind, from_url: Url, to_url: Url, rank: u32) -> Self {
		let home_page_redirect = !from_url.path_is_empty() && to_url.path_is_empty();
		RemapRule {
			kind,
			from_url,
			to_url,
			from_host_is_regex: false,
			compiled_regex: None,
			host_placeholders: Vec::new(),
			wildcard_from_scheme: false,
			home_page_redirect,
			tag: None,
			referer_predicates: Vec::new(),
			optional_referer: false,
			negative_referer: false,
			redirect_url_chunks: None,
			filters: Vec::new(),
			plugins: Vec::new(),
			ip_allow_check_enabled: false,
			rank,
			map_id: None,
			unique: false,
			hit_count: AtomicU64::new(0),
		}
	}

	pub fn record_hit(&self) {
		self.hit_count.fetch_add(1, Ordering::Relaxed);
	}

	pub fn hit_count(&self) -> u64 {
		self.hit_count.load(Ordering::Relaxed)
	}

	/// Expands `$N` placeholders in the target host template against
	/// `captures`, producing the materialised target host for a regex rule
	/// match (spec §4.4).
	pub fn expand_target_host(&self, captures: &regex::Captures) -> String {
		let template = &self.to_url.host;
		if self.host_placeholders.is_empty() {
			return template.clone();
		}
		let mut out = String::with_capacity(template.len());
		let mut last = 0;
		for ph in &self.host_placeholders {
			out.push_str(&template[last..ph.marker_offset]);
			if let Some(m) = captures.get(ph.capture_id as usize) {
				out.push_str(m.as_str());
			}
			last = ph.marker_offset + 2; // "$N"
		}
		out.push_str(&template[last..]);
		out
	}
}

impl Clone for RemapRule {
	fn clone(&self) -> Self {
		RemapRule {
			kind: self.kind,
			from_url: self.from_url.clone(),
			to_url: self.to_url.clone(),
			from_host_is_regex: self.from_host_is_regex,
			compiled_regex: self.compiled_regex.clone(),
			host_placeholders: self.host_placeholders.clone(),
			wildcard_from_scheme: self.wildcard_from_scheme,
			home_page_redirect: self.home_page_redirect,
			tag: self.tag.clone(),
			referer_predicates: self.referer_predicates.clone(),
			optional_referer: self.optional_referer,
			negative_referer: self.negative_referer,
			redirect_url_chunks: self.redirect_url_chunks.clone(),
			filters: self.filters.clone(),
			plugins: self.plugins.clone(),
			ip_allow_check_enabled: self.ip_allow_check_enabled,
			rank: self.rank,
			map_id: self.map_id,
			unique: self.unique,
			hit_count: AtomicU64::new(0),
		}
	}
}
