//! Access-control predicates attached to remap rules (C2) and the per-request
//! evaluator that walks them (C9).
//!
//! The evaluator's behaviour is split by [`Policy`]: `Legacy` always lets
//! every rule vote and always defers the final word to the IP-allow file;
//! `Modern` stops at the first rule whose IP and method predicates both
//! match and skips the IP-allow file in that case.

use std::net::IpAddr;

use ipnet::IpNet;

mod evaluator;
mod parse;

pub use evaluator::{AclEvaluator, IpAllowFile, RequestContext};
pub use parse::{ActionError, parse_action};

/// Upper bound mirroring the source's `MAX_SRC_IP` / `MAX_IN_IP` constants;
/// the parser rejects configs that would need more predicates than this.
pub const MAX_SRC_IP: usize = 16;
pub const MAX_IN_IP: usize = 16;

/// `acl_behavior_policy` process-wide knob (see spec §4.2 / §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Policy {
	Legacy,
	#[default]
	Modern,
}

/// An `{ip_or_all, invert}` predicate over a source/inbound address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpPredicate {
	pub range: IpRangeOrAll,
	pub invert: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpRangeOrAll {
	All,
	Range(IpNet),
}

impl IpRangeOrAll {
	pub fn contains(&self, addr: IpAddr) -> bool {
		match self {
			IpRangeOrAll::All => true,
			IpRangeOrAll::Range(net) => net.contains(&addr),
		}
	}
}

impl IpPredicate {
	pub fn matches(&self, addr: IpAddr) -> bool {
		self.range.contains(addr) != self.invert
	}
}

/// `{category_name, invert}`; categories are resolved externally against an
/// `IpAllowFile`-style registry, not stored as ranges here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpCategoryPredicate {
	pub category: String,
	pub invert: bool,
}

/// `{allow_flag, add_flag}` decoded from an `@action=` token (see the table
/// in spec §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
	pub allow_flag: bool,
	pub add_flag: bool,
}

/// One entry in a filter's chain.
#[derive(Clone, Debug, Default)]
pub struct AclRule {
	pub method_restriction_enabled: bool,
	/// Bitset over well-known method indices (see [`crate::remap::method`]).
	pub method_bitset: u32,
	pub nonstandard_methods: std::collections::HashSet<String>,
	pub src_ip: Vec<IpPredicate>,
	pub src_ip_category: Vec<IpCategoryPredicate>,
	pub in_ip: Vec<IpPredicate>,
	pub internal: bool,
	pub add_flag: bool,
	pub allow_flag: bool,
}

impl AclRule {
	/// An `AclRule` with no source-IP predicates of any kind behaves as if a
	/// single `match_all` predicate were present (spec §3 invariant).
	fn ip_matches(&self, ctx: &RequestContext, ip_allow: &dyn IpAllowFile) -> bool {
		if self.src_ip.is_empty() && self.src_ip_category.is_empty() && self.in_ip.is_empty() && !self.internal {
			return true;
		}
		let src_ok = self.src_ip.iter().all(|p| p.matches(ctx.peer_addr));
		let cat_ok = self
			.src_ip_category
			.iter()
			.all(|p| ip_allow.category_matches(&p.category, ctx.peer_addr) != p.invert);
		let in_ok = self.in_ip.iter().all(|p| p.matches(ctx.local_addr));
		let internal_ok = !self.internal || ctx.is_internal;
		src_ok && cat_ok && in_ok && internal_ok
	}

	fn method_matches(&self, ctx: &RequestContext) -> bool {
		if !self.method_restriction_enabled {
			return true;
		}
		if ctx.method_idx >= 0 {
			(self.method_bitset & (1 << ctx.method_idx)) != 0
		} else {
			self.nonstandard_methods.contains(ctx.method_token)
		}
	}
}

/// An ordered list of [`AclRule`], optionally named (named filters are
/// defined once via `.definefilter` and referenced via `.activatefilter`).
#[derive(Clone, Debug, Default)]
pub struct AclFilter {
	pub name: Option<String>,
	pub rules: Vec<AclRule>,
}

impl AclFilter {
	pub fn anonymous(rules: Vec<AclRule>) -> Self {
		AclFilter { name: None, rules }
	}
}
