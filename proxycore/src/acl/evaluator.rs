use std::net::IpAddr;

use super::{AclFilter, Policy};

/// External IP-allow-file lookup. Out of scope to implement (spec §1); the
/// core only needs to consult it through this seam.
pub trait IpAllowFile: Send + Sync {
	/// Final verdict from the allow file for this peer, consulted when no
	/// filter rule claims the request first (or always, under `Legacy`).
	fn allows(&self, peer_addr: IpAddr) -> bool;

	/// Whether `peer_addr` belongs to the named IP category.
	fn category_matches(&self, category: &str, peer_addr: IpAddr) -> bool;
}

/// A no-op allow file that admits everything; useful when a listener has no
/// IP-allow file configured at all.
pub struct AllowAll;

impl IpAllowFile for AllowAll {
	fn allows(&self, _peer_addr: IpAddr) -> bool {
		true
	}

	fn category_matches(&self, _category: &str, _peer_addr: IpAddr) -> bool {
		false
	}
}

/// Per-request inputs to the evaluator (spec §4.2).
pub struct RequestContext<'a> {
	pub peer_addr: IpAddr,
	pub local_addr: IpAddr,
	pub is_internal: bool,
	pub method_idx: i32,
	pub method_token: &'a str,
}

/// Walks a rule's filter chain plus the global IP-allow file under a
/// configurable policy (spec §4.2, C9).
pub struct AclEvaluator {
	pub policy: Policy,
}

impl AclEvaluator {
	pub fn new(policy: Policy) -> Self {
		AclEvaluator { policy }
	}

	/// `filters` is the ordered chain attached to the matched remap rule
	/// (named filters already expanded in file order, then the rule's own
	/// inline filter last).
	pub fn evaluate(&self, filters: &[AclFilter], ctx: &RequestContext, ip_allow: &dyn IpAllowFile) -> bool {
		let mut allowed = true;
		let mut skip_ip_allow_file = false;

		'outer: for filter in filters {
			for rule in &filter.rules {
				let ip_matches = rule.ip_matches(ctx, ip_allow);
				let method_matches = rule.method_matches(ctx);
				match self.policy {
					Policy::Legacy => {
						allowed = if ip_matches && method_matches { rule.allow_flag } else { !rule.allow_flag };
						// skip_ip_allow_file is never set in Legacy mode: the
						// ip-allow file always gets final say (see spec §9
						// open question).
					},
					Policy::Modern => {
						if ip_matches && method_matches {
							allowed = rule.allow_flag;
							skip_ip_allow_file = true;
							break 'outer;
						} else if ip_matches && !method_matches && !rule.add_flag {
							allowed = !rule.allow_flag;
							skip_ip_allow_file = true;
							break 'outer;
						}
						// else: fall through to the next filter rule.
					},
				}
			}
		}

		if !skip_ip_allow_file {
			allowed = allowed && ip_allow.allows(ctx.peer_addr);
		}
		allowed
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;
	use crate::acl::{AclRule, IpPredicate, IpRangeOrAll};

	fn ctx(peer: &str, method_idx: i32) -> RequestContext<'static> {
		RequestContext {
			peer_addr: peer.parse().unwrap(),
			local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			is_internal: false,
			method_idx,
			method_token: "GET",
		}
	}

	fn rule(cidr: &str, method_idx_allowed: Option<i32>, allow_flag: bool, add_flag: bool) -> AclRule {
		AclRule {
			method_restriction_enabled: method_idx_allowed.is_some(),
			method_bitset: method_idx_allowed.map(|i| 1u32 << i).unwrap_or(0),
			src_ip: vec![IpPredicate {
				range: IpRangeOrAll::Range(cidr.parse().unwrap()),
				invert: false,
			}],
			allow_flag,
			add_flag,
			..Default::default()
		}
	}

	// E3: modern, ip doesn't match any rule, falls through to ip_allow file.
	#[test]
	fn modern_falls_through_to_ip_allow_file() {
		let eval = AclEvaluator::new(Policy::Modern);
		let filter = AclFilter::anonymous(vec![rule("10.0.0.0/8", Some(0), true, false)]);
		let c = ctx("192.0.2.1", 0);
		struct DenyAll;
		impl IpAllowFile for DenyAll {
			fn allows(&self, _: IpAddr) -> bool {
				false
			}
			fn category_matches(&self, _: &str, _: IpAddr) -> bool {
				false
			}
		}
		assert!(!eval.evaluate(&[filter], &c, &DenyAll));
	}

	// E4: modern, ip matches but method doesn't, add_flag=false -> deny, skip ip_allow.
	#[test]
	fn modern_add_flag_false_denies_and_skips_ip_allow() {
		let eval = AclEvaluator::new(Policy::Modern);
		let filter = AclFilter::anonymous(vec![rule("10.0.0.0/8", Some(0), true, false)]);
		let c = ctx("10.1.1.1", 3); // POST, not GET(0)
		assert!(!eval.evaluate(&[filter], &c, &AllowAll));
	}

	#[test]
	fn modern_matching_rule_wins_immediately() {
		let eval = AclEvaluator::new(Policy::Modern);
		let filter = AclFilter::anonymous(vec![rule("10.0.0.0/8", Some(0), true, false)]);
		let c = ctx("10.1.1.1", 0);
		assert!(eval.evaluate(&[filter], &c, &AllowAll));
	}

	#[test]
	fn legacy_always_consults_ip_allow_file() {
		let eval = AclEvaluator::new(Policy::Legacy);
		let filter = AclFilter::anonymous(vec![rule("10.0.0.0/8", None, true, true)]);
		let c = ctx("10.1.1.1", 0);
		struct DenyAll;
		impl IpAllowFile for DenyAll {
			fn allows(&self, _: IpAddr) -> bool {
				false
			}
			fn category_matches(&self, _: &str, _: IpAddr) -> bool {
				false
			}
		}
		// rule allows, but legacy mode ANDs with ip_allow regardless.
		assert!(!eval.evaluate(&[filter], &c, &DenyAll));
	}

	#[test]
	fn empty_predicate_group_matches_all() {
		let eval = AclEvaluator::new(Policy::Modern);
		let r = AclRule {
			allow_flag: false,
			add_flag: true,
			..Default::default()
		};
		let filter = AclFilter::anonymous(vec![r]);
		let c = ctx("203.0.113.1", 0);
		assert!(!eval.evaluate(&[filter], &c, &AllowAll));
	}
}
