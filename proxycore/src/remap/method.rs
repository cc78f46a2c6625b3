//! Well-known HTTP method token indices, mirroring the source's fixed
//! method table so `AclRule::method_bitset` can use a plain bitset instead
//! of a hash set for the common case.

pub const METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "CONNECT", "TRACE", "PATCH"];
pub const METHODS_CNT: usize = METHODS.len();

/// Returns the well-known index for `method`, or `-1` for nonstandard
/// methods (matching the `method_idx == -1` sentinel used throughout the
/// ACL evaluator).
pub fn method_idx(method: &str) -> i32 {
	METHODS
		.iter()
		.position(|m| m.eq_ignore_ascii_case(method))
		.map(|i| i as i32)
		.unwrap_or(-1)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn known_methods_resolve() {
		assert_eq!(method_idx("GET"), 0);
		assert_eq!(method_idx("post"), 2);
	}

	#[test]
	fn unknown_method_is_negative_one() {
		assert_eq!(method_idx("PROPFIND"), -1);
	}
}
