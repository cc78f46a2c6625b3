//! Error kinds and propagation for the admission core (spec §7).

pub mod gateway;

use std::path::Path;

use http::StatusCode;

use crate::acl::Policy;
use crate::remap::{ParseError as RemapParseError, RemapConfigParser, RemapTable};

/// Every per-connection error is local to that connection; every
/// per-request error is local to that request. None of these abort the
/// process (spec §7 "Recoverable vs fatal").
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("config parse error in {file}:{line}: {reason}")]
	ConfigParseError { file: String, line: usize, reason: String },

	#[error("config load rejected: {0}")]
	ConfigLoadRejected(String),

	#[error("connection protocol error: {0}")]
	ConnectionProtocolError(String),

	#[error("acl denied the request")]
	AclDenied,

	#[error("no remap rule matched and url_remap_required is set")]
	LookupMiss,

	#[error("plugin load error: {0}")]
	PluginLoadError(String),

	#[error("config acquire miss on slot {0}")]
	ConfigAcquireMiss(usize),
}

impl ProxyError {
	/// Maps an error to the response behaviour described in spec §7.
	/// `ConfigParseError`/`ConfigLoadRejected`/`PluginLoadError` abort a
	/// config load rather than answer a request, so they have no status
	/// code; `ConnectionProtocolError` closes the connection silently.
	pub fn status_code(&self) -> Option<StatusCode> {
		match self {
			ProxyError::AclDenied => Some(StatusCode::FORBIDDEN),
			ProxyError::LookupMiss => Some(StatusCode::NOT_FOUND),
			ProxyError::ConfigParseError { .. }
			| ProxyError::ConfigLoadRejected(_)
			| ProxyError::ConnectionProtocolError(_)
			| ProxyError::PluginLoadError(_)
			| ProxyError::ConfigAcquireMiss(_) => None,
		}
	}

	/// `ConfigAcquireMiss` is the one kind that is not actually a failure
	/// from the caller's point of view — spec §7 says to treat an empty
	/// slot as "no policy" and admit with defaults.
	pub fn is_admit_with_defaults(&self) -> bool {
		matches!(self, ProxyError::ConfigAcquireMiss(_))
	}
}

impl From<RemapParseError> for ProxyError {
	fn from(value: RemapParseError) -> Self {
		match value {
			RemapParseError::Line { file, line, reason } => ProxyError::ConfigParseError { file, line, reason },
			other => ProxyError::ConfigParseError { file: String::new(), line: 0, reason: other.to_string() },
		}
	}
}

/// Loads and validates `remap.config` at `path` (spec §4.7 step 1, §6
/// "Minimum number of remap rules required for a valid configuration").
/// Rejects a configuration with fewer than `min_remap_rules` rules with
/// `ConfigLoadRejected` rather than publishing it — per spec §7, a
/// rejected load leaves any existing configuration active, so the caller
/// should simply not call `ConfigRegistry::set` on error.
pub fn load_remap_table(path: &Path, policy: Policy, min_remap_rules: usize) -> Result<RemapTable, ProxyError> {
	let table = RemapConfigParser::new(policy).parse_file(path)?;
	if table.rule_count() < min_remap_rules {
		return Err(ProxyError::ConfigLoadRejected(format!(
			"remap config has {} rules, fewer than the required minimum of {min_remap_rules}",
			table.rule_count()
		)));
	}
	Ok(table)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acl_denied_maps_to_403() {
		assert_eq!(ProxyError::AclDenied.status_code(), Some(StatusCode::FORBIDDEN));
	}

	#[test]
	fn lookup_miss_maps_to_404() {
		assert_eq!(ProxyError::LookupMiss.status_code(), Some(StatusCode::NOT_FOUND));
	}

	#[test]
	fn config_acquire_miss_admits_with_defaults() {
		assert!(ProxyError::ConfigAcquireMiss(3).is_admit_with_defaults());
	}

	#[test]
	fn rejects_config_below_min_remap_rules() {
		let path = std::env::temp_dir().join("proxycore-test-too-few-rules.config");
		std::fs::write(&path, "map http://a.example/ http://backend/\n").unwrap();
		let err = load_remap_table(&path, Policy::Modern, 2).unwrap_err();
		assert!(matches!(err, ProxyError::ConfigLoadRejected(_)));
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn accepts_config_meeting_min_remap_rules() {
		let path = std::env::temp_dir().join("proxycore-test-enough-rules.config");
		std::fs::write(&path, "map http://a.example/ http://backend/\nmap http://b.example/ http://backend2/\n").unwrap();
		let table = load_remap_table(&path, Policy::Modern, 2).unwrap();
		assert_eq!(table.rule_count(), 2);
		std::fs::remove_file(&path).ok();
	}
}
