//! Process-wide configuration keys consumed by the core (spec §6).
//!
//! Records-file parsing and process bootstrap proper are out of scope
//! (spec §1); this module only defines the typed shape those layers
//! eventually hand the core, plus a thin `serde`-based loader so the bin
//! crate has something concrete to call.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::acl::Policy;
use crate::transport::tls::AlpnToken;

fn default_accept_inactivity_timeout() -> u64 {
	10
}

fn default_min_remap_rules() -> usize {
	0
}

fn default_release_grace_secs() -> u64 {
	60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclBehaviorPolicy {
	Legacy,
	Modern,
}

impl From<AclBehaviorPolicy> for Policy {
	fn from(value: AclBehaviorPolicy) -> Self {
		match value {
			AclBehaviorPolicy::Legacy => Policy::Legacy,
			AclBehaviorPolicy::Modern => Policy::Modern,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Family {
	Inet,
	Inet6,
	Unix,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlpnPref {
	#[serde(rename = "h2")]
	H2,
	#[serde(rename = "http/1.1")]
	Http11,
	#[serde(rename = "http/1.0")]
	Http10,
}

impl From<AlpnPref> for AlpnToken {
	fn from(value: AlpnPref) -> Self {
		match value {
			AlpnPref::H2 => AlpnToken::H2,
			AlpnPref::Http11 => AlpnToken::Http11,
			AlpnPref::Http10 => AlpnToken::Http10,
		}
	}
}

/// `{family, port, local_ip?, tls?, proxy_protocol?, transparent?,
/// alpn_pref[]}` (spec §6). Unix-domain sockets reuse the same shape via
/// `unix_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerDescriptor {
	pub family: Family,
	#[serde(default)]
	pub port: u16,
	#[serde(default)]
	pub local_ip: Option<IpAddr>,
	#[serde(default)]
	pub unix_path: Option<PathBuf>,
	#[serde(default)]
	pub tls: bool,
	#[serde(default)]
	pub tls_cert_path: Option<PathBuf>,
	#[serde(default)]
	pub tls_key_path: Option<PathBuf>,
	#[serde(default)]
	pub proxy_protocol: bool,
	#[serde(default)]
	pub transparent: bool,
	#[serde(default)]
	pub alpn_pref: Vec<AlpnPref>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
	pub acl_behavior_policy: AclBehaviorPolicy,

	#[serde(default = "default_accept_inactivity_timeout")]
	pub accept_inactivity_timeout_secs: u64,

	#[serde(default)]
	pub proxy_protocol_trusted_ips: Vec<IpNet>,

	#[serde(default = "default_min_remap_rules")]
	pub min_remap_rules: usize,

	#[serde(default = "default_release_grace_secs")]
	pub config_release_grace_secs: u64,

	#[serde(default)]
	pub listeners: Vec<ListenerDescriptor>,

	pub remap_config_path: PathBuf,

	#[serde(default)]
	pub virtualhost_config_path: Option<PathBuf>,
}

impl ProcessConfig {
	pub fn accept_inactivity_timeout(&self) -> Duration {
		Duration::from_secs(self.accept_inactivity_timeout_secs)
	}

	pub fn config_release_grace(&self) -> Duration {
		Duration::from_secs(self.config_release_grace_secs)
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigLoadError {
	#[error("io error reading {0:?}: {1}")]
	Io(PathBuf, std::io::Error),
	#[error("invalid yaml: {0}")]
	Yaml(#[from] serde_yaml::Error),
}

pub fn load_process_config(path: &std::path::Path) -> Result<ProcessConfig, ConfigLoadError> {
	let text = fs_err::read_to_string(path).map_err(|e| ConfigLoadError::Io(path.to_path_buf(), e.into()))?;
	Ok(serde_yaml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_config() {
		let yaml = r#"
acl_behavior_policy: modern
remap_config_path: /etc/proxy/remap.config
listeners:
  - family: inet
    port: 8080
"#;
		let cfg: ProcessConfig = serde_yaml::from_str(yaml).unwrap();
		assert_eq!(cfg.accept_inactivity_timeout_secs, 10);
		assert_eq!(cfg.config_release_grace_secs, 60);
		assert_eq!(cfg.listeners.len(), 1);
	}

	#[test]
	fn parses_trusted_ip_list_and_alpn_pref() {
		let yaml = r#"
acl_behavior_policy: legacy
remap_config_path: /etc/proxy/remap.config
proxy_protocol_trusted_ips: ["127.0.0.0/8", "10.0.0.0/8"]
listeners:
  - family: inet
    port: 443
    tls: true
    proxy_protocol: true
    alpn_pref: [h2, "http/1.1"]
"#;
		let cfg: ProcessConfig = serde_yaml::from_str(yaml).unwrap();
		assert_eq!(cfg.proxy_protocol_trusted_ips.len(), 2);
		assert_eq!(cfg.listeners[0].alpn_pref, vec![AlpnPref::H2, AlpnPref::Http11]);
	}
}
