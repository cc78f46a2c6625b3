//! YAML-sourced mapping from domain names to a named remap sub-table (spec
//! §4.5, C6).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::acl::Policy;
use crate::remap::{ParseError as RemapParseError, RemapConfigParser, RemapTable};

#[derive(Debug, Deserialize)]
struct VirtualHostDoc {
	virtualhost: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
	id: String,
	domains: Vec<String>,
	remap: Vec<String>,
}

/// `{ id, exact_domains[], wildcard_domains[], remap_table }` (spec §3).
pub struct VirtualHostEntry {
	pub id: String,
	pub exact_domains: Vec<String>,
	/// Stored as the suffix after `*.`.
	pub wildcard_domains: Vec<String>,
	pub remap_table: Arc<RemapTable>,
}

#[derive(thiserror::Error, Debug)]
pub enum VirtualHostLoadError {
	#[error("invalid yaml: {0}")]
	Yaml(#[from] serde_yaml::Error),
	#[error("duplicate domain {0:?} across virtualhost entries")]
	DuplicateDomain(String),
	#[error("remap parse error in virtualhost {id:?}: {source}")]
	Remap { id: String, source: RemapParseError },
}

#[derive(Default)]
pub struct VirtualHostTable {
	exact: HashMap<String, Arc<VirtualHostEntry>>,
	/// Keyed by the suffix after `*.`, e.g. `"a.example"` for `*.a.example`.
	wildcard: HashMap<String, Arc<VirtualHostEntry>>,
	by_id: HashMap<String, Arc<VirtualHostEntry>>,
}

impl VirtualHostTable {
	pub fn from_yaml(text: &str, policy: Policy) -> Result<VirtualHostTable, VirtualHostLoadError> {
		let doc: VirtualHostDoc = serde_yaml::from_str(text)?;
		let mut table = VirtualHostTable::default();
		for raw in doc.virtualhost {
			let mut parser = RemapConfigParser::new(policy);
			let remap_text = raw.remap.join("\n");
			let remap_table = parser
				.parse_str(&remap_text, &raw.id)
				.map_err(|source| VirtualHostLoadError::Remap { id: raw.id.clone(), source })?;

			let mut exact_domains = Vec::new();
			let mut wildcard_domains = Vec::new();
			for domain in &raw.domains {
				let lowered = domain.to_ascii_lowercase();
				if let Some(suffix) = lowered.strip_prefix("*.") {
					wildcard_domains.push(suffix.to_string());
				} else {
					exact_domains.push(lowered);
				}
			}

			let entry = Arc::new(VirtualHostEntry {
				id: raw.id.clone(),
				exact_domains: exact_domains.clone(),
				wildcard_domains: wildcard_domains.clone(),
				remap_table: Arc::new(remap_table),
			});

			for d in &exact_domains {
				if table.exact.insert(d.clone(), entry.clone()).is_some() {
					return Err(VirtualHostLoadError::DuplicateDomain(d.clone()));
				}
			}
			for d in &wildcard_domains {
				if table.wildcard.insert(d.clone(), entry.clone()).is_some() {
					return Err(VirtualHostLoadError::DuplicateDomain(format!("*.{d}")));
				}
			}
			table.by_id.insert(raw.id, entry);
		}
		Ok(table)
	}

	/// Exact matches win; among wildcards, the longest suffix wins (spec
	/// §3 / §4.5).
	pub fn lookup_by_host(&self, host: &str) -> Option<Arc<VirtualHostEntry>> {
		let host = host.to_ascii_lowercase();
		if let Some(entry) = self.exact.get(&host) {
			return Some(entry.clone());
		}
		let mut rest = host.as_str();
		while let Some(idx) = rest.find('.') {
			rest = &rest[idx + 1..];
			if let Some(entry) = self.wildcard.get(rest) {
				return Some(entry.clone());
			}
		}
		None
	}

	pub fn lookup_by_id(&self, id: &str) -> Option<Arc<VirtualHostEntry>> {
		self.by_id.get(id).cloned()
	}

	/// Replaces only `id`'s entry; the caller publishes the resulting clone
	/// through the [`crate::registry::ConfigRegistry`] (spec §4.5).
	pub fn reconfigure(&self, id: &str, new_entry: VirtualHostEntry) -> VirtualHostTable {
		let mut next = VirtualHostTable::default();
		let new_entry = Arc::new(new_entry);
		for (_, entry) in self.by_id.iter().filter(|(eid, _)| *eid != id) {
			for d in &entry.exact_domains {
				next.exact.insert(d.clone(), entry.clone());
			}
			for d in &entry.wildcard_domains {
				next.wildcard.insert(d.clone(), entry.clone());
			}
			next.by_id.insert(entry.id.clone(), entry.clone());
		}
		for d in &new_entry.exact_domains {
			next.exact.insert(d.clone(), new_entry.clone());
		}
		for d in &new_entry.wildcard_domains {
			next.wildcard.insert(d.clone(), new_entry.clone());
		}
		next.by_id.insert(new_entry.id.clone(), new_entry);
		next
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const DOC: &str = r#"
virtualhost:
  - id: tenant-a
    domains: [a.example, "*.a.example"]
    remap:
      - "map http://a.example/ http://origin-a/"
  - id: tenant-b
    domains: [b.example]
    remap:
      - "map http://b.example/ http://origin-b/"
"#;

	#[test]
	fn exact_and_wildcard_lookup() {
		let table = VirtualHostTable::from_yaml(DOC, Policy::Modern).unwrap();
		assert_eq!(table.lookup_by_host("a.example").unwrap().id, "tenant-a");
		assert_eq!(table.lookup_by_host("foo.a.example").unwrap().id, "tenant-a");
		assert!(table.lookup_by_host("b.a.example").is_some());
		assert!(table.lookup_by_host("unknown.example").is_none());
	}

	#[test]
	fn duplicate_domain_fails_load() {
		let doc = r#"
virtualhost:
  - id: a
    domains: [x.example]
    remap: []
  - id: b
    domains: [x.example]
    remap: []
"#;
		assert!(VirtualHostTable::from_yaml(doc, Policy::Modern).is_err());
	}

	#[test]
	fn reconfigure_replaces_single_id() {
		let table = VirtualHostTable::from_yaml(DOC, Policy::Modern).unwrap();
		let mut parser = RemapConfigParser::new(Policy::Modern);
		let remap_table = parser.parse_str("map http://a.example/ http://new-origin/\n", "tenant-a").unwrap();
		let replacement = VirtualHostEntry {
			id: "tenant-a".to_string(),
			exact_domains: vec!["a.example".to_string()],
			wildcard_domains: vec![],
			remap_table: Arc::new(remap_table),
		};
		let updated = table.reconfigure("tenant-a", replacement);
		assert!(updated.lookup_by_host("a.example").is_some());
		assert!(updated.lookup_by_host("foo.a.example").is_none());
		assert!(updated.lookup_by_host("b.example").is_some());
	}
}
