//! Thin wrapper around `prometheus_client` so every subsystem registers its
//! counters the same way instead of poking the registry directly.

use prometheus_client::registry::Registry;

/// Create a namespaced sub-registry for a subsystem (e.g. `"acl"`, `"remap"`).
pub fn sub_registry<'a>(registry: &'a mut Registry, namespace: &'static str) -> &'a mut Registry {
	registry.sub_registry_with_prefix(namespace)
}
