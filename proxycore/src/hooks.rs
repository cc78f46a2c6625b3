//! Trait-object stand-ins for the legacy plugin C ABI (spec §9): the
//! source hangs plugin behaviour off `TS_HTTP_*_HOOK` and
//! `TS_LIFECYCLE_*_HOOK` callback registrations taking `TSMLoc`/`TSMBuffer`
//! handles. That ABI is out of scope (spec §1) but the hook *set* is named
//! explicitly, so it is re-expressed here as two trait interfaces a plugin
//! re-implementation would hang its callbacks off instead. Neither trait
//! is invoked by anything in this crate: the transaction state machine and
//! plugin loader that would call them are themselves out of scope.

/// Per-transaction hooks (`TS_HTTP_READ_REQUEST_HDR_HOOK` and friends).
/// A `PluginInstance` (spec §3, `remap::rule::PluginInstance`) is the
/// *attachment* of a plugin to a rule; this trait is the *behaviour* such
/// an attachment would run, were the transaction state machine in scope.
pub trait TransactionHooks: Send + Sync {
	/// `TS_HTTP_READ_REQUEST_HDR_HOOK`
	fn read_request_hdr(&self) {}
	/// `TS_HTTP_SEND_REQUEST_HDR_HOOK`
	fn send_request_hdr(&self) {}
	/// `TS_HTTP_READ_RESPONSE_HDR_HOOK`
	fn read_response_hdr(&self) {}
	/// `TS_HTTP_SEND_RESPONSE_HDR_HOOK`
	fn send_response_hdr(&self) {}
	/// `TS_HTTP_TXN_CLOSE_HOOK`
	fn txn_close(&self) {}
}

/// Process-lifecycle hooks (`TS_LIFECYCLE_*_HOOK`). `AcceptorSet::run`
/// invokes `ports_ready` once every listener socket is open (spec §4.7
/// step 5); the bin crate's shutdown path invokes `shutdown` once drain
/// completes.
pub trait LifecycleHooks: Send + Sync {
	/// `TS_LIFECYCLE_PORTS_READY_HOOK`
	fn ports_ready(&self) {}
	/// `TS_LIFECYCLE_SHUTDOWN_HOOK`
	fn shutdown(&self) {}
}

/// A `LifecycleHooks` that just logs; used by the bin crate and tests
/// until a real plugin loader is wired in.
pub struct LoggingLifecycleHooks;

impl LifecycleHooks for LoggingLifecycleHooks {
	fn ports_ready(&self) {
		tracing::info!("LIFECYCLE_PORTS_READY");
	}

	fn shutdown(&self) {
		tracing::info!("LIFECYCLE_SHUTDOWN");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct CountingHooks {
		ports_ready: std::sync::atomic::AtomicUsize,
		shutdown: std::sync::atomic::AtomicUsize,
	}

	impl LifecycleHooks for CountingHooks {
		fn ports_ready(&self) {
			self.ports_ready.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
		}

		fn shutdown(&self) {
			self.shutdown.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
		}
	}

	#[test]
	fn default_transaction_hooks_are_inert() {
		struct Noop;
		impl TransactionHooks for Noop {}
		let h = Noop;
		h.read_request_hdr();
		h.send_request_hdr();
		h.read_response_hdr();
		h.send_response_hdr();
		h.txn_close();
	}

	#[test]
	fn lifecycle_hooks_fire_once_each() {
		let hooks = CountingHooks {
			ports_ready: std::sync::atomic::AtomicUsize::new(0),
			shutdown: std::sync::atomic::AtomicUsize::new(0),
		};
		hooks.ports_ready();
		hooks.shutdown();
		assert_eq!(hooks.ports_ready.load(std::sync::atomic::Ordering::SeqCst), 1);
		assert_eq!(hooks.shutdown.load(std::sync::atomic::Ordering::SeqCst), 1);
	}
}
