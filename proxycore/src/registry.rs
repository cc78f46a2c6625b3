//! Slot-indexed wait-free snapshot store with deferred release (spec §4.1,
//! C1).
//!
//! Each slot wraps an [`arc_swap::ArcSwapOption`] so `acquire` is a single
//! atomic load plus an `Arc` clone — no locks on the read path. `set` is
//! serialised per slot behind a small mutex (CAS loop territory in the
//! source; here the mutex *is* the CAS loop, since slot replacement also
//! has to push the superseded object onto the deferred-free list
//! atomically with the swap). Superseded objects are not dropped until
//! their grace window has elapsed and no handle still references them —
//! [`ConfigRegistry::reap`] (or simply the next `set` on that slot) is what
//! performs that check.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

pub const MAX_CONFIGS: usize = 100;

// Spec §4.1 also names "null objects" as a `set` failure; here `new_config`
// is `Arc<T>`, which cannot be null, so that failure mode doesn't exist as
// a reachable state and has no variant below.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("slot id {0} out of range (max {MAX_CONFIGS})")]
	OutOfRange(usize),
}

struct Deferred<T> {
	object: Arc<T>,
	retired_at: Instant,
}

struct ConfigSlot<T> {
	current: ArcSwapOption<T>,
	generation: std::sync::atomic::AtomicU64,
	deferred: Mutex<Vec<Deferred<T>>>,
}

impl<T> Default for ConfigSlot<T> {
	fn default() -> Self {
		ConfigSlot {
			current: ArcSwapOption::from(None),
			generation: std::sync::atomic::AtomicU64::new(0),
			deferred: Mutex::new(Vec::new()),
		}
	}
}

/// RAII handle acquired via [`ConfigRegistry::acquire`]; releases on drop.
/// While it exists the pointed-to config object will not be reclaimed
/// (spec's `MappingScopedConfig`).
pub struct MappingScopedConfig<T> {
	inner: Arc<T>,
}

impl<T> Deref for MappingScopedConfig<T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.inner
	}
}

/// Wait-free snapshot/reference-counted registry (spec §4.1).
pub struct ConfigRegistry<T> {
	slots: Vec<ConfigSlot<T>>,
	release: Duration,
}

impl<T> ConfigRegistry<T> {
	pub fn new(release: Duration) -> Self {
		ConfigRegistry::with_capacity(MAX_CONFIGS, release)
	}

	pub fn with_capacity(capacity: usize, release: Duration) -> Self {
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, ConfigSlot::default);
		ConfigRegistry { slots, release }
	}

	fn slot(&self, slot_id: usize) -> Result<&ConfigSlot<T>, RegistryError> {
		self.slots.get(slot_id).ok_or(RegistryError::OutOfRange(slot_id))
	}

	/// Atomically swaps the slot's current object, returning the new
	/// generation number. The old object (if any) is enqueued for release
	/// after the registry's grace window.
	pub fn set(&self, slot_id: usize, new_config: Arc<T>) -> Result<u64, RegistryError> {
		let slot = self.slot(slot_id)?;
		let old = slot.current.swap(Some(new_config));
		if let Some(old) = old {
			slot.deferred.lock().unwrap().push(Deferred { object: old, retired_at: Instant::now() });
		}
		self.reap_slot(slot);
		Ok(slot.generation.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1)
	}

	/// Wait-free on the fast path: one atomic load plus an `Arc` clone.
	/// Returns `None` if the slot is empty.
	pub fn acquire(&self, slot_id: usize) -> Result<Option<MappingScopedConfig<T>>, RegistryError> {
		let slot = self.slot(slot_id)?;
		Ok(slot.current.load_full().map(|inner| MappingScopedConfig { inner }))
	}

	/// Drops every deferred object in `slot_id` whose grace window has
	/// elapsed and which no handle still references (`Arc::strong_count`
	/// is 1, i.e. only the deferred list itself holds it). Called
	/// automatically by `set`; exposed so a background task can also drive
	/// reclamation of slots that never see another `set`.
	pub fn reap(&self, slot_id: usize) -> Result<(), RegistryError> {
		let slot = self.slot(slot_id)?;
		self.reap_slot(slot);
		Ok(())
	}

	fn reap_slot(&self, slot: &ConfigSlot<T>) {
		let now = Instant::now();
		let mut deferred = slot.deferred.lock().unwrap();
		deferred.retain(|d| {
			let grace_elapsed = now.duration_since(d.retired_at) >= self.release;
			let still_referenced = Arc::strong_count(&d.object) > 1;
			!(grace_elapsed && !still_referenced)
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acquire_on_empty_slot_is_none() {
		let reg: ConfigRegistry<u32> = ConfigRegistry::with_capacity(4, Duration::from_secs(60));
		assert_eq!(reg.acquire(0).unwrap().map(|h| *h), None);
	}

	#[test]
	fn set_then_acquire_sees_new_value() {
		let reg: ConfigRegistry<u32> = ConfigRegistry::with_capacity(4, Duration::from_secs(60));
		reg.set(0, Arc::new(42)).unwrap();
		let handle = reg.acquire(0).unwrap().unwrap();
		assert_eq!(*handle, 42);
	}

	#[test]
	fn out_of_range_slot_is_an_error_not_a_panic() {
		let reg: ConfigRegistry<u32> = ConfigRegistry::with_capacity(4, Duration::from_secs(60));
		assert!(matches!(reg.set(999, Arc::new(1)), Err(RegistryError::OutOfRange(999))));
		assert!(matches!(reg.acquire(999), Err(RegistryError::OutOfRange(999))));
	}

	#[test]
	fn generation_increases_monotonically() {
		let reg: ConfigRegistry<u32> = ConfigRegistry::with_capacity(4, Duration::from_secs(60));
		let g1 = reg.set(0, Arc::new(1)).unwrap();
		let g2 = reg.set(0, Arc::new(2)).unwrap();
		assert!(g2 > g1);
	}

	#[test]
	fn handle_survives_intervening_set_within_grace_window() {
		let reg: ConfigRegistry<u32> = ConfigRegistry::with_capacity(4, Duration::from_secs(60));
		reg.set(0, Arc::new(1)).unwrap();
		let handle = reg.acquire(0).unwrap().unwrap();
		reg.set(0, Arc::new(2)).unwrap();
		reg.set(0, Arc::new(3)).unwrap();
		// The handle to generation 1's object is still valid; nothing
		// reaped it because the grace window (60s) hasn't elapsed.
		assert_eq!(*handle, 1);
	}

	#[test]
	fn reclaims_after_grace_window_once_unreferenced() {
		let reg: ConfigRegistry<u32> = ConfigRegistry::with_capacity(4, Duration::from_millis(1));
		reg.set(0, Arc::new(1)).unwrap();
		std::thread::sleep(Duration::from_millis(5));
		reg.set(0, Arc::new(2)).unwrap();
		let slot = &reg.slots[0];
		assert!(slot.deferred.lock().unwrap().is_empty());
	}
}
