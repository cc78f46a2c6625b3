//! Ambient runtime support shared by the admission core: graceful drain,
//! readiness tracking, shutdown signalling, structured logging and a thin
//! tracing/metrics surface. None of this is specific to remap/ACL semantics;
//! it is the plumbing every long-running listener needs.

pub mod bow;
pub mod drain;
pub mod metrics;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod telemetry;
pub mod trcng;
pub mod version;
