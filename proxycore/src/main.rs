//! Thin CLI entry point: parse arguments, load the process config, start
//! the acceptor set. Records-file parsing and process bootstrap proper are
//! out of scope (spec §1) — this is the minimal shim that wires the typed
//! pieces together.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gateway_core::readiness::Ready;
use gateway_core::signal;
use proxycore::acl::Policy;
use proxycore::config::load_process_config;
use proxycore::hooks::LoggingLifecycleHooks;
use proxycore::proxy::gateway::{AcceptorSet, LoggingSessionAcceptor};
use proxycore::proxy::load_remap_table;
use proxycore::registry::ConfigRegistry;
use proxycore::remap::RemapTable;

#[derive(Parser, Debug)]
#[command(name = "proxycore", version)]
struct Args {
	/// Path to the process config YAML.
	#[arg(short, long)]
	config: PathBuf,

	/// Parse and validate the configuration, then exit.
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let _guard = gateway_core::telemetry::setup_logging();

	let cfg = load_process_config(&args.config)?;
	let policy: Policy = cfg.acl_behavior_policy.clone().into();

	// Spec §4.7 step 1: load all configuration before spawning anything.
	// A rejected remap config (too few rules, or a parse error) aborts
	// startup here rather than leaving the process half-initialised.
	let remap_table = load_remap_table(&cfg.remap_config_path, policy, cfg.min_remap_rules)?;
	tracing::info!(rules = remap_table.rule_count(), "remap config loaded");

	if args.validate_only {
		tracing::info!("configuration is valid");
		return Ok(());
	}

	let remap_registry: ConfigRegistry<RemapTable> = ConfigRegistry::new(cfg.config_release_grace());
	remap_registry.set(0, Arc::new(remap_table))?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(cfg))
}

async fn run(cfg: proxycore::config::ProcessConfig) -> anyhow::Result<()> {
	let ready = Ready::new();
	let (drain_trigger, drain_watcher) = gateway_core::drain::new();
	let shutdown = signal::Shutdown::new();

	let trusted = if cfg.proxy_protocol_trusted_ips.is_empty() {
		None
	} else {
		Some(cfg.proxy_protocol_trusted_ips.clone())
	};

	let lifecycle = Arc::new(LoggingLifecycleHooks);
	let acceptor_set = AcceptorSet::new(
		cfg.listeners.clone(),
		cfg.accept_inactivity_timeout(),
		trusted,
		Arc::new(LoggingSessionAcceptor),
		lifecycle.clone(),
	);

	let run_fut = acceptor_set.run(ready, drain_watcher);
	tokio::pin!(run_fut);

	tokio::select! {
		res = &mut run_fut => res?,
		_ = shutdown.wait() => {
			tracing::info!("shutdown signal received, starting drain");
			drain_trigger.start_drain_and_wait(gateway_core::drain::DrainMode::Graceful).await;
			lifecycle.shutdown();
		}
	}
	Ok(())
}
