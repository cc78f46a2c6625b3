//! Per-listener configuration and startup orchestration (spec §4.7, C8).
//!
//! The accept chain is built from the outside in, exactly as spec §4.7
//! describes: `NetAccept -> (ALPN dispatch if TLS) -> ProtocolProbe ->
//! {HTTP/1.x | HTTP/2} SessionAccept`. The per-protocol session-accept
//! layer and everything downstream of it (the transaction state machine)
//! are out of scope (spec §1) and rephrased here as a trait object, per
//! spec §9's design note on replacing virtual-inheritance hooks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gateway_core::drain::{self, DrainWatcher};
use gateway_core::readiness::Ready;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tracing::{Instrument, debug, info, warn};

use crate::config::ListenerDescriptor;
use crate::hooks::LifecycleHooks;
use crate::protocol_probe::{PeekedStream, Protocol, ProtocolProbe, ProtocolProbeConfig};
use crate::transport::tls::{self, AlpnToken};

/// A dispatched connection handed to a [`SessionAcceptor`]. `Tls` carries
/// any bytes a fallthrough protocol probe already read off the decrypted
/// stream (spec §4.6: a TLS stream can't be re-peeked, so those bytes are
/// replayed to the next reader via [`PeekedStream`]).
pub enum Conn {
	Plain(TcpStream),
	Tls(Box<PeekedStream<TlsStream<TcpStream>>>),
}

/// Trait-object stand-in for `TS_HTTP_*_HOOK` style session acceptance
/// (spec §9): the core hands off a dispatched connection here and does not
/// look at it again.
pub trait SessionAcceptor: Send + Sync + 'static {
	fn accept(&self, protocol: Protocol, peer_addr: SocketAddr, conn: Conn);
}

/// A `SessionAcceptor` that just logs; useful for the bin crate and tests
/// until a real transaction state machine is wired in.
pub struct LoggingSessionAcceptor;

impl SessionAcceptor for LoggingSessionAcceptor {
	fn accept(&self, protocol: Protocol, peer_addr: SocketAddr, _conn: Conn) {
		info!(?protocol, %peer_addr, "dispatching connection");
	}
}

/// Per-listener runtime state: the descriptor plus the probe built from it
/// (spec §6's listener descriptor plus the derived `accept-inactivity`
/// timeout and trusted-IP list).
pub struct AcceptorSet {
	listeners: Vec<(ListenerDescriptor, Arc<ProtocolProbe>)>,
	session_acceptor: Arc<dyn SessionAcceptor>,
	lifecycle: Arc<dyn LifecycleHooks>,
}

impl AcceptorSet {
	pub fn new(
		listeners: Vec<ListenerDescriptor>,
		accept_inactivity_timeout: Duration,
		trusted_proxy_ranges: Option<Vec<ipnet::IpNet>>,
		session_acceptor: Arc<dyn SessionAcceptor>,
		lifecycle: Arc<dyn LifecycleHooks>,
	) -> Self {
		let listeners = listeners
			.into_iter()
			.map(|l| {
				let probe_config = ProtocolProbeConfig {
					proxy_protocol_enabled: l.proxy_protocol,
					trusted_proxy_ranges: trusted_proxy_ranges.clone(),
					accept_inactivity_timeout,
				};
				(l, Arc::new(ProtocolProbe::new(probe_config)))
			})
			.collect();
		AcceptorSet { listeners, session_acceptor, lifecycle }
	}

	/// Runs the startup order from spec §4.7 steps 2-5: wait on the
	/// readiness barrier, open every listening socket, and start
	/// accepting. Each listener's accept loop participates in `drain` so
	/// shutdown can wait for in-flight connections to finish.
	pub async fn run(self, ready: Ready, drain: DrainWatcher) -> anyhow::Result<()> {
		let _block = ready.register_task("acceptor-set");
		let mut js = JoinSet::new();
		for (descriptor, probe) in self.listeners {
			let addr = SocketAddr::new(
				descriptor.local_ip.unwrap_or_else(|| "0.0.0.0".parse().unwrap()),
				descriptor.port,
			);
			let listener = TcpListener::bind(addr).await?;
			info!(%addr, "listener ready");

			let tls_cfg = if descriptor.tls {
				let cert = descriptor
					.tls_cert_path
					.as_ref()
					.ok_or_else(|| anyhow::anyhow!("listener on {addr} has tls=true but no tls_cert_path"))?;
				let key = descriptor
					.tls_key_path
					.as_ref()
					.ok_or_else(|| anyhow::anyhow!("listener on {addr} has tls=true but no tls_key_path"))?;
				let alpn: Vec<AlpnToken> = descriptor.alpn_pref.iter().map(|p| (*p).into()).collect();
				Some(Arc::new(tls::load_server_config(cert, key, &alpn)?))
			} else {
				None
			};

			let sub_drain = drain.clone();
			let acceptor = self.session_acceptor.clone();
			js.spawn(
				async move {
					Self::accept_loop(listener, probe, tls_cfg, acceptor, sub_drain).await;
				}
				.in_current_span(),
			);
		}
		drop(_block);
		// Spec §4.7 step 5: every listener socket is open at this point.
		self.lifecycle.ports_ready();
		while let Some(res) = js.join_next().await {
			if let Err(e) = res {
				warn!(error = %e, "listener task panicked");
			}
		}
		Ok(())
	}

	async fn accept_loop(
		listener: TcpListener,
		probe: Arc<ProtocolProbe>,
		tls_cfg: Option<Arc<ServerConfig>>,
		acceptor: Arc<dyn SessionAcceptor>,
		drain: DrainWatcher,
	) {
		let wait = drain.wait_for_drain();
		tokio::pin!(wait);
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let Ok((stream, peer_addr)) = accepted else { continue };
					let probe = probe.clone();
					let acceptor = acceptor.clone();
					let tls_cfg = tls_cfg.clone();
					tokio::spawn(async move {
						Self::dispatch(stream, peer_addr, probe, tls_cfg, acceptor).await;
					});
				}
				_ = &mut wait => {
					info!("stop accepting; drain started");
					break;
				}
			}
		}
	}

	/// One connection through the chain described at the top of this file.
	/// Plain listeners go straight through [`ProtocolProbe::accept`]. TLS
	/// listeners complete the handshake first (`SslNextProtocolAccept`):
	/// an ALPN token dispatches directly, and its absence falls through to
	/// the same probe logic running over the decrypted stream.
	async fn dispatch(
		stream: TcpStream,
		peer_addr: SocketAddr,
		probe: Arc<ProtocolProbe>,
		tls_cfg: Option<Arc<ServerConfig>>,
		acceptor: Arc<dyn SessionAcceptor>,
	) {
		let Some(cfg) = tls_cfg else {
			return match probe.accept(&stream, peer_addr).await {
				Ok(outcome) => acceptor.accept(outcome.protocol, outcome.peer_addr, Conn::Plain(stream)),
				Err(e) => debug!(error = %e, %peer_addr, "closing connection during protocol probe"),
			};
		};

		let (tls_stream, negotiated) = match tls::accept(stream, cfg).await {
			Ok(r) => r,
			Err(e) => {
				debug!(error = %e, %peer_addr, "tls handshake failed");
				return;
			},
		};

		match negotiated {
			Some(token) => {
				let protocol = if token == AlpnToken::H2 { Protocol::Http2 } else { Protocol::Http1 };
				acceptor.accept(protocol, peer_addr, Conn::Tls(Box::new(PeekedStream::new(tls_stream))));
			},
			None => match probe.accept_over_reader(tls_stream, peer_addr).await {
				Ok((outcome, peeked)) => acceptor.accept(outcome.protocol, outcome.peer_addr, Conn::Tls(Box::new(peeked))),
				Err(e) => debug!(error = %e, %peer_addr, "closing connection during protocol probe (tls fallthrough)"),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Family;

	#[tokio::test]
	async fn binds_an_ephemeral_listener_and_is_cancellable() {
		let descriptor = ListenerDescriptor {
			family: Family::Inet,
			port: 0,
			local_ip: Some("127.0.0.1".parse().unwrap()),
			unix_path: None,
			tls: false,
			tls_cert_path: None,
			tls_key_path: None,
			proxy_protocol: false,
			transparent: false,
			alpn_pref: vec![],
		};
		let set = AcceptorSet::new(
			vec![descriptor],
			Duration::from_secs(1),
			None,
			Arc::new(LoggingSessionAcceptor),
			Arc::new(crate::hooks::LoggingLifecycleHooks),
		);
		let (trigger, watcher) = drain::new();
		let ready = Ready::new();
		let handle = tokio::spawn(set.run(ready, watcher));
		tokio::time::sleep(Duration::from_millis(10)).await;
		trigger.start_drain_and_wait(gateway_core::drain::DrainMode::Graceful).await;
		let _ = handle.await;
	}
}
