//! First-read dispatcher (spec §4.6, C7): optionally consumes a
//! PROXY-protocol v1 preamble, then sniffs HTTP/1.x vs HTTP/2 from the
//! connection preface, all without consuming bytes the chosen protocol
//! handler still needs to see.
//!
//! Grounded in the source's `ProtocolProbeSessionAccept` peek-and-dispatch
//! design: the probe never "reads" in the consuming sense until it knows
//! which handler to commit the bytes to.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use ipnet::IpNet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::proxyprotocol::{ProxyParseError, parse_v1};

/// The HTTP/2 connection preface (RFC 9113 §3.4).
const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const PEEK_CAPACITY: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
	Http1,
	Http2,
}

#[derive(Debug, Clone)]
pub struct ProtocolProbeConfig {
	pub proxy_protocol_enabled: bool,
	/// `None` means no allowlist is configured (every peer is trusted).
	pub trusted_proxy_ranges: Option<Vec<IpNet>>,
	pub accept_inactivity_timeout: Duration,
}

impl Default for ProtocolProbeConfig {
	fn default() -> Self {
		ProtocolProbeConfig {
			proxy_protocol_enabled: false,
			trusted_proxy_ranges: None,
			accept_inactivity_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug)]
pub struct ProbeOutcome {
	pub protocol: Protocol,
	/// The apparent remote address, possibly overwritten by a trusted
	/// PROXY-protocol declaration (spec invariant 6 / E6).
	pub peer_addr: SocketAddr,
	/// The unconsumed peek buffer, handed off intact to the chosen
	/// protocol's session-accept layer (spec: "ownership of the buffer
	/// transfers with the hand-off").
	pub peek_buffer: BytesMut,
}

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
	#[error("connection closed before a usable preface arrived")]
	Eos,
	#[error("accept-inactivity timeout elapsed while peeking")]
	InactivityTimeout,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("PROXY-protocol required but source {0} is not in the trusted range")]
	UntrustedProxySource(IpAddr),
	#[error("PROXY-protocol header required but absent or malformed: {0}")]
	ProxyProtocol(#[from] ProxyParseError),
}

/// Per-connection state machine states named in spec §4.6. `accept` drives
/// a connection through all four in sequence (or returns early at `Closed`
/// via an `Err`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
	Reading,
	PeekDone,
	Dispatched,
	Closed,
}

pub struct ProtocolProbe {
	config: ProtocolProbeConfig,
}

impl ProtocolProbe {
	pub fn new(config: ProtocolProbeConfig) -> Self {
		ProtocolProbe { config }
	}

	/// Runs the `Reading -> PeekDone -> Dispatched` pipeline (spec §4.6) for
	/// one accepted connection. Returns `Err` (equivalent to the state
	/// machine reaching `Closed`) on EOF, timeout, or a PROXY-protocol
	/// violation.
	pub async fn accept(&self, stream: &TcpStream, initial_peer_addr: SocketAddr) -> Result<ProbeOutcome, ProbeError> {
		let mut state = State::Reading;
		let mut peer_addr = initial_peer_addr;
		let buf = match self.peek(stream).await {
			Ok(buf) => {
				state = State::PeekDone;
				buf
			},
			Err(e) => {
				state = State::Closed;
				debug_assert_eq!(state, State::Closed);
				return Err(e);
			},
		};

		let mut consumed = 0usize;
		if self.config.proxy_protocol_enabled {
			if let Some(ranges) = &self.config.trusted_proxy_ranges {
				let trusted = ranges.iter().any(|n| n.contains(&peer_addr.ip()));
				if !trusted {
					state = State::Closed;
					return Err(ProbeError::UntrustedProxySource(peer_addr.ip()));
				}
			}
			let header = match parse_v1(&buf) {
				Ok(h) => h,
				Err(e) => {
					state = State::Closed;
					return Err(e.into());
				},
			};
			peer_addr = header.source;
			consumed = header.consumed;
		}

		let rest = &buf[consumed..];
		let protocol = if is_http2_preface(rest) { Protocol::Http2 } else { Protocol::Http1 };

		if consumed > 0 {
			// The PROXY preamble was only peeked, not consumed, so the
			// chosen protocol handler would otherwise see it again as the
			// first bytes of the "HTTP" stream. Drain exactly those bytes
			// off the socket now; the remaining (still-unread) bytes stay
			// available for the downstream handler to read normally.
			let mut discard = vec![0u8; consumed];
			let mut reader = stream;
			if let Err(e) = reader.read_exact(&mut discard).await {
				state = State::Closed;
				return Err(e.into());
			}
		}

		state = State::Dispatched;
		debug_assert_eq!(state, State::Dispatched);
		Ok(ProbeOutcome { protocol, peer_addr, peek_buffer: BytesMut::from(rest) })
	}

	/// Variant of [`Self::accept`] for streams that don't support
	/// kernel-level peeking (the TLS/ALPN fallthrough path of spec §4.6:
	/// "[an endpoint] falls through to a default endpoint... so that
	/// unannounced H2 over a TLS port still works"). Since a decrypted TLS
	/// stream can't be peeked without consuming it, this does a real
	/// (consuming) read and hands back a [`PeekedStream`] that replays the
	/// consumed bytes to the next reader before delegating to `reader`.
	pub async fn accept_over_reader<R>(&self, mut reader: R, initial_peer_addr: SocketAddr) -> Result<(ProbeOutcome, PeekedStream<R>), ProbeError>
	where
		R: AsyncRead + Unpin,
	{
		let mut peer_addr = initial_peer_addr;
		let mut buf = BytesMut::zeroed(PEEK_CAPACITY);
		let n = tokio::time::timeout(self.config.accept_inactivity_timeout, reader.read(&mut buf))
			.await
			.map_err(|_| ProbeError::InactivityTimeout)??;
		if n == 0 {
			return Err(ProbeError::Eos);
		}
		buf.truncate(n);

		let mut consumed = 0usize;
		if self.config.proxy_protocol_enabled {
			if let Some(ranges) = &self.config.trusted_proxy_ranges {
				if !ranges.iter().any(|r| r.contains(&peer_addr.ip())) {
					return Err(ProbeError::UntrustedProxySource(peer_addr.ip()));
				}
			}
			let header = parse_v1(&buf)?;
			peer_addr = header.source;
			consumed = header.consumed;
		}

		let rest = BytesMut::from(&buf[consumed..]);
		let protocol = if is_http2_preface(&rest) { Protocol::Http2 } else { Protocol::Http1 };
		let peek_buffer = rest.clone();
		Ok((
			ProbeOutcome { protocol, peer_addr, peek_buffer },
			PeekedStream { prefix: rest, inner: reader },
		))
	}

	/// Issues a non-consuming read of up to [`PEEK_CAPACITY`] bytes,
	/// bounded by `accept_inactivity_timeout`. Grows a little past the
	/// initial peek if the first `poll_peek` wakes with fewer bytes than
	/// we'd like, since PROXY headers and the HTTP/2 preface can arrive
	/// split across reads (spec boundary behaviours).
	async fn peek(&self, stream: &TcpStream) -> Result<BytesMut, ProbeError> {
		let fut = async {
			let mut buf = BytesMut::zeroed(PEEK_CAPACITY);
			let n = std::future::poll_fn(|cx| {
				let mut read_buf = ReadBuf::new(&mut buf);
				std::pin::Pin::new(&mut PeekHandle(stream)).poll_read(cx, &mut read_buf).map(|r| r.map(|_| read_buf.filled().len()))
			})
			.await?;
			if n == 0 {
				return Err(ProbeError::Eos);
			}
			buf.truncate(n);
			Ok(buf)
		};
		tokio::time::timeout(self.config.accept_inactivity_timeout, fut)
			.await
			.map_err(|_| ProbeError::InactivityTimeout)?
	}
}

struct PeekHandle<'a>(&'a TcpStream);

impl AsyncRead for PeekHandle<'_> {
	fn poll_read(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &mut ReadBuf<'_>) -> std::task::Poll<std::io::Result<()>> {
		self.0.poll_peek(cx, buf)
	}
}

/// Wraps a stream whose leading bytes were already drained by a consuming
/// peek (see [`ProtocolProbe::accept_over_reader`]) so a downstream reader
/// sees exactly the bytes it would have if the peek hadn't consumed them.
pub struct PeekedStream<R> {
	prefix: BytesMut,
	inner: R,
}

impl<R> PeekedStream<R> {
	/// Wraps a stream with nothing buffered in front of it (the direct
	/// ALPN-dispatch case of spec §4.6, where no fallthrough peek ran).
	pub fn new(inner: R) -> Self {
		PeekedStream { prefix: BytesMut::new(), inner }
	}
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekedStream<R> {
	fn poll_read(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &mut ReadBuf<'_>) -> std::task::Poll<std::io::Result<()>> {
		if !self.prefix.is_empty() {
			let n = buf.remaining().min(self.prefix.len());
			buf.put_slice(&self.prefix[..n]);
			let _ = self.prefix.split_to(n);
			return std::task::Poll::Ready(Ok(()));
		}
		std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<R: AsyncWrite + Unpin> AsyncWrite for PeekedStream<R> {
	fn poll_write(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, data: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
		std::pin::Pin::new(&mut self.inner).poll_write(cx, data)
	}

	fn poll_flush(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

/// A prefix match selects HTTP/2; anything else selects HTTP/1.x (spec
/// §4.6 step 2, grounded in the source's `proto_is_http2()`).
fn is_http2_preface(buf: &[u8]) -> bool {
	let n = buf.len().min(HTTP2_PREFACE.len());
	buf[..n] == HTTP2_PREFACE[..n]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recognises_full_preface() {
		assert!(is_http2_preface(HTTP2_PREFACE));
	}

	// E5, boundary: preface split across reads still recognised as a prefix match.
	#[test]
	fn recognises_partial_preface_prefix() {
		assert!(is_http2_preface(&HTTP2_PREFACE[..4]));
	}

	#[test]
	fn rejects_non_preface() {
		assert!(!is_http2_preface(b"GET / HTTP/1.1\r\n"));
	}

	// TLS/ALPN fallthrough (spec §4.6): a decrypted stream can't be
	// re-peeked, so accept_over_reader does a consuming read and the
	// caller must see those bytes again via PeekedStream.
	#[tokio::test]
	async fn accept_over_reader_recognises_preface_and_replays_it() {
		let probe = ProtocolProbe::new(ProtocolProbeConfig::default());
		let input = std::io::Cursor::new(HTTP2_PREFACE.to_vec());
		let (outcome, mut peeked) = probe
			.accept_over_reader(input, "127.0.0.1:0".parse().unwrap())
			.await
			.unwrap();
		assert_eq!(outcome.protocol, Protocol::Http2);

		let mut replayed = Vec::new();
		peeked.read_to_end(&mut replayed).await.unwrap();
		assert_eq!(replayed, HTTP2_PREFACE);
	}

	#[tokio::test]
	async fn accept_over_reader_honours_proxy_protocol_and_replays_only_the_rest() {
		let mut config = ProtocolProbeConfig::default();
		config.proxy_protocol_enabled = true;
		let probe = ProtocolProbe::new(config);
		let mut body = b"PROXY TCP4 203.0.113.7 10.0.0.1 56324 443\r\n".to_vec();
		body.extend_from_slice(b"GET / HTTP/1.1\r\n");
		let input = std::io::Cursor::new(body);
		let (outcome, mut peeked) = probe.accept_over_reader(input, "127.0.0.1:0".parse().unwrap()).await.unwrap();
		assert_eq!(outcome.protocol, Protocol::Http1);
		assert_eq!(outcome.peer_addr, "203.0.113.7:56324".parse().unwrap());

		let mut replayed = Vec::new();
		peeked.read_to_end(&mut replayed).await.unwrap();
		assert_eq!(replayed, b"GET / HTTP/1.1\r\n");
	}

	// The PROXY preamble is only peeked, not consumed, by the kernel-level
	// fast path; accept() must drain it for real so the downstream HTTP
	// handler reading the raw socket doesn't see it twice.
	#[tokio::test]
	async fn accept_drains_proxy_preamble_from_the_socket() {
		use tokio::io::AsyncWriteExt;
		use tokio::net::TcpListener;

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let mut client = TcpStream::connect(addr).await.unwrap();
		client.write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 56324 443\r\nGET / HTTP/1.1\r\n").await.unwrap();

		let (server, peer_addr) = listener.accept().await.unwrap();
		let mut config = ProtocolProbeConfig::default();
		config.proxy_protocol_enabled = true;
		let probe = ProtocolProbe::new(config);
		let outcome = probe.accept(&server, peer_addr).await.unwrap();
		assert_eq!(outcome.peer_addr, "203.0.113.7:56324".parse().unwrap());
		assert_eq!(outcome.protocol, Protocol::Http1);

		let mut rest = vec![0u8; b"GET / HTTP/1.1\r\n".len()];
		server.readable().await.unwrap();
		let n = server.try_read(&mut rest).unwrap();
		assert_eq!(&rest[..n], b"GET / HTTP/1.1\r\n");
	}
}
