//! TLS termination plus the ALPN-based `SslNextProtocolAccept` dispatch
//! variant described in spec §4.6: complete the handshake, consult the
//! negotiated ALPN token, and route to the endpoint registered for it. An
//! unrecognised (or absent) token falls through to the plain
//! [`crate::protocol_probe::ProtocolProbe`] so unannounced H2 still works.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
	#[error("tls handshake error: {0}")]
	Handshake(#[from] std::io::Error),
	#[error("reading cert/key material from {0:?}: {1}")]
	Io(std::path::PathBuf, std::io::Error),
	#[error("no private key found in {0:?}")]
	NoPrivateKey(std::path::PathBuf),
	#[error("building tls server config: {0}")]
	Config(#[from] rustls::Error),
}

/// Loads a PEM certificate chain and private key from disk and builds a
/// `ServerConfig` with the listener's ALPN preference applied (spec §6's
/// `tls?`/`alpn_pref[]` listener fields).
pub fn load_server_config(cert_path: &Path, key_path: &Path, alpn_pref: &[AlpnToken]) -> Result<ServerConfig, TlsError> {
	let cert_bytes = fs_err::read(cert_path).map_err(|e| TlsError::Io(cert_path.to_path_buf(), e.into()))?;
	let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
		.collect::<Result<_, _>>()
		.map_err(|e| TlsError::Io(cert_path.to_path_buf(), e))?;

	let key_bytes = fs_err::read(key_path).map_err(|e| TlsError::Io(key_path.to_path_buf(), e.into()))?;
	let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())
		.map_err(|e| TlsError::Io(key_path.to_path_buf(), e))?
		.ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

	let provider = Arc::new(rustls::crypto::ring::default_provider());
	let mut cfg = ServerConfig::builder_with_provider(provider)
		.with_safe_default_protocol_versions()?
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	set_alpn_protocols(&mut cfg, alpn_pref);
	Ok(cfg)
}

/// The ALPN tokens the probe understands (spec §6's `alpn_pref[]`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlpnToken {
	Http10,
	Http11,
	H2,
}

impl AlpnToken {
	pub fn wire_name(&self) -> &'static [u8] {
		match self {
			AlpnToken::Http10 => b"http/1.0",
			AlpnToken::Http11 => b"http/1.1",
			AlpnToken::H2 => b"h2",
		}
	}

	fn from_wire(bytes: &[u8]) -> Option<AlpnToken> {
		match bytes {
			b"http/1.0" => Some(AlpnToken::Http10),
			b"http/1.1" => Some(AlpnToken::Http11),
			b"h2" => Some(AlpnToken::H2),
			_ => None,
		}
	}
}

/// Builds the rustls `ServerConfig`'s ALPN preference list from a
/// listener's `alpn_pref[]` descriptor (spec §6).
pub fn set_alpn_protocols(cfg: &mut ServerConfig, preference: &[AlpnToken]) {
	cfg.alpn_protocols = preference.iter().map(|t| t.wire_name().to_vec()).collect();
}

/// Completes the handshake and reads back the negotiated protocol.
/// `None` means ALPN yielded no registered token (or none at all) and the
/// caller should fall through to the default [`crate::protocol_probe::ProtocolProbe`]
/// endpoint.
pub async fn accept(stream: TcpStream, cfg: Arc<ServerConfig>) -> Result<(TlsStream<TcpStream>, Option<AlpnToken>), TlsError> {
	let tls_stream = tokio_rustls::TlsAcceptor::from(cfg).accept(stream).await?;
	let negotiated = tls_stream.get_ref().1.alpn_protocol().and_then(AlpnToken::from_wire);
	Ok((tls_stream, negotiated))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_alpn_token_falls_through() {
		assert_eq!(AlpnToken::from_wire(b"spdy/3"), None);
	}

	#[test]
	fn known_tokens_round_trip() {
		for tok in [AlpnToken::Http10, AlpnToken::Http11, AlpnToken::H2] {
			assert_eq!(AlpnToken::from_wire(tok.wire_name()), Some(tok));
		}
	}
}
