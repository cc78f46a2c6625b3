//! PROXY-protocol v1 preamble parsing (`PROXY TCP4 src dst sp dp\r\n`),
//! adapted from the source's v2 `ppp`-based parser to the textual v1
//! format this core's spec requires (spec glossary "PROXY-protocol v1").

use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
	pub source: SocketAddr,
	pub destination: SocketAddr,
	/// Byte length of the header line including the trailing `\r\n`, so the
	/// caller can advance past it in the peek buffer.
	pub consumed: usize,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProxyParseError {
	#[error("buffer does not start with the PROXY v1 signature")]
	NotProxyProtocol,
	#[error("header line incomplete (no terminating CRLF yet)")]
	Incomplete,
	#[error("malformed PROXY v1 header: {0}")]
	Malformed(String),
	#[error("unsupported INET protocol family {0:?}")]
	UnsupportedFamily(String),
}

const SIGNATURE: &str = "PROXY ";
/// The source caps a v1 header line at 107 bytes including the CRLF.
const MAX_HEADER_LEN: usize = 107;

/// Parses a PROXY protocol v1 line from the head of `buf`. Returns
/// `Incomplete` (not a hard error) if `buf` does not yet contain a
/// terminating `\r\n` and is still within the maximum header length —
/// callers should read more and retry (spec boundary behaviour: "PROXY
/// header spanning multiple read callbacks").
pub fn parse_v1(buf: &[u8]) -> Result<ProxyHeader, ProxyParseError> {
	if buf.len() < SIGNATURE.len() {
		return Err(ProxyParseError::Incomplete);
	}
	if &buf[..SIGNATURE.len()] != SIGNATURE.as_bytes() {
		return Err(ProxyParseError::NotProxyProtocol);
	}
	let search_len = buf.len().min(MAX_HEADER_LEN);
	let Some(crlf_idx) = find_crlf(&buf[..search_len]) else {
		if buf.len() >= MAX_HEADER_LEN {
			return Err(ProxyParseError::Malformed("header exceeds maximum length without CRLF".to_string()));
		}
		return Err(ProxyParseError::Incomplete);
	};

	let line = std::str::from_utf8(&buf[..crlf_idx]).map_err(|_| ProxyParseError::Malformed("non-utf8 header".to_string()))?;
	let mut parts = line.split(' ');
	let _proxy = parts.next(); // "PROXY"
	let family = parts.next().ok_or_else(|| ProxyParseError::Malformed("missing protocol family".to_string()))?;
	let src_ip = parts.next().ok_or_else(|| ProxyParseError::Malformed("missing source address".to_string()))?;
	let dst_ip = parts.next().ok_or_else(|| ProxyParseError::Malformed("missing destination address".to_string()))?;
	let src_port = parts.next().ok_or_else(|| ProxyParseError::Malformed("missing source port".to_string()))?;
	let dst_port = parts.next().ok_or_else(|| ProxyParseError::Malformed("missing destination port".to_string()))?;

	match family {
		"TCP4" | "TCP6" => {},
		"UNKNOWN" => return Err(ProxyParseError::UnsupportedFamily(family.to_string())),
		other => return Err(ProxyParseError::UnsupportedFamily(other.to_string())),
	}

	let source_ip: IpAddr = src_ip.parse().map_err(|_| ProxyParseError::Malformed(format!("invalid source ip {src_ip:?}")))?;
	let dest_ip: IpAddr = dst_ip.parse().map_err(|_| ProxyParseError::Malformed(format!("invalid destination ip {dst_ip:?}")))?;
	let source_port: u16 = src_port.parse().map_err(|_| ProxyParseError::Malformed(format!("invalid source port {src_port:?}")))?;
	let dest_port: u16 = dst_port.parse().map_err(|_| ProxyParseError::Malformed(format!("invalid destination port {dst_port:?}")))?;

	Ok(ProxyHeader {
		source: SocketAddr::new(source_ip, source_port),
		destination: SocketAddr::new(dest_ip, dest_port),
		consumed: crlf_idx + 2,
	})
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
	buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
	use super::*;

	// E6
	#[test]
	fn parses_trusted_v1_header() {
		let buf = b"PROXY TCP4 203.0.113.7 10.0.0.1 56324 443\r\nGET / HTTP/1.1\r\n";
		let header = parse_v1(buf).unwrap();
		assert_eq!(header.source, "203.0.113.7:56324".parse().unwrap());
		assert_eq!(header.destination, "10.0.0.1:443".parse().unwrap());
	}

	#[test]
	fn incomplete_header_requests_more_bytes() {
		let buf = b"PROXY TCP4 203.0.113.7 10.0.0.1 56324 4";
		assert_eq!(parse_v1(buf).unwrap_err(), ProxyParseError::Incomplete);
	}

	#[test]
	fn non_proxy_prefix_is_rejected_outright() {
		let buf = b"GET / HTTP/1.1\r\n";
		assert_eq!(parse_v1(buf).unwrap_err(), ProxyParseError::NotProxyProtocol);
	}

	#[test]
	fn unknown_family_is_an_error() {
		let buf = b"PROXY UNKNOWN\r\n";
		assert!(matches!(parse_v1(buf), Err(ProxyParseError::UnsupportedFamily(_))));
	}
}
