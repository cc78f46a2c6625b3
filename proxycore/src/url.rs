//! Parsed URL type used throughout the remap engine.
//!
//! Unlike `url::Url` this type tolerates origin-form references (`/path`),
//! keeps the two query-string forms (with/without leading `?`) distinct, and
//! normalizes the host to lowercase so exact-match table keys are stable.

use std::fmt;

/// Schemes the remap engine is willing to reason about. Anything else is a
/// parse error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
	Http,
	Https,
	Ws,
	Wss,
	Tunnel,
	File,
}

impl Scheme {
	pub fn as_str(&self) -> &'static str {
		match self {
			Scheme::Http => "http",
			Scheme::Https => "https",
			Scheme::Ws => "ws",
			Scheme::Wss => "wss",
			Scheme::Tunnel => "tunnel",
			Scheme::File => "file",
		}
	}

	pub fn default_port(&self) -> u16 {
		match self {
			Scheme::Http => 80,
			Scheme::Https => 443,
			Scheme::Ws => 80,
			Scheme::Wss => 443,
			Scheme::Tunnel => 80,
			Scheme::File => 0,
		}
	}

	pub fn parse(s: &str) -> Option<Scheme> {
		match s.to_ascii_lowercase().as_str() {
			"http" => Some(Scheme::Http),
			"https" => Some(Scheme::Https),
			"ws" => Some(Scheme::Ws),
			"wss" => Some(Scheme::Wss),
			"tunnel" => Some(Scheme::Tunnel),
			"file" => Some(Scheme::File),
			_ => None,
		}
	}
}

impl fmt::Display for Scheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlParseError {
	#[error("unknown scheme {0:?}")]
	UnknownScheme(String),
	#[error("empty url")]
	Empty,
	#[error("invalid port {0:?}")]
	InvalidPort(String),
}

/// The query string, with its leading-`?` form preserved as given.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Query {
	#[default]
	None,
	/// Stored without the leading `?`.
	Bare(String),
	/// Stored without the leading `?`; `with_leading_question_mark()` restores it.
	Marked(String),
}

impl Query {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Query::None => None,
			Query::Bare(s) | Query::Marked(s) => Some(s.as_str()),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Url {
	pub scheme: Option<Scheme>,
	pub userinfo: Option<String>,
	/// Always lowercased.
	pub host: String,
	/// `None` means "use scheme default".
	pub port: Option<u16>,
	pub path: String,
	pub query: Query,
	pub fragment: Option<String>,
	/// Only meaningful for `Scheme::File`; mirrors the source's ftp-type flag.
	pub ftp_type: Option<char>,
}

impl Url {
	pub fn effective_port(&self) -> u16 {
		self
			.port
			.unwrap_or_else(|| self.scheme.map(|s| s.default_port()).unwrap_or(80))
	}

	/// Parses either an absolute URL (`scheme://host[:port]/path?query#frag`)
	/// or an origin-form reference (`/path?query#frag`).
	///
	/// `regex_host` suppresses scheme/host validation so the caller can parse
	/// the raw text of a `regex_map` source pattern, whose "host" is a regex.
	pub fn parse(input: &str, regex_host: bool) -> Result<Url, UrlParseError> {
		if input.is_empty() {
			return Err(UrlParseError::Empty);
		}
		let mut fragment = None;
		let mut rest = input;
		if let Some(idx) = rest.find('#') {
			fragment = Some(rest[idx + 1..].to_string());
			rest = &rest[..idx];
		}
		let mut query = Query::None;
		if let Some(idx) = rest.find('?') {
			let q = &rest[idx + 1..];
			query = Query::Marked(q.to_string());
			rest = &rest[..idx];
		}

		if rest.starts_with('/') {
			return Ok(Url {
				scheme: None,
				userinfo: None,
				host: String::new(),
				port: None,
				path: rest.to_string(),
				query,
				fragment,
				ftp_type: None,
			});
		}

		let (scheme, after_scheme) = match rest.find("://") {
			Some(idx) => {
				let raw_scheme = &rest[..idx];
				let scheme = if regex_host {
					Scheme::parse(raw_scheme)
				} else {
					Some(Scheme::parse(raw_scheme).ok_or_else(|| UrlParseError::UnknownScheme(raw_scheme.to_string()))?)
				};
				(scheme, &rest[idx + 3..])
			},
			None => (None, rest),
		};

		let path_start = after_scheme.find('/').unwrap_or(after_scheme.len());
		let authority = &after_scheme[..path_start];
		let path = after_scheme[path_start..].to_string();

		let (userinfo, host_port) = match authority.rfind('@') {
			Some(idx) => (Some(authority[..idx].to_string()), &authority[idx + 1..]),
			None => (None, authority),
		};

		let (host, port) = if let Some(idx) = host_port.rfind(':') {
			let (h, p) = host_port.split_at(idx);
			let p = &p[1..];
			if p.is_empty() {
				(h, None)
			} else {
				let port = p.parse::<u16>().map_err(|_| UrlParseError::InvalidPort(p.to_string()))?;
				(h, Some(port))
			}
		} else {
			(host_port, None)
		};

		Ok(Url {
			scheme,
			userinfo,
			host: host.to_ascii_lowercase(),
			port,
			path,
			query,
			fragment,
			ftp_type: None,
		})
	}

	/// True if the path component is empty (no `/` at all, as opposed to `"/"`).
	pub fn path_is_empty(&self) -> bool {
		self.path.is_empty()
	}
}

impl fmt::Display for Url {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if let Some(scheme) = self.scheme {
			write!(f, "{scheme}://")?;
			if let Some(ui) = &self.userinfo {
				write!(f, "{ui}@")?;
			}
			write!(f, "{}", self.host)?;
			if let Some(port) = self.port {
				write!(f, ":{port}")?;
			}
		}
		write!(f, "{}", self.path)?;
		if let Some(q) = self.query.as_str() {
			write!(f, "?{q}")?;
		}
		if let Some(frag) = &self.fragment {
			write!(f, "#{frag}")?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_absolute_url() {
		let u = Url::parse("http://Example.COM:8080/foo/bar?x=1#top", false).unwrap();
		assert_eq!(u.scheme, Some(Scheme::Http));
		assert_eq!(u.host, "example.com");
		assert_eq!(u.port, Some(8080));
		assert_eq!(u.path, "/foo/bar");
		assert_eq!(u.query.as_str(), Some("x=1"));
		assert_eq!(u.fragment.as_deref(), Some("top"));
	}

	#[test]
	fn parses_origin_form() {
		let u = Url::parse("/foo/index.html", false).unwrap();
		assert_eq!(u.scheme, None);
		assert_eq!(u.host, "");
		assert_eq!(u.path, "/foo/index.html");
	}

	#[test]
	fn rejects_unknown_scheme() {
		let err = Url::parse("gopher://example/", false).unwrap_err();
		assert!(matches!(err, UrlParseError::UnknownScheme(_)));
	}

	#[test]
	fn default_port_by_scheme() {
		let u = Url::parse("https://example/", false).unwrap();
		assert_eq!(u.effective_port(), 443);
	}

	#[test]
	fn equality_is_component_wise() {
		let a = Url::parse("http://example/a", false).unwrap();
		let b = Url::parse("http://example/a", false).unwrap();
		assert_eq!(a, b);
	}
}
