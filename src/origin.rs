use std::fmt;
use std::net::IpAddr;

use http::uri::Uri;

use crate::error::{Error, Result};

/// The scheme half of an origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain TCP.
    Http,
    /// TLS.
    Https,
}

impl Scheme {
    /// The default port for this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A fixed request target: scheme, host, and port.
///
/// Clients are bound to exactly one origin; the path, query, and fragment
/// belong to individual requests and are rejected here.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Origin {
    /// Parses an origin from an URL like `http://example.com:8080`.
    pub fn parse(url: &str) -> Result<Origin> {
        let uri = url
            .parse::<Uri>()
            .map_err(|e| Error::new_invalid_arg("invalid url").with(e))?;
        Origin::try_from_uri(&uri)
    }

    pub(crate) fn try_from_uri(uri: &Uri) -> Result<Origin> {
        if uri.query().is_some() {
            return Err(Error::new_invalid_arg("invalid url query"));
        }
        match uri.path() {
            "" | "/" => {}
            _ => return Err(Error::new_invalid_arg("invalid url path")),
        }
        Origin::authority_of(uri)
    }

    /// The origin named by an URI, ignoring its path and query. Used when
    /// resolving absolute redirect targets.
    pub(crate) fn authority_of(uri: &Uri) -> Result<Origin> {
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            _ => return Err(Error::new_invalid_arg("invalid url protocol")),
        };
        let host = match uri.host() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(Error::new_invalid_arg("invalid url host")),
        };
        // Bracketed IPv6 hosts keep their brackets out of the stored name.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Origin {
            scheme,
            host: host.to_ascii_lowercase(),
            port: uri.port_u16().unwrap_or_else(|| scheme.default_port()),
        })
    }

    /// The origin's scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The origin's host, lowercased, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin's port, explicit or scheme default.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns true for `https` origins.
    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    pub(crate) fn is_ip_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// The value used for the `host` header and, unless the host is an IP
    /// literal, for TLS SNI.
    pub(crate) fn host_header(&self) -> String {
        let needs_brackets = self.host.contains(':');
        let host = if needs_brackets {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// The SNI name implied by this origin, if any.
    pub(crate) fn default_servername(&self) -> Option<String> {
        if self.is_ip_literal() {
            None
        } else {
            Some(self.host.clone())
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{}://{}", scheme, self.host_header())
    }
}

impl std::str::FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Origin> {
        Origin::parse(s)
    }
}

/// Types that can name an origin: `Origin` itself, URL strings, and
/// `http::Uri` values.
pub trait IntoOrigin {
    /// Convert into an [`Origin`], validating the URL shape.
    fn into_origin(self) -> Result<Origin>;
}

impl IntoOrigin for Origin {
    fn into_origin(self) -> Result<Origin> {
        Ok(self)
    }
}

impl IntoOrigin for &Origin {
    fn into_origin(self) -> Result<Origin> {
        Ok(self.clone())
    }
}

impl IntoOrigin for &str {
    fn into_origin(self) -> Result<Origin> {
        Origin::parse(self)
    }
}

impl IntoOrigin for String {
    fn into_origin(self) -> Result<Origin> {
        Origin::parse(&self)
    }
}

impl IntoOrigin for &Uri {
    fn into_origin(self) -> Result<Origin> {
        Origin::try_from_uri(self)
    }
}

impl IntoOrigin for Uri {
    fn into_origin(self) -> Result<Origin> {
        Origin::try_from_uri(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_ports() {
        let origin = Origin::parse("http://example.com").unwrap();
        assert_eq!(origin.port(), 80);
        assert_eq!(origin.host(), "example.com");
        assert!(!origin.is_https());

        let origin = Origin::parse("https://example.com").unwrap();
        assert_eq!(origin.port(), 443);
        assert!(origin.is_https());
    }

    #[test]
    fn keeps_explicit_port() {
        let origin = Origin::parse("http://localhost:8080").unwrap();
        assert_eq!(origin.port(), 8080);
        assert_eq!(origin.host_header(), "localhost:8080");
    }

    #[test]
    fn rejects_path_query_and_bad_scheme() {
        assert!(Origin::parse("http://example.com/foo").is_err());
        assert!(Origin::parse("http://example.com/?q=1").is_err());
        assert!(Origin::parse("ftp://example.com").is_err());
        assert!(Origin::parse("example.com").is_err());
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        assert!(Origin::parse("http://example.com/").is_ok());
    }

    #[test]
    fn ip_literals_have_no_servername() {
        let origin = Origin::parse("https://127.0.0.1:4443").unwrap();
        assert!(origin.default_servername().is_none());

        let origin = Origin::parse("https://example.com").unwrap();
        assert_eq!(origin.default_servername().as_deref(), Some("example.com"));
    }

    #[test]
    fn display_round_trips() {
        let origin = Origin::parse("https://example.com:8443").unwrap();
        assert_eq!(origin.to_string(), "https://example.com:8443");
        assert_eq!(origin.to_string().parse::<Origin>().unwrap(), origin);
    }
}
