use std::{net::SocketAddr, str::FromStr};

use http::{
    Method,
    uri::{Scheme, Uri},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};

/// Response written to the client after a CONNECT tunnel is established.
pub const ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// Response written to the client when the upstream connection fails.
pub const PROXY_ERROR_RESPONSE: &[u8] =
    b"HTTP/1.1 500 Proxy Error\r\n\r\nProxy cannot process request. Error connecting to server.";

/// Shortest byte sequence that can hold a request (`"X HTTP/1.1\r\n\r\n"`).
const MIN_REQUEST_LEN: usize = 14;

/// Host and port authority parsed from HTTP request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    /// Hostname or IP literal without scheme or brackets.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // IPv6 literals need brackets to keep the port unambiguous
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s, None)
    }
}

impl From<SocketAddr> for Authority {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl Authority {
    /// Parses an authority-form request target (`host:port`).
    ///
    /// `default_port` fills in a missing port; with `None` the port is required.
    pub fn from_authority_str(s: &str, default_port: Option<u16>) -> Result<Self> {
        // A bare host without a port parses as a path-only URI, so the
        // default port has to be appended before parsing.
        let has_port = match s.strip_prefix('[') {
            Some(rest) => rest.contains("]:"),
            None => s.contains(':'),
        };
        let full = match (has_port, default_port) {
            (true, _) => s.to_string(),
            (false, Some(port)) => format!("{s}:{port}"),
            (false, None) => return Err(anyerr!("Expected authority with port")),
        };
        let uri = Uri::from_str(&full).std_context("Invalid authority string")?;
        ensure_any!(uri.scheme().is_none(), "Expected URI without scheme");
        ensure_any!(uri.path_and_query().is_none(), "Expected URI without path");
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = authority.port_u16().context("Expected URI with port")?;
        Ok(Self {
            host: authority.host().trim_matches(['[', ']']).to_string(),
            port,
        })
    }

    /// Parses an absolute-form request target and infers the port from the scheme.
    ///
    /// Note: if no port is present, only `http` and `https` schemes are accepted.
    /// Userinfo and path are stripped.
    pub fn from_absolute_str(s: &str) -> Result<Self> {
        let uri = Uri::from_str(s).std_context("Invalid request target")?;
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("Expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self {
            host: authority.host().trim_matches(['[', ']']).to_string(),
            port,
        })
    }

    /// Parses a `Host:` header value (`host` or `host:port`), default port 80.
    pub fn from_host_header(s: &str) -> Result<Self> {
        Self::from_authority_str(s.trim(), Some(80)).context("Invalid Host header")
    }

    /// Formats the authority as the CONNECT request the proxy synthesizes
    /// for a transparently redirected non-HTTP stream.
    pub fn to_connect_request(&self) -> String {
        format!("CONNECT {self} HTTP/1.1\r\n\r\n")
    }
}

/// Verdict of the request sniffer for an accumulated byte sequence.
#[derive(Debug)]
pub enum Classification {
    /// More bytes are needed before a verdict is possible.
    Incomplete,
    /// The stream cannot be an HTTP request; tunnel it opaquely.
    NotHttp,
    /// One complete, framed request starts at offset zero.
    Complete(RequestHead),
}

/// Parsed request line and framing of one complete request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP method from the request line.
    pub method: Method,
    /// Raw request target from the request line.
    pub target: String,
    /// Byte offset of the `\r\n\r\n` header terminator.
    pub header_end: usize,
    /// Declared body length; zero when no `Content-Length` header is present.
    pub content_length: usize,
    /// `Host:` header value, if present.
    pub host: Option<String>,
}

impl RequestHead {
    /// Total framed length of the request: headers, terminator, and body.
    ///
    /// Saturates, so a `Content-Length` near `usize::MAX` yields a frame
    /// length no buffer can ever satisfy instead of wrapping around.
    pub fn total_len(&self) -> usize {
        self.header_end
            .saturating_add(4)
            .saturating_add(self.content_length)
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Extracts the destination authority carried in the request itself.
    ///
    /// CONNECT targets are authority-form with a default port of 443.
    /// Other methods carry the destination only in absolute-form targets;
    /// origin-form (bare path) targets return `None` and the caller falls
    /// back to the `Host:` header or the original destination.
    pub fn authority(&self) -> Result<Option<Authority>> {
        if self.is_connect() {
            return Authority::from_authority_str(&self.target, Some(443))
                .map(Some)
                .context("Invalid CONNECT target");
        }
        if self.target.starts_with('/') {
            return Ok(None);
        }
        match Uri::from_str(&self.target) {
            Ok(uri) if uri.scheme().is_some() => {
                Authority::from_absolute_str(&self.target).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// Decides whether `buf` holds a complete HTTP request.
///
/// This is deliberately a heuristic sniff, not a full parser: the first
/// byte must be an uppercase ASCII letter and the request line must end in
/// an `HTTP/` version token. Anything else is [`Classification::NotHttp`],
/// e.g. a raw TLS ClientHello on a transparently redirected socket. A
/// plausible prefix stays [`Classification::Incomplete`] no matter how the
/// bytes were chunked; a request is `Complete` once the header terminator
/// is present and `Content-Length` bytes of body follow it.
pub fn classify(buf: &[u8]) -> Classification {
    let Some(&first) = buf.first() else {
        return Classification::Incomplete;
    };
    if !first.is_ascii_uppercase() {
        return Classification::NotHttp;
    }
    let Some(line_end) = find(buf, b"\r\n") else {
        // request line still arriving
        return Classification::Incomplete;
    };
    // The request line must end in "HTTP/x.y".
    if line_end < 10 || &buf[line_end - 8..line_end - 3] != b"HTTP/" {
        return Classification::NotHttp;
    }
    let Some(header_end) = find(buf, b"\r\n\r\n") else {
        return Classification::Incomplete;
    };
    if header_end + 4 < MIN_REQUEST_LEN {
        return Classification::NotHttp;
    }

    let mut parts = buf[..line_end]
        .split(|&b| b == b' ')
        .filter(|p| !p.is_empty());
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Classification::NotHttp;
    };
    let Ok(method) = Method::from_bytes(method) else {
        return Classification::NotHttp;
    };
    let Ok(target) = std::str::from_utf8(target) else {
        return Classification::NotHttp;
    };

    let mut content_length = 0;
    let mut host = None;
    for line in buf[line_end..header_end].split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = std::str::from_utf8(&line[..colon]).unwrap_or("").trim();
        let value = std::str::from_utf8(&line[colon + 1..]).unwrap_or("").trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("host") {
            host = Some(value.to_string());
        }
    }

    let head = RequestHead {
        method,
        target: target.to_string(),
        header_end,
        content_length,
        host,
    };
    if buf.len() >= head.total_len() {
        Classification::Complete(head)
    } else {
        Classification::Incomplete
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
