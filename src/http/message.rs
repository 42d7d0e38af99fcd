//! Request and response heads: parsing, typed framing flags, and wire
//! serialization.

use crate::error::ProxyError;
use crate::http::headers::HeaderCollection;

/// HTTP protocol versions handled by the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpVersion::Http10 => write!(f, "HTTP/1.0"),
            HttpVersion::Http11 => write!(f, "HTTP/1.1"),
        }
    }
}

/// How a message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    /// Body runs until the peer closes (responses only).
    CloseDelimited,
}

/// Splits a request line into method, target, and version.
///
/// At most three space-separated fields. The method is uppercased. Two
/// fields imply HTTP/1.1; with three, `HTTP/1.0` (case-insensitive)
/// selects 1.0 and anything else 1.1.
pub(crate) fn parse_request_line(line: &str) -> Result<(String, String, HttpVersion), ProxyError> {
    let mut fields = line.splitn(3, ' ');
    let method = fields
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ProxyError::MalformedRequest(format!("empty request line: {line:?}")))?;
    let target = fields
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProxyError::MalformedRequest(format!("missing request target: {line:?}")))?;
    let version = match fields.next() {
        None => HttpVersion::Http11,
        Some(v) if v.eq_ignore_ascii_case("HTTP/1.0") => HttpVersion::Http10,
        Some(_) => HttpVersion::Http11,
    };
    Ok((method.to_uppercase(), target.to_string(), version))
}

/// Splits a header line on the first `:`, trimming both sides.
pub(crate) fn parse_header_line(line: &str) -> Result<(String, String), ProxyError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ProxyError::MalformedHeader(line.to_string()))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

/// A parsed request head with typed framing flags and mutation locking.
///
/// Embedder hooks may mutate the head through the lock-checked setters
/// until the session loop locks it for dispatch; later attempts are
/// rejected with [`ProxyError::RequestLocked`].
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Request target as received (absolute-form, origin-form, or
    /// authority-form).
    pub target: String,
    pub version: HttpVersion,
    headers: HeaderCollection,
    /// Absolute URI reconstructed by the session loop.
    url: String,
    /// Body bytes cached by a hook; `None` until a hook reads the body.
    body: Option<Vec<u8>>,
    /// Head bytes exactly as received, for verbatim replay.
    raw: Vec<u8>,
    locked: bool,
    cancelled: bool,
}

impl Request {
    pub(crate) fn new(
        method: String,
        target: String,
        version: HttpVersion,
        headers: HeaderCollection,
        raw: Vec<u8>,
    ) -> Self {
        Self {
            method,
            target,
            version,
            headers,
            url: String::new(),
            body: None,
            raw,
            locked: false,
            cancelled: false,
        }
    }

    pub fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderCollection {
        &mut self.headers
    }

    /// Absolute URI for this request.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn set_url(&mut self, url: String) {
        self.url = url;
    }

    pub fn raw_head(&self) -> &[u8] {
        &self.raw
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Whether a hook has read (and possibly replaced) the body.
    pub fn body_read(&self) -> bool {
        self.body.is_some()
    }

    // Lock-checked mutators, exposed to embedder hooks.

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), ProxyError> {
        self.check_unlocked()?;
        self.headers.set(name, value);
        Ok(())
    }

    pub fn append_header(&mut self, name: &str, value: &str) -> Result<(), ProxyError> {
        self.check_unlocked()?;
        self.headers.append(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<(), ProxyError> {
        self.check_unlocked()?;
        self.headers.remove(name);
        Ok(())
    }

    /// Replaces the request body. The new bytes are forwarded with a
    /// rewritten `Content-Length`; chunked re-encoding is not supported.
    pub fn set_body(&mut self, bytes: Vec<u8>) -> Result<(), ProxyError> {
        self.check_unlocked()?;
        self.body = Some(bytes);
        Ok(())
    }

    /// Cancels the request; the session ends without contacting upstream.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn check_unlocked(&self) -> Result<(), ProxyError> {
        if self.locked {
            Err(ProxyError::RequestLocked)
        } else {
            Ok(())
        }
    }

    // Typed framing flags.

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("Transfer-Encoding", "chunked")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn has_body(&self) -> bool {
        self.is_chunked() || self.content_length().is_some_and(|n| n > 0)
    }

    pub fn expect_continue(&self) -> bool {
        self.headers.has_token("Expect", "100-continue")
    }

    pub fn upgrade_to_websocket(&self) -> bool {
        self.headers
            .get("Upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("Host")
    }

    /// Authority (host without port) from the reconstructed URL.
    pub(crate) fn url_host(&self) -> Option<&str> {
        let rest = self.url.split_once("://")?.1;
        let authority = rest.split(['/', '?']).next()?;
        let host = match authority.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => h,
            _ => authority,
        };
        Some(host)
    }

    pub(crate) fn url_port(&self) -> u16 {
        let default = if self.url.starts_with("https://") { 443 } else { 80 };
        let Some(rest) = self.url.split_once("://").map(|(_, r)| r) else {
            return default;
        };
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        match authority.rsplit_once(':') {
            Some((_, p)) => p.parse().unwrap_or(default),
            None => default,
        }
    }

    pub(crate) fn is_https(&self) -> bool {
        self.url.starts_with("https://")
    }

    /// Origin-form target (path + query) from the reconstructed URL.
    pub(crate) fn origin_form_target(&self) -> String {
        let Some(rest) = self.url.split_once("://").map(|(_, r)| r) else {
            return self.target.clone();
        };
        match rest.find('/') {
            Some(at) => rest[at..].to_string(),
            None => "/".to_string(),
        }
    }

    /// Serializes the head for the upstream. `absolute_form` keeps the
    /// full URI in the request line (plaintext HTTP via an upstream
    /// proxy); otherwise the origin-form target is used.
    pub(crate) fn to_wire(&self, absolute_form: bool) -> Vec<u8> {
        let target = if absolute_form {
            self.url.clone()
        } else {
            self.origin_form_target()
        };
        let mut out = Vec::with_capacity(self.raw.len() + 64);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, target, self.version).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// A parsed response head.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderCollection,
    /// Whether the client connection survives this exchange.
    pub keep_alive: bool,
    /// Set when the upstream answered `Expect: 100-continue` with 417.
    pub expectation_failed: bool,
}

impl Response {
    pub(crate) fn parse_status_line(line: &str) -> Result<(HttpVersion, u16, String), ProxyError> {
        let mut fields = line.splitn(3, ' ');
        let version = match fields.next() {
            Some(v) if v.eq_ignore_ascii_case("HTTP/1.0") => HttpVersion::Http10,
            Some(v) if v.to_ascii_uppercase().starts_with("HTTP/") => HttpVersion::Http11,
            _ => {
                return Err(ProxyError::MalformedRequest(format!(
                    "invalid status line: {line:?}"
                )))
            }
        };
        let status = fields
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                ProxyError::MalformedRequest(format!("invalid status code: {line:?}"))
            })?;
        let reason = fields.next().unwrap_or("").to_string();
        Ok((version, status, reason))
    }

    pub(crate) fn new(
        version: HttpVersion,
        status: u16,
        reason: String,
        headers: HeaderCollection,
        request_version: HttpVersion,
    ) -> Self {
        let keep_alive = compute_keep_alive(request_version, version, &headers);
        Self {
            version,
            status,
            reason,
            headers,
            keep_alive,
            expectation_failed: false,
        }
    }

    pub fn is_100_continue(&self) -> bool {
        self.status == 100
    }

    /// Body framing per RFC 7230 §3.3: no body for HEAD responses, 1xx,
    /// 204, and 304; otherwise chunked wins over Content-Length, and a
    /// response with neither runs until close.
    pub fn body_mode(&self, request_method: &str) -> BodyMode {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return BodyMode::None;
        }
        if self.headers.has_token("Transfer-Encoding", "chunked") {
            return BodyMode::Chunked;
        }
        if let Some(length) = self
            .headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            return if length == 0 {
                BodyMode::None
            } else {
                BodyMode::ContentLength(length)
            };
        }
        BodyMode::CloseDelimited
    }

    pub(crate) fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Keep-alive governance: HTTP/1.1 defaults to keep-alive unless the
/// server sent `Connection: close`; HTTP/1.0 defaults to close unless
/// `Connection: keep-alive`. The stricter of request and response version
/// applies.
fn compute_keep_alive(
    request_version: HttpVersion,
    response_version: HttpVersion,
    headers: &HeaderCollection,
) -> bool {
    if headers.has_token("Connection", "close") {
        return false;
    }
    if request_version == HttpVersion::Http10 || response_version == HttpVersion::Http10 {
        return headers.has_token("Connection", "keep-alive");
    }
    true
}

/// The CONNECT request that opened an explicit-mode tunnel. Attached to
/// every session born from that client connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Target authority exactly as requested, `host:port`.
    pub authority: String,
    pub host: String,
    pub port: u16,
    pub version: HttpVersion,
    pub headers: HeaderCollection,
}

impl ConnectRequest {
    /// Parses a `host:port` authority; a missing port defaults to 443.
    pub(crate) fn parse_authority(authority: &str) -> Result<(String, u16), ProxyError> {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    ProxyError::MalformedRequest(format!("invalid CONNECT port: {authority:?}"))
                })?;
                Ok((host.to_string(), port))
            }
            _ if !authority.is_empty() => Ok((authority.to_string(), 443)),
            _ => Err(ProxyError::MalformedRequest(
                "empty CONNECT authority".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Request-line parsing: field count and version defaulting rules.
    #[test]
    fn request_line_variants() {
        let (method, target, version) = parse_request_line("get /a HTTP/1.0").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "/a");
        assert_eq!(version, HttpVersion::Http10);

        // Two fields imply HTTP/1.1.
        let (_, _, version) = parse_request_line("GET /a").unwrap();
        assert_eq!(version, HttpVersion::Http11);

        // Unknown version text selects 1.1.
        let (_, _, version) = parse_request_line("GET /a HTTP/2.0").unwrap();
        assert_eq!(version, HttpVersion::Http11);

        assert!(parse_request_line("GET").is_err());
        assert!(parse_request_line("").is_err());
    }

    /// Header lines must contain a colon; values are trimmed.
    #[test]
    fn header_line_parsing() {
        let (name, value) = parse_header_line("Host:  example.com ").unwrap();
        assert_eq!(name, "Host");
        assert_eq!(value, "example.com");
        assert!(matches!(
            parse_header_line("no colon here"),
            Err(ProxyError::MalformedHeader(_))
        ));
    }

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut collection = HeaderCollection::new();
        for (n, v) in headers {
            collection.append(n, v);
        }
        Request::new(
            "POST".to_string(),
            "/upload".to_string(),
            HttpVersion::Http11,
            collection,
            Vec::new(),
        )
    }

    /// Framing flags surface from the header collection.
    #[test]
    fn typed_flags() {
        let request = request_with(&[
            ("Content-Length", "42"),
            ("Expect", "100-continue"),
            ("Upgrade", "websocket"),
        ]);
        assert_eq!(request.content_length(), Some(42));
        assert!(request.has_body());
        assert!(!request.is_chunked());
        assert!(request.expect_continue());
        assert!(request.upgrade_to_websocket());

        let chunked = request_with(&[("Transfer-Encoding", "chunked")]);
        assert!(chunked.is_chunked());
        assert!(chunked.has_body());
    }

    /// After the lock, hook mutations are rejected and state is unchanged.
    #[test]
    fn locked_request_rejects_mutation() {
        let mut request = request_with(&[("Host", "example.com")]);
        request.set_header("X-Injected", "yes").unwrap();
        request.lock();

        assert!(matches!(
            request.set_header("X-Late", "no"),
            Err(ProxyError::RequestLocked)
        ));
        assert!(matches!(
            request.set_body(b"late".to_vec()),
            Err(ProxyError::RequestLocked)
        ));
        assert!(!request.headers().contains("X-Late"));
        assert!(request.body().is_none());
    }

    /// URL helpers: authority extraction and origin-form conversion.
    #[test]
    fn url_helpers() {
        let mut request = request_with(&[]);
        request.set_url("http://example.com/a?q=1".to_string());
        assert_eq!(request.url_host(), Some("example.com"));
        assert_eq!(request.url_port(), 80);
        assert_eq!(request.origin_form_target(), "/a?q=1");
        assert!(!request.is_https());

        request.set_url("https://example.com:8443".to_string());
        assert_eq!(request.url_port(), 8443);
        assert_eq!(request.origin_form_target(), "/");
        assert!(request.is_https());
    }

    /// Keep-alive governance across version combinations.
    #[test]
    fn keep_alive_rules() {
        let empty = HeaderCollection::new();
        assert!(compute_keep_alive(
            HttpVersion::Http11,
            HttpVersion::Http11,
            &empty
        ));
        assert!(!compute_keep_alive(
            HttpVersion::Http10,
            HttpVersion::Http11,
            &empty
        ));

        let mut close = HeaderCollection::new();
        close.append("Connection", "close");
        assert!(!compute_keep_alive(
            HttpVersion::Http11,
            HttpVersion::Http11,
            &close
        ));

        let mut keep = HeaderCollection::new();
        keep.append("Connection", "keep-alive");
        assert!(compute_keep_alive(
            HttpVersion::Http10,
            HttpVersion::Http10,
            &keep
        ));
    }

    /// Response body framing per method and status.
    #[test]
    fn response_body_modes() {
        let mut headers = HeaderCollection::new();
        headers.append("Content-Length", "10");
        let response = Response::new(
            HttpVersion::Http11,
            200,
            "OK".to_string(),
            headers,
            HttpVersion::Http11,
        );
        assert_eq!(response.body_mode("GET"), BodyMode::ContentLength(10));
        assert_eq!(response.body_mode("HEAD"), BodyMode::None);

        let no_length = Response::new(
            HttpVersion::Http11,
            200,
            "OK".to_string(),
            HeaderCollection::new(),
            HttpVersion::Http11,
        );
        assert_eq!(no_length.body_mode("GET"), BodyMode::CloseDelimited);

        let not_modified = Response::new(
            HttpVersion::Http11,
            304,
            "Not Modified".to_string(),
            HeaderCollection::new(),
            HttpVersion::Http11,
        );
        assert_eq!(not_modified.body_mode("GET"), BodyMode::None);
    }

    /// CONNECT authority parsing with and without an explicit port.
    #[test]
    fn connect_authority() {
        assert_eq!(
            ConnectRequest::parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            ConnectRequest::parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert!(ConnectRequest::parse_authority("example.com:x").is_err());
        assert!(ConnectRequest::parse_authority("").is_err());
    }
}
