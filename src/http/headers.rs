//! Ordered, multi-valued header collection and dispatch-time rewriting.

/// HTTP header collection preserving insertion order and multiplicity.
///
/// Lookup is case-insensitive; repeated names keep their relative order so
/// multi-valued headers round-trip the way the peer sent them.
#[derive(Debug, Clone, Default)]
pub struct HeaderCollection {
    entries: Vec<(String, String)>,
}

impl HeaderCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for the given name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for the given name, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every occurrence of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: &str) {
        let position = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name));
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        match position {
            Some(at) if at <= self.entries.len() => {
                self.entries
                    .insert(at, (name.to_string(), value.to_string()));
            }
            _ => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    /// Appends a value without touching existing entries of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Removes every occurrence of `name`. Returns whether any existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    /// Whether any value of `name` contains `token` in its comma-separated
    /// token list.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes as `Name: value\r\n` lines, without the blank terminator.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Rewrites request headers for dispatch to the upstream.
///
/// `Accept-Encoding` is pinned to `gzip,deflate` so intercepted bodies stay
/// decodable, and proxy hop-by-hop headers are stripped: `Proxy-Connection`,
/// `Proxy-Authorization`, and every header named in the request's
/// `Connection` field.
pub fn prepare_request_headers(headers: &mut HeaderCollection) {
    if headers.contains("Accept-Encoding") {
        headers.set("Accept-Encoding", "gzip,deflate");
    }

    let connection_tokens: Vec<String> = headers
        .get_all("Connection")
        .iter()
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .filter(|t| !t.eq_ignore_ascii_case("close") && !t.eq_ignore_ascii_case("keep-alive"))
        .collect();

    headers.remove("Proxy-Connection");
    headers.remove("Proxy-Authorization");
    for token in connection_tokens {
        headers.remove(&token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Repeated header names keep order and multiplicity.
    #[test]
    fn repeated_headers_preserved() {
        let mut headers = HeaderCollection::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("X-Other", "x");
        headers.append("Set-Cookie", "b=2");

        assert_eq!(headers.get("set-cookie"), Some("a=1"));
        assert_eq!(headers.get_all("Set-Cookie"), vec!["a=1", "b=2"]);
        assert_eq!(headers.len(), 3);
    }

    /// `set` collapses repeats into a single entry at the first position.
    #[test]
    fn set_replaces_all_occurrences() {
        let mut headers = HeaderCollection::new();
        headers.append("Accept-Encoding", "br");
        headers.append("Host", "example.com");
        headers.append("accept-encoding", "zstd");

        headers.set("Accept-Encoding", "gzip,deflate");
        assert_eq!(headers.get_all("Accept-Encoding"), vec!["gzip,deflate"]);
        // Position of the first occurrence is kept.
        assert_eq!(headers.iter().next().unwrap().0, "Accept-Encoding");
    }

    /// Token matching is case-insensitive and comma-aware.
    #[test]
    fn token_matching() {
        let mut headers = HeaderCollection::new();
        headers.append("Transfer-Encoding", "gzip, Chunked");
        assert!(headers.has_token("transfer-encoding", "chunked"));
        assert!(!headers.has_token("transfer-encoding", "identity"));
    }

    /// Dispatch rewriting pins Accept-Encoding and strips hop-by-hop
    /// headers named in Connection.
    #[test]
    fn prepare_strips_hop_by_hop() {
        let mut headers = HeaderCollection::new();
        headers.append("Host", "example.com");
        headers.append("Accept-Encoding", "br");
        headers.append("Proxy-Connection", "keep-alive");
        headers.append("Proxy-Authorization", "Basic Zm9vOmJhcg==");
        headers.append("Connection", "close, X-Tracking");
        headers.append("X-Tracking", "abc");

        prepare_request_headers(&mut headers);

        assert_eq!(headers.get("Accept-Encoding"), Some("gzip,deflate"));
        assert!(!headers.contains("Proxy-Connection"));
        assert!(!headers.contains("Proxy-Authorization"));
        assert!(!headers.contains("X-Tracking"));
        // Connection itself survives; it still governs keep-alive.
        assert!(headers.contains("Connection"));
        assert!(headers.contains("Host"));
    }

    /// A request without Accept-Encoding does not gain one.
    #[test]
    fn prepare_does_not_invent_accept_encoding() {
        let mut headers = HeaderCollection::new();
        headers.append("Host", "example.com");
        prepare_request_headers(&mut headers);
        assert!(!headers.contains("Accept-Encoding"));
    }
}
