//! Proxy configuration: listening endpoints, interception patterns, and
//! session-loop tuning knobs.
//!
//! Configuration is loaded from YAML and validated once at startup. The
//! include/exclude pattern lists are compiled into an [`InterceptionFilter`]
//! so per-connection checks never touch the raw strings.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

fn default_buffer_size() -> usize {
    8192
}

fn default_true() -> bool {
    true
}

/// TLS protocol versions offered during interception handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub(crate) fn as_rustls(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// An upstream HTTP or HTTPS proxy to chain through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalProxy {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ExternalProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A listening endpoint and its interception mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Endpoint {
    /// Explicit proxy endpoint: clients speak absolute-form HTTP or issue
    /// `CONNECT` for TLS targets.
    Explicit { listen: SocketAddr },
    /// Transparent endpoint: clients believe they reached the origin.
    /// With `tls_enabled`, the listener terminates TLS immediately using
    /// a certificate minted for `generic_cert_name`.
    Transparent {
        listen: SocketAddr,
        #[serde(default)]
        tls_enabled: bool,
        generic_cert_name: String,
    },
}

impl Endpoint {
    pub fn listen_addr(&self) -> SocketAddr {
        match self {
            Endpoint::Explicit { listen } => *listen,
            Endpoint::Transparent { listen, .. } => *listen,
        }
    }
}

/// Proxy configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listening endpoints. At least one is required to run the server.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// Read buffer capacity; bounds request-line and header-block size.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// TLS versions offered on intercepted handshakes. Empty means both.
    #[serde(default)]
    pub supported_tls_versions: Vec<TlsVersion>,

    /// Negotiate `Expect: 100-continue` with the upstream before the
    /// client sends the request body.
    #[serde(default = "default_true")]
    pub enable_100_continue: bool,

    /// Hosts to intercept. When non-empty, a CONNECT target matching none
    /// of these patterns is tunneled opaquely, regardless of the exclude
    /// list.
    #[serde(default)]
    pub include_https_patterns: Vec<String>,

    /// Hosts to never intercept.
    #[serde(default)]
    pub exclude_https_patterns: Vec<String>,

    /// Chain plaintext HTTP requests through this proxy.
    #[serde(default)]
    pub upstream_http_proxy: Option<ExternalProxy>,

    /// Chain HTTPS requests through this proxy (via CONNECT).
    #[serde(default)]
    pub upstream_https_proxy: Option<ExternalProxy>,
}

impl ProxyConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ProxyError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ProxyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.buffer_size < 512 {
            return Err(ProxyError::Config(format!(
                "buffer_size {} is too small to hold a request line",
                self.buffer_size
            )));
        }
        // Compiling also validates the pattern syntax.
        self.interception_filter()?;
        Ok(())
    }

    /// Compiles the include/exclude pattern lists.
    pub fn interception_filter(&self) -> Result<InterceptionFilter, ProxyError> {
        InterceptionFilter::compile(&self.include_https_patterns, &self.exclude_https_patterns)
    }

    /// TLS versions to offer, defaulting to TLS 1.2 + 1.3.
    pub fn tls_versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        if self.supported_tls_versions.is_empty() {
            vec![&rustls::version::TLS12, &rustls::version::TLS13]
        } else {
            self.supported_tls_versions
                .iter()
                .map(|v| v.as_rustls())
                .collect()
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            buffer_size: default_buffer_size(),
            supported_tls_versions: Vec::new(),
            enable_100_continue: true,
            include_https_patterns: Vec::new(),
            exclude_https_patterns: Vec::new(),
            upstream_http_proxy: None,
            upstream_https_proxy: None,
        }
    }
}

/// Compiled interception patterns for CONNECT targets.
pub struct InterceptionFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl InterceptionFilter {
    fn compile(include: &[String], exclude: &[String]) -> Result<Self, ProxyError> {
        let compile_all = |patterns: &[String]| -> Result<Vec<Regex>, ProxyError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| ProxyError::Config(format!("invalid pattern {p:?}: {e}")))
                })
                .collect()
        };
        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
        })
    }

    /// An empty filter intercepts everything.
    pub fn intercept_all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Whether a CONNECT target host is excluded from interception.
    ///
    /// When include patterns exist they decide: a host matched by none of
    /// them is excluded even if no exclude pattern matches.
    pub fn is_excluded(&self, host: &str) -> bool {
        if !self.include.is_empty() {
            return !self.include.iter().any(|re| re.is_match(host));
        }
        self.exclude.iter().any(|re| re.is_match(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_CONFIG: &str = r#"
endpoints:
  - mode: explicit
    listen: "127.0.0.1:8080"
  - mode: transparent
    listen: "127.0.0.1:8443"
    tls_enabled: true
    generic_cert_name: "localhost"
buffer_size: 16384
supported_tls_versions: [tls12, tls13]
exclude_https_patterns:
  - "^badssl\\.com$"
upstream_https_proxy:
  host: "10.0.0.1"
  port: 3128
"#;

    /// Tests parsing a complete YAML configuration file.
    #[test]
    fn parse_example_config() {
        let config = ProxyConfig::parse(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.buffer_size, 16384);
        assert!(config.enable_100_continue);
        assert_eq!(config.exclude_https_patterns.len(), 1);
        assert_eq!(
            config.upstream_https_proxy,
            Some(ExternalProxy {
                host: "10.0.0.1".to_string(),
                port: 3128,
            })
        );
        match &config.endpoints[1] {
            Endpoint::Transparent {
                tls_enabled,
                generic_cert_name,
                ..
            } => {
                assert!(tls_enabled);
                assert_eq!(generic_cert_name, "localhost");
            }
            other => panic!("expected transparent endpoint, got {other:?}"),
        }
    }

    /// Tests that invalid regex patterns are rejected during validation.
    #[test]
    fn invalid_pattern_rejected() {
        let yaml = r#"
exclude_https_patterns:
  - "["
"#;
        assert!(ProxyConfig::parse(yaml).is_err());
    }

    /// Exclude patterns alone: only matching hosts are excluded.
    #[test]
    fn exclude_only_filter() {
        let filter =
            InterceptionFilter::compile(&[], &["^badssl\\.com$".to_string()]).unwrap();
        assert!(filter.is_excluded("badssl.com"));
        assert!(!filter.is_excluded("example.com"));
    }

    /// When include patterns exist they decide: hosts outside the include
    /// list are excluded even without a matching exclude pattern.
    #[test]
    fn include_list_decides() {
        let filter = InterceptionFilter::compile(
            &["\\.example\\.com$".to_string()],
            &["^irrelevant$".to_string()],
        )
        .unwrap();
        assert!(!filter.is_excluded("api.example.com"));
        assert!(filter.is_excluded("other.org"));
    }

    /// An empty filter intercepts every target.
    #[test]
    fn empty_filter_intercepts_all() {
        let filter = InterceptionFilter::intercept_all();
        assert!(!filter.is_excluded("anything.example"));
    }
}
