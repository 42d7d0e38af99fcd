//! Upstream connection acquisition: direct TCP, client TLS, and chaining
//! through an upstream HTTP/HTTPS proxy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::ExternalProxy;
use crate::error::ProxyError;
use crate::http::{BoxedIo, BufferedConn, HttpVersion};

/// Timeout for upstream TCP connect.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Live upstream connections across the whole process.
static SERVER_CONNECTION_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Number of upstream connections currently alive.
pub fn server_connection_count() -> usize {
    SERVER_CONNECTION_COUNT.load(Ordering::SeqCst)
}

/// Decrements the process-wide counter when dropped, so every disposal
/// path of an [`UpstreamConnection`] is covered.
pub(crate) struct ConnectionCountGuard(());

impl ConnectionCountGuard {
    fn new() -> Self {
        SERVER_CONNECTION_COUNT.fetch_add(1, Ordering::SeqCst);
        Self(())
    }
}

impl Drop for ConnectionCountGuard {
    fn drop(&mut self) {
        SERVER_CONNECTION_COUNT.fetch_sub(1, Ordering::SeqCst);
    }
}

/// URI scheme of the target the connection was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// A connection to the origin server or an upstream proxy.
pub struct UpstreamConnection {
    pub(crate) io: BufferedConn<BoxedIo>,
    host: String,
    port: u16,
    scheme: Scheme,
    version: HttpVersion,
    tls_wrapped: bool,
    via_proxy: Option<ExternalProxy>,
    _guard: ConnectionCountGuard,
}

impl UpstreamConnection {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn is_tls_wrapped(&self) -> bool {
        self.tls_wrapped
    }

    pub fn via_proxy(&self) -> Option<&ExternalProxy> {
        self.via_proxy.as_ref()
    }

    /// Case-insensitive host comparison for the reuse policy.
    pub fn matches_host(&self, host: &str) -> bool {
        self.host.eq_ignore_ascii_case(host)
    }

    /// Splits the connection into its transport and the counter guard, for
    /// hand-off to a raw tunnel that outlives this wrapper.
    pub(crate) fn into_parts(self) -> (BufferedConn<BoxedIo>, ConnectionCountGuard) {
        (self.io, self._guard)
    }
}

/// Factory for upstream connections, holding the shared TLS client
/// configuration so the root store is built once.
pub struct UpstreamConnector {
    tls: TlsConnector,
    buffer_size: usize,
}

impl UpstreamConnector {
    /// Connector trusting the platform's default roots (webpki).
    pub fn new(buffer_size: usize) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_root_store(buffer_size, root_store)
    }

    /// Connector with a custom upstream trust store, for environments with
    /// private CAs.
    pub fn with_root_store(buffer_size: usize, root_store: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
            buffer_size,
        }
    }

    /// Opens a connection for the given target.
    ///
    /// HTTPS through an upstream proxy issues `CONNECT host:port`, requires
    /// a 200, then starts client TLS to the origin. Direct HTTPS opens TCP
    /// and starts TLS. HTTP opens TCP only (to the proxy when one is set).
    pub async fn create_client(
        &self,
        host: &str,
        port: u16,
        version: HttpVersion,
        is_https: bool,
        proxy: Option<ExternalProxy>,
    ) -> Result<UpstreamConnection, ProxyError> {
        let (connect_host, connect_port) = match &proxy {
            Some(p) => (p.host.as_str(), p.port),
            None => (host, port),
        };

        let tcp = tokio::time::timeout(
            UPSTREAM_CONNECT_TIMEOUT,
            TcpStream::connect((connect_host, connect_port)),
        )
        .await
        .map_err(|_| unavailable(host, "connection timed out"))?
        .map_err(|e| unavailable(host, e))?;

        let mut io = BufferedConn::new(Box::new(tcp) as BoxedIo, self.buffer_size);
        let mut tls_wrapped = false;

        if is_https {
            if proxy.is_some() {
                self.tunnel_through_proxy(&mut io, host, port).await?;
            }

            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| unavailable(host, "invalid TLS server name"))?;
            let tls_stream = self
                .tls
                .connect(server_name, io)
                .await
                .map_err(|e| unavailable(host, e))?;
            io = BufferedConn::new(Box::new(tls_stream) as BoxedIo, self.buffer_size);
            tls_wrapped = true;
        }

        debug!(
            "upstream connection to {}:{} (tls: {}, proxy: {:?})",
            host, port, tls_wrapped, proxy
        );

        Ok(UpstreamConnection {
            io,
            host: host.to_string(),
            port,
            scheme: if is_https { Scheme::Https } else { Scheme::Http },
            version,
            tls_wrapped,
            via_proxy: proxy,
            _guard: ConnectionCountGuard::new(),
        })
    }

    /// Issues `CONNECT host:port` to the upstream proxy and drains its
    /// response headers. Anything but a 200 makes the upstream unusable.
    async fn tunnel_through_proxy(
        &self,
        io: &mut BufferedConn<BoxedIo>,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
        io.write_all(connect.as_bytes())
            .await
            .map_err(|e| unavailable(host, e))?;
        io.flush().await.map_err(|e| unavailable(host, e))?;

        let status_line = io
            .read_line()
            .await
            .map_err(|e| unavailable(host, e))?
            .ok_or_else(|| unavailable(host, "proxy closed during CONNECT"))?;
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| unavailable(host, format!("malformed proxy response: {status_line}")))?;
        if status != 200 {
            return Err(unavailable(
                host,
                format!("upstream proxy rejected CONNECT with status {status}"),
            ));
        }

        loop {
            match io.read_line().await.map_err(|e| unavailable(host, e))? {
                Some(line) if line.is_empty() => return Ok(()),
                Some(_) => continue,
                None => return Err(unavailable(host, "proxy closed during CONNECT")),
            }
        }
    }
}

/// Serializes tests that assert on the process-global connection counter.
#[cfg(test)]
pub(crate) fn counter_test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unavailable(host: &str, reason: impl ToString) -> ProxyError {
    ProxyError::UpstreamUnavailable {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    /// Plain HTTP connect: counter goes up on create, down on drop.
    /// The counter is process-global, so assertions are delta-based.
    #[tokio::test]
    async fn counter_tracks_lifecycle() {
        let _guard = counter_test_guard();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let before = server_connection_count();
        let connector = UpstreamConnector::new(8192);
        let conn = connector
            .create_client("127.0.0.1", addr.port(), HttpVersion::Http11, false, None)
            .await
            .unwrap();
        assert_eq!(server_connection_count(), before + 1);
        assert!(!conn.is_tls_wrapped());
        assert_eq!(conn.scheme(), Scheme::Http);
        assert!(conn.matches_host("127.0.0.1"));

        drop(conn);
        assert_eq!(server_connection_count(), before);
    }

    /// HTTPS via an upstream proxy sends CONNECT first; a non-200 from the
    /// proxy surfaces as UpstreamUnavailable and never touches the counter.
    #[tokio::test]
    async fn proxy_connect_rejection() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = proxy_listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.starts_with("CONNECT example.com:443 HTTP/1.1"));
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).await.unwrap();
                if header.trim().is_empty() {
                    break;
                }
            }
            let mut stream = reader.into_inner();
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let _guard = counter_test_guard();
        let before = server_connection_count();
        let connector = UpstreamConnector::new(8192);
        let result = connector
            .create_client(
                "example.com",
                443,
                HttpVersion::Http11,
                true,
                Some(ExternalProxy {
                    host: proxy_addr.ip().to_string(),
                    port: proxy_addr.port(),
                }),
            )
            .await;
        assert!(matches!(
            result,
            Err(ProxyError::UpstreamUnavailable { .. })
        ));
        assert_eq!(server_connection_count(), before);
    }

    /// Connecting to a closed port is UpstreamUnavailable.
    #[tokio::test]
    async fn refused_connection() {
        // Bind-and-drop to get a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = UpstreamConnector::new(8192);
        let result = connector
            .create_client("127.0.0.1", addr.port(), HttpVersion::Http11, false, None)
            .await;
        assert!(matches!(
            result,
            Err(ProxyError::UpstreamUnavailable { .. })
        ));
    }
}
