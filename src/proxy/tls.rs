//! TLS interception: ClientHello detection and the server-side handshake
//! with a dynamically minted certificate.

use std::sync::Arc;

use rustls::ServerConfig;
use tracing::debug;

use crate::ca::{wildcard_name, CertCache};
use crate::error::ProxyError;
use crate::http::{BoxedIo, BufferedConn};

/// First byte of a TLS record carrying a handshake message.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Whether the peeked byte opens a TLS ClientHello.
pub fn is_tls_client_hello(first_byte: u8) -> bool {
    first_byte == TLS_HANDSHAKE_RECORD
}

/// Performs the man-in-the-middle server handshake over an intercepted
/// client stream, using leaf certificates minted on demand.
pub struct TlsInterceptor {
    cert_cache: Arc<CertCache>,
    versions: Vec<&'static rustls::SupportedProtocolVersion>,
    buffer_size: usize,
}

impl TlsInterceptor {
    pub fn new(
        cert_cache: Arc<CertCache>,
        versions: Vec<&'static rustls::SupportedProtocolVersion>,
        buffer_size: usize,
    ) -> Self {
        Self {
            cert_cache,
            versions,
            buffer_size,
        }
    }

    /// Accepts TLS for a CONNECT target, minting a certificate for the
    /// wildcard-normalized hostname.
    ///
    /// The handshake runs over the buffered stream, so bytes peeked for
    /// ClientHello detection are consumed by the handshake itself. The
    /// returned connection replaces the caller's transport.
    pub async fn accept(
        &self,
        io: BufferedConn<BoxedIo>,
        host: &str,
    ) -> Result<BufferedConn<BoxedIo>, ProxyError> {
        self.accept_with_cert_name(io, &wildcard_name(host)).await
    }

    /// Accepts TLS using the certificate name verbatim. Transparent
    /// endpoints use this with their fixed generic certificate name.
    pub async fn accept_with_cert_name(
        &self,
        io: BufferedConn<BoxedIo>,
        cert_name: &str,
    ) -> Result<BufferedConn<BoxedIo>, ProxyError> {
        let certified_key = self.cert_cache.get_or_create(cert_name)?;
        let config = self.server_config(certified_key)?;
        let acceptor = tokio_rustls::TlsAcceptor::from(config);

        let tls_stream = acceptor
            .accept(io)
            .await
            .map_err(ProxyError::TlsHandshakeFailed)?;
        debug!("intercepted TLS handshake completed for {}", cert_name);

        Ok(BufferedConn::new(
            Box::new(tls_stream) as BoxedIo,
            self.buffer_size,
        ))
    }

    /// Server config offering the configured protocol versions, no client
    /// certificate, no revocation checking.
    fn server_config(
        &self,
        certified_key: Arc<rustls::sign::CertifiedKey>,
    ) -> Result<Arc<ServerConfig>, ProxyError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&self.versions)
            .map_err(|e| ProxyError::Config(format!("TLS config error: {e}")))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SingleCertResolver(certified_key)));
        Ok(Arc::new(config))
    }
}

/// Resolver that always serves the one certificate minted for this
/// connection's target.
struct SingleCertResolver(Arc<rustls::sign::CertifiedKey>);

impl std::fmt::Debug for SingleCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleCertResolver").finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for SingleCertResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaState;
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn interceptor() -> (Arc<CertCache>, TlsInterceptor) {
        let ca = Arc::new(CaState::generate().unwrap());
        let cache = Arc::new(CertCache::new(ca));
        let interceptor = TlsInterceptor::new(
            Arc::clone(&cache),
            vec![&rustls::version::TLS12, &rustls::version::TLS13],
            8192,
        );
        (cache, interceptor)
    }

    fn client_config(cache: &CertCache) -> Arc<rustls::ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(cache.ca().ca_cert_der().clone()).unwrap();
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    /// Record type 0x16 is a ClientHello; anything else is opaque.
    #[test]
    fn client_hello_detection() {
        assert!(is_tls_client_hello(0x16));
        assert!(!is_tls_client_hello(b'G'));
        assert!(!is_tls_client_hello(0x17));
    }

    /// Full interception handshake: a client trusting the CA completes a
    /// handshake against the minted certificate and exchanges plaintext.
    #[tokio::test]
    async fn handshake_with_minted_cert() {
        let (cache, interceptor) = interceptor();
        let (client_side, server_side) = duplex(64 * 1024);

        let connector = tokio_rustls::TlsConnector::from(client_config(&cache));
        let client_task = tokio::spawn(async move {
            let name = ServerName::try_from("example.com").unwrap();
            let mut tls = connector.connect(name, client_side).await.unwrap();
            tls.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            tls.flush().await.unwrap();
            let mut reply = [0u8; 2];
            tls.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"ok");
        });

        let io = BufferedConn::new(Box::new(server_side) as BoxedIo, 8192);
        let mut intercepted = interceptor.accept(io, "example.com").await.unwrap();

        // The request line is readable as plaintext after interception.
        let line = intercepted.read_line().await.unwrap().unwrap();
        assert_eq!(line, "GET / HTTP/1.1");
        intercepted.read_line().await.unwrap();
        intercepted.write_all(b"ok").await.unwrap();
        intercepted.flush().await.unwrap();
        // Let the client finish reading before the stream drops.
        client_task.await.unwrap();

        // example.com has two labels: minted verbatim.
        assert_eq!(cache.minted_count(), 1);
    }

    /// The handshake still succeeds when the ClientHello was peeked at
    /// first, because peeked bytes stay in the buffer.
    #[tokio::test]
    async fn handshake_after_peek() {
        let (cache, interceptor) = interceptor();
        let (client_side, server_side) = duplex(64 * 1024);

        let connector = tokio_rustls::TlsConnector::from(client_config(&cache));
        let client_task = tokio::spawn(async move {
            let name = ServerName::try_from("sub.example.com").unwrap();
            let mut tls = connector.connect(name, client_side).await.unwrap();
            tls.write_all(b"ping").await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut io = BufferedConn::new(Box::new(server_side) as BoxedIo, 8192);
        let first = io.peek_byte().await.unwrap().unwrap();
        assert!(is_tls_client_hello(first));

        let mut intercepted = interceptor.accept(io, "sub.example.com").await.unwrap();
        let mut payload = [0u8; 4];
        intercepted.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");
        client_task.await.unwrap();

        // Three labels: the leftmost collapses to a wildcard.
        assert_eq!(cache.minted_count(), 1);
        assert!(cache.get_or_create("*.example.com").is_ok());
        assert_eq!(cache.minted_count(), 1);
    }

    /// Non-TLS bytes after CONNECT must not be wrapped; the dispatcher
    /// checks the peeked byte before calling the interceptor.
    #[tokio::test]
    async fn plaintext_not_mistaken_for_hello() {
        let (_cache, _interceptor) = interceptor();
        let (mut client_side, server_side) = duplex(1024);
        client_side.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut io = BufferedConn::new(Box::new(server_side) as BoxedIo, 8192);
        let first = io.peek_byte().await.unwrap().unwrap();
        assert!(!is_tls_client_hello(first));
    }
}
