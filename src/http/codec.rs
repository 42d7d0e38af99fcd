//! Buffered byte stream with CRLF line discipline, single-byte peeking,
//! and HTTP/1.x body relays.
//!
//! [`BufferedConn`] fronts a transport with a read-ahead buffer. Bytes
//! peeked or over-read stay in the buffer and are served first by the
//! `AsyncRead` impl, so the whole connection can be handed to a TLS
//! handshake without losing the ClientHello that was peeked at.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::ProxyError;
use crate::http::headers::HeaderCollection;
use crate::http::message::{parse_header_line, parse_request_line, Request, Response};

const IO_CHUNK_SIZE: usize = 8192;

/// Marker for transports the proxy can pump in both directions.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// A type-erased transport: plain TCP before interception, TLS after.
pub type BoxedIo = Box<dyn AsyncIo>;

/// Buffered connection over an arbitrary transport.
pub struct BufferedConn<S> {
    stream: S,
    read_buf: Vec<u8>,
    /// Bounds request-line and header-block sizes.
    capacity: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BufferedConn<S> {
    pub fn new(stream: S, capacity: usize) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reads more bytes from the transport into the buffer.
    /// Returns the number of bytes read; zero means EOF.
    async fn fill(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; IO_CHUNK_SIZE];
        let read = self.stream.read(&mut chunk).await?;
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Returns the next byte without consuming it, or `None` on EOF.
    ///
    /// The byte remains in the buffer and will be yielded again by
    /// subsequent reads.
    pub async fn peek_byte(&mut self) -> std::io::Result<Option<u8>> {
        while self.read_buf.is_empty() {
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
        Ok(self.read_buf.first().copied())
    }

    /// Reads one CRLF-terminated line, without the terminator.
    ///
    /// Returns `None` on a clean EOF before any byte of the line. EOF in
    /// the middle of a line, a line exceeding the buffer capacity, and
    /// non-UTF-8 bytes are all malformed.
    pub async fn read_line(&mut self) -> Result<Option<String>, ProxyError> {
        loop {
            if let Some(at) = self.read_buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.read_buf.drain(..=at).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|_| ProxyError::MalformedRequest("non-UTF-8 line".to_string()));
            }
            if self.read_buf.len() >= self.capacity {
                return Err(ProxyError::MalformedRequest(
                    "line exceeds buffer capacity".to_string(),
                ));
            }
            if self.fill().await.map_err(ProxyError::Io)? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::MalformedRequest(
                    "connection closed mid-line".to_string(),
                ));
            }
        }
    }

    /// Reads header lines until the blank terminator, appending the raw
    /// bytes of every line (terminator included) to `raw`.
    async fn read_header_block(&mut self, raw: &mut Vec<u8>) -> Result<HeaderCollection, ProxyError> {
        let mut headers = HeaderCollection::new();
        loop {
            let line = self.read_line().await?.ok_or_else(|| {
                ProxyError::MalformedRequest("connection closed inside headers".to_string())
            })?;
            raw.extend_from_slice(line.as_bytes());
            raw.extend_from_slice(b"\r\n");
            if raw.len() > self.capacity {
                return Err(ProxyError::MalformedRequest(
                    "header block exceeds buffer capacity".to_string(),
                ));
            }
            if line.is_empty() {
                return Ok(headers);
            }
            let (name, value) = parse_header_line(&line)?;
            headers.append(&name, &value);
        }
    }

    /// Reads header lines until the blank terminator, discarding the raw
    /// bytes. Used for the CONNECT handshake where no replay is needed.
    pub async fn read_headers(&mut self) -> Result<HeaderCollection, ProxyError> {
        let mut raw = Vec::new();
        self.read_header_block(&mut raw).await
    }

    /// Reads a full request head. `first_line` supplies a request line the
    /// dispatcher already consumed. Returns `None` when the client closed
    /// cleanly or sent an empty line.
    pub async fn read_request_head(
        &mut self,
        first_line: Option<String>,
    ) -> Result<Option<Request>, ProxyError> {
        let line = match first_line {
            Some(line) => line,
            None => match self.read_line().await? {
                Some(line) => line,
                None => return Ok(None),
            },
        };
        if line.is_empty() {
            return Ok(None);
        }

        let (method, target, version) = parse_request_line(&line)?;
        let mut raw = Vec::with_capacity(line.len() + 2);
        raw.extend_from_slice(line.as_bytes());
        raw.extend_from_slice(b"\r\n");
        let headers = self.read_header_block(&mut raw).await?;
        Ok(Some(Request::new(method, target, version, headers, raw)))
    }

    /// Reads a response head from the upstream.
    pub async fn read_response_head(
        &mut self,
        request_version: crate::http::HttpVersion,
    ) -> Result<Response, ProxyError> {
        let line = self
            .read_line()
            .await?
            .ok_or_else(|| ProxyError::UpstreamIo(eof("upstream closed before status line")))?;
        let (version, status, reason) = Response::parse_status_line(&line)?;
        let mut raw = Vec::new();
        let headers = self.read_header_block(&mut raw).await?;
        Ok(Response::new(version, status, reason, headers, request_version))
    }

    /// Copies exactly `remaining` bytes to `dst`, draining the read-ahead
    /// buffer first.
    pub async fn copy_exact<W: AsyncWrite + Unpin>(
        &mut self,
        dst: &mut W,
        mut remaining: u64,
    ) -> std::io::Result<u64> {
        let total = remaining;
        while remaining > 0 {
            if self.read_buf.is_empty() && self.fill().await? == 0 {
                return Err(eof("connection closed mid-body"));
            }
            let take = (self.read_buf.len() as u64).min(remaining) as usize;
            dst.write_all(&self.read_buf[..take]).await?;
            self.read_buf.drain(..take);
            remaining -= take as u64;
        }
        dst.flush().await?;
        Ok(total)
    }

    /// Copies bytes to `dst` until this side reports EOF. Used for
    /// close-delimited response bodies.
    pub async fn copy_to_end<W: AsyncWrite + Unpin>(
        &mut self,
        dst: &mut W,
    ) -> std::io::Result<u64> {
        let mut total = 0u64;
        loop {
            if self.read_buf.is_empty() && self.fill().await? == 0 {
                dst.flush().await?;
                return Ok(total);
            }
            dst.write_all(&self.read_buf).await?;
            total += self.read_buf.len() as u64;
            self.read_buf.clear();
        }
    }

    /// Relays a chunked body to `dst`: size lines, payloads, and the
    /// terminal chunk with any trailers, re-emitting the exact framing.
    pub async fn copy_chunked<W: AsyncWrite + Unpin>(
        &mut self,
        dst: &mut W,
    ) -> Result<u64, ProxyError> {
        let mut total = 0u64;
        loop {
            let size_line = self.read_line().await?.ok_or_else(|| {
                ProxyError::MalformedRequest("connection closed before chunk size".to_string())
            })?;
            let size_field = size_line.split(';').next().unwrap_or("").trim();
            let size = u64::from_str_radix(size_field, 16).map_err(|_| {
                ProxyError::MalformedRequest(format!("invalid chunk size: {size_line:?}"))
            })?;

            dst.write_all(size_line.as_bytes()).await?;
            dst.write_all(b"\r\n").await?;

            if size == 0 {
                // Trailer section runs to the blank line.
                loop {
                    let trailer = self.read_line().await?.ok_or_else(|| {
                        ProxyError::MalformedRequest(
                            "connection closed inside trailers".to_string(),
                        )
                    })?;
                    dst.write_all(trailer.as_bytes()).await?;
                    dst.write_all(b"\r\n").await?;
                    if trailer.is_empty() {
                        dst.flush().await?;
                        return Ok(total);
                    }
                }
            }

            total += self.copy_exact(dst, size).await?;

            let mut crlf = [0u8; 2];
            self.read_exact(&mut crlf).await?;
            if &crlf != b"\r\n" {
                return Err(ProxyError::MalformedRequest(
                    "chunk payload not followed by CRLF".to_string(),
                ));
            }
            dst.write_all(b"\r\n").await?;
        }
    }
}

fn eof(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, message)
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for BufferedConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let take = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..take]);
            self.read_buf.drain(..take);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for BufferedConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpVersion;
    use tokio::io::duplex;

    fn conn_over(data: &[u8]) -> BufferedConn<tokio::io::DuplexStream> {
        let (client, mut server) = duplex(64 * 1024);
        let data = data.to_vec();
        tokio::spawn(async move {
            server.write_all(&data).await.unwrap();
            server.shutdown().await.unwrap();
        });
        BufferedConn::new(client, 8192)
    }

    /// Lines come back without terminators; EOF yields None.
    #[tokio::test]
    async fn read_lines() {
        let mut conn = conn_over(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.read_line().await.unwrap().unwrap(), "GET / HTTP/1.1");
        assert_eq!(conn.read_line().await.unwrap().unwrap(), "Host: x");
        assert_eq!(conn.read_line().await.unwrap().unwrap(), "");
        assert!(conn.read_line().await.unwrap().is_none());
    }

    /// Peeking does not consume: the peeked byte is read again afterwards.
    #[tokio::test]
    async fn peek_leaves_bytes() {
        let mut conn = conn_over(&[0x16, 0x03, 0x01]);
        assert_eq!(conn.peek_byte().await.unwrap(), Some(0x16));
        assert_eq!(conn.peek_byte().await.unwrap(), Some(0x16));

        let mut bytes = [0u8; 3];
        conn.read_exact(&mut bytes).await.unwrap();
        assert_eq!(bytes, [0x16, 0x03, 0x01]);
    }

    /// A full request head parses with flags and raw bytes preserved.
    #[tokio::test]
    async fn read_request() {
        let raw = b"POST /u HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nbody";
        let mut conn = conn_over(raw);
        let request = conn.read_request_head(None).await.unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/u");
        assert_eq!(request.version, HttpVersion::Http11);
        assert_eq!(request.content_length(), Some(4));
        assert_eq!(
            request.raw_head(),
            b"POST /u HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\n"
        );

        // The body is still readable after the head.
        let mut body = [0u8; 4];
        conn.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"body");
    }

    /// An empty first line ends the session cleanly.
    #[tokio::test]
    async fn empty_line_ends_session() {
        let mut conn = conn_over(b"\r\n");
        assert!(conn.read_request_head(None).await.unwrap().is_none());
    }

    /// A header line without a colon is malformed.
    #[tokio::test]
    async fn malformed_header_rejected() {
        let mut conn = conn_over(b"GET / HTTP/1.1\r\nbroken line\r\n\r\n");
        assert!(matches!(
            conn.read_request_head(None).await,
            Err(ProxyError::MalformedHeader(_))
        ));
    }

    /// Fixed-length copy drains buffered bytes before touching the
    /// transport and copies exactly the requested count.
    #[tokio::test]
    async fn copy_exact_bytes() {
        let mut conn = conn_over(b"hello world");
        // Buffer part of the stream via a line-less peek.
        conn.peek_byte().await.unwrap();

        let mut out = Vec::new();
        let copied = conn.copy_exact(&mut out, 5).await.unwrap();
        assert_eq!(copied, 5);
        assert_eq!(out, b"hello");
    }

    /// Chunked relay reproduces the framing including the terminator.
    #[tokio::test]
    async fn copy_chunked_roundtrip() {
        let framed = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut conn = conn_over(framed);
        let mut out = Vec::new();
        let payload = conn.copy_chunked(&mut out).await.unwrap();
        assert_eq!(payload, 9);
        assert_eq!(out, framed);
    }

    /// Chunk extensions are tolerated and passed through.
    #[tokio::test]
    async fn chunk_extensions() {
        let framed = b"4;ext=1\r\nWiki\r\n0\r\n\r\n";
        let mut conn = conn_over(framed);
        let mut out = Vec::new();
        conn.copy_chunked(&mut out).await.unwrap();
        assert_eq!(out, framed);
    }

    /// A response head computes keep-alive from versions and Connection.
    #[tokio::test]
    async fn read_response() {
        let mut conn =
            conn_over(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
        let response = conn.read_response_head(HttpVersion::Http11).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(!response.keep_alive);
    }
}
