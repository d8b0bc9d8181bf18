//! Plain-TCP HTTP/1.1 transport.
//!
//! Each connection is driven on its own task: resolve, create the socket,
//! connect, then write the request as the orchestrator hands it over while
//! watching the socket for the response head. A response that arrives before
//! the body is fully written is delivered at once and the rest of the body is
//! discarded. The response body is left on the socket for whoever takes the
//! response.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream;
use hickory_resolver::TokioAsyncResolver;
use http::{header, StatusCode, Uri};
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
};

use super::{
    codec::{
        encode_chunk, encode_head, parse_response_head, ChunkedDecoder, Decoded, RequestFraming,
        ResponseFraming, ResponseHead, CHUNKED_TERMINATOR,
    },
    Connection, ConnectionDriver, Outbound, Transport, DEFAULT_WRITE_BUFFER,
};
use crate::{
    core::{RequestDescriptor, Response, ResponseBody, TransportError, TransportResult},
    utils::request::method_expects_body,
};

const READ_CHUNK_SIZE: usize = 8 * 1024;

static GLOBAL_RESOLVER: OnceCell<Arc<TokioAsyncResolver>> = OnceCell::new();

fn global_resolver() -> TransportResult<Arc<TokioAsyncResolver>> {
    GLOBAL_RESOLVER
        .get_or_try_init(|| TokioAsyncResolver::tokio_from_system_conf().map(Arc::new))
        .cloned()
        .map_err(|e| {
            TransportError::new("ENOTFOUND", format!("resolver unavailable: {e}")).with_cause(e)
        })
}

/// HTTP/1.1 over plain TCP, one connection per request
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
    write_buffer: usize,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            timeout: None,
            write_buffer: DEFAULT_WRITE_BUFFER,
        }
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the time spent in the connect handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Default limit on waiting for the response head, used when the request
    /// does not carry its own.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Depth of the outbound frame queue.
    pub fn with_write_buffer(mut self, frames: usize) -> Self {
        self.write_buffer = frames.max(1);
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, descriptor: &RequestDescriptor) -> TransportResult<Connection> {
        let target = Target::from_uri(&descriptor.uri)?;
        let (connection, driver) = Connection::channel(self.write_buffer);
        let exchange = Exchange {
            descriptor: descriptor.clone(),
            target,
            connect_timeout: self.connect_timeout,
            timeout: descriptor.options.timeout.or(self.timeout),
        };
        tokio::spawn(exchange.drive(driver));
        Ok(connection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
}

impl Target {
    fn from_uri(uri: &Uri) -> TransportResult<Self> {
        match uri.scheme_str() {
            Some("http") => {}
            Some(scheme) => {
                return Err(TransportError::new(
                    "EPROTONOSUPPORT",
                    format!("unsupported scheme {scheme}"),
                ))
            }
            None => {
                return Err(TransportError::new(
                    "EINVAL",
                    format!("request URI {uri} is not absolute"),
                ))
            }
        }
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TransportError::new("EINVAL", format!("request URI {uri} has no host")))?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: uri.port_u16().unwrap_or(80),
        })
    }

    async fn resolve(&self) -> TransportResult<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        log::debug!("Resolving DNS for host: {}", self.host);
        let not_found = || TransportError::new("ENOTFOUND", format!("getaddrinfo ENOTFOUND {}", self.host));
        let lookup = global_resolver()?
            .lookup_ip(self.host.as_str())
            .await
            .map_err(|e| not_found().with_cause(e))?;
        lookup
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, self.port))
            .ok_or_else(not_found)
    }
}

struct Exchange {
    descriptor: RequestDescriptor,
    target: Target,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
}

impl Exchange {
    async fn drive(self, mut driver: ConnectionDriver) {
        if let Err(err) = self.run(&mut driver).await {
            log::debug!(
                "{} {} failed: {}",
                self.descriptor.method,
                self.descriptor.uri,
                err
            );
            driver.fail(err);
        }
    }

    async fn run(&self, driver: &mut ConnectionDriver) -> TransportResult<()> {
        let addr = driver.until_destroyed(self.target.resolve()).await??;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        driver.socket();

        let connect = socket.connect(addr);
        let mut stream = match self.connect_timeout {
            Some(limit) => driver
                .until_destroyed(tokio::time::timeout(limit, connect))
                .await?
                .map_err(|_| {
                    TransportError::new("ETIMEDOUT", format!("connect ETIMEDOUT {addr}"))
                })??,
            None => driver.until_destroyed(connect).await??,
        };
        driver.connected();
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY on {addr}: {e}");
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let (head, uploaded) = {
            let (mut reader, mut writer) = stream.split();
            let mut upload = Upload::new(&self.descriptor);
            let reading = read_head(&mut reader, &mut buf);
            tokio::pin!(reading);

            // The peer may answer before the body is fully written
            let early = loop {
                tokio::select! {
                    biased;
                    head = &mut reading => break Some(head?),
                    ended = upload.step(driver, &mut writer) => {
                        if ended? {
                            break None;
                        }
                    }
                }
            };

            match early {
                Some(head) => (head, false),
                None => {
                    let head = match self.timeout {
                        Some(limit) => driver
                            .until_destroyed(tokio::time::timeout(limit, &mut reading))
                            .await?
                            .map_err(|_| TransportError::new("ETIMEDOUT", "response timed out"))??,
                        None => driver.until_destroyed(&mut reading).await??,
                    };
                    (head, true)
                }
            }
        };

        let framing = ResponseFraming::for_response(&self.descriptor.method, &head)?;
        let body = match framing {
            ResponseFraming::Empty => ResponseBody::empty(),
            framing => BodyReader::new(stream, buf, framing).into_body(),
        };
        driver.respond(Response::new(head.status, head.version, head.headers, body));

        if !uploaded {
            log::debug!(
                "{} {} answered before the request body was sent, discarding the rest",
                self.descriptor.method,
                self.descriptor.uri
            );
            discard_outbound(driver).await;
        }
        Ok(())
    }
}

/// Request write state, advanced one outbound frame at a time.
///
/// The head is held back until the first frame arrives, since that frame
/// decides the framing, and is then coalesced with it.
struct Upload<'a> {
    descriptor: &'a RequestDescriptor,
    framing: Option<RequestFraming>,
    pending: BytesMut,
}

impl<'a> Upload<'a> {
    fn new(descriptor: &'a RequestDescriptor) -> Self {
        Self {
            descriptor,
            framing: None,
            pending: BytesMut::new(),
        }
    }

    fn framing_for(&self, first: &Outbound) -> RequestFraming {
        let declared = self.descriptor.headers.contains_key(header::CONTENT_LENGTH);
        match (first, declared) {
            (_, true) => RequestFraming::Declared,
            (Outbound::Chunk(_), false) => RequestFraming::Chunked,
            (Outbound::End, false) => RequestFraming::Empty {
                zero_length: method_expects_body(&self.descriptor.method),
            },
        }
    }

    /// Write the next outbound frame. Returns whether the body has ended.
    async fn step<W>(&mut self, driver: &mut ConnectionDriver, writer: &mut W) -> TransportResult<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = driver.next_outbound().await?.ok_or_else(TransportError::aborted)?;
        let framing = match self.framing {
            Some(framing) => framing,
            None => {
                let framing = self.framing_for(&frame);
                self.pending = encode_head(self.descriptor, framing);
                self.framing = Some(framing);
                framing
            }
        };

        match frame {
            Outbound::Chunk(chunk) => {
                let chunk = if framing == RequestFraming::Chunked {
                    encode_chunk(&chunk)
                } else {
                    chunk
                };
                if self.pending.is_empty() {
                    driver.until_destroyed(writer.write_all(&chunk)).await??;
                } else {
                    self.pending.extend_from_slice(&chunk);
                    let pending = self.pending.split().freeze();
                    driver.until_destroyed(writer.write_all(&pending)).await??;
                }
                Ok(false)
            }
            Outbound::End => {
                if framing == RequestFraming::Chunked {
                    self.pending.extend_from_slice(CHUNKED_TERMINATOR);
                }
                if !self.pending.is_empty() {
                    let pending = self.pending.split().freeze();
                    driver.until_destroyed(writer.write_all(&pending)).await??;
                }
                driver.until_destroyed(writer.flush()).await??;
                Ok(true)
            }
        }
    }
}

/// Accept and drop outbound frames until the body ends, the writers go away
/// or the connection is torn down.
async fn discard_outbound(driver: &mut ConnectionDriver) {
    let mut discarded = 0usize;
    while let Ok(Some(Outbound::Chunk(chunk))) = driver.next_outbound().await {
        discarded += chunk.len();
    }
    log::trace!("Discarded {discarded} body bytes after early response");
}

/// Read until a final (non-interim) response head is available.
async fn read_head<R>(reader: &mut R, buf: &mut BytesMut) -> TransportResult<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(head) = parse_response_head(buf)? {
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                log::debug!("Skipping interim response {}", head.status);
                continue;
            }
            return Ok(head);
        }
        buf.reserve(READ_CHUNK_SIZE);
        if reader.read_buf(buf).await? == 0 {
            return Err(TransportError::hang_up());
        }
    }
}

/// Reads the response body off the socket according to its framing.
struct BodyReader {
    stream: TcpStream,
    buf: BytesMut,
    framing: ResponseFraming,
    remaining: u64,
    decoder: ChunkedDecoder,
}

impl BodyReader {
    fn new(stream: TcpStream, buf: BytesMut, framing: ResponseFraming) -> Self {
        let remaining = match framing {
            ResponseFraming::Length(length) => length,
            _ => 0,
        };
        Self {
            stream,
            buf,
            framing,
            remaining,
            decoder: ChunkedDecoder::new(),
        }
    }

    fn into_body(self) -> ResponseBody {
        ResponseBody::new(stream::try_unfold(self, |mut reader| async move {
            let chunk = reader.next_chunk().await?;
            Ok::<_, TransportError>(chunk.map(|chunk| (chunk, reader)))
        }))
    }

    async fn fill(&mut self) -> TransportResult<usize> {
        self.buf.reserve(READ_CHUNK_SIZE);
        Ok(self.stream.read_buf(&mut self.buf).await?)
    }

    async fn next_chunk(&mut self) -> TransportResult<Option<Bytes>> {
        match self.framing {
            ResponseFraming::Empty => Ok(None),
            ResponseFraming::Length(_) => {
                if self.remaining == 0 {
                    return Ok(None);
                }
                if self.buf.is_empty() && self.fill().await? == 0 {
                    return Err(premature_close());
                }
                let take = self.remaining.min(self.buf.len() as u64);
                self.remaining -= take;
                Ok(Some(self.buf.split_to(take as usize).freeze()))
            }
            ResponseFraming::Chunked => loop {
                if self.decoder.is_done() {
                    return Ok(None);
                }
                match self.decoder.decode(&mut self.buf)? {
                    Decoded::Data(data) => return Ok(Some(data)),
                    Decoded::Done => return Ok(None),
                    Decoded::NeedMore => {
                        if self.fill().await? == 0 {
                            return Err(premature_close());
                        }
                    }
                }
            },
            ResponseFraming::UntilClose => {
                if self.buf.is_empty() && self.fill().await? == 0 {
                    return Ok(None);
                }
                Ok(Some(self.buf.split().freeze()))
            }
        }
    }
}

fn premature_close() -> TransportError {
    TransportError::new("ECONNRESET", "aborted: connection closed before the response body ended")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::Method;
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        transport::TransportSignal,
        utils::response::read_to_bytes,
    };

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Accept one connection, read the full request head plus `body_len`
    /// bytes (or until the chunked terminator), reply with `reply`, and hand
    /// back what was received.
    async fn one_shot_peer(reply: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if request_complete(&received) {
                    break;
                }
            }
            socket.write_all(reply).await.unwrap();
            socket.shutdown().await.unwrap();
            received
        });
        (addr, handle)
    }

    fn request_complete(received: &[u8]) -> bool {
        let text = String::from_utf8_lossy(received);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let head = text[..head_end].to_ascii_lowercase();
        let body = &text[head_end + 4..];
        if head.contains("transfer-encoding: chunked") {
            return body.ends_with("0\r\n\r\n");
        }
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length: "))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        body.len() >= length
    }

    async fn run(
        transport: &TcpTransport,
        descriptor: &RequestDescriptor,
        body: Vec<Outbound>,
    ) -> TransportResult<Response> {
        let mut connection = transport.open(descriptor).await?;
        let writer = connection.writer();
        loop {
            match connection.next_signal().await {
                Some(TransportSignal::Socket) => {}
                Some(TransportSignal::Connect) => {
                    for frame in body.clone() {
                        match frame {
                            Outbound::Chunk(chunk) => writer.write(chunk).await?,
                            Outbound::End => writer.end().await?,
                        }
                    }
                }
                Some(TransportSignal::Response(response)) => return Ok(response),
                Some(TransportSignal::Error(err)) => return Err(err),
                None => return Err(TransportError::aborted()),
            }
        }
    }

    fn descriptor(method: Method, addr: SocketAddr, path: &str) -> RequestDescriptor {
        RequestDescriptor::new(method, format!("http://{addr}{path}").parse().unwrap())
    }

    #[test]
    fn test_target_from_uri() {
        let target = Target::from_uri(&"http://example.com/x".parse().unwrap()).unwrap();
        assert_eq!(target, Target { host: "example.com".into(), port: 80 });

        let target = Target::from_uri(&"http://[::1]:8080/".parse().unwrap()).unwrap();
        assert_eq!(target, Target { host: "::1".into(), port: 8080 });

        let err = Target::from_uri(&"https://example.com/".parse().unwrap()).unwrap_err();
        assert_eq!(err.code(), "EPROTONOSUPPORT");
        let err = Target::from_uri(&"/relative".parse().unwrap()).unwrap_err();
        assert_eq!(err.code(), "EINVAL");
    }

    #[tokio::test]
    async fn test_chunked_request_and_response() {
        init_log();
        let (addr, peer) = one_shot_peer(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nHello\r\n8\r\n, world!\r\n0\r\n\r\n",
        )
        .await;

        let response = run(
            &TcpTransport::new(),
            &descriptor(Method::POST, addr, "/upload"),
            vec![
                Outbound::Chunk(Bytes::from_static(b"abc")),
                Outbound::Chunk(Bytes::from_static(b"defgh")),
                Outbound::End,
            ],
        )
        .await
        .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(read_to_bytes(response.into_body()).await.unwrap(), &b"Hello, world!"[..]);

        let received = String::from_utf8(peer.await.unwrap()).unwrap();
        assert!(received.starts_with("POST /upload HTTP/1.1\r\n"));
        assert!(received.contains("transfer-encoding: chunked\r\n"));
        assert!(received.ends_with("\r\n\r\n3\r\nabc\r\n5\r\ndefgh\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_empty_post_gets_zero_length() {
        let (addr, peer) = one_shot_peer(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let response = run(
            &TcpTransport::new(),
            &descriptor(Method::POST, addr, "/"),
            vec![Outbound::End],
        )
        .await
        .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert!(read_to_bytes(response.into_body()).await.unwrap().is_empty());

        let received = String::from_utf8(peer.await.unwrap()).unwrap();
        assert!(received.contains("content-length: 0\r\n"));
    }

    #[tokio::test]
    async fn test_interim_response_skipped_and_body_until_close() {
        let (addr, _peer) = one_shot_peer(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nconnection: close\r\n\r\nstreamed until close",
        )
        .await;
        let response = run(
            &TcpTransport::new(),
            &descriptor(Method::GET, addr, "/"),
            vec![Outbound::End],
        )
        .await
        .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            read_to_bytes(response.into_body()).await.unwrap(),
            &b"streamed until close"[..]
        );
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let (addr, _peer) = one_shot_peer(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nshort").await;
        let response = run(
            &TcpTransport::new(),
            &descriptor(Method::GET, addr, "/"),
            vec![Outbound::End],
        )
        .await
        .unwrap();
        let err = read_to_bytes(response.into_body()).await.unwrap_err();
        assert_eq!(err.code(), "ECONNRESET");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = run(
            &TcpTransport::new(),
            &descriptor(Method::GET, addr, "/"),
            vec![Outbound::End],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ECONNREFUSED");
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            // Hold the socket open without answering
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let transport = TcpTransport::new().with_timeout(Duration::from_millis(100));
        let err = run(&transport, &descriptor(Method::GET, addr, "/"), vec![Outbound::End])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ETIMEDOUT");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroy_stops_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut connection = TcpTransport::new()
            .open(&descriptor(Method::GET, addr, "/"))
            .await
            .unwrap();
        while let Some(signal) = connection.next_signal().await {
            if matches!(signal, TransportSignal::Connect) {
                break;
            }
        }
        assert!(connection.destroy(Some(TransportError::new("ENOENT", "missing body"))));

        // The driver gave up on the exchange, so writes can no longer land
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.writer().end().await.unwrap_err().code(), "EPIPE");
    }

    #[tokio::test]
    async fn test_response_before_body_finished() {
        init_log();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 6\r\n\r\ndenied")
                .await
                .unwrap();
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let mut connection = TcpTransport::new()
            .open(&descriptor(Method::PUT, addr, "/upload"))
            .await
            .unwrap();
        let writer = connection.writer();
        loop {
            match connection.next_signal().await {
                Some(TransportSignal::Socket) => {}
                Some(TransportSignal::Connect) => break,
                other => panic!("unexpected signal {other:?}"),
            }
        }

        // Body never ends, the reply must still come through
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        let response = match connection.next_signal().await {
            Some(TransportSignal::Response(response)) => response,
            other => panic!("unexpected signal {other:?}"),
        };
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);

        // Frames after the reply are accepted and dropped
        writer.write(Bytes::from_static(b"more")).await.unwrap();
        writer.end().await.unwrap();
        assert_eq!(read_to_bytes(response.into_body()).await.unwrap(), &b"denied"[..]);
    }
}
