//! HTTP/1.1 wire encoding for the TCP transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

use crate::core::{RequestDescriptor, TransportError, TransportResult};

/// Maximum number of response headers accepted
const MAX_HEADERS: usize = 100;

/// Maximum size of a response head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// How the request body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFraming {
    /// Declared by a `content-length` header already in the descriptor
    Declared,
    /// `transfer-encoding: chunked`
    Chunked,
    /// No body; `content-length: 0` added when `zero_length` is set
    Empty { zero_length: bool },
}

/// Serialise the request line and headers.
pub fn encode_head(descriptor: &RequestDescriptor, framing: RequestFraming) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    let target = descriptor
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");

    buf.put_slice(descriptor.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !descriptor.headers.contains_key(header::HOST) {
        if let Some(authority) = descriptor.uri.authority() {
            put_header(&mut buf, header::HOST.as_str(), authority.as_str().as_bytes());
        }
    }

    for (name, value) in descriptor.headers.iter() {
        if framing == RequestFraming::Chunked && name == header::CONTENT_LENGTH {
            continue;
        }
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }

    match framing {
        RequestFraming::Chunked if !descriptor.headers.contains_key(header::TRANSFER_ENCODING) => {
            put_header(&mut buf, header::TRANSFER_ENCODING.as_str(), b"chunked");
        }
        RequestFraming::Empty { zero_length: true } => {
            put_header(&mut buf, header::CONTENT_LENGTH.as_str(), b"0");
        }
        _ => {}
    }

    buf.put_slice(b"\r\n");
    buf
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Wrap one chunk in chunked transfer coding.
pub fn encode_chunk(chunk: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(chunk.len() + 12);
    buf.put_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
    buf.put_slice(chunk);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Parsed response status line and headers
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Try to parse a response head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; on success the head is
/// split off `buf`, leaving any body bytes in place.
pub fn parse_response_head(buf: &mut BytesMut) -> TransportResult<Option<ResponseHead>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let len = match response.parse(&buf[..]) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(protocol_error("response head too large"));
            }
            return Ok(None);
        }
        Err(e) => return Err(protocol_error(format!("malformed response head: {e}"))),
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| protocol_error("invalid status code"))?;
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut map = HeaderMap::with_capacity(response.headers.len());
    for h in response.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| protocol_error(format!("invalid header name {}: {e}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| protocol_error(format!("invalid header value for {name}: {e}")))?;
        map.append(name, value);
    }

    buf.advance(len);
    Ok(Some(ResponseHead {
        status,
        version,
        headers: map,
    }))
}

/// How the response body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl ResponseFraming {
    pub fn for_response(method: &Method, head: &ResponseHead) -> TransportResult<Self> {
        if *method == Method::HEAD
            || head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            return Ok(ResponseFraming::Empty);
        }

        let chunked = head
            .headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(ResponseFraming::Chunked);
        }

        match head.headers.get(header::CONTENT_LENGTH) {
            Some(value) => {
                let length = value
                    .to_str()
                    .ok()
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .ok_or_else(|| protocol_error("invalid content-length"))?;
                Ok(if length == 0 {
                    ResponseFraming::Empty
                } else {
                    ResponseFraming::Length(length)
                })
            }
            None => Ok(ResponseFraming::UntilClose),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Output of one [`ChunkedDecoder::decode`] step
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Data(Bytes),
    NeedMore,
    Done,
}

/// Incremental decoder for chunked transfer coding
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume as much of `buf` as possible, returning the next piece of
    /// body data when one is available.
    pub fn decode(&mut self, buf: &mut BytesMut) -> TransportResult<Decoded> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    let size = line.split(|b| *b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(size)
                        .ok()
                        .and_then(|size| u64::from_str_radix(size.trim(), 16).ok())
                        .ok_or_else(|| protocol_error("invalid chunk size"))?;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining)
                    };
                    return Ok(Decoded::Data(data));
                }
                ChunkState::DataEnd => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    if !line.is_empty() {
                        return Err(protocol_error("missing CRLF after chunk data"));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(Decoded::Done),
            }
        }
    }
}

/// Split one CRLF-terminated line off the front of `buf`, without the CRLF.
fn take_line(buf: &mut BytesMut) -> TransportResult<Option<Bytes>> {
    match buf.windows(2).position(|window| window == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_HEAD_SIZE => Err(protocol_error("chunk line too long")),
        None => Ok(None),
    }
}

fn protocol_error(message: impl Into<String>) -> TransportError {
    TransportError::new("EPROTO", message)
}
