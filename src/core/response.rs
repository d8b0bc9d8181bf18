//! Response handle returned on success

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use http::{HeaderMap, StatusCode, Version};

use super::error::{TransportError, TransportResult};
use crate::utils::response::read_to_bytes;

/// Readable sequence of octets sent back by the peer.
///
/// Whoever holds this owns the underlying connection; dropping it releases
/// the connection.
pub struct ResponseBody {
    inner: BoxStream<'static, TransportResult<Bytes>>,
}

impl ResponseBody {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = TransportResult<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// A body that is already fully in memory.
    pub fn full(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        Self::new(stream::once(async move { Ok::<_, TransportError>(data) }))
    }
}

impl Stream for ResponseBody {
    type Item = TransportResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody { .. }")
    }
}

/// Response head plus its body stream
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub fn new(status: StatusCode, version: Version, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            version,
            headers,
            body,
        }
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Drain the body into memory.
    pub async fn bytes(self) -> TransportResult<Bytes> {
        read_to_bytes(self.body).await
    }
}
