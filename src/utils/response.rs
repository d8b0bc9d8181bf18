//! Response consumption helpers.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::core::{ResponseBody, TransportResult};

/// Drain a response body into a single buffer.
///
/// Fails with the first error the body stream yields; whatever was read
/// before that point is discarded.
pub async fn read_to_bytes(mut body: ResponseBody) -> TransportResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        // Avoid a copy for the common single-chunk body
        if buf.is_empty() {
            match body.next().await {
                None => return Ok(chunk),
                Some(next) => {
                    buf.extend_from_slice(&chunk);
                    buf.extend_from_slice(&next?);
                }
            }
        } else {
            buf.extend_from_slice(&chunk);
        }
    }
    Ok(buf.freeze())
}
