//! Outbound request bodies
//!
//! [`BodySource`] is the closed set of payload shapes a request can carry.
//! Untyped values go through [`BodySource::classify`] before anything is
//! opened; everything downstream matches on the variant.

use std::{any::Any, fmt, io, path::PathBuf};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::{fs::File, io::AsyncReadExt};

use crate::core::{RequestError, RequestResult};

/// Lazily produced, possibly failing sequence of octets.
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

const FILE_CHUNK_SIZE: usize = 16 * 1024;

/// How the outbound payload is supplied
#[derive(Default)]
pub enum BodySource {
    #[default]
    None,
    Bytes(Bytes),
    Text(String),
    Stream(BodyStream),
}

impl BodySource {
    /// Wrap any stream of chunks as a live body.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        BodySource::Stream(stream.boxed())
    }

    /// Stream the contents of a file.
    ///
    /// The file is opened on first poll, so a missing file is reported by
    /// the stream itself rather than here.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let chunks = stream::once(async move { File::open(path).await })
            .map(|opened| match opened {
                Ok(file) => file_chunks(file).left_stream(),
                Err(err) => stream::once(async move { Err(err) }).right_stream(),
            })
            .flatten();
        BodySource::stream(chunks)
    }

    /// Classify an arbitrary caller value into one of the body variants.
    ///
    /// Accepts `BodySource`, `()`, `Bytes`, `Vec<u8>`, `&'static [u8]`,
    /// `String`, `&'static str` and [`BodyStream`]. Anything else is
    /// rejected with [`RequestError::InvalidBodyType`].
    pub fn classify(value: Box<dyn Any + Send>) -> RequestResult<BodySource> {
        let value = match value.downcast::<BodySource>() {
            Ok(body) => return Ok(*body),
            Err(value) => value,
        };
        if value.is::<()>() {
            return Ok(BodySource::None);
        }
        let value = match value.downcast::<Bytes>() {
            Ok(bytes) => return Ok(BodySource::Bytes(*bytes)),
            Err(value) => value,
        };
        let value = match value.downcast::<Vec<u8>>() {
            Ok(bytes) => return Ok(BodySource::Bytes(Bytes::from(*bytes))),
            Err(value) => value,
        };
        let value = match value.downcast::<&'static [u8]>() {
            Ok(bytes) => return Ok(BodySource::Bytes(Bytes::from_static(*bytes))),
            Err(value) => value,
        };
        let value = match value.downcast::<String>() {
            Ok(text) => return Ok(BodySource::Text(*text)),
            Err(value) => value,
        };
        let value = match value.downcast::<&'static str>() {
            Ok(text) => return Ok(BodySource::Text((*text).to_string())),
            Err(value) => value,
        };
        match value.downcast::<BodyStream>() {
            Ok(stream) => Ok(BodySource::Stream(*stream)),
            Err(_) => Err(RequestError::InvalidBodyType(
                "expected bytes, text, a body stream or no body".to_string(),
            )),
        }
    }

    /// Byte length of in-memory bodies. Streams and empty bodies have no
    /// derivable length.
    pub fn content_length(&self) -> Option<u64> {
        match self {
            BodySource::Bytes(bytes) => Some(bytes.len() as u64),
            // String is UTF-8, which is what goes on the wire
            BodySource::Text(text) => Some(text.len() as u64),
            BodySource::Stream(_) | BodySource::None => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BodySource::None => "none",
            BodySource::Bytes(_) => "bytes",
            BodySource::Text(_) => "text",
            BodySource::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodySource::None => f.write_str("None"),
            BodySource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            BodySource::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            BodySource::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for BodySource {
    fn from(bytes: Bytes) -> Self {
        BodySource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for BodySource {
    fn from(bytes: Vec<u8>) -> Self {
        BodySource::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for BodySource {
    fn from(bytes: &'static [u8]) -> Self {
        BodySource::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for BodySource {
    fn from(text: String) -> Self {
        BodySource::Text(text)
    }
}

impl From<&str> for BodySource {
    fn from(text: &str) -> Self {
        BodySource::Text(text.to_string())
    }
}

impl From<BodyStream> for BodySource {
    fn from(stream: BodyStream) -> Self {
        BodySource::Stream(stream)
    }
}

fn file_chunks(file: File) -> impl Stream<Item = io::Result<Bytes>> + Send {
    stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::with_capacity(FILE_CHUNK_SIZE);
        let read = file.read_buf(&mut buf).await?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some((buf.freeze(), file)))
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn test_classify_variants() {
        let stream: BodyStream = stream::empty().boxed();
        let cases: Vec<(Box<dyn Any + Send>, &str)> = vec![
            (Box::new(()), "none"),
            (Box::new(BodySource::Text("x".into())), "text"),
            (Box::new(Bytes::from_static(b"abc")), "bytes"),
            (Box::new(vec![1u8, 2, 3]), "bytes"),
            (Box::new(&b"abc"[..]), "bytes"),
            (Box::new(String::from("héllo")), "text"),
            (Box::new("héllo"), "text"),
            (Box::new(stream), "stream"),
        ];

        for (value, kind) in cases {
            assert_eq!(BodySource::classify(value).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_classify_rejects_unknown() {
        let rejected: Vec<Box<dyn Any + Send>> = vec![
            Box::new(42u32),
            Box::new(SystemTime::now()),
            Box::new(vec!["not", "bytes"]),
        ];
        for value in rejected {
            let err = BodySource::classify(value).unwrap_err();
            assert!(matches!(err, RequestError::InvalidBodyType(_)));
        }
    }

    #[test]
    fn test_content_length() {
        assert_eq!(BodySource::from("Hello, world!").content_length(), Some(13));
        // Multi-byte characters count in bytes, not chars
        assert_eq!(BodySource::from("héllo").content_length(), Some(6));
        assert_eq!(BodySource::from(vec![0u8; 1024]).content_length(), Some(1024));
        assert_eq!(BodySource::from(Bytes::new()).content_length(), Some(0));
        assert_eq!(BodySource::None.content_length(), None);
        assert_eq!(
            BodySource::stream(stream::empty()).content_length(),
            None
        );
    }

    #[tokio::test]
    async fn test_from_file_missing() {
        let path = std::env::temp_dir().join(format!("pingcall-missing-{}", uuid::Uuid::new_v4()));
        let BodySource::Stream(mut stream) = BodySource::from_file(path) else {
            panic!("file body should be a stream");
        };
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_from_file_contents() {
        let path = std::env::temp_dir().join(format!("pingcall-body-{}", uuid::Uuid::new_v4()));
        let contents = vec![7u8; FILE_CHUNK_SIZE * 2 + 10];
        tokio::fs::write(&path, &contents).await.unwrap();

        let BodySource::Stream(stream) = BodySource::from_file(&path) else {
            panic!("file body should be a stream");
        };
        let chunks: Vec<Bytes> = stream.map(|chunk| chunk.unwrap()).collect().await;
        let read: Vec<u8> = chunks.concat();
        assert_eq!(read, contents);

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
