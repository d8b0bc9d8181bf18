//! Outbound request description
//!
//! A [`RequestDescriptor`] is assembled by the caller (or by
//! [`Client`](crate::client::Client)) and handed to the orchestrator, which
//! only ever touches it to inject a derived `content-length`.

use std::time::Duration;

use http::{header, HeaderMap, HeaderValue, Method, Uri};

/// Transport-specific knobs carried with a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    /// Time allowed for the response head to arrive once the body is sent.
    /// Overrides the transport default when set.
    pub timeout: Option<Duration>,
}

impl TransportOptions {
    /// Overlay `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merged_with(&self, overrides: &TransportOptions) -> TransportOptions {
        TransportOptions {
            timeout: overrides.timeout.or(self.timeout),
        }
    }
}

/// Everything needed to issue one request
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub uri: Uri,
    pub method: Method,
    pub headers: HeaderMap,
    pub options: TransportOptions,
}

impl RequestDescriptor {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            uri,
            method,
            headers: HeaderMap::new(),
            options: TransportOptions::default(),
        }
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Declared `content-length`, if present and well formed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    /// Set `content-length`, replacing any value already present.
    pub(crate) fn set_content_length(&mut self, length: u64) {
        self.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }

    /// Set `content-length` only if the caller did not declare one.
    pub(crate) fn set_content_length_if_absent(&mut self, length: u64) {
        if !self.headers.contains_key(header::CONTENT_LENGTH) {
            self.set_content_length(length);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_length_overwrite() {
        let mut descriptor = RequestDescriptor::new(Method::POST, Uri::from_static("/"))
            .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        assert_eq!(descriptor.content_length(), Some(999));

        descriptor.set_content_length(13);
        assert_eq!(descriptor.content_length(), Some(13));
        assert_eq!(descriptor.headers.get_all(header::CONTENT_LENGTH).iter().count(), 1);
    }

    #[test]
    fn test_content_length_if_absent() {
        let mut descriptor = RequestDescriptor::new(Method::POST, Uri::from_static("/"))
            .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        descriptor.set_content_length_if_absent(13);
        assert_eq!(descriptor.content_length(), Some(999));

        let mut descriptor = RequestDescriptor::new(Method::POST, Uri::from_static("/"));
        descriptor.set_content_length_if_absent(13);
        assert_eq!(descriptor.content_length(), Some(13));
    }

    #[test]
    fn test_options_merge() {
        let base = TransportOptions {
            timeout: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            base.merged_with(&TransportOptions::default()).timeout,
            Some(Duration::from_secs(30))
        );
        let overrides = TransportOptions {
            timeout: Some(Duration::from_secs(1)),
        };
        assert_eq!(base.merged_with(&overrides).timeout, Some(Duration::from_secs(1)));
    }
}
