//! Lifecycle telemetry
//!
//! The orchestrator reports every transport stage a request reaches as a
//! [`LifecycleEvent`] through an optional [`TelemetrySink`]. Publishing is
//! fire-and-forget: a sink cannot alter the request or its outcome.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use http::{HeaderMap, StatusCode, Version};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::core::{RequestDescriptor, TransportError};

/// Transport stages, in the order they can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleEventKind {
    RequestInitiated,
    SocketObtained,
    ConnectionEstablished,
    BodyTransmissionCompleted,
    ResponseReceived,
    RequestFailed,
}

impl LifecycleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEventKind::RequestInitiated => "request_initiated",
            LifecycleEventKind::SocketObtained => "socket_obtained",
            LifecycleEventKind::ConnectionEstablished => "connection_established",
            LifecycleEventKind::BodyTransmissionCompleted => "body_transmission_completed",
            LifecycleEventKind::ResponseReceived => "response_received",
            LifecycleEventKind::RequestFailed => "request_failed",
        }
    }

    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific context attached to an event
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Resolved target and merged options, after `content-length` injection
    Request(RequestDescriptor),
    /// Response head as it arrived
    Response {
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
    },
}

/// One immutable lifecycle notification
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub request_id: Uuid,
    pub kind: LifecycleEventKind,
    pub payload: Option<EventPayload>,
    pub error: Option<TransportError>,
}

/// Consumer of lifecycle events.
///
/// Called synchronously with the transport signal that caused the event.
/// Implementations must not block; a panicking sink is contained and logged.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, event: &LifecycleEvent);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn publish(&self, _event: &LifecycleEvent) {}
}

/// Sink that writes each event to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn publish(&self, event: &LifecycleEvent) {
        match (&event.error, &event.payload) {
            (Some(error), _) => {
                log::warn!("[{}] {}: {}", event.request_id, event.kind, error)
            }
            (None, Some(EventPayload::Request(descriptor))) => log::info!(
                "[{}] {}: {} {}",
                event.request_id,
                event.kind,
                descriptor.method,
                descriptor.uri
            ),
            (None, Some(EventPayload::Response { status, .. })) => {
                log::info!("[{}] {}: {}", event.request_id, event.kind, status)
            }
            (None, None) => log::info!("[{}] {}", event.request_id, event.kind),
        }
    }
}

/// Sink forwarding events over an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: UnboundedSender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new(sender: UnboundedSender<LifecycleEvent>) -> Self {
        Self { sender }
    }
}

impl TelemetrySink for ChannelSink {
    fn publish(&self, event: &LifecycleEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.sender.send(event.clone());
    }
}

/// Sink keeping every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn kinds(&self) -> Vec<LifecycleEventKind> {
        self.events().iter().map(|event| event.kind).collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn publish(&self, event: &LifecycleEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Per-request publisher enforcing at-most-once per kind and isolating the
/// request from sink panics.
pub(crate) struct Publisher {
    request_id: Uuid,
    sink: Option<Arc<dyn TelemetrySink>>,
    published: u8,
}

impl Publisher {
    pub(crate) fn new(request_id: Uuid, sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        Self {
            request_id,
            sink,
            published: 0,
        }
    }

    pub(crate) fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Publish `kind` unless it was already published. Returns whether the
    /// event went out.
    pub(crate) fn publish(
        &mut self,
        kind: LifecycleEventKind,
        payload: Option<EventPayload>,
        error: Option<TransportError>,
    ) -> bool {
        if self.published & kind.bit() != 0 {
            log::debug!("[{}] {} already published", self.request_id, kind);
            return false;
        }
        self.published |= kind.bit();

        let Some(sink) = &self.sink else {
            return true;
        };
        let event = LifecycleEvent {
            request_id: self.request_id,
            kind,
            payload,
            error,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| sink.publish(&event))).is_err() {
            log::warn!(
                "[{}] telemetry sink panicked while handling {}",
                self.request_id,
                kind
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    struct PanickingSink;

    impl TelemetrySink for PanickingSink {
        fn publish(&self, _event: &LifecycleEvent) {
            panic!("sink failure");
        }
    }

    #[test]
    fn test_publish_at_most_once() {
        let sink = Arc::new(RecordingSink::new());
        let mut publisher = Publisher::new(Uuid::new_v4(), Some(sink.clone()));

        assert!(publisher.publish(LifecycleEventKind::SocketObtained, None, None));
        assert!(!publisher.publish(LifecycleEventKind::SocketObtained, None, None));
        assert!(publisher.publish(LifecycleEventKind::RequestFailed, None, None));

        assert_eq!(
            sink.kinds(),
            vec![
                LifecycleEventKind::SocketObtained,
                LifecycleEventKind::RequestFailed
            ]
        );
        assert!(sink
            .events()
            .iter()
            .all(|event| event.request_id == publisher.request_id()));
    }

    #[test]
    fn test_sink_panic_is_contained() {
        let mut publisher = Publisher::new(Uuid::new_v4(), Some(Arc::new(PanickingSink)));
        assert!(publisher.publish(LifecycleEventKind::RequestInitiated, None, None));
        assert!(publisher.publish(LifecycleEventKind::ResponseReceived, None, None));
    }

    #[test]
    fn test_no_sink() {
        let mut publisher = Publisher::new(Uuid::new_v4(), None);
        assert!(publisher.publish(LifecycleEventKind::RequestInitiated, None, None));
        assert!(!publisher.publish(LifecycleEventKind::RequestInitiated, None, None));
    }

    #[test]
    fn test_channel_sink() {
        let (tx, mut rx) = unbounded_channel();
        let mut publisher = Publisher::new(Uuid::new_v4(), Some(Arc::new(ChannelSink::new(tx))));
        publisher.publish(
            LifecycleEventKind::RequestFailed,
            None,
            Some(TransportError::new("ECONNRESET", "socket hang up")),
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, LifecycleEventKind::RequestFailed);
        assert_eq!(event.error.unwrap().code(), "ECONNRESET");
    }

    #[test]
    fn test_kind_order() {
        assert!(LifecycleEventKind::RequestInitiated < LifecycleEventKind::SocketObtained);
        assert!(LifecycleEventKind::BodyTransmissionCompleted < LifecycleEventKind::ResponseReceived);
        assert_eq!(LifecycleEventKind::RequestFailed.to_string(), "request_failed");
    }
}
