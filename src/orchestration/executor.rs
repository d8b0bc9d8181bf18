//! Request execution orchestration
//!
//! [`RequestOrchestrator::execute`] drives one connection from open to
//! outcome. Transport signals and body hand-off progress are consumed in a
//! single loop; each reached stage advances the [`Lifecycle`], is published
//! to telemetry, and terminal stages settle the [`OutcomeLatch`].

use std::{any::Any, sync::Arc};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use uuid::Uuid;

use super::{
    latch::OutcomeLatch,
    lifecycle::{Lifecycle, LifecycleState},
};
use crate::{
    body::{BodySource, BodyStream},
    config::ContentLengthPolicy,
    core::{RequestDescriptor, RequestError, RequestResult, Response, TransportError},
    telemetry::{EventPayload, LifecycleEventKind, Publisher, TelemetrySink},
    transport::{BodyWriter, Connection, Transport, TransportSignal},
};

/// Runs requests over a [`Transport`]
#[derive(Clone)]
pub struct RequestOrchestrator {
    transport: Arc<dyn Transport>,
    content_length: ContentLengthPolicy,
}

impl RequestOrchestrator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            content_length: ContentLengthPolicy::default(),
        }
    }

    pub fn with_content_length_policy(mut self, policy: ContentLengthPolicy) -> Self {
        self.content_length = policy;
        self
    }

    /// Issue one request and wait for its outcome.
    ///
    /// Resolves with the response as soon as its head arrives, or with the
    /// first failure reported by the connection or the body source. Every
    /// transport stage reached is published to `telemetry`, in order, at
    /// most once.
    pub async fn execute(
        &self,
        mut descriptor: RequestDescriptor,
        body: BodySource,
        telemetry: Option<Arc<dyn TelemetrySink>>,
    ) -> RequestResult<Response> {
        if let Some(length) = body.content_length() {
            match self.content_length {
                ContentLengthPolicy::Overwrite => descriptor.set_content_length(length),
                ContentLengthPolicy::Preserve => descriptor.set_content_length_if_absent(length),
            }
        }

        let mut publisher = Publisher::new(Uuid::new_v4(), telemetry);
        log::debug!(
            "[{}] {} {} with {} body",
            publisher.request_id(),
            descriptor.method,
            descriptor.uri,
            body.kind()
        );

        let connection = match self.transport.open(&descriptor).await {
            Ok(connection) => connection,
            Err(err) => {
                log::debug!("[{}] failed to open connection: {}", publisher.request_id(), err);
                publisher.publish(LifecycleEventKind::RequestFailed, None, Some(err.clone()));
                return Err(RequestError::Transport(err));
            }
        };

        InFlight::new(publisher, connection, body).run(descriptor).await
    }

    /// Like [`execute`](Self::execute), for a body of unknown type.
    ///
    /// The body is classified before anything else happens; an unsupported
    /// value fails with [`RequestError::InvalidBodyType`] without opening a
    /// connection or publishing any event.
    pub async fn execute_any(
        &self,
        descriptor: RequestDescriptor,
        body: Box<dyn Any + Send>,
        telemetry: Option<Arc<dyn TelemetrySink>>,
    ) -> RequestResult<Response> {
        let body = BodySource::classify(body)?;
        self.execute(descriptor, body, telemetry).await
    }
}

/// Failure of the body hand-off
#[derive(Debug)]
enum HandOffError {
    /// The body source itself failed
    Source(TransportError),
    /// The connection stopped accepting body frames
    Sink(TransportError),
}

type HandOff = BoxFuture<'static, Result<(), HandOffError>>;

enum Step {
    Signal(Option<TransportSignal>),
    HandOff(Result<(), HandOffError>),
}

/// State of one request between open and outcome
struct InFlight {
    lifecycle: Lifecycle,
    publisher: Publisher,
    connection: Connection,
    body: Option<BodySource>,
    hand_off: Option<HandOff>,
    latch: OutcomeLatch<RequestResult<Response>>,
}

impl InFlight {
    fn new(publisher: Publisher, connection: Connection, body: BodySource) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            publisher,
            connection,
            body: Some(body),
            hand_off: None,
            latch: OutcomeLatch::new(),
        }
    }

    async fn run(mut self, descriptor: RequestDescriptor) -> RequestResult<Response> {
        self.publisher.publish(
            LifecycleEventKind::RequestInitiated,
            Some(EventPayload::Request(descriptor)),
            None,
        );
        self.lifecycle.advance(LifecycleState::AwaitingSocket);

        while !self.lifecycle.is_terminal() {
            let step = tokio::select! {
                biased;
                signal = self.connection.next_signal() => Step::Signal(signal),
                result = poll_hand_off(&mut self.hand_off) => Step::HandOff(result),
            };

            match step {
                Step::Signal(Some(TransportSignal::Socket)) => self.on_socket(),
                Step::Signal(Some(TransportSignal::Connect)) => self.on_connect(),
                Step::Signal(Some(TransportSignal::Response(response))) => self.resolve(response),
                Step::Signal(Some(TransportSignal::Error(err))) => {
                    self.fail(RequestError::Transport(err))
                }
                Step::Signal(None) => self.fail(RequestError::Transport(TransportError::new(
                    "ECONNABORTED",
                    "connection closed without a response",
                ))),
                Step::HandOff(result) => {
                    self.hand_off = None;
                    match result {
                        Ok(()) => log::trace!("[{}] body hand-off finished", self.id()),
                        Err(HandOffError::Source(err)) => self.fail(RequestError::BodySource(err)),
                        // The transport reports its own failure
                        Err(HandOffError::Sink(err)) => {
                            log::debug!("[{}] body hand-off stopped: {}", self.id(), err)
                        }
                    }
                }
            }
        }

        self.latch.take().unwrap_or_else(|| {
            Err(RequestError::Internal(
                "request finished without an outcome".to_string(),
            ))
        })
    }

    fn id(&self) -> Uuid {
        self.publisher.request_id()
    }

    fn on_socket(&mut self) {
        if !self.lifecycle.advance(LifecycleState::SocketObtained) {
            return;
        }
        self.publisher
            .publish(LifecycleEventKind::SocketObtained, None, None);
        self.lifecycle.advance(LifecycleState::AwaitingConnect);
    }

    fn on_connect(&mut self) {
        if self.lifecycle.state() == LifecycleState::AwaitingSocket {
            log::debug!("[{}] connected without a socket assignment", self.id());
            self.lifecycle.advance(LifecycleState::SocketObtained);
            self.lifecycle.advance(LifecycleState::AwaitingConnect);
        }
        if !self.lifecycle.advance(LifecycleState::Connected) {
            return;
        }
        self.publisher
            .publish(LifecycleEventKind::ConnectionEstablished, None, None);

        if let Some(body) = self.body.take() {
            self.hand_off = Some(hand_off(body, self.connection.writer()));
        }
        // Marks the hand-off as started, not the body as delivered
        self.publisher
            .publish(LifecycleEventKind::BodyTransmissionCompleted, None, None);
        self.lifecycle.advance(LifecycleState::AwaitingResponse);
    }

    fn resolve(&mut self, response: Response) {
        if !self.lifecycle.advance(LifecycleState::Resolved) {
            return;
        }
        log::debug!("[{}] response received: {}", self.id(), response.status);
        self.publisher.publish(
            LifecycleEventKind::ResponseReceived,
            Some(EventPayload::Response {
                status: response.status,
                version: response.version,
                headers: response.headers.clone(),
            }),
            None,
        );

        if let Some(pending) = self.hand_off.take() {
            let id = self.id();
            tokio::spawn(async move {
                if let Err(err) = pending.await {
                    log::warn!("[{}] body hand-off failed after response: {:?}", id, err);
                }
            });
        }

        if self.latch.settle(Ok(response)).is_err() {
            log::warn!("[{}] outcome already settled, dropping response", self.id());
        }
    }

    fn fail(&mut self, err: RequestError) {
        if !self.lifecycle.advance(LifecycleState::Failed) {
            return;
        }
        log::debug!("[{}] request failed: {}", self.id(), err);

        let cause = err.transport_error().cloned();
        self.connection.destroy(cause.clone());
        self.hand_off = None;
        self.publisher
            .publish(LifecycleEventKind::RequestFailed, None, cause);

        if self.latch.settle(Err(err)).is_err() {
            log::warn!("[{}] outcome already settled, dropping failure", self.id());
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // Abandoned before an outcome, e.g. the caller dropped the future
        if !self.lifecycle.is_terminal() {
            self.connection.destroy(Some(TransportError::aborted()));
        }
    }
}

async fn poll_hand_off(hand_off: &mut Option<HandOff>) -> Result<(), HandOffError> {
    match hand_off {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

/// Start pushing `body` into the connection.
fn hand_off(body: BodySource, writer: BodyWriter) -> HandOff {
    match body {
        BodySource::None => async move { writer.end().await.map_err(HandOffError::Sink) }.boxed(),
        BodySource::Bytes(bytes) => write_all(bytes, writer).boxed(),
        BodySource::Text(text) => write_all(Bytes::from(text), writer).boxed(),
        BodySource::Stream(stream) => pipe(stream, writer).boxed(),
    }
}

async fn write_all(payload: Bytes, writer: BodyWriter) -> Result<(), HandOffError> {
    writer.write(payload).await.map_err(HandOffError::Sink)?;
    writer.end().await.map_err(HandOffError::Sink)
}

async fn pipe(mut stream: BodyStream, writer: BodyWriter) -> Result<(), HandOffError> {
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HandOffError::Source(TransportError::from(e)))?;
        writer.write(chunk).await.map_err(HandOffError::Sink)?;
    }
    writer.end().await.map_err(HandOffError::Sink)
}
