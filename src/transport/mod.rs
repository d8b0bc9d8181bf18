//! Transport connection abstraction
//!
//! A [`Transport`] opens one [`Connection`] per request. The connection is
//! split in two halves joined by channels:
//!
//! - [`Connection`], held by the orchestrator: receives [`TransportSignal`]s,
//!   writes the outbound body through a [`BodyWriter`], and can destroy the
//!   exchange.
//! - [`ConnectionDriver`], held by the transport implementation: emits each
//!   signal at most once, pulls [`Outbound`] frames and observes teardown.

pub mod codec;
pub mod tcp;

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::core::{RequestDescriptor, Response, TransportError, TransportResult};

pub use tcp::TcpTransport;

/// Default depth of the outbound frame queue
pub const DEFAULT_WRITE_BUFFER: usize = 16;

/// Low-level lifecycle notifications from a connection
#[derive(Debug)]
pub enum TransportSignal {
    /// An underlying channel has been assigned to the request
    Socket,
    /// The channel completed its connect handshake
    Connect,
    /// The peer's reply started arriving
    Response(Response),
    /// The exchange failed
    Error(TransportError),
}

/// Frames of the outbound body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Chunk(Bytes),
    End,
}

/// Opens connections for requests
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, descriptor: &RequestDescriptor) -> TransportResult<Connection>;
}

/// Orchestrator half of a connection
#[derive(Debug)]
pub struct Connection {
    writer: BodyWriter,
    signals: mpsc::UnboundedReceiver<TransportSignal>,
    teardown: Option<oneshot::Sender<TransportError>>,
    destroyed: bool,
}

impl Connection {
    /// Create both halves of a connection with an outbound queue of
    /// `buffer` frames.
    pub fn channel(buffer: usize) -> (Connection, ConnectionDriver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer.max(1));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (teardown_tx, teardown_rx) = oneshot::channel();

        let connection = Connection {
            writer: BodyWriter { sender: outbound_tx },
            signals: signal_rx,
            teardown: Some(teardown_tx),
            destroyed: false,
        };
        let driver = ConnectionDriver {
            outbound: outbound_rx,
            signals: signal_tx,
            teardown: Some(teardown_rx),
            emitted: Emitted::default(),
        };
        (connection, driver)
    }

    /// Next signal from the transport. `None` once the driver is gone.
    pub async fn next_signal(&mut self) -> Option<TransportSignal> {
        self.signals.recv().await
    }

    /// Handle for writing the outbound body.
    pub fn writer(&self) -> BodyWriter {
        self.writer.clone()
    }

    /// Tear the exchange down. Only the first call has any effect; returns
    /// whether this call was it.
    pub fn destroy(&mut self, error: Option<TransportError>) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;
        self.signals.close();
        if let Some(teardown) = self.teardown.take() {
            // Driver may have finished already
            let _ = teardown.send(error.unwrap_or_else(TransportError::aborted));
        }
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

/// Cloneable writer for the outbound body
#[derive(Debug, Clone)]
pub struct BodyWriter {
    sender: mpsc::Sender<Outbound>,
}

impl BodyWriter {
    pub async fn write(&self, chunk: Bytes) -> TransportResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.send(Outbound::Chunk(chunk)).await
    }

    /// Close the outbound side.
    pub async fn end(&self) -> TransportResult<()> {
        self.send(Outbound::End).await
    }

    async fn send(&self, frame: Outbound) -> TransportResult<()> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| TransportError::new("EPIPE", "connection closed before the body was written"))
    }
}

#[derive(Debug, Default)]
struct Emitted {
    socket: bool,
    connect: bool,
    terminal: bool,
}

/// Transport half of a connection
#[derive(Debug)]
pub struct ConnectionDriver {
    outbound: mpsc::Receiver<Outbound>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    teardown: Option<oneshot::Receiver<TransportError>>,
    emitted: Emitted,
}

impl ConnectionDriver {
    /// Report channel assignment. Ignored after the first call or after a
    /// terminal signal.
    pub fn socket(&mut self) -> bool {
        if self.emitted.socket || self.emitted.terminal {
            return false;
        }
        self.emitted.socket = true;
        self.emit(TransportSignal::Socket)
    }

    /// Report a completed connect handshake.
    pub fn connected(&mut self) -> bool {
        if self.emitted.connect || self.emitted.terminal {
            return false;
        }
        self.emitted.connect = true;
        self.emit(TransportSignal::Connect)
    }

    /// Hand the response to the orchestrator. Terminal.
    pub fn respond(&mut self, response: Response) -> bool {
        if self.emitted.terminal {
            return false;
        }
        self.emitted.terminal = true;
        self.emit(TransportSignal::Response(response))
    }

    /// Report a failure. Terminal.
    pub fn fail(&mut self, error: TransportError) -> bool {
        if self.emitted.terminal {
            return false;
        }
        self.emitted.terminal = true;
        self.emit(TransportSignal::Error(error))
    }

    /// Next outbound frame. `Ok(None)` if every writer is gone without
    /// ending the body; `Err` if the connection was destroyed.
    pub async fn next_outbound(&mut self) -> TransportResult<Option<Outbound>> {
        let ConnectionDriver {
            outbound, teardown, ..
        } = self;
        tokio::select! {
            biased;
            err = wait_teardown(teardown) => Err(err),
            frame = outbound.recv() => Ok(frame),
        }
    }

    /// Run `fut` unless the connection is destroyed first.
    pub async fn until_destroyed<F: Future>(&mut self, fut: F) -> TransportResult<F::Output> {
        tokio::select! {
            biased;
            err = wait_teardown(&mut self.teardown) => Err(err),
            output = fut => Ok(output),
        }
    }

    fn emit(&self, signal: TransportSignal) -> bool {
        self.signals.send(signal).is_ok()
    }
}

/// Resolves with the teardown error once the connection is destroyed. Stays
/// pending forever if the orchestrator let go without destroying.
async fn wait_teardown(teardown: &mut Option<oneshot::Receiver<TransportError>>) -> TransportError {
    let result = match teardown.as_mut() {
        Some(receiver) => receiver.await,
        None => return std::future::pending().await,
    };
    *teardown = None;
    match result {
        Ok(err) => err,
        Err(_) => std::future::pending().await,
    }
}
