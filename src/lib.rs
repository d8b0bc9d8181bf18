//! Single-request HTTP lifecycle orchestration.
//!
//! A [`RequestOrchestrator`] opens one connection through a [`Transport`],
//! hands the request body over once connected, publishes each lifecycle stage
//! to an optional [`TelemetrySink`] and resolves exactly once with either the
//! response or a typed error. [`Client`] layers a base URL, default headers
//! and the common verbs on top.

pub mod body;
pub mod client;
pub mod config;
pub mod core;
pub mod logging;
pub mod orchestration;
pub mod telemetry;
pub mod transport;
pub mod utils;

pub use body::{BodySource, BodyStream};
pub use client::{Client, RequestOptions};
pub use core::{
    RequestDescriptor, RequestError, RequestResult, Response, ResponseBody, TransportError,
    TransportOptions,
};
pub use orchestration::RequestOrchestrator;
pub use telemetry::{LifecycleEvent, LifecycleEventKind, TelemetrySink};
pub use transport::{TcpTransport, Transport};
