//! Core request and response types
//!
//! Descriptors, responses and the error model shared by the transport, the
//! orchestrator and the client.

pub mod descriptor;
pub mod error;
pub mod response;

pub use descriptor::{RequestDescriptor, TransportOptions};
pub use error::{ErrorContext, RequestError, RequestResult, TransportError, TransportResult};
pub use response::{Response, ResponseBody};
