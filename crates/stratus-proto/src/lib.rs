//! Wire protocol types for the Stratus language worker.
//!
//! This crate defines the vocabulary exchanged between a function host and
//! a language worker over a single duplex stream:
//!
//! - Handshake and capability negotiation (stream start, worker init)
//! - Function metadata and load requests
//! - Invocation requests, responses and cancellation
//! - Environment reload, status probes, termination and log records
//!
//! Values crossing the boundary are expressed as [`WireValue`], the closed
//! set of shapes the host understands.
//!
//! # Wire Format
//!
//! The default transport frames every envelope with an 8-byte header:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Frame Header (8 bytes, fixed)               │
//! ├──────────────┬──────────────┬────────────────────────────┤
//! │  Version (2) │ Frame Kind(2)│    Payload Length (4)      │
//! ├──────────────┴──────────────┴────────────────────────────┤
//! │                 rkyv-serialised Envelope                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use stratus_proto::{Envelope, StartStream, WorkerMessage};
//!
//! let envelope = Envelope::new(
//!     "req-1",
//!     WorkerMessage::StartStream(StartStream {
//!         worker_id: "worker-1".into(),
//!     }),
//! );
//! ```

pub mod codec;
mod envelope;
mod error;
mod messages;
mod status;
mod typed_data;

pub use codec::{
    Codec, EnvelopeCodec, FrameHeader, FrameKind, CURRENT_VERSION, FRAME_HEADER_SIZE,
    MAX_FRAME_PAYLOAD, MAX_MESSAGE_SIZE,
};
pub use envelope::{Envelope, EnvelopeHeader, WorkerMessage};
pub use error::ProtocolError;
pub use messages::{
    BindingDirection, BindingInfo, FunctionEnvironmentReloadRequest,
    FunctionEnvironmentReloadResponse, FunctionLoadRequest, FunctionLoadResponse,
    FunctionMetadataResponse, FunctionsMetadataRequest, InvocationCancel, InvocationRequest,
    InvocationResponse, LogCategory, LogLevel, RetryContext, RetryOptions, RetryStrategy,
    RpcFunctionMetadata, RpcLog, StartStream, TraceContext, WorkerInitRequest,
    WorkerInitResponse, WorkerMetadata, WorkerTerminate,
};
pub use status::{RpcException, Status, StatusResult};
pub use typed_data::{ParameterBinding, RpcHttp, WireValue};

/// Protocol version constants.
pub mod version {
    /// Current protocol version.
    pub const CURRENT: u16 = 1;

    /// Minimum supported protocol version.
    pub const MIN_SUPPORTED: u16 = 1;
}

/// Capability names exchanged during the handshake.
pub mod capabilities {
    /// HTTP bodies are delivered as the body only, without trigger metadata duplication.
    pub const RPC_HTTP_BODY_ONLY: &str = "RpcHttpBodyOnly";

    /// HTTP bodies are delivered as raw bytes.
    pub const RAW_HTTP_BODY_BYTES: &str = "RawHttpBodyBytes";

    /// Homogeneous collection wire values are understood.
    pub const TYPED_DATA_COLLECTION: &str = "TypedDataCollection";

    /// The worker answers status probes.
    pub const WORKER_STATUS: &str = "WorkerStatus";

    /// The worker handles terminate messages.
    pub const HANDLES_WORKER_TERMINATE: &str = "HandlesWorkerTerminateMessage";

    /// The worker handles invocation cancel messages.
    pub const HANDLES_INVOCATION_CANCEL: &str = "HandlesInvocationCancelMessage";
}

/// Reserved output name carrying a function's implicit return value.
pub const RETURN_BINDING_NAME: &str = "$return";
