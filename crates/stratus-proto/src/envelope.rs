//! Envelope types for protocol messages.

use rkyv::{Archive, Deserialize, Serialize};

use crate::messages::{
    FunctionEnvironmentReloadRequest, FunctionEnvironmentReloadResponse, FunctionLoadRequest,
    FunctionLoadResponse, FunctionMetadataResponse, FunctionsMetadataRequest, InvocationCancel,
    InvocationRequest, InvocationResponse, RpcLog, StartStream, WorkerInitRequest,
    WorkerInitResponse, WorkerTerminate,
};
use crate::status::StatusResult;

/// A protocol envelope: header metadata plus exactly one message payload.
///
/// Envelopes are immutable once received. Responses echo the request ID of
/// the envelope they answer.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Envelope header with metadata.
    pub header: EnvelopeHeader,

    /// The message payload.
    pub payload: WorkerMessage,
}

impl Envelope {
    /// Creates a new envelope with the given request ID and payload.
    #[must_use]
    pub fn new(request_id: impl Into<String>, payload: WorkerMessage) -> Self {
        Self {
            header: EnvelopeHeader::new(request_id),
            payload,
        }
    }

    /// Creates a response envelope echoing the request's ID.
    #[must_use]
    pub fn response_to(request_header: &EnvelopeHeader, payload: WorkerMessage) -> Self {
        Self {
            header: EnvelopeHeader::response_to(request_header),
            payload,
        }
    }

    /// Returns the request ID carried by this envelope.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.header.request_id
    }
}

/// Header metadata for all protocol envelopes.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Protocol version.
    ///
    /// Receivers should reject messages with unsupported versions.
    pub version: u16,

    /// Request ID for request/response matching.
    pub request_id: String,

    /// Message timestamp in nanoseconds since Unix epoch.
    pub timestamp_ns: u64,
}

impl EnvelopeHeader {
    /// Creates a new header for the given request ID.
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            version: crate::version::CURRENT,
            request_id: request_id.into(),
            timestamp_ns: current_timestamp_ns(),
        }
    }

    /// Creates a response header echoing the request's ID.
    #[must_use]
    pub fn response_to(request: &Self) -> Self {
        Self::new(request.request_id.clone())
    }

    /// Checks if this message version is compatible.
    #[must_use]
    pub const fn is_compatible(&self) -> bool {
        self.version >= crate::version::MIN_SUPPORTED && self.version <= crate::version::CURRENT
    }
}

/// Every message kind carried over the worker stream.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// First message on a new stream, identifying the worker.
    StartStream(StartStream),

    /// Host handshake request.
    WorkerInitRequest(WorkerInitRequest),

    /// Worker handshake response.
    WorkerInitResponse(WorkerInitResponse),

    /// Host liveness probe.
    WorkerStatusRequest,

    /// Worker liveness reply.
    WorkerStatusResponse,

    /// Host request for the worker's function metadata.
    FunctionsMetadataRequest(FunctionsMetadataRequest),

    /// Worker's function metadata.
    FunctionMetadataResponse(FunctionMetadataResponse),

    /// Host request to load a function.
    FunctionLoadRequest(FunctionLoadRequest),

    /// Outcome of a function load.
    FunctionLoadResponse(FunctionLoadResponse),

    /// Host request to run a function.
    InvocationRequest(InvocationRequest),

    /// Outcome of an invocation.
    InvocationResponse(InvocationResponse),

    /// Host request to cancel an in-flight invocation.
    InvocationCancel(InvocationCancel),

    /// Host request to swap the worker's environment.
    FunctionEnvironmentReloadRequest(FunctionEnvironmentReloadRequest),

    /// Outcome of an environment reload.
    FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse),

    /// Host request to shut the worker down.
    WorkerTerminate(WorkerTerminate),

    /// Log record produced by the worker.
    RpcLog(RpcLog),
}

impl WorkerMessage {
    /// Returns a stable name for this message kind, used in logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StartStream(_) => "start_stream",
            Self::WorkerInitRequest(_) => "worker_init_request",
            Self::WorkerInitResponse(_) => "worker_init_response",
            Self::WorkerStatusRequest => "worker_status_request",
            Self::WorkerStatusResponse => "worker_status_response",
            Self::FunctionsMetadataRequest(_) => "functions_metadata_request",
            Self::FunctionMetadataResponse(_) => "function_metadata_response",
            Self::FunctionLoadRequest(_) => "function_load_request",
            Self::FunctionLoadResponse(_) => "function_load_response",
            Self::InvocationRequest(_) => "invocation_request",
            Self::InvocationResponse(_) => "invocation_response",
            Self::InvocationCancel(_) => "invocation_cancel",
            Self::FunctionEnvironmentReloadRequest(_) => "function_environment_reload_request",
            Self::FunctionEnvironmentReloadResponse(_) => "function_environment_reload_response",
            Self::WorkerTerminate(_) => "worker_terminate",
            Self::RpcLog(_) => "rpc_log",
        }
    }

    /// Checks if this message is one the host sends to the worker.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(
            self,
            Self::WorkerInitRequest(_)
                | Self::WorkerStatusRequest
                | Self::FunctionsMetadataRequest(_)
                | Self::FunctionLoadRequest(_)
                | Self::InvocationRequest(_)
                | Self::InvocationCancel(_)
                | Self::FunctionEnvironmentReloadRequest(_)
                | Self::WorkerTerminate(_)
        )
    }

    /// Returns the status result carried by a response message, if any.
    #[must_use]
    pub fn result(&self) -> Option<&StatusResult> {
        match self {
            Self::WorkerInitResponse(r) => Some(&r.result),
            Self::FunctionMetadataResponse(r) => Some(&r.result),
            Self::FunctionLoadResponse(r) => Some(&r.result),
            Self::InvocationResponse(r) => Some(&r.result),
            Self::FunctionEnvironmentReloadResponse(r) => Some(&r.result),
            _ => None,
        }
    }
}

/// Returns the current time in nanoseconds since Unix epoch.
fn current_timestamp_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
