//! Message payload types.

use rkyv::{Archive, Deserialize, Serialize};

use crate::status::{RpcException, StatusResult};
use crate::typed_data::{ParameterBinding, WireValue};

/// Identifies the worker at the start of a stream.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartStream {
    /// Worker identity assigned by the host.
    pub worker_id: String,
}

/// Host handshake request.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerInitRequest {
    /// Version of the host runtime.
    pub host_version: String,

    /// Capabilities the host supports.
    pub capabilities: Vec<(String, String)>,

    /// Directory containing the function app.
    pub function_app_directory: String,
}

/// Worker handshake response.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerInitResponse {
    /// Version of the worker.
    pub worker_version: String,

    /// Capabilities the worker supports.
    pub capabilities: Vec<(String, String)>,

    /// Descriptive worker metadata.
    pub worker_metadata: WorkerMetadata,

    /// Handshake outcome.
    pub result: StatusResult,
}

/// Descriptive metadata about the worker process.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerMetadata {
    /// Name of the language runtime.
    pub runtime_name: String,

    /// Version of the language runtime.
    pub runtime_version: String,

    /// Version of the worker.
    pub worker_version: String,

    /// Process bitness, e.g. `x64`.
    pub worker_bitness: String,

    /// Additional properties.
    pub custom_properties: Vec<(String, String)>,
}

/// Host request for function metadata.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionsMetadataRequest {
    /// Directory containing the function app.
    pub function_app_directory: String,
}

/// Worker's function metadata.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionMetadataResponse {
    /// Metadata for every function the worker can run.
    pub function_metadata: Vec<RpcFunctionMetadata>,

    /// Whether the host should index functions itself.
    pub use_default_metadata_indexing: bool,

    /// Outcome of metadata collection.
    pub result: StatusResult,
}

/// Host request to load a function.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionLoadRequest {
    /// Identifier the host will use in invocation requests.
    pub function_id: String,

    /// Function metadata.
    pub metadata: RpcFunctionMetadata,
}

/// Outcome of a function load.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionLoadResponse {
    /// Function identifier from the request.
    pub function_id: String,

    /// Load outcome.
    pub result: StatusResult,
}

/// Function metadata as exchanged with the host.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RpcFunctionMetadata {
    /// Function identifier.
    pub function_id: String,

    /// Function name.
    pub name: String,

    /// Entry point reference.
    pub entry_point: String,

    /// Script or artifact file.
    pub script_file: String,

    /// Directory of the function.
    pub directory: String,

    /// Language name.
    pub language: String,

    /// Bindings by name, in declaration order.
    pub bindings: Vec<(String, BindingInfo)>,

    /// Raw JSON binding definitions.
    pub raw_bindings: Vec<String>,

    /// Retry policy, if any.
    pub retry_options: Option<RetryOptions>,

    /// Whether the function is a proxy.
    pub is_proxy: bool,
}

impl RpcFunctionMetadata {
    /// Gets binding info by name (case-insensitive).
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<&BindingInfo> {
        self.bindings
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Declared binding.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    /// Binding type, e.g. `httpTrigger`.
    pub binding_type: String,

    /// Data direction.
    pub direction: BindingDirection,
}

impl BindingInfo {
    /// Creates a new binding.
    #[must_use]
    pub fn new(binding_type: impl Into<String>, direction: BindingDirection) -> Self {
        Self {
            binding_type: binding_type.into(),
            direction,
        }
    }

    /// Checks if the binding is a trigger.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.binding_type.ends_with("Trigger") || self.binding_type.ends_with("trigger")
    }
}

/// Binding data direction.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingDirection {
    /// Input.
    In,
    /// Output.
    Out,
    /// Input and output.
    InOut,
}

impl BindingDirection {
    /// Checks if values flow out of the function.
    #[must_use]
    pub const fn is_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }

    /// Returns the direction as written in binding definitions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::InOut => "inout",
        }
    }
}

/// Host retry policy for a function.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Maximum retries, `-1` for unlimited.
    pub max_retry_count: i32,

    /// Delay strategy.
    pub strategy: RetryStrategy,
}

/// Retry delay strategy.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Constant delay between attempts.
    FixedDelay {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Delay grows between the bounds.
    ExponentialBackoff {
        /// Minimum delay in milliseconds.
        minimum_interval_ms: u64,
        /// Maximum delay in milliseconds.
        maximum_interval_ms: u64,
    },
}

/// Host request to run a function.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    /// Unique per-call identifier.
    pub invocation_id: String,

    /// Identifier of a previously loaded function.
    pub function_id: String,

    /// Named inputs.
    pub input_data: Vec<ParameterBinding>,

    /// Trigger metadata values by name.
    pub trigger_metadata: Vec<(String, WireValue)>,

    /// Distributed trace context.
    pub trace_context: Option<TraceContext>,

    /// Retry state when this call is a retry.
    pub retry_context: Option<RetryContext>,
}

impl InvocationRequest {
    /// Creates a request with no trigger metadata or contexts.
    #[must_use]
    pub fn new(
        invocation_id: impl Into<String>,
        function_id: impl Into<String>,
        input_data: Vec<ParameterBinding>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            function_id: function_id.into(),
            input_data,
            trigger_metadata: Vec::new(),
            trace_context: None,
            retry_context: None,
        }
    }
}

/// Outcome of an invocation.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InvocationResponse {
    /// Invocation identifier from the request.
    pub invocation_id: String,

    /// Named output values.
    pub output_data: Vec<ParameterBinding>,

    /// Implicit return value, if the function declares one.
    pub return_value: Option<WireValue>,

    /// Invocation outcome.
    pub result: StatusResult,

    /// Trace context echoed back with collected attributes.
    pub trace_context: Option<TraceContext>,

    /// Retry context echoed from the request.
    pub retry_context: Option<RetryContext>,
}

impl InvocationResponse {
    /// Gets an output value by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&WireValue> {
        self.output_data
            .iter()
            .find(|b| b.name == name)
            .map(|b| &b.data)
    }
}

/// W3C trace context.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TraceContext {
    /// `traceparent` value.
    pub trace_parent: String,

    /// `tracestate` value.
    pub trace_state: String,

    /// Extra attributes.
    pub attributes: Vec<(String, String)>,
}

/// Retry state supplied by the host.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// Current retry attempt.
    pub retry_count: i32,

    /// Maximum retries allowed.
    pub max_retry_count: i32,

    /// Exception from the previous attempt.
    pub exception: Option<RpcException>,
}

/// Host request to cancel an invocation.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InvocationCancel {
    /// Invocation to cancel.
    pub invocation_id: String,

    /// Grace period before the host gives up, in milliseconds.
    pub grace_period_ms: Option<u64>,
}

/// Host request to swap the worker's environment.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionEnvironmentReloadRequest {
    /// Replacement environment variables.
    pub environment_variables: Vec<(String, String)>,

    /// Replacement function app directory.
    pub function_app_directory: String,
}

/// Outcome of an environment reload.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionEnvironmentReloadResponse {
    /// Descriptive worker metadata.
    pub worker_metadata: WorkerMetadata,

    /// Capabilities the worker supports.
    pub capabilities: Vec<(String, String)>,

    /// Reload outcome.
    pub result: StatusResult,
}

/// Host request to shut the worker down.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerTerminate {
    /// Time allowed for in-flight work, in milliseconds.
    pub grace_period_ms: u64,
}

/// Log record produced by the worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcLog {
    /// Invocation the record belongs to, if any.
    pub invocation_id: Option<String>,

    /// Logger category.
    pub category: String,

    /// Severity.
    pub level: LogLevel,

    /// Formatted message.
    pub message: String,

    /// Associated exception.
    pub exception: Option<RpcException>,

    /// Whether the record came from user or worker code.
    pub log_category: LogCategory,
}

/// Log record severity.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Information.
    Information,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Critical.
    Critical,
}

/// Origin of a log record.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Emitted by function code.
    User,
    /// Emitted by the worker itself.
    System,
}
