//! Error types for the worker.
//!
//! Errors are split by layer: transport failures are fatal to the bridge,
//! worker errors fail a single control request, and invocation errors are
//! classified into a response status by the invocation handler.

use std::any::Any;

use stratus_proto::RpcException;
use thiserror::Error;

use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::context::ContextError;
use crate::converters::ConversionError;
use crate::handler::FunctionError;
use crate::metadata::MetadataError;

/// Source recorded on exceptions raised by the worker itself.
pub(crate) const WORKER_SOURCE: &str = "stratus-worker";

/// Errors raised while running a single invocation.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// No function is loaded under the requested id.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// An input could not be bound to its parameter.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// User code returned an error.
    #[error("{0}")]
    User(FunctionError),

    /// The invocation observed its cancellation signal.
    #[error("invocation cancelled")]
    Cancelled,

    /// The execution context was used outside its lifecycle.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// User code panicked.
    #[error("function panicked: {0}")]
    Panicked(String),
}

impl InvocationError {
    /// Returns the exception type name reported to the host.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::FunctionNotFound(_) => "function_not_found",
            Self::Conversion(_) => "conversion_error",
            Self::User(_) => "user_code_error",
            Self::Cancelled => "cancelled",
            Self::Context(_) => "context_error",
            Self::Panicked(_) => "panic",
        }
    }

    /// Checks if this error represents cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Checks if this error originated in user code.
    pub fn is_user_fault(&self) -> bool {
        matches!(self, Self::User(_) | Self::Panicked(_))
    }

    /// Converts this error into exception details for the host.
    ///
    /// With `enable_user_code_exception` set, user faults keep their
    /// original type and message. Otherwise they are flattened into a
    /// single message under a generic type.
    pub fn to_rpc_exception(&self, enable_user_code_exception: bool) -> RpcException {
        match self {
            Self::User(error) if enable_user_code_exception => {
                RpcException::new(error.type_name(), error.message()).user()
            }
            Self::User(error) => RpcException::new(
                self.error_type(),
                format!("{}: {}", error.type_name(), error.message()),
            ),
            Self::Panicked(message) if enable_user_code_exception => {
                RpcException::new(self.error_type(), message.clone()).user()
            }
            _ => RpcException::new(self.error_type(), self.to_string()).with_source(WORKER_SOURCE),
        }
    }
}

impl From<FunctionError> for InvocationError {
    fn from(error: FunctionError) -> Self {
        if error.is_cancelled() {
            Self::Cancelled
        } else {
            Self::User(error)
        }
    }
}

/// Errors raised while handling control requests or running the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A function with this id is already loaded.
    #[error("function already loaded: {0}")]
    DuplicateFunction(String),

    /// No catalog entry matches the load request.
    #[error("no function registered for entry point '{0}'")]
    UnknownEntryPoint(String),

    /// An output parameter has no matching output binding.
    #[error("function '{function}' sets output '{output}' without an output binding")]
    UndeclaredOutput { function: String, output: String },

    /// Function metadata could not be produced.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// The environment reload was rejected.
    #[error("environment reload failed: {0}")]
    Reload(String),

    /// A request arrived in a state that cannot serve it.
    #[error("worker is not ready (state: {0})")]
    NotReady(&'static str),

    /// The stream bridge failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The connection to the host could not be opened.
    #[error("failed to connect to host at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkerError {
    /// Returns the exception type name reported to the host.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::DuplicateFunction(_) => "duplicate_function",
            Self::UnknownEntryPoint(_) => "unknown_entry_point",
            Self::UndeclaredOutput { .. } => "undeclared_output",
            Self::Metadata(_) => "metadata_error",
            Self::Reload(_) => "reload_error",
            Self::NotReady(_) => "not_ready",
            Self::Bridge(_) => "bridge_error",
            Self::Config(_) => "config_error",
            Self::Connect { .. } => "connect_error",
        }
    }

    /// Converts this error into exception details for the host.
    pub fn to_rpc_exception(&self) -> RpcException {
        RpcException::new(self.error_type(), self.to_string()).with_source(WORKER_SOURCE)
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
