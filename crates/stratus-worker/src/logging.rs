//! Logging for function code and the worker itself.
//!
//! Each invocation exposes a write-only [`InvocationLogger`]. Records are
//! emitted as `tracing` events and forwarded to a [`LogSink`]; the default
//! sink ships them to the host as `RpcLog` envelopes.

use std::fmt;
use std::sync::Arc;

use stratus_proto::{Envelope, LogCategory, LogLevel, RpcLog, WorkerMessage};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use crate::bridge::OutboundSender;

/// Installs the global `tracing` subscriber.
///
/// Honours `RUST_LOG`, defaulting to `info`. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .try_init();
}

/// Destination for log records.
pub trait LogSink: Send + Sync {
    /// Accepts one record.
    fn emit(&self, record: RpcLog);
}

/// Sink forwarding records to the host.
#[derive(Debug, Clone)]
pub struct OutboundLogSink {
    outbound: OutboundSender,
}

impl OutboundLogSink {
    /// Creates a sink writing to the given outbound queue.
    pub fn new(outbound: OutboundSender) -> Self {
        Self { outbound }
    }
}

impl LogSink for OutboundLogSink {
    fn emit(&self, record: RpcLog) {
        let envelope = Envelope::new(String::new(), WorkerMessage::RpcLog(record));
        if let Err(e) = self.outbound.send(envelope) {
            debug!(error = %e, "Dropping log record");
        }
    }
}

/// Sink that keeps records local to the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardLogSink;

impl LogSink for DiscardLogSink {
    fn emit(&self, _record: RpcLog) {}
}

/// Write-only logger scoped to one invocation.
#[derive(Clone)]
pub struct InvocationLogger {
    invocation_id: String,
    category: String,
    sink: Arc<dyn LogSink>,
}

impl InvocationLogger {
    /// Creates a logger for the given invocation and function.
    pub fn new(
        invocation_id: impl Into<String>,
        function_name: &str,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            category: format!("Function.{function_name}.User"),
            sink,
        }
    }

    /// Writes a record at the given level.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let id = self.invocation_id.as_str();
        let category = self.category.as_str();

        match level {
            LogLevel::Trace => trace!(invocation_id = %id, category, "{message}"),
            LogLevel::Debug => debug!(invocation_id = %id, category, "{message}"),
            LogLevel::Information => info!(invocation_id = %id, category, "{message}"),
            LogLevel::Warning => warn!(invocation_id = %id, category, "{message}"),
            LogLevel::Error | LogLevel::Critical => {
                error!(invocation_id = %id, category, "{message}");
            }
        }

        self.sink.emit(RpcLog {
            invocation_id: Some(self.invocation_id.clone()),
            category: self.category.clone(),
            level,
            message,
            exception: None,
            log_category: LogCategory::User,
        });
    }

    /// Writes a debug record.
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    /// Writes an information record.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Information, message);
    }

    /// Writes a warning record.
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    /// Writes an error record.
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for InvocationLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationLogger")
            .field("invocation_id", &self.invocation_id)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}
