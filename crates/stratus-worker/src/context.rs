//! Execution context for a single invocation.
//!
//! A [`FunctionContext`] is created when an invocation request arrives and
//! disposed exactly once when its response has been produced. Clones share
//! the same state, so middleware, converters and the handler all observe
//! the same items and outputs.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Executing -> ResultSet -> Disposed
//!                      \-> Faulted  -/
//! ```
//!
//! Items and outputs may only be written while `Executing`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use stratus_proto::{InvocationRequest, ParameterBinding, RetryContext, TraceContext, WireValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::definition::FunctionDefinition;
use crate::handler::InvocationResult;
use crate::logging::{InvocationLogger, LogSink};
use crate::output::{IntoWireValue, OutputValue};
use crate::reload::WorkerEnvironment;
use crate::services::{ScopeFactory, ServiceScope};

/// Lifecycle state of a [`FunctionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Built, pipeline not yet entered.
    Created,
    /// The pipeline is running.
    Executing,
    /// The handler completed and its result was recorded.
    ResultSet,
    /// The pipeline failed.
    Faulted,
    /// Resources released. Terminal.
    Disposed,
}

impl ContextState {
    /// Returns the state name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Executing => "executing",
            Self::ResultSet => "result_set",
            Self::Faulted => "faulted",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by misuse of a [`FunctionContext`].
#[derive(Debug, Error)]
pub enum ContextError {
    /// A mutation was attempted outside the executing state.
    #[error("context is not executing (state: {state})")]
    NotExecuting { state: ContextState },

    /// The output name is not a declared output binding.
    #[error("output '{0}' is not declared by this function")]
    UndeclaredOutput(String),

    /// The context has already been disposed.
    #[error("context has been disposed")]
    Disposed,

    /// A lifecycle transition is not allowed from the current state.
    #[error("invalid context transition from {from} to {to}")]
    InvalidTransition { from: ContextState, to: ContextState },
}

type Item = Box<dyn Any + Send + Sync>;

/// Per-invocation state shared by the pipeline and the handler.
#[derive(Clone)]
pub struct FunctionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    invocation_id: String,
    definition: Arc<FunctionDefinition>,
    input_data: Vec<ParameterBinding>,
    trigger_metadata: Vec<(String, WireValue)>,
    trace_context: Option<TraceContext>,
    retry_context: Option<RetryContext>,
    cancellation: CancellationToken,
    logger: InvocationLogger,
    scope_factory: Arc<dyn ScopeFactory>,
    scope: Mutex<Option<Arc<dyn ServiceScope>>>,
    environment: WorkerEnvironment,
    state: Mutex<ContextState>,
    items: Mutex<HashMap<String, Item>>,
    outputs: Mutex<Vec<(String, Box<dyn OutputValue>)>>,
    result: Mutex<Option<InvocationResult>>,
    trace_attributes: Mutex<Vec<(String, String)>>,
}

impl FunctionContext {
    pub(crate) fn new(
        definition: Arc<FunctionDefinition>,
        request: InvocationRequest,
        scope_factory: Arc<dyn ScopeFactory>,
        environment: WorkerEnvironment,
        log_sink: Arc<dyn LogSink>,
        cancellation: CancellationToken,
    ) -> Self {
        let logger = InvocationLogger::new(&*request.invocation_id, &definition.name, log_sink);
        Self {
            inner: Arc::new(ContextInner {
                invocation_id: request.invocation_id,
                definition,
                input_data: request.input_data,
                trigger_metadata: request.trigger_metadata,
                trace_context: request.trace_context,
                retry_context: request.retry_context,
                cancellation,
                logger,
                scope_factory,
                scope: Mutex::new(None),
                environment,
                state: Mutex::new(ContextState::Created),
                items: Mutex::new(HashMap::new()),
                outputs: Mutex::new(Vec::new()),
                result: Mutex::new(None),
                trace_attributes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the invocation id.
    pub fn invocation_id(&self) -> &str {
        &self.inner.invocation_id
    }

    /// Returns the function id.
    pub fn function_id(&self) -> &str {
        &self.inner.definition.id
    }

    /// Returns the function name.
    pub fn function_name(&self) -> &str {
        &self.inner.definition.name
    }

    /// Returns the loaded function definition.
    pub fn definition(&self) -> &Arc<FunctionDefinition> {
        &self.inner.definition
    }

    /// Returns the distributed trace context sent by the host.
    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.inner.trace_context.as_ref()
    }

    /// Returns the retry context sent by the host.
    pub fn retry_context(&self) -> Option<&RetryContext> {
        self.inner.retry_context.as_ref()
    }

    /// Returns a trigger metadata value by name (case-insensitive).
    pub fn trigger_metadata(&self, name: &str) -> Option<&WireValue> {
        self.inner
            .trigger_metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Returns the invocation's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Checks if the host asked to cancel this invocation.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Returns the function app environment last reloaded by the host.
    pub fn environment(&self) -> &WorkerEnvironment {
        &self.inner.environment
    }

    /// Returns the invocation logger.
    pub fn logger(&self) -> &InvocationLogger {
        &self.inner.logger
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ContextState {
        *self.inner.state.lock()
    }

    /// Returns the service scope for this invocation, opening it on first use.
    pub fn instance_services(&self) -> Result<Arc<dyn ServiceScope>, ContextError> {
        if self.state() == ContextState::Disposed {
            return Err(ContextError::Disposed);
        }
        let mut scope = self.inner.scope.lock();
        let scope = scope.get_or_insert_with(|| {
            debug!(invocation_id = %self.inner.invocation_id, "Opening service scope");
            self.inner.scope_factory.create_scope()
        });
        Ok(Arc::clone(scope))
    }

    /// Stores an item for later middleware or the handler.
    pub fn set_item<T: Any + Send + Sync>(
        &self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), ContextError> {
        self.ensure_executing()?;
        self.inner.items.lock().insert(key.into(), Box::new(value));
        Ok(())
    }

    /// Returns a copy of an item, if present and of type `T`.
    pub fn item<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .items
            .lock()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Sets a declared output. A later value for the same name wins.
    pub fn set_output<T>(&self, name: &str, value: T) -> Result<(), ContextError>
    where
        T: IntoWireValue + Send + Sync + 'static,
    {
        self.set_output_boxed(name, Box::new(value))
    }

    /// Sets a declared output from an erased value.
    pub fn set_output_boxed(
        &self,
        name: &str,
        value: Box<dyn OutputValue>,
    ) -> Result<(), ContextError> {
        self.ensure_executing()?;
        let Some(name) = self.inner.definition.output_name(name) else {
            return Err(ContextError::UndeclaredOutput(name.to_owned()));
        };

        let mut outputs = self.inner.outputs.lock();
        match outputs.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => outputs.push((name.to_owned(), value)),
        }
        Ok(())
    }

    /// Checks if an output has been set.
    pub fn has_output(&self, name: &str) -> bool {
        self.inner
            .outputs
            .lock()
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Adds an attribute to the trace context echoed back to the host.
    pub fn add_trace_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .trace_attributes
            .lock()
            .push((key.into(), value.into()));
    }

    /// Looks up the wire value for a binding: input data first, then
    /// trigger metadata. Names match case-insensitively.
    pub(crate) fn input(&self, name: &str) -> Option<&WireValue> {
        self.inner
            .input_data
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
            .map(|b| &b.data)
            .or_else(|| self.trigger_metadata(name))
    }

    pub(crate) fn set_result(&self, result: InvocationResult) -> Result<(), ContextError> {
        self.ensure_executing()?;
        *self.inner.result.lock() = Some(result);
        Ok(())
    }

    pub(crate) fn take_result(&self) -> Option<InvocationResult> {
        self.inner.result.lock().take()
    }

    pub(crate) fn take_outputs(&self) -> Vec<(String, Box<dyn OutputValue>)> {
        std::mem::take(&mut *self.inner.outputs.lock())
    }

    pub(crate) fn trace_attributes(&self) -> Vec<(String, String)> {
        self.inner.trace_attributes.lock().clone()
    }

    pub(crate) fn begin(&self) -> Result<(), ContextError> {
        self.transition(&[ContextState::Created], ContextState::Executing)
    }

    pub(crate) fn complete(&self) -> Result<(), ContextError> {
        self.transition(&[ContextState::Executing], ContextState::ResultSet)
    }

    pub(crate) fn fault(&self) -> Result<(), ContextError> {
        self.transition(
            &[ContextState::Created, ContextState::Executing],
            ContextState::Faulted,
        )
    }

    /// Releases the service scope, if one was opened.
    ///
    /// Returns `true` for the call that performed the disposal. Later and
    /// concurrent calls return `false` without touching the scope.
    pub(crate) async fn dispose(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state == ContextState::Disposed {
                return false;
            }
            *state = ContextState::Disposed;
        }

        let scope = self.inner.scope.lock().take();
        if let Some(scope) = scope {
            scope.dispose().await;
        }
        self.inner.items.lock().clear();
        debug!(invocation_id = %self.inner.invocation_id, "Context disposed");
        true
    }

    fn ensure_executing(&self) -> Result<(), ContextError> {
        match self.state() {
            ContextState::Executing => Ok(()),
            ContextState::Disposed => Err(ContextError::Disposed),
            state => Err(ContextError::NotExecuting { state }),
        }
    }

    fn transition(&self, from: &[ContextState], to: ContextState) -> Result<(), ContextError> {
        let mut state = self.inner.state.lock();
        if from.contains(&state) {
            *state = to;
            Ok(())
        } else {
            Err(ContextError::InvalidTransition { from: *state, to })
        }
    }
}

impl fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("invocation_id", &self.inner.invocation_id)
            .field("function", &self.inner.definition.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::definition::FunctionParameter;
    use crate::handler::sync_handler_fn;
    use crate::logging::DiscardLogSink;
    use crate::services::ServiceProvider;

    pub(crate) fn definition(
        parameters: Vec<FunctionParameter>,
        outputs: &[&str],
    ) -> Arc<FunctionDefinition> {
        Arc::new(FunctionDefinition {
            id: "fn-1".into(),
            name: "test".into(),
            entry_point: "test".into(),
            parameters,
            bindings: Vec::new(),
            outputs: outputs.iter().map(|s| (*s).to_owned()).collect(),
            retry: None,
            invoker: sync_handler_fn(|_| ()),
        })
    }

    pub(crate) fn context(
        definition: Arc<FunctionDefinition>,
        inputs: Vec<ParameterBinding>,
    ) -> FunctionContext {
        let request = InvocationRequest::new("inv-1", definition.id.clone(), inputs);
        FunctionContext::new(
            definition,
            request,
            Arc::new(ServiceProvider::empty()),
            WorkerEnvironment::new(),
            Arc::new(DiscardLogSink),
            CancellationToken::new(),
        )
    }
}
