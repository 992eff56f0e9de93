//! Invocation handling and cancellation.
//!
//! Every invocation request produces exactly one [`InvocationResponse`].
//! Failures anywhere in the pipeline, including panics in user code, are
//! classified into a status instead of escaping to the dispatcher.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use stratus_proto::{InvocationRequest, InvocationResponse, StatusResult, TraceContext};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::FunctionContext;
use crate::error::{panic_message, InvocationError};
use crate::logging::LogSink;
use crate::output::OutputBindingRegistry;
use crate::pipeline::Pipeline;
use crate::registry::FunctionTable;
use crate::reload::WorkerEnvironment;
use crate::services::ScopeFactory;

/// Outcome of a cancellation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The invocation was in flight and has been signalled.
    Signalled,
    /// No invocation with this id is in flight.
    NotFound,
}

/// Token registered for one in-flight invocation.
#[derive(Debug)]
pub struct CancellationRegistration {
    invocation_id: String,
    generation: u64,
    token: CancellationToken,
}

impl CancellationRegistration {
    /// Returns the invocation id.
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Returns the cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Cancellation tokens of in-flight invocations, keyed by invocation id.
///
/// Registering an id that is already present replaces the earlier token.
/// Each registration only ever removes its own entry.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: DashMap<String, (u64, CancellationToken)>,
    next_generation: AtomicU64,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh token for an invocation.
    pub fn register(&self, invocation_id: &str) -> CancellationRegistration {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if self
            .entries
            .insert(invocation_id.to_owned(), (generation, token.clone()))
            .is_some()
        {
            warn!(invocation_id, "Invocation id reused while in flight, replacing token");
        }
        CancellationRegistration {
            invocation_id: invocation_id.to_owned(),
            generation,
            token,
        }
    }

    /// Removes a registration. Has no effect if it has been replaced.
    pub fn remove(&self, registration: &CancellationRegistration) {
        self.entries
            .remove_if(&registration.invocation_id, |_, (generation, _)| {
                *generation == registration.generation
            });
    }

    /// Signals the token registered for an invocation.
    pub fn try_cancel(&self, invocation_id: &str) -> CancelOutcome {
        match self.entries.get(invocation_id) {
            Some(entry) => {
                entry.value().1.cancel();
                CancelOutcome::Signalled
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Checks if an invocation is registered.
    pub fn contains(&self, invocation_id: &str) -> bool {
        self.entries.contains_key(invocation_id)
    }

    /// Returns the number of in-flight invocations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs invocation requests against the loaded functions.
pub struct InvocationHandler {
    functions: Arc<FunctionTable>,
    pipeline: Arc<Pipeline>,
    outputs: Arc<OutputBindingRegistry>,
    cancellations: CancellationRegistry,
    scope_factory: Arc<dyn ScopeFactory>,
    environment: WorkerEnvironment,
    enable_user_code_exception: bool,
}

impl InvocationHandler {
    /// Creates a handler.
    pub fn new(
        functions: Arc<FunctionTable>,
        pipeline: Arc<Pipeline>,
        outputs: Arc<OutputBindingRegistry>,
        scope_factory: Arc<dyn ScopeFactory>,
        enable_user_code_exception: bool,
    ) -> Self {
        Self {
            functions,
            pipeline,
            outputs,
            cancellations: CancellationRegistry::new(),
            scope_factory,
            environment: WorkerEnvironment::new(),
            enable_user_code_exception,
        }
    }

    /// Shares a function app environment with every invocation context.
    pub fn with_environment(mut self, environment: WorkerEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Returns the registry of in-flight invocations.
    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Signals cancellation of an in-flight invocation.
    pub fn try_cancel(&self, invocation_id: &str) -> CancelOutcome {
        let outcome = self.cancellations.try_cancel(invocation_id);
        match outcome {
            CancelOutcome::Signalled => info!(invocation_id, "Invocation cancellation signalled"),
            CancelOutcome::NotFound => debug!(invocation_id, "Cancel for unknown invocation"),
        }
        outcome
    }

    /// Runs one invocation to completion.
    pub async fn invoke(
        &self,
        request: InvocationRequest,
        log_sink: Arc<dyn LogSink>,
    ) -> InvocationResponse {
        let invocation_id = request.invocation_id.clone();
        let trace_context = request.trace_context.clone();
        let retry_context = request.retry_context.clone();

        let Some(definition) = self.functions.get(&request.function_id) else {
            warn!(
                invocation_id = %invocation_id,
                function_id = %request.function_id,
                "Invocation for unknown function"
            );
            let error = InvocationError::FunctionNotFound(request.function_id);
            return InvocationResponse {
                invocation_id,
                output_data: Vec::new(),
                return_value: None,
                result: StatusResult::failure(
                    error.to_rpc_exception(self.enable_user_code_exception),
                ),
                trace_context,
                retry_context,
            };
        };

        let registration = self.cancellations.register(&invocation_id);
        let context = FunctionContext::new(
            Arc::clone(&definition),
            request,
            Arc::clone(&self.scope_factory),
            self.environment.clone(),
            log_sink,
            registration.token().clone(),
        );
        debug!(
            invocation_id = %invocation_id,
            function = %definition.name,
            "Invocation started"
        );

        let outcome = self.execute(&context).await;

        let mut response = InvocationResponse {
            invocation_id,
            output_data: Vec::new(),
            return_value: None,
            result: StatusResult::success(),
            trace_context: echo_trace_context(trace_context, context.trace_attributes()),
            retry_context,
        };

        let outcome = match outcome {
            Ok(()) => {
                if let Err(e) = context.complete() {
                    warn!(
                        invocation_id = %response.invocation_id,
                        error = %e,
                        "Unexpected context state"
                    );
                }
                let outputs = context.take_outputs();
                panic::catch_unwind(AssertUnwindSafe(|| self.outputs.collect(&definition, outputs)))
                    .map_err(|payload| InvocationError::Panicked(panic_message(payload.as_ref())))
            }
            Err(error) => {
                if let Err(e) = context.fault() {
                    warn!(
                        invocation_id = %response.invocation_id,
                        error = %e,
                        "Unexpected context state"
                    );
                }
                Err(error)
            }
        };

        match outcome {
            Ok(serialized) => {
                response.output_data = serialized.output_data;
                response.return_value = serialized.return_value;
                info!(
                    invocation_id = %response.invocation_id,
                    function = %definition.name,
                    outputs = response.output_data.len(),
                    "Invocation succeeded"
                );
            }
            Err(error) => response.result = self.classify(&context, &error),
        }

        self.cancellations.remove(&registration);
        context.dispose().await;
        response
    }

    async fn execute(&self, context: &FunctionContext) -> Result<(), InvocationError> {
        context.begin()?;
        if context.is_cancelled() {
            return Err(InvocationError::Cancelled);
        }

        match AssertUnwindSafe(self.pipeline.run(context)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(InvocationError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    fn classify(&self, context: &FunctionContext, error: &InvocationError) -> StatusResult {
        let invocation_id = context.invocation_id();
        let function = context.function_name();

        if error.is_cancellation() || (context.is_cancelled() && !error.is_user_fault()) {
            info!(invocation_id, function, "Invocation cancelled");
            return StatusResult::cancelled(None);
        }

        if error.is_user_fault() {
            warn!(
                invocation_id,
                function,
                error_type = error.error_type(),
                error = %error,
                "Function failed"
            );
        } else {
            error!(
                invocation_id,
                function,
                error_type = error.error_type(),
                error = %error,
                "Invocation failed"
            );
        }
        StatusResult::failure(error.to_rpc_exception(self.enable_user_code_exception))
    }
}

impl std::fmt::Debug for InvocationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationHandler")
            .field("functions", &self.functions.len())
            .field("in_flight", &self.cancellations.len())
            .field("enable_user_code_exception", &self.enable_user_code_exception)
            .finish_non_exhaustive()
    }
}

fn echo_trace_context(
    trace_context: Option<TraceContext>,
    attributes: Vec<(String, String)>,
) -> Option<TraceContext> {
    if attributes.is_empty() {
        return trace_context;
    }
    let mut trace_context = trace_context.unwrap_or_default();
    trace_context.attributes.extend(attributes);
    Some(trace_context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converters::ConverterChain;
    use crate::definition::{FunctionDefinition, FunctionParameter, ParameterRole};
    use crate::handler::{handler_fn, sync_handler_fn, FunctionError, FunctionInvoker};
    use crate::logging::DiscardLogSink;
    use crate::pipeline::{from_fn, PipelineBuilder};
    use crate::catalog::CatalogEntry;
    use crate::output::{OutputBinding, OutputSerializer, OutputValue};
    use crate::services::{ServiceInstance, ServiceProvider, ServiceScope};
    use async_trait::async_trait;
    use rstest::rstest;
    use std::any::TypeId;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;
    use stratus_proto::{
        BindingDirection, BindingInfo, FunctionLoadRequest, ParameterBinding, RetryContext, Status,
        WireValue,
    };

    fn definition(
        id: &str,
        parameters: Vec<FunctionParameter>,
        outputs: &[&str],
        invoker: Arc<dyn FunctionInvoker>,
    ) -> FunctionDefinition {
        FunctionDefinition {
            id: id.into(),
            name: id.into(),
            entry_point: id.into(),
            parameters,
            bindings: Vec::new(),
            outputs: outputs.iter().map(|s| (*s).to_owned()).collect(),
            retry: None,
            invoker,
        }
    }

    fn handler_parts(
        builder: PipelineBuilder,
        functions: Vec<FunctionDefinition>,
        outputs: OutputBindingRegistry,
        scopes: Arc<dyn ScopeFactory>,
        enable: bool,
    ) -> InvocationHandler {
        let table = Arc::new(FunctionTable::new());
        for function in functions {
            table.insert(function).unwrap();
        }
        InvocationHandler::new(
            table,
            Arc::new(builder.build(Arc::new(ConverterChain::with_defaults()))),
            Arc::new(outputs),
            scopes,
            enable,
        )
    }

    fn handler_with(
        builder: PipelineBuilder,
        functions: Vec<FunctionDefinition>,
        enable: bool,
    ) -> InvocationHandler {
        handler_parts(
            builder,
            functions,
            OutputBindingRegistry::new(),
            Arc::new(ServiceProvider::empty()),
            enable,
        )
    }

    fn handler(functions: Vec<FunctionDefinition>) -> InvocationHandler {
        handler_with(PipelineBuilder::new(), functions, true)
    }

    async fn invoke(handler: &InvocationHandler, request: InvocationRequest) -> InvocationResponse {
        handler.invoke(request, Arc::new(DiscardLogSink)).await
    }

    #[tokio::test]
    async fn unknown_function_fails() {
        let handler = handler(Vec::new());
        let response = invoke(&handler, InvocationRequest::new("inv-1", "F1", Vec::new())).await;

        assert_eq!(response.invocation_id, "inv-1");
        assert_eq!(response.result.status, Status::Failure);
        let exception = response.result.exception.unwrap();
        assert_eq!(exception.type_name, "function_not_found");
        assert!(exception.message.contains("F1"));
    }

    #[tokio::test]
    async fn string_collection_output() {
        let invoker = sync_handler_fn(|_| vec!["a".to_owned(), "b".to_owned()]);
        let handler = handler(vec![definition("fn-1", Vec::new(), &["$return"], invoker)]);

        let response = invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await;

        assert!(response.result.is_success());
        assert_eq!(
            response.return_value,
            Some(WireValue::CollectionString(vec!["a".into(), "b".into()]))
        );
        assert!(handler.cancellations().is_empty());
    }

    #[tokio::test]
    async fn user_error_keeps_type_and_message() {
        let invoker = sync_handler_fn(|_| Err::<(), _>(FunctionError::new("BoomError", "boom")));
        let handler = handler(vec![definition("fn-1", Vec::new(), &[], invoker)]);

        let response = invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await;

        assert_eq!(response.result.status, Status::Failure);
        let exception = response.result.exception.unwrap();
        assert_eq!(exception.type_name, "BoomError");
        assert_eq!(exception.message, "boom");
        assert!(exception.is_user_exception);
    }

    #[tokio::test]
    async fn user_error_wrapped_when_user_exceptions_disabled() {
        let invoker = sync_handler_fn(|_| Err::<(), _>(FunctionError::new("BoomError", "boom")));
        let handler = handler_with(
            PipelineBuilder::new(),
            vec![definition("fn-1", Vec::new(), &[], invoker)],
            false,
        );

        let response = invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await;

        let exception = response.result.exception.unwrap();
        assert_eq!(exception.type_name, "user_code_error");
        assert_eq!(exception.message, "BoomError: boom");
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let invoker = sync_handler_fn(|_| -> () { panic!("handler exploded") });
        let handler = handler(vec![definition("fn-1", Vec::new(), &[], invoker)]);

        let response = invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await;

        assert_eq!(response.result.status, Status::Failure);
        let exception = response.result.exception.unwrap();
        assert_eq!(exception.type_name, "panic");
        assert_eq!(exception.message, "handler exploded");
    }

    #[tokio::test]
    async fn conversion_failure_is_system_failure() {
        let handler = handler(vec![definition(
            "fn-1",
            vec![FunctionParameter::of::<i64>("n", ParameterRole::Trigger)],
            &[],
            sync_handler_fn(|_| ()),
        )]);

        let request = InvocationRequest::new(
            "inv-1",
            "fn-1",
            vec![ParameterBinding::new("n", WireValue::from("many"))],
        );
        let response = invoke(&handler, request).await;

        let exception = response.result.exception.unwrap();
        assert_eq!(exception.type_name, "conversion_error");
        assert!(!exception.is_user_exception);
    }

    #[tokio::test]
    async fn cancel_in_flight_invocation() {
        let invoker = handler_fn(|mut args| async move {
            let token: CancellationToken = args.take(0)?;
            token.cancelled().await;
            Err::<(), _>(FunctionError::cancelled())
        });
        let handler = Arc::new(handler(vec![definition(
            "fn-1",
            vec![FunctionParameter::of::<CancellationToken>("cancel", ParameterRole::Context)],
            &[],
            invoker,
        )]));

        let running = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handler.cancellations().contains("inv-1") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handler.try_cancel("inv-1"), CancelOutcome::Signalled);
        let response = running.await.unwrap();
        assert_eq!(response.result.status, Status::Cancelled);

        assert_eq!(handler.try_cancel("inv-1"), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn cancel_after_completion_not_found() {
        let handler = handler(vec![definition("fn-1", Vec::new(), &[], sync_handler_fn(|_| ()))]);
        let response = invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await;
        assert!(response.result.is_success());

        assert_eq!(handler.try_cancel("inv-1"), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn contexts_echoed_with_attributes() {
        let mut builder = PipelineBuilder::new();
        builder.push(from_fn(|ctx, next| {
            Box::pin(async move {
                ctx.add_trace_attribute("tenant", "acme");
                next.run(ctx).await
            })
        }));
        let handler = handler_with(
            builder,
            vec![definition("fn-1", Vec::new(), &[], sync_handler_fn(|_| ()))],
            true,
        );

        let retry = RetryContext {
            retry_count: 1,
            max_retry_count: 3,
            exception: None,
        };
        let request = InvocationRequest {
            trace_context: Some(TraceContext {
                trace_parent: "00-abc-01".into(),
                ..TraceContext::default()
            }),
            retry_context: Some(retry.clone()),
            ..InvocationRequest::new("inv-1", "fn-1", Vec::new())
        };
        let response = invoke(&handler, request).await;

        let trace = response.trace_context.unwrap();
        assert_eq!(trace.trace_parent, "00-abc-01");
        assert_eq!(trace.attributes, vec![("tenant".to_owned(), "acme".to_owned())]);
        assert_eq!(response.retry_context, Some(retry));
    }

    #[test]
    fn replaced_registration_survives_stale_removal() {
        let registry = CancellationRegistry::new();
        let first = registry.register("inv-1");
        let second = registry.register("inv-1");

        registry.remove(&first);
        assert!(registry.contains("inv-1"));

        assert_eq!(registry.try_cancel("inv-1"), CancelOutcome::Signalled);
        assert!(second.token().is_cancelled());
        assert!(!first.token().is_cancelled());

        registry.remove(&second);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn output_names_follow_host_spelling() {
        let entry = CatalogEntry::new(
            "enqueue",
            sync_handler_fn(|mut args| {
                let queue: OutputBinding<String> = args.take(0)?;
                queue.set("queued".to_owned())?;
                Ok::<_, FunctionError>(())
            }),
        )
        .output::<String>("queue", "queue");
        let mut metadata = entry.to_metadata("fn-1", "/app");
        metadata.bindings = vec![(
            "Queue".into(),
            BindingInfo::new("queue", BindingDirection::Out),
        )];
        let definition = entry
            .instantiate(&FunctionLoadRequest {
                function_id: "fn-1".into(),
                metadata,
            })
            .unwrap();
        assert_eq!(definition.outputs, vec!["Queue".to_owned()]);

        let handler = handler(vec![definition]);
        let response = invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await;

        assert!(response.result.is_success());
        assert_eq!(
            response.output_data,
            vec![ParameterBinding::new("Queue", WireValue::String("queued".into()))]
        );
    }

    struct Exploding;

    impl OutputSerializer for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn serialize(&self, _value: &dyn OutputValue) -> Option<WireValue> {
            panic!("serializer exploded")
        }
    }

    #[derive(Default)]
    struct CountingScopes {
        opened: Arc<AtomicUsize>,
        disposed: Arc<AtomicUsize>,
    }

    struct CountingScope(Arc<AtomicUsize>);

    #[async_trait]
    impl ServiceScope for CountingScope {
        fn resolve(&self, _type_id: TypeId) -> Option<ServiceInstance> {
            None
        }

        async fn dispose(&self) {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    impl ScopeFactory for CountingScopes {
        fn create_scope(&self) -> Arc<dyn ServiceScope> {
            self.opened.fetch_add(1, AtomicOrdering::SeqCst);
            Arc::new(CountingScope(Arc::clone(&self.disposed)))
        }
    }

    /// Middleware that opens the invocation's service scope.
    fn open_scope() -> PipelineBuilder {
        let mut builder = PipelineBuilder::new();
        builder.push(from_fn(|ctx, next| {
            Box::pin(async move {
                ctx.instance_services()?;
                next.run(ctx).await
            })
        }));
        builder
    }

    #[tokio::test]
    async fn serializer_panic_fails_and_releases_invocation() {
        let scopes = CountingScopes::default();
        let disposed = Arc::clone(&scopes.disposed);
        let mut outputs = OutputBindingRegistry::new();
        outputs.push(Arc::new(Exploding));
        let handler = handler_parts(
            open_scope(),
            vec![definition("fn-1", Vec::new(), &["$return"], sync_handler_fn(|_| "x".to_owned()))],
            outputs,
            Arc::new(scopes),
            true,
        );

        let response = invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await;

        assert_eq!(response.result.status, Status::Failure);
        let exception = response.result.exception.unwrap();
        assert_eq!(exception.type_name, "panic");
        assert_eq!(exception.message, "serializer exploded");
        assert!(response.return_value.is_none());
        assert!(!handler.cancellations().contains("inv-1"));
        assert_eq!(disposed.load(AtomicOrdering::SeqCst), 1);
    }

    #[rstest]
    #[case::success(sync_handler_fn(|_| ()), Status::Success)]
    #[case::user_fault(
        sync_handler_fn(|_| Err::<(), _>(FunctionError::new("BoomError", "boom"))),
        Status::Failure
    )]
    #[case::panic(sync_handler_fn(|_| -> () { panic!("handler exploded") }), Status::Failure)]
    #[case::cancelled(
        handler_fn(|mut args| async move {
            let token: CancellationToken = args.take(0)?;
            token.cancel();
            Err::<(), _>(FunctionError::cancelled())
        }),
        Status::Cancelled
    )]
    #[tokio::test]
    async fn scope_disposed_once_per_invocation(
        #[case] invoker: Arc<dyn FunctionInvoker>,
        #[case] expected: Status,
    ) {
        let scopes = CountingScopes::default();
        let opened = Arc::clone(&scopes.opened);
        let disposed = Arc::clone(&scopes.disposed);
        let cancel = FunctionParameter::of::<CancellationToken>("cancel", ParameterRole::Context);
        let handler = handler_parts(
            open_scope(),
            vec![definition("fn-1", vec![cancel], &[], invoker)],
            OutputBindingRegistry::new(),
            Arc::new(scopes),
            true,
        );

        let response = invoke(&handler, InvocationRequest::new("inv-1", "fn-1", Vec::new())).await;

        assert_eq!(response.result.status, expected);
        assert_eq!(opened.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(disposed.load(AtomicOrdering::SeqCst), 1);
        assert!(handler.cancellations().is_empty());
    }
}
