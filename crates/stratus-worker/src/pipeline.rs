//! Invocation middleware pipeline.
//!
//! The pipeline is composed once when the worker is built and replayed for
//! every invocation. Extension middleware runs outermost-registered-first;
//! the output-bindings step and the function execution step are always
//! innermost.
//!
//! ```text
//! ext[0] -> ext[1] -> ... -> output bindings -> function execution
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use stratus_proto::RETURN_BINDING_NAME;
use tracing::{debug, trace};

use crate::context::FunctionContext;
use crate::converters::{ConverterChain, ConverterContext};
use crate::definition::{ParameterRole, TypeShape};
use crate::error::InvocationError;
use crate::handler::{Arguments, BoxedValue};

/// A step wrapping the rest of the pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Runs this step. Call [`Next::run`] to continue down the pipeline.
    async fn invoke(
        &self,
        context: &FunctionContext,
        next: Next<'_>,
    ) -> Result<(), InvocationError>;
}

/// The remainder of the pipeline after the current step.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    terminal: &'a FunctionExecution,
}

impl Next<'_> {
    /// Runs the remaining steps.
    pub async fn run(self, context: &FunctionContext) -> Result<(), InvocationError> {
        match self.remaining.split_first() {
            Some((step, remaining)) => {
                let next = Next {
                    remaining,
                    terminal: self.terminal,
                };
                step.invoke(context, next).await
            }
            None => self.terminal.execute(context).await,
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.remaining.len())
            .finish()
    }
}

struct FnMiddleware<F>(F);

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a FunctionContext, Next<'a>) -> BoxFuture<'a, Result<(), InvocationError>>
        + Send
        + Sync,
{
    async fn invoke(
        &self,
        context: &FunctionContext,
        next: Next<'_>,
    ) -> Result<(), InvocationError> {
        (self.0)(context, next).await
    }
}

/// Wraps a closure as middleware.
///
/// ```ignore
/// let timing = from_fn(|ctx, next| Box::pin(async move {
///     let started = Instant::now();
///     let result = next.run(ctx).await;
///     ctx.add_trace_attribute("elapsed_ms", started.elapsed().as_millis().to_string());
///     result
/// }));
/// ```
pub fn from_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: for<'a> Fn(&'a FunctionContext, Next<'a>) -> BoxFuture<'a, Result<(), InvocationError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMiddleware(f))
}

/// Routes the handler's returned values into the context's outputs.
///
/// Named outputs go to their binding; the direct return value goes to
/// `$return` when the function declares it and is dropped otherwise.
#[derive(Debug, Default)]
pub struct OutputBindingsMiddleware;

#[async_trait]
impl Middleware for OutputBindingsMiddleware {
    async fn invoke(
        &self,
        context: &FunctionContext,
        next: Next<'_>,
    ) -> Result<(), InvocationError> {
        next.run(context).await?;

        let Some(result) = context.take_result() else {
            return Ok(());
        };
        for (name, value) in result.outputs {
            context.set_output_boxed(&name, value)?;
        }
        if let Some(value) = result.return_value {
            if context.definition().has_return_value() {
                context.set_output_boxed(RETURN_BINDING_NAME, value)?;
            } else {
                debug!(
                    invocation_id = %context.invocation_id(),
                    function = %context.function_name(),
                    "Return value discarded, no $return binding declared"
                );
            }
        }
        Ok(())
    }
}

/// Innermost step: binds parameters and calls the handler.
pub struct FunctionExecution {
    converters: Arc<ConverterChain>,
}

impl FunctionExecution {
    fn new(converters: Arc<ConverterChain>) -> Self {
        Self { converters }
    }

    async fn bind(&self, context: &FunctionContext) -> Result<Arguments, InvocationError> {
        let definition = Arc::clone(context.definition());
        let mut names = Vec::with_capacity(definition.parameters.len());
        let mut values: Vec<BoxedValue> = Vec::with_capacity(definition.parameters.len());

        for parameter in &definition.parameters {
            let value: BoxedValue = match (parameter.role, parameter.ty.shape()) {
                (ParameterRole::Context, TypeShape::Context) => Box::new(context.clone()),
                (ParameterRole::Context, TypeShape::Cancellation) => {
                    Box::new(context.cancellation_token().clone())
                }
                (role, _) => {
                    let source = match role {
                        ParameterRole::Input | ParameterRole::Trigger => {
                            context.input(&parameter.name)
                        }
                        ParameterRole::Output | ParameterRole::Context => None,
                    };
                    let converter_context = ConverterContext {
                        parameter,
                        source,
                        function_context: context,
                    };
                    self.converters.convert(&converter_context).await?.value
                }
            };
            names.push(parameter.name.clone());
            values.push(value);
        }

        Ok(Arguments::new(names, values))
    }

    async fn execute(&self, context: &FunctionContext) -> Result<(), InvocationError> {
        let arguments = self.bind(context).await?;
        if context.is_cancelled() {
            return Err(InvocationError::Cancelled);
        }

        trace!(
            invocation_id = %context.invocation_id(),
            arguments = arguments.len(),
            "Calling handler"
        );
        let invoker = Arc::clone(&context.definition().invoker);
        let result = invoker.invoke(arguments).await?;
        context.set_result(result)?;
        Ok(())
    }
}

impl fmt::Debug for FunctionExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionExecution")
            .field("converters", &self.converters)
            .finish()
    }
}

/// The composed invocation pipeline.
pub struct Pipeline {
    middleware: Vec<Arc<dyn Middleware>>,
    terminal: FunctionExecution,
}

impl Pipeline {
    /// Runs the pipeline for one invocation.
    pub async fn run(&self, context: &FunctionContext) -> Result<(), InvocationError> {
        Next {
            remaining: &self.middleware,
            terminal: &self.terminal,
        }
        .run(context)
        .await
    }

    /// Returns the number of steps, excluding function execution.
    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    /// Returns true if the pipeline has no steps before function execution.
    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.middleware.len())
            .field("terminal", &self.terminal)
            .finish()
    }
}

/// Collects extension middleware before composition.
#[derive(Default, Clone)]
pub struct PipelineBuilder {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends middleware. Earlier registrations wrap later ones.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    /// Composes the pipeline.
    pub fn build(self, converters: Arc<ConverterChain>) -> Pipeline {
        let mut middleware = self.middleware;
        middleware.push(Arc::new(OutputBindingsMiddleware));
        debug!(steps = middleware.len(), "Invocation pipeline composed");
        Pipeline {
            middleware,
            terminal: FunctionExecution::new(converters),
        }
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::context;
    use crate::definition::{FunctionDefinition, FunctionParameter};
    use crate::handler::{handler_fn, FunctionError, FunctionInvoker, Outputs};
    use crate::output::OutputBinding;
    use parking_lot::Mutex;
    use stratus_proto::{ParameterBinding, WireValue};

    fn definition(
        parameters: Vec<FunctionParameter>,
        outputs: &[&str],
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Arc<FunctionDefinition> {
        Arc::new(FunctionDefinition {
            id: "fn-1".into(),
            name: "test".into(),
            entry_point: "test".into(),
            parameters,
            bindings: Vec::new(),
            outputs: outputs.iter().map(|s| (*s).to_owned()).collect(),
            retry: None,
            invoker,
        })
    }

    fn pipeline(builder: PipelineBuilder) -> Pipeline {
        builder.build(Arc::new(ConverterChain::with_defaults()))
    }

    struct Record {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Record {
        async fn invoke(
            &self,
            context: &FunctionContext,
            next: Next<'_>,
        ) -> Result<(), InvocationError> {
            self.log.lock().push(format!("{}:before", self.label));
            let result = next.run(context).await;
            self.log.lock().push(format!("{}:after", self.label));
            result
        }
    }

    #[tokio::test]
    async fn middleware_runs_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = Arc::clone(&log);
        let invoker = handler_fn(move |_args| {
            let log = Arc::clone(&handler_log);
            async move {
                log.lock().push("handler".to_owned());
            }
        });

        let mut builder = PipelineBuilder::new();
        builder.push(Arc::new(Record { label: "a", log: Arc::clone(&log) }));
        builder.push(Arc::new(Record { label: "b", log: Arc::clone(&log) }));
        let pipeline = pipeline(builder);
        assert_eq!(pipeline.len(), 3);

        let ctx = context(definition(Vec::new(), &[], invoker), Vec::new());
        ctx.begin().unwrap();
        pipeline.run(&ctx).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["a:before", "b:before", "handler", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn binds_arguments_and_routes_return_value() {
        let invoker = handler_fn(|mut args| async move {
            let name: String = args.take(0)?;
            let ctx: FunctionContext = args.take(1)?;
            Ok::<_, FunctionError>(format!("{name} from {}", ctx.invocation_id()))
        });
        let def = definition(
            vec![
                FunctionParameter::of::<String>("name", ParameterRole::Trigger),
                FunctionParameter::of::<FunctionContext>("context", ParameterRole::Context),
            ],
            &["$return"],
            invoker,
        );

        let ctx = context(def, vec![ParameterBinding::new("name", WireValue::from("ada"))]);
        ctx.begin().unwrap();
        pipeline(PipelineBuilder::new()).run(&ctx).await.unwrap();

        let outputs = ctx.take_outputs();
        assert_eq!(outputs.len(), 1);
        let (name, value) = outputs.into_iter().next().unwrap();
        assert_eq!(name, "$return");
        assert_eq!(value.into_wire(), WireValue::String("ada from inv-1".into()));
    }

    #[tokio::test]
    async fn undeclared_return_value_is_dropped() {
        let def = definition(Vec::new(), &[], handler_fn(|_args| async { 5_i64 }));
        let ctx = context(def, Vec::new());
        ctx.begin().unwrap();

        pipeline(PipelineBuilder::new()).run(&ctx).await.unwrap();
        assert!(ctx.take_outputs().is_empty());
    }

    #[tokio::test]
    async fn output_parameters_and_named_outputs() {
        let invoker = handler_fn(|mut args| async move {
            let queue: OutputBinding<String> = args.take(0)?;
            queue.set("from binding".to_owned())?;
            Ok::<_, FunctionError>(Outputs::new().with("table", vec!["row".to_owned()]))
        });
        let def = definition(
            vec![FunctionParameter::of::<OutputBinding<String>>("queue", ParameterRole::Output)],
            &["queue", "table"],
            invoker,
        );

        let ctx = context(def, Vec::new());
        ctx.begin().unwrap();
        pipeline(PipelineBuilder::new()).run(&ctx).await.unwrap();

        assert!(ctx.has_output("queue"));
        assert!(ctx.has_output("table"));
    }

    #[tokio::test]
    async fn conversion_failure_stops_before_handler() {
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        let invoker = handler_fn(move |_args| {
            let flag = Arc::clone(&flag);
            async move {
                *flag.lock() = true;
            }
        });
        let def = definition(
            vec![FunctionParameter::of::<i32>("n", ParameterRole::Input)],
            &[],
            invoker,
        );

        let ctx = context(def, vec![ParameterBinding::new("n", WireValue::from("many"))]);
        ctx.begin().unwrap();
        let err = pipeline(PipelineBuilder::new()).run(&ctx).await.unwrap_err();

        assert!(matches!(err, InvocationError::Conversion(_)));
        assert!(!*called.lock());
    }

    #[tokio::test]
    async fn closure_middleware_can_short_circuit() {
        let mut builder = PipelineBuilder::new();
        builder.push(from_fn(|ctx, _next| {
            Box::pin(async move {
                ctx.add_trace_attribute("blocked", "true");
                Err(InvocationError::Cancelled)
            })
        }));

        let def = definition(Vec::new(), &[], handler_fn(|_args| async {}));
        let ctx = context(def, Vec::new());
        ctx.begin().unwrap();

        let err = pipeline(builder).run(&ctx).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(ctx.trace_attributes(), vec![("blocked".to_owned(), "true".to_owned())]);
    }
}
