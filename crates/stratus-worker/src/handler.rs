//! Typed invokers for function handlers.
//!
//! Handlers are plain closures resolved once when a function is loaded.
//! Whatever a handler returns (nothing, a value, a `Result`, several named
//! outputs, synchronously or not) is normalised into one asynchronous
//! [`InvocationResult`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use stratus_proto::WireValue;

use crate::output::{IntoWireValue, Json, OutputValue};
use crate::triggers::HttpResponseData;

/// A bound parameter value, erased until the handler takes it.
pub type BoxedValue = Box<dyn Any + Send>;

/// Error returned by user code.
///
/// Any `std::error::Error` converts into this with `?`, keeping its type
/// name and message for the host.
#[derive(Debug, Clone)]
pub struct FunctionError {
    type_name: String,
    message: String,
    cancelled: bool,
}

impl FunctionError {
    /// Creates an error with an explicit type name.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            cancelled: false,
        }
    }

    /// Creates an error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("FunctionError", message)
    }

    /// Creates an error reporting that the function stopped on cancellation.
    pub fn cancelled() -> Self {
        Self {
            type_name: "Cancelled".to_owned(),
            message: "invocation cancelled".to_owned(),
            cancelled: true,
        }
    }

    /// Returns the error's type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Checks if this error reports cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl<E> From<E> for FunctionError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(short_type_name::<E>(), error.to_string())
    }
}

/// Returns the last path segment of a type name, keeping generic arguments.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    let start = base.rfind("::").map_or(0, |i| i + 2);
    full[start..].to_owned()
}

/// Bound handler arguments, in parameter order.
pub struct Arguments {
    names: Vec<String>,
    values: Vec<Option<BoxedValue>>,
}

impl Arguments {
    pub(crate) fn new(names: Vec<String>, values: Vec<BoxedValue>) -> Self {
        Self {
            names,
            values: values.into_iter().map(Some).collect(),
        }
    }

    /// Returns the number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the function takes no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Takes the argument at `index` as `T`.
    ///
    /// Each argument can be taken once.
    pub fn take<T: 'static>(&mut self, index: usize) -> Result<T, FunctionError> {
        let slot = self.values.get_mut(index).ok_or_else(|| {
            FunctionError::new("ArgumentError", format!("no argument at index {index}"))
        })?;
        let value = slot.take().ok_or_else(|| {
            FunctionError::new("ArgumentError", format!("argument {index} already taken"))
        })?;

        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => {
                *slot = Some(value);
                Err(FunctionError::new(
                    "ArgumentError",
                    format!(
                        "argument {index} is not a {}",
                        std::any::type_name::<T>()
                    ),
                ))
            }
        }
    }

    /// Takes the argument bound to parameter `name` as `T`.
    pub fn take_named<T: 'static>(&mut self, name: &str) -> Result<T, FunctionError> {
        let index = self
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                FunctionError::new("ArgumentError", format!("no argument named '{name}'"))
            })?;
        self.take(index)
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments").field("names", &self.names).finish_non_exhaustive()
    }
}

/// Normalised outcome of a handler call.
#[derive(Default)]
pub struct InvocationResult {
    /// Implicit return value.
    pub return_value: Option<Box<dyn OutputValue>>,
    /// Named outputs, applied in order.
    pub outputs: Vec<(String, Box<dyn OutputValue>)>,
}

impl InvocationResult {
    /// A result with only a return value.
    pub fn value<T: IntoWireValue + Send + Sync + 'static>(value: T) -> Self {
        Self {
            return_value: Some(Box::new(value)),
            outputs: Vec::new(),
        }
    }
}

impl fmt::Debug for InvocationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outputs: Vec<&str> = self.outputs.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("InvocationResult")
            .field("has_return_value", &self.return_value.is_some())
            .field("outputs", &outputs)
            .finish()
    }
}

/// Several named outputs returned at once.
///
/// ```ignore
/// Ok(Outputs::new()
///     .with("message", format!("Hello {name}"))
///     .with_return(HttpResponseData::ok("queued")))
/// ```
#[derive(Default)]
pub struct Outputs {
    result: InvocationResult,
}

impl Outputs {
    /// Creates an empty set of outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named output. A later value for the same name wins.
    pub fn with<T>(mut self, name: impl Into<String>, value: T) -> Self
    where
        T: IntoWireValue + Send + Sync + 'static,
    {
        self.result.outputs.push((name.into(), Box::new(value)));
        self
    }

    /// Sets the implicit return value.
    pub fn with_return<T: IntoWireValue + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.result.return_value = Some(Box::new(value));
        self
    }
}

/// Return types a handler may produce.
pub trait IntoInvocationResult {
    /// Converts the handler's return value.
    fn into_invocation_result(self) -> Result<InvocationResult, FunctionError>;
}

impl IntoInvocationResult for () {
    fn into_invocation_result(self) -> Result<InvocationResult, FunctionError> {
        Ok(InvocationResult::default())
    }
}

impl IntoInvocationResult for Outputs {
    fn into_invocation_result(self) -> Result<InvocationResult, FunctionError> {
        Ok(self.result)
    }
}

impl IntoInvocationResult for InvocationResult {
    fn into_invocation_result(self) -> Result<InvocationResult, FunctionError> {
        Ok(self)
    }
}

impl<T, E> IntoInvocationResult for Result<T, E>
where
    T: IntoInvocationResult,
    E: Into<FunctionError>,
{
    fn into_invocation_result(self) -> Result<InvocationResult, FunctionError> {
        self.map_err(Into::into)?.into_invocation_result()
    }
}

macro_rules! value_result {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoInvocationResult for $ty {
                fn into_invocation_result(self) -> Result<InvocationResult, FunctionError> {
                    Ok(InvocationResult::value(self))
                }
            }
        )*
    };
}

value_result! {
    String,
    &'static str,
    Vec<u8>,
    bytes::Bytes,
    bool,
    i32,
    i64,
    u32,
    u64,
    f64,
    Vec<String>,
    Vec<Vec<u8>>,
    Vec<f64>,
    Vec<i64>,
    WireValue,
    HttpResponseData,
    serde_json::Value,
}

impl<T> IntoInvocationResult for Option<T>
where
    T: IntoWireValue + Send + Sync + 'static,
{
    fn into_invocation_result(self) -> Result<InvocationResult, FunctionError> {
        Ok(InvocationResult::value(self))
    }
}

impl<T> IntoInvocationResult for Json<T>
where
    T: serde::Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn into_invocation_result(self) -> Result<InvocationResult, FunctionError> {
        Ok(InvocationResult::value(self))
    }
}

/// A handler resolved at load time.
pub trait FunctionInvoker: Send + Sync {
    /// Calls the handler with bound arguments.
    fn invoke(
        &self,
        args: Arguments,
    ) -> BoxFuture<'static, Result<InvocationResult, FunctionError>>;
}

struct AsyncHandler<F>(F);

impl<F, Fut, R> FunctionInvoker for AsyncHandler<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoInvocationResult + 'static,
{
    fn invoke(
        &self,
        args: Arguments,
    ) -> BoxFuture<'static, Result<InvocationResult, FunctionError>> {
        (self.0)(args).map(IntoInvocationResult::into_invocation_result).boxed()
    }
}

struct SyncHandler<F>(F);

impl<F, R> FunctionInvoker for SyncHandler<F>
where
    F: Fn(Arguments) -> R + Send + Sync + 'static,
    R: IntoInvocationResult,
{
    fn invoke(
        &self,
        args: Arguments,
    ) -> BoxFuture<'static, Result<InvocationResult, FunctionError>> {
        let result = (self.0)(args).into_invocation_result();
        futures::future::ready(result).boxed()
    }
}

/// Wraps an async closure as an invoker.
///
/// ```ignore
/// let greet = handler_fn(|mut args| async move {
///     let name: String = args.take(0)?;
///     Ok::<_, FunctionError>(format!("Hello, {name}!"))
/// });
/// ```
pub fn handler_fn<F, Fut, R>(f: F) -> Arc<dyn FunctionInvoker>
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoInvocationResult + 'static,
{
    Arc::new(AsyncHandler(f))
}

/// Wraps a synchronous closure as an invoker.
pub fn sync_handler_fn<F, R>(f: F) -> Arc<dyn FunctionInvoker>
where
    F: Fn(Arguments) -> R + Send + Sync + 'static,
    R: IntoInvocationResult + 'static,
{
    Arc::new(SyncHandler(f))
}
