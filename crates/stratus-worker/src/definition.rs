//! Load-time function descriptions.
//!
//! A [`FunctionDefinition`] is created once when the host loads a function
//! and is read-only afterwards. Each parameter carries a [`ParameterType`]
//! describing the Rust type the handler expects, which the converter chain
//! uses to pick a conversion.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use stratus_proto::{BindingInfo, RetryOptions, WireValue, RETURN_BINDING_NAME};
use tokio_util::sync::CancellationToken;

use crate::context::FunctionContext;
use crate::handler::{BoxedValue, FunctionInvoker};
use crate::output::{IntoWireValue, Json, OutputBinding};
use crate::triggers::HttpRequestData;

/// Constructs an output binding wrapper for a named output.
pub type OutputFactory = fn(&str, &FunctionContext) -> BoxedValue;

/// Deserialises JSON text into a boxed value of the target type.
pub type JsonDecoder = fn(&str) -> Result<BoxedValue, serde_json::Error>;

/// How a parameter receives its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterRole {
    /// Bound from a named input.
    Input,
    /// Bound from the trigger input.
    Trigger,
    /// An output binding wrapper the handler writes to.
    Output,
    /// The invocation's execution context.
    Context,
}

/// The structural shape of a parameter's target type.
#[derive(Clone, Copy)]
pub enum TypeShape {
    /// `String`.
    String,
    /// `Vec<u8>`.
    Bytes,
    /// `bool`.
    Bool,
    /// `i32`.
    I32,
    /// `i64`.
    I64,
    /// `u32`.
    U32,
    /// `u64`.
    U64,
    /// `f64`.
    F64,
    /// `Vec<String>`.
    StringList,
    /// `Vec<Vec<u8>>`.
    BytesList,
    /// `Vec<f64>`.
    DoubleList,
    /// `Vec<i64>`.
    Int64List,
    /// [`HttpRequestData`].
    Http,
    /// The raw [`WireValue`].
    Wire,
    /// [`FunctionContext`].
    Context,
    /// [`CancellationToken`].
    Cancellation,
    /// [`OutputBinding<T>`].
    Output(OutputFactory),
    /// [`Json<T>`].
    Json(JsonDecoder),
    /// A type only extension converters know how to produce.
    Custom,
}

impl fmt::Debug for TypeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "String",
            Self::Bytes => "Bytes",
            Self::Bool => "Bool",
            Self::I32 => "I32",
            Self::I64 => "I64",
            Self::U32 => "U32",
            Self::U64 => "U64",
            Self::F64 => "F64",
            Self::StringList => "StringList",
            Self::BytesList => "BytesList",
            Self::DoubleList => "DoubleList",
            Self::Int64List => "Int64List",
            Self::Http => "Http",
            Self::Wire => "Wire",
            Self::Context => "Context",
            Self::Cancellation => "Cancellation",
            Self::Output(_) => "Output",
            Self::Json(_) => "Json",
            Self::Custom => "Custom",
        };
        f.write_str(name)
    }
}

/// The Rust type a parameter binds to.
#[derive(Debug, Clone, Copy)]
pub struct ParameterType {
    type_id: TypeId,
    type_name: &'static str,
    shape: TypeShape,
}

impl ParameterType {
    /// Describes `T` with the given shape.
    pub fn of<T: 'static>(shape: TypeShape) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            shape,
        }
    }

    /// Describes a type that only extension converters can produce.
    pub fn custom<T: 'static>() -> Self {
        Self::of::<T>(TypeShape::Custom)
    }

    /// Returns the type id.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns the type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the structural shape.
    pub fn shape(&self) -> TypeShape {
        self.shape
    }

    /// Checks if this describes `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

/// Types a function parameter can bind to.
pub trait BindingTarget: Send + 'static {
    /// Returns the descriptor for this type.
    fn parameter_type() -> ParameterType;
}

macro_rules! binding_target {
    ($($ty:ty => $shape:ident),* $(,)?) => {
        $(
            impl BindingTarget for $ty {
                fn parameter_type() -> ParameterType {
                    ParameterType::of::<$ty>(TypeShape::$shape)
                }
            }
        )*
    };
}

binding_target! {
    String => String,
    Vec<u8> => Bytes,
    bool => Bool,
    i32 => I32,
    i64 => I64,
    u32 => U32,
    u64 => U64,
    f64 => F64,
    Vec<String> => StringList,
    Vec<Vec<u8>> => BytesList,
    Vec<f64> => DoubleList,
    Vec<i64> => Int64List,
    HttpRequestData => Http,
    WireValue => Wire,
    FunctionContext => Context,
    CancellationToken => Cancellation,
}

impl<T> BindingTarget for OutputBinding<T>
where
    T: IntoWireValue + Send + Sync + 'static,
{
    fn parameter_type() -> ParameterType {
        ParameterType::of::<Self>(TypeShape::Output(output_factory::<T>))
    }
}

impl<T> BindingTarget for Json<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn parameter_type() -> ParameterType {
        ParameterType::of::<Self>(TypeShape::Json(json_decoder::<T>))
    }
}

fn output_factory<T>(name: &str, context: &FunctionContext) -> BoxedValue
where
    T: IntoWireValue + Send + Sync + 'static,
{
    Box::new(OutputBinding::<T>::new(name, context.clone()))
}

fn json_decoder<T>(text: &str) -> Result<BoxedValue, serde_json::Error>
where
    T: DeserializeOwned + Send + 'static,
{
    let value: T = serde_json::from_str(text)?;
    Ok(Box::new(Json(value)))
}

/// A declared handler parameter.
#[derive(Debug, Clone)]
pub struct FunctionParameter {
    /// Binding name the parameter is resolved from.
    pub name: String,
    /// Target type.
    pub ty: ParameterType,
    /// How the parameter receives its value.
    pub role: ParameterRole,
}

impl FunctionParameter {
    /// Creates a parameter with an explicit type descriptor.
    pub fn new(name: impl Into<String>, ty: ParameterType, role: ParameterRole) -> Self {
        Self {
            name: name.into(),
            ty,
            role,
        }
    }

    /// Creates a parameter bound to type `T`.
    pub fn of<T: BindingTarget>(name: impl Into<String>, role: ParameterRole) -> Self {
        Self::new(name, T::parameter_type(), role)
    }
}

/// Immutable description of a loaded function.
pub struct FunctionDefinition {
    /// Identifier the host uses in invocation requests.
    pub id: String,
    /// Function name.
    pub name: String,
    /// Entry point the function was resolved from.
    pub entry_point: String,
    /// Parameters in handler order.
    pub parameters: Vec<FunctionParameter>,
    /// Declared bindings in declaration order.
    pub bindings: Vec<(String, BindingInfo)>,
    /// Names of output bindings, in declaration order.
    pub outputs: Vec<String>,
    /// Host retry policy.
    pub retry: Option<RetryOptions>,
    /// Resolved handler.
    pub invoker: Arc<dyn FunctionInvoker>,
}

impl FunctionDefinition {
    /// Returns the declared spelling of an output. Names match
    /// case-insensitively.
    pub fn output_name(&self, name: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    /// Checks if `name` is a declared output.
    pub fn declares_output(&self, name: &str) -> bool {
        self.output_name(name).is_some()
    }

    /// Checks if the function declares an implicit return value.
    pub fn has_return_value(&self) -> bool {
        self.declares_output(RETURN_BINDING_NAME)
    }
}

impl fmt::Debug for FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entry_point", &self.entry_point)
            .field("parameters", &self.parameters)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}
