//! Input conversion from wire values to handler parameters.
//!
//! Each parameter is bound by walking an ordered [`ConverterChain`]. The
//! first converter that succeeds wins; one that does not recognise the
//! combination returns [`ConversionResult::Unhandled`] and the next is
//! tried.

mod builtin;

pub use builtin::{
    CollectionConverter, ContextConverter, IdentityConverter, JsonConverter,
    OutputBindingConverter, PrimitiveConverter,
};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use stratus_proto::WireValue;
use thiserror::Error;
use tracing::{debug, trace};

use crate::context::FunctionContext;
use crate::definition::FunctionParameter;
use crate::handler::BoxedValue;

/// Everything a converter may inspect for one parameter.
pub struct ConverterContext<'a> {
    /// Parameter being bound.
    pub parameter: &'a FunctionParameter,
    /// Wire value resolved for the parameter, if any.
    pub source: Option<&'a WireValue>,
    /// Context of the running invocation.
    pub function_context: &'a FunctionContext,
}

impl fmt::Debug for ConverterContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterContext")
            .field("parameter", &self.parameter.name)
            .field("source", &self.source.map(WireValue::kind))
            .finish_non_exhaustive()
    }
}

/// Outcome of a single converter.
pub enum ConversionResult {
    /// The converter does not handle this combination.
    Unhandled,
    /// The value was produced.
    Succeeded(BoxedValue),
    /// The converter recognised the combination but could not convert it.
    Failed(String),
}

impl fmt::Debug for ConversionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unhandled => f.write_str("Unhandled"),
            Self::Succeeded(_) => f.write_str("Succeeded(..)"),
            Self::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// Converts a wire value into a parameter value.
#[async_trait]
pub trait InputConverter: Send + Sync {
    /// Returns the converter's name, used for ordering and logging.
    fn name(&self) -> &str;

    /// Attempts the conversion.
    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult;
}

/// Errors produced while binding parameters.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// No converter produced a value.
    #[error(
        "cannot bind parameter '{parameter}': no converter from {wire_kind} to {target_type}{}",
        .cause.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
    )]
    NoConverter {
        parameter: String,
        target_type: &'static str,
        wire_kind: &'static str,
        cause: Option<String>,
    },

    /// The invocation carried no value for the parameter.
    #[error("cannot bind parameter '{parameter}': no input supplied for {target_type}")]
    Missing {
        parameter: String,
        target_type: &'static str,
    },

    /// A converter name used for ordering is not registered.
    #[error("no converter named '{0}'")]
    UnknownConverter(String),
}

/// A successfully bound value.
pub struct Converted {
    /// The bound value.
    pub value: BoxedValue,
    /// Name of the converter that produced it.
    pub converter: String,
}

impl fmt::Debug for Converted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converted")
            .field("converter", &self.converter)
            .finish_non_exhaustive()
    }
}

/// Ordered list of input converters.
#[derive(Clone)]
pub struct ConverterChain {
    converters: Vec<Arc<dyn InputConverter>>,
}

impl ConverterChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self {
            converters: Vec::new(),
        }
    }

    /// Creates a chain with the built-in converters in their default order.
    pub fn with_defaults() -> Self {
        let mut chain = Self::new();
        chain.push(Arc::new(IdentityConverter));
        chain.push(Arc::new(ContextConverter));
        chain.push(Arc::new(OutputBindingConverter));
        chain.push(Arc::new(CollectionConverter));
        chain.push(Arc::new(PrimitiveConverter));
        chain.push(Arc::new(JsonConverter));
        chain
    }

    /// Appends a converter.
    pub fn push(&mut self, converter: Arc<dyn InputConverter>) {
        debug!(converter = converter.name(), "Input converter registered");
        self.converters.push(converter);
    }

    /// Inserts a converter ahead of the one named `anchor`.
    pub fn insert_before(
        &mut self,
        anchor: &str,
        converter: Arc<dyn InputConverter>,
    ) -> Result<(), ConversionError> {
        let index = self
            .converters
            .iter()
            .position(|c| c.name() == anchor)
            .ok_or_else(|| ConversionError::UnknownConverter(anchor.to_owned()))?;
        debug!(converter = converter.name(), anchor, "Input converter inserted");
        self.converters.insert(index, converter);
        Ok(())
    }

    /// Returns converter names in order.
    pub fn names(&self) -> Vec<&str> {
        self.converters.iter().map(|c| c.name()).collect()
    }

    /// Runs the chain for one parameter.
    pub async fn convert(
        &self,
        context: &ConverterContext<'_>,
    ) -> Result<Converted, ConversionError> {
        let parameter = context.parameter;
        let mut failure: Option<String> = None;

        for converter in &self.converters {
            match converter.convert(context).await {
                ConversionResult::Succeeded(value) => {
                    trace!(
                        parameter = %parameter.name,
                        converter = converter.name(),
                        "Parameter bound"
                    );
                    return Ok(Converted {
                        value,
                        converter: converter.name().to_owned(),
                    });
                }
                ConversionResult::Failed(reason) => {
                    debug!(
                        parameter = %parameter.name,
                        converter = converter.name(),
                        reason = %reason,
                        "Converter failed"
                    );
                    failure.get_or_insert_with(|| format!("{}: {reason}", converter.name()));
                }
                ConversionResult::Unhandled => {}
            }
        }

        let target_type = parameter.ty.type_name();
        match context.source {
            Some(source) => Err(ConversionError::NoConverter {
                parameter: parameter.name.clone(),
                target_type,
                wire_kind: source.kind(),
                cause: failure,
            }),
            None => Err(ConversionError::Missing {
                parameter: parameter.name.clone(),
                target_type,
            }),
        }
    }
}

impl Default for ConverterChain {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for ConverterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterChain")
            .field("converters", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{context, definition};
    use crate::definition::{ParameterRole, ParameterType};

    struct Shout;

    #[async_trait]
    impl InputConverter for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
            match context.source {
                Some(WireValue::String(s)) if context.parameter.ty.is::<String>() => {
                    ConversionResult::Succeeded(Box::new(s.to_uppercase()))
                }
                _ => ConversionResult::Unhandled,
            }
        }
    }

    struct Refuse;

    #[async_trait]
    impl InputConverter for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        async fn convert(&self, _context: &ConverterContext<'_>) -> ConversionResult {
            ConversionResult::Failed("not today".into())
        }
    }

    async fn run(
        chain: &ConverterChain,
        parameter: FunctionParameter,
        source: Option<WireValue>,
    ) -> Result<Converted, ConversionError> {
        let ctx = context(definition(Vec::new(), &[]), Vec::new());
        let cx = ConverterContext {
            parameter: &parameter,
            source: source.as_ref(),
            function_context: &ctx,
        };
        chain.convert(&cx).await
    }

    #[test]
    fn default_order() {
        assert_eq!(
            ConverterChain::with_defaults().names(),
            vec!["identity", "context", "output-binding", "collection", "primitive", "json"]
        );
    }

    #[tokio::test]
    async fn string_input_bound_by_identity_alone() {
        let parameter = FunctionParameter::of::<String>("name", ParameterRole::Input);
        let converted = run(&ConverterChain::with_defaults(), parameter, Some("hello".into()))
            .await
            .unwrap();

        assert_eq!(converted.converter, "identity");
        assert_eq!(*converted.value.downcast::<String>().unwrap(), "hello");
    }

    #[tokio::test]
    async fn inserted_converter_runs_first() {
        let mut chain = ConverterChain::with_defaults();
        chain.insert_before("identity", Arc::new(Shout)).unwrap();
        assert_eq!(chain.names()[0], "shout");

        let parameter = FunctionParameter::of::<String>("name", ParameterRole::Input);
        let converted = run(&chain, parameter, Some("hello".into())).await.unwrap();
        assert_eq!(converted.converter, "shout");
        assert_eq!(*converted.value.downcast::<String>().unwrap(), "HELLO");
    }

    #[test]
    fn insert_before_unknown_anchor() {
        let mut chain = ConverterChain::with_defaults();
        let err = chain.insert_before("nope", Arc::new(Shout)).unwrap_err();
        assert!(matches!(err, ConversionError::UnknownConverter(name) if name == "nope"));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_chain_continues() {
        let mut chain = ConverterChain::new();
        chain.push(Arc::new(Refuse));
        chain.push(Arc::new(IdentityConverter));

        let parameter = FunctionParameter::of::<String>("name", ParameterRole::Input);
        let converted = run(&chain, parameter, Some("hi".into())).await.unwrap();
        assert_eq!(converted.converter, "identity");
    }

    #[tokio::test]
    async fn no_converter_names_target_and_cause() {
        struct Widget;
        let mut chain = ConverterChain::with_defaults();
        chain.push(Arc::new(Refuse));

        let parameter =
            FunctionParameter::new("w", ParameterType::custom::<Widget>(), ParameterRole::Input);
        let err = run(&chain, parameter, Some(WireValue::Bytes(vec![1]))).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("'w'"));
        assert!(message.contains("Widget"));
        assert!(message.contains("bytes"));
        assert!(message.contains("refuse: not today"));
    }

    #[tokio::test]
    async fn missing_input() {
        let parameter = FunctionParameter::of::<i64>("count", ParameterRole::Input);
        let err = run(&ConverterChain::with_defaults(), parameter, None).await.unwrap_err();
        assert!(matches!(
            err,
            ConversionError::Missing { ref parameter, .. } if parameter == "count"
        ));
    }
}
