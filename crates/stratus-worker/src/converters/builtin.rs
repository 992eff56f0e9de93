//! Built-in input converters, in default chain order.

use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use stratus_proto::WireValue;

use super::{ConversionResult, ConverterContext, InputConverter};
use crate::definition::TypeShape;
use crate::handler::BoxedValue;
use crate::triggers::HttpRequestData;

fn succeeded<T: Send + 'static>(value: T) -> ConversionResult {
    ConversionResult::Succeeded(Box::new(value))
}

/// Raw bytes of a text-like source, including an HTTP body.
fn raw_content(source: &WireValue) -> Option<&[u8]> {
    match source {
        WireValue::Http(http) => Some(http.body.as_deref().unwrap_or_default()),
        other => other.as_raw(),
    }
}

fn text_content(source: &WireValue) -> Option<Result<&str, std::str::Utf8Error>> {
    match source {
        WireValue::String(s) | WireValue::Json(s) => Some(Ok(s)),
        other => raw_content(other).map(std::str::from_utf8),
    }
}

/// Passes values through when the wire shape already matches the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityConverter;

#[async_trait]
impl InputConverter for IdentityConverter {
    fn name(&self) -> &str {
        "identity"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let shape = context.parameter.ty.shape();
        if matches!(shape, TypeShape::Wire) {
            return succeeded(context.source.cloned().unwrap_or_default());
        }
        let Some(source) = context.source else {
            return ConversionResult::Unhandled;
        };

        match (shape, source) {
            (TypeShape::String, WireValue::String(s)) => succeeded(s.clone()),
            (TypeShape::Bytes, WireValue::Bytes(b)) => succeeded(b.clone()),
            (TypeShape::StringList, WireValue::CollectionString(v)) => succeeded(v.clone()),
            (TypeShape::BytesList, WireValue::CollectionBytes(v)) => succeeded(v.clone()),
            (TypeShape::DoubleList, WireValue::CollectionDouble(v)) => succeeded(v.clone()),
            (TypeShape::Int64List, WireValue::CollectionSint64(v)) => succeeded(v.clone()),
            (TypeShape::Http, WireValue::Http(http)) => {
                succeeded(HttpRequestData::from(http.clone()))
            }
            _ => ConversionResult::Unhandled,
        }
    }
}

/// Supplies the invocation context and its cancellation token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextConverter;

#[async_trait]
impl InputConverter for ContextConverter {
    fn name(&self) -> &str {
        "context"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        match context.parameter.ty.shape() {
            TypeShape::Context => succeeded(context.function_context.clone()),
            TypeShape::Cancellation => {
                succeeded(context.function_context.cancellation_token().clone())
            }
            _ => ConversionResult::Unhandled,
        }
    }
}

/// Builds `OutputBinding<T>` wrappers for output parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputBindingConverter;

#[async_trait]
impl InputConverter for OutputBindingConverter {
    fn name(&self) -> &str {
        "output-binding"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        match context.parameter.ty.shape() {
            TypeShape::Output(factory) => ConversionResult::Succeeded(factory(
                &context.parameter.name,
                context.function_context,
            )),
            _ => ConversionResult::Unhandled,
        }
    }
}

/// Shapes homogeneous collections and JSON arrays into vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionConverter;

impl CollectionConverter {
    fn json_array<T: DeserializeOwned + Send + 'static>(text: &str) -> ConversionResult {
        match serde_json::from_str::<Vec<T>>(text) {
            Ok(items) => succeeded(items),
            Err(e) => ConversionResult::Failed(format!("not a JSON array: {e}")),
        }
    }
}

#[async_trait]
impl InputConverter for CollectionConverter {
    fn name(&self) -> &str {
        "collection"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let Some(source) = context.source else {
            return ConversionResult::Unhandled;
        };

        match (context.parameter.ty.shape(), source) {
            (TypeShape::StringList, WireValue::Json(text)) => Self::json_array::<String>(text),
            (TypeShape::BytesList, WireValue::Json(text)) => Self::json_array::<Vec<u8>>(text),
            (TypeShape::DoubleList, WireValue::Json(text)) => Self::json_array::<f64>(text),
            (TypeShape::Int64List, WireValue::Json(text)) => Self::json_array::<i64>(text),

            (TypeShape::StringList, WireValue::CollectionBytes(items)) => {
                let decoded: Result<Vec<String>, _> = items
                    .iter()
                    .map(|b| String::from_utf8(b.clone()))
                    .collect();
                match decoded {
                    Ok(strings) => succeeded(strings),
                    Err(e) => ConversionResult::Failed(format!("invalid UTF-8 element: {e}")),
                }
            }
            (TypeShape::StringList, WireValue::CollectionSint64(items)) => {
                succeeded(items.iter().map(i64::to_string).collect::<Vec<_>>())
            }
            (TypeShape::StringList, WireValue::CollectionDouble(items)) => {
                succeeded(items.iter().map(f64::to_string).collect::<Vec<_>>())
            }
            (TypeShape::BytesList, WireValue::CollectionString(items)) => {
                succeeded(items.iter().map(|s| s.as_bytes().to_vec()).collect::<Vec<_>>())
            }
            (TypeShape::DoubleList, WireValue::CollectionSint64(items)) => {
                succeeded(items.iter().map(|&i| i as f64).collect::<Vec<_>>())
            }
            _ => ConversionResult::Unhandled,
        }
    }
}

/// Converts between text and bytes and parses scalars from text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimitiveConverter;

impl PrimitiveConverter {
    fn parse<T>(source: &WireValue) -> ConversionResult
    where
        T: FromStr + Send + 'static,
        T::Err: std::fmt::Display,
    {
        let text = match text_content(source) {
            Some(Ok(text)) => text,
            Some(Err(e)) => return ConversionResult::Failed(format!("invalid UTF-8: {e}")),
            None => return ConversionResult::Unhandled,
        };
        let trimmed = text.trim().trim_matches('"');
        match trimmed.parse::<T>() {
            Ok(value) => succeeded(value),
            Err(e) => ConversionResult::Failed(format!("cannot parse {trimmed:?}: {e}")),
        }
    }
}

#[async_trait]
impl InputConverter for PrimitiveConverter {
    fn name(&self) -> &str {
        "primitive"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let Some(source) = context.source else {
            return ConversionResult::Unhandled;
        };

        match context.parameter.ty.shape() {
            TypeShape::String => match text_content(source) {
                Some(Ok(text)) => succeeded(text.to_owned()),
                Some(Err(e)) => ConversionResult::Failed(format!("invalid UTF-8: {e}")),
                None => ConversionResult::Unhandled,
            },
            TypeShape::Bytes => match raw_content(source) {
                Some(bytes) => succeeded(bytes.to_vec()),
                None => ConversionResult::Unhandled,
            },
            TypeShape::Bool => Self::parse::<bool>(source),
            TypeShape::I32 => Self::parse::<i32>(source),
            TypeShape::I64 => Self::parse::<i64>(source),
            TypeShape::U32 => Self::parse::<u32>(source),
            TypeShape::U64 => Self::parse::<u64>(source),
            TypeShape::F64 => Self::parse::<f64>(source),
            _ => ConversionResult::Unhandled,
        }
    }
}

/// Deserialises structured text into `Json<T>` parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

#[async_trait]
impl InputConverter for JsonConverter {
    fn name(&self) -> &str {
        "json"
    }

    async fn convert(&self, context: &ConverterContext<'_>) -> ConversionResult {
        let TypeShape::Json(decode) = context.parameter.ty.shape() else {
            return ConversionResult::Unhandled;
        };
        let Some(source) = context.source else {
            return ConversionResult::Unhandled;
        };

        let text = match text_content(source) {
            Some(Ok(text)) => text,
            Some(Err(e)) => return ConversionResult::Failed(format!("invalid UTF-8: {e}")),
            None => return ConversionResult::Unhandled,
        };
        let decoded: Result<BoxedValue, _> = decode(text);
        match decoded {
            Ok(value) => ConversionResult::Succeeded(value),
            Err(e) => ConversionResult::Failed(format!("invalid JSON: {e}")),
        }
    }
}
