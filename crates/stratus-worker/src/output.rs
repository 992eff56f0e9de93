//! Output bindings and value serialisation.
//!
//! Every value a function produces is mapped onto a [`WireValue`] by
//! type-directed rules. The mapping is total: anything that is not bytes,
//! text or a homogeneous collection becomes JSON, and a value that cannot
//! be serialised falls back to its `Debug` text.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use stratus_proto::{ParameterBinding, WireValue, RETURN_BINDING_NAME};
use tracing::debug;

use crate::context::{ContextError, FunctionContext};
use crate::definition::FunctionDefinition;
use crate::triggers::HttpResponseData;

/// Values with a wire representation.
pub trait IntoWireValue {
    /// Converts the value.
    fn into_wire_value(self) -> WireValue;
}

impl IntoWireValue for WireValue {
    fn into_wire_value(self) -> WireValue {
        self
    }
}

impl IntoWireValue for String {
    fn into_wire_value(self) -> WireValue {
        WireValue::String(self)
    }
}

impl IntoWireValue for &'static str {
    fn into_wire_value(self) -> WireValue {
        WireValue::String(self.to_owned())
    }
}

impl IntoWireValue for Vec<u8> {
    fn into_wire_value(self) -> WireValue {
        WireValue::Bytes(self)
    }
}

impl IntoWireValue for bytes::Bytes {
    fn into_wire_value(self) -> WireValue {
        WireValue::Bytes(self.to_vec())
    }
}

impl IntoWireValue for Vec<String> {
    fn into_wire_value(self) -> WireValue {
        WireValue::CollectionString(self)
    }
}

impl IntoWireValue for Vec<&'static str> {
    fn into_wire_value(self) -> WireValue {
        WireValue::CollectionString(self.into_iter().map(str::to_owned).collect())
    }
}

impl IntoWireValue for Vec<Vec<u8>> {
    fn into_wire_value(self) -> WireValue {
        WireValue::CollectionBytes(self)
    }
}

impl IntoWireValue for Vec<f64> {
    fn into_wire_value(self) -> WireValue {
        WireValue::CollectionDouble(self)
    }
}

impl IntoWireValue for Vec<i64> {
    fn into_wire_value(self) -> WireValue {
        WireValue::CollectionSint64(self)
    }
}

impl IntoWireValue for HttpResponseData {
    fn into_wire_value(self) -> WireValue {
        WireValue::Http(self.into_rpc())
    }
}

impl IntoWireValue for serde_json::Value {
    fn into_wire_value(self) -> WireValue {
        WireValue::Json(self.to_string())
    }
}

impl<T: IntoWireValue> IntoWireValue for Option<T> {
    fn into_wire_value(self) -> WireValue {
        self.map_or(WireValue::None, IntoWireValue::into_wire_value)
    }
}

macro_rules! scalar_as_json {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoWireValue for $ty {
                fn into_wire_value(self) -> WireValue {
                    Json(self).into_wire_value()
                }
            }
        )*
    };
}

scalar_as_json!(bool, i32, i64, u32, u64, f64);

/// Structured value serialised as JSON.
///
/// As an input, `Json<T>` deserialises the bound value into `T`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize + fmt::Debug> IntoWireValue for Json<T> {
    fn into_wire_value(self) -> WireValue {
        match serde_json::to_string(&self.0) {
            Ok(text) => WireValue::Json(text),
            Err(e) => {
                debug!(error = %e, "JSON serialisation failed, using debug text");
                WireValue::String(format!("{:?}", self.0))
            }
        }
    }
}

/// An output value with its concrete type erased.
pub trait OutputValue: Send + Sync {
    /// Converts the value using the built-in rules.
    fn into_wire(self: Box<Self>) -> WireValue;

    /// Returns the value for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns the concrete type name.
    fn type_name(&self) -> &'static str;
}

impl<T> OutputValue for T
where
    T: IntoWireValue + Send + Sync + 'static,
{
    fn into_wire(self: Box<Self>) -> WireValue {
        (*self).into_wire_value()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl fmt::Debug for dyn OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputValue<{}>", self.type_name())
    }
}

/// Handler-side wrapper for a declared output.
///
/// Each call to [`set`](Self::set) replaces the previous value.
pub struct OutputBinding<T> {
    name: String,
    context: FunctionContext,
    _value: PhantomData<fn(T)>,
}

impl<T> OutputBinding<T>
where
    T: IntoWireValue + Send + Sync + 'static,
{
    pub(crate) fn new(name: &str, context: FunctionContext) -> Self {
        Self {
            name: name.to_owned(),
            context,
            _value: PhantomData,
        }
    }

    /// Returns the output name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the output value. Last write wins.
    pub fn set(&self, value: T) -> Result<(), ContextError> {
        self.context.set_output(&self.name, value)
    }
}

impl<T> fmt::Debug for OutputBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBinding").field("name", &self.name).finish()
    }
}

/// Extension hook consulted before the built-in serialisation rules.
pub trait OutputSerializer: Send + Sync {
    /// Returns a name for logging.
    fn name(&self) -> &str;

    /// Serialises the value, or returns `None` to defer.
    fn serialize(&self, value: &dyn OutputValue) -> Option<WireValue>;
}

/// Serialised outputs of one invocation.
#[derive(Debug, Default, PartialEq)]
pub struct SerializedOutputs {
    /// Named outputs, in declaration order.
    pub output_data: Vec<ParameterBinding>,
    /// Implicit return value.
    pub return_value: Option<WireValue>,
}

/// Serialises produced outputs onto the wire.
#[derive(Default, Clone)]
pub struct OutputBindingRegistry {
    serializers: Vec<Arc<dyn OutputSerializer>>,
}

impl OutputBindingRegistry {
    /// Creates a registry using only the built-in rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an extension serializer.
    pub fn push(&mut self, serializer: Arc<dyn OutputSerializer>) {
        debug!(serializer = serializer.name(), "Output serializer registered");
        self.serializers.push(serializer);
    }

    /// Serialises one value.
    pub fn serialize(&self, value: Box<dyn OutputValue>) -> WireValue {
        for serializer in &self.serializers {
            if let Some(wire) = serializer.serialize(value.as_ref()) {
                return wire;
            }
        }
        value.into_wire()
    }

    /// Walks the declared outputs in declaration order and serialises
    /// every one that received a value.
    pub fn collect(
        &self,
        definition: &FunctionDefinition,
        mut produced: Vec<(String, Box<dyn OutputValue>)>,
    ) -> SerializedOutputs {
        let mut serialized = SerializedOutputs::default();

        for name in &definition.outputs {
            let Some(index) = produced
                .iter()
                .position(|(n, _)| n.eq_ignore_ascii_case(name))
            else {
                continue;
            };
            let (_, value) = produced.swap_remove(index);
            let wire = self.serialize(value);

            if name.eq_ignore_ascii_case(RETURN_BINDING_NAME) {
                serialized.return_value = Some(wire);
            } else {
                serialized.output_data.push(ParameterBinding::new(name.clone(), wire));
            }
        }

        serialized
    }
}

impl fmt::Debug for OutputBindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.serializers.iter().map(|s| s.name()).collect();
        f.debug_struct("OutputBindingRegistry")
            .field("serializers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::sync_handler_fn;
    use rstest::rstest;

    fn definition(outputs: &[&str]) -> FunctionDefinition {
        FunctionDefinition {
            id: "fn-1".into(),
            name: "test".into(),
            entry_point: "test".into(),
            parameters: Vec::new(),
            bindings: Vec::new(),
            outputs: outputs.iter().map(|s| (*s).to_owned()).collect(),
            retry: None,
            invoker: sync_handler_fn(|_| ()),
        }
    }

    #[rstest]
    #[case::bytes(Box::new(vec![1_u8, 2]), WireValue::Bytes(vec![1, 2]))]
    #[case::string(Box::new("hi".to_owned()), WireValue::String("hi".into()))]
    #[case::strings(
        Box::new(vec!["a".to_owned(), "b".to_owned()]),
        WireValue::CollectionString(vec!["a".into(), "b".into()])
    )]
    #[case::doubles(Box::new(vec![1.5_f64]), WireValue::CollectionDouble(vec![1.5]))]
    #[case::ints(Box::new(vec![3_i64, 4]), WireValue::CollectionSint64(vec![3, 4]))]
    #[case::scalar(Box::new(42_i32), WireValue::Json("42".into()))]
    #[case::none(Box::new(None::<String>), WireValue::None)]
    #[case::json(Box::new(Json(serde_json::json!({"a": 1}))), WireValue::Json(r#"{"a":1}"#.into()))]
    fn built_in_rules(#[case] value: Box<dyn OutputValue>, #[case] expected: WireValue) {
        assert_eq!(OutputBindingRegistry::new().serialize(value), expected);
    }

    #[test]
    fn unserialisable_value_falls_back_to_text() {
        use std::collections::HashMap;

        // JSON object keys must be strings.
        let mut map = HashMap::new();
        map.insert((1, 2), "x");
        let wire = OutputBindingRegistry::new().serialize(Box::new(Json(map)));

        assert!(matches!(wire, WireValue::String(text) if text.contains("(1, 2)")));
    }

    #[test]
    fn http_response_maps_to_http() {
        let wire =
            OutputBindingRegistry::new().serialize(Box::new(HttpResponseData::created("ok")));
        let WireValue::Http(http) = wire else {
            panic!("expected http value");
        };
        assert_eq!(http.status_code.as_deref(), Some("201"));
        assert_eq!(http.body.as_deref(), Some(&b"ok"[..]));
    }

    struct UpperCase;

    impl OutputSerializer for UpperCase {
        fn name(&self) -> &str {
            "upper"
        }

        fn serialize(&self, value: &dyn OutputValue) -> Option<WireValue> {
            value
                .as_any()
                .downcast_ref::<String>()
                .map(|s| WireValue::String(s.to_uppercase()))
        }
    }

    #[test]
    fn extension_serializers_run_first() {
        let mut registry = OutputBindingRegistry::new();
        registry.push(Arc::new(UpperCase));

        assert_eq!(
            registry.serialize(Box::new("abc".to_owned())),
            WireValue::String("ABC".into())
        );
        assert_eq!(
            registry.serialize(Box::new(vec![1_u8])),
            WireValue::Bytes(vec![1])
        );
    }

    #[test]
    fn collect_follows_declaration_order() {
        let definition = definition(&["second", "$return", "first"]);
        let produced: Vec<(String, Box<dyn OutputValue>)> = vec![
            ("first".into(), Box::new("1".to_owned())),
            ("$return".into(), Box::new(7_i64)),
            ("second".into(), Box::new("2".to_owned())),
        ];

        let serialized = OutputBindingRegistry::new().collect(&definition, produced);

        let names: Vec<&str> = serialized.output_data.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["second", "first"]);
        assert_eq!(serialized.return_value, Some(WireValue::Json("7".into())));
    }

    #[test]
    fn unset_outputs_are_omitted() {
        let definition = definition(&["out"]);
        let serialized = OutputBindingRegistry::new().collect(&definition, Vec::new());
        assert_eq!(serialized, SerializedOutputs::default());
    }
}
