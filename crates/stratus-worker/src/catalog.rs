//! Functions compiled into the worker.
//!
//! The catalog is built once at startup. When the host loads a function,
//! its entry point (or name) is looked up here and the matching entry is
//! turned into a [`FunctionDefinition`].
//!
//! # Example
//!
//! ```ignore
//! let catalog = FunctionCatalog::new()
//!     .with(
//!         CatalogEntry::new("greet", handler_fn(greet))
//!             .trigger::<HttpRequestData>("req", "httpTrigger")
//!             .output::<String>("queue", "queue")
//!             .returns("http"),
//!     );
//! ```

use std::fmt;
use std::sync::Arc;

use stratus_proto::{
    BindingDirection, BindingInfo, FunctionLoadRequest, RetryOptions, RpcFunctionMetadata,
    RETURN_BINDING_NAME,
};
use tracing::debug;

use crate::definition::{BindingTarget, FunctionDefinition, FunctionParameter, ParameterRole};
use crate::error::WorkerError;
use crate::handler::FunctionInvoker;
use crate::output::{IntoWireValue, OutputBinding};

/// Language reported in function metadata.
pub const LANGUAGE: &str = "rust";

/// One function known to the worker.
#[derive(Clone)]
pub struct CatalogEntry {
    name: String,
    entry_point: String,
    parameters: Vec<FunctionParameter>,
    bindings: Vec<(String, BindingInfo)>,
    retry: Option<RetryOptions>,
    invoker: Arc<dyn FunctionInvoker>,
}

impl CatalogEntry {
    /// Creates an entry whose entry point is its name.
    pub fn new(name: impl Into<String>, invoker: Arc<dyn FunctionInvoker>) -> Self {
        let name = name.into();
        Self {
            entry_point: name.clone(),
            name,
            parameters: Vec::new(),
            bindings: Vec::new(),
            retry: None,
            invoker,
        }
    }

    /// Overrides the entry point.
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Adds the trigger parameter.
    pub fn trigger<T: BindingTarget>(self, name: &str, binding_type: &str) -> Self {
        self.bound_parameter::<T>(name, binding_type, ParameterRole::Trigger, BindingDirection::In)
    }

    /// Adds an input binding parameter.
    pub fn input<T: BindingTarget>(self, name: &str, binding_type: &str) -> Self {
        self.bound_parameter::<T>(name, binding_type, ParameterRole::Input, BindingDirection::In)
    }

    /// Adds an output binding received by the handler as `OutputBinding<T>`.
    pub fn output<T>(self, name: &str, binding_type: &str) -> Self
    where
        T: IntoWireValue + Send + Sync + 'static,
    {
        self.bound_parameter::<OutputBinding<T>>(
            name,
            binding_type,
            ParameterRole::Output,
            BindingDirection::Out,
        )
    }

    /// Declares an output binding the handler fills through `Outputs`.
    pub fn output_binding(mut self, name: &str, binding_type: &str) -> Self {
        self.bindings
            .push((name.to_owned(), BindingInfo::new(binding_type, BindingDirection::Out)));
        self
    }

    /// Declares the `$return` binding receiving the handler's return value.
    pub fn returns(self, binding_type: &str) -> Self {
        self.output_binding(RETURN_BINDING_NAME, binding_type)
    }

    /// Adds a parameter supplied by the worker rather than a binding.
    pub fn context<T: BindingTarget>(mut self, name: &str) -> Self {
        self.parameters
            .push(FunctionParameter::of::<T>(name, ParameterRole::Context));
        self
    }

    /// Adds a parameter with an explicit descriptor and binding.
    pub fn parameter(mut self, parameter: FunctionParameter, binding: BindingInfo) -> Self {
        self.bindings.push((parameter.name.clone(), binding));
        self.parameters.push(parameter);
        self
    }

    /// Sets the retry policy reported to the host.
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Returns the function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the entry point.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Returns the declared bindings.
    pub fn bindings(&self) -> &[(String, BindingInfo)] {
        &self.bindings
    }

    fn bound_parameter<T: BindingTarget>(
        mut self,
        name: &str,
        binding_type: &str,
        role: ParameterRole,
        direction: BindingDirection,
    ) -> Self {
        self.bindings
            .push((name.to_owned(), BindingInfo::new(binding_type, direction)));
        self.parameters.push(FunctionParameter::of::<T>(name, role));
        self
    }

    /// Describes this entry for the host.
    pub fn to_metadata(
        &self,
        function_id: impl Into<String>,
        directory: &str,
    ) -> RpcFunctionMetadata {
        let raw_bindings = self
            .bindings
            .iter()
            .map(|(name, info)| {
                serde_json::json!({
                    "name": name,
                    "type": info.binding_type,
                    "direction": info.direction.as_str(),
                })
                .to_string()
            })
            .collect();

        RpcFunctionMetadata {
            function_id: function_id.into(),
            name: self.name.clone(),
            entry_point: self.entry_point.clone(),
            script_file: String::new(),
            directory: directory.to_owned(),
            language: LANGUAGE.to_owned(),
            bindings: self.bindings.clone(),
            raw_bindings,
            retry_options: self.retry.clone(),
            is_proxy: false,
        }
    }

    /// Builds the definition for a load request.
    ///
    /// Bindings sent by the host take precedence over the ones declared
    /// here. Every output parameter must name an output binding.
    pub fn instantiate(
        &self,
        request: &FunctionLoadRequest,
    ) -> Result<FunctionDefinition, WorkerError> {
        let metadata = &request.metadata;
        let bindings = if metadata.bindings.is_empty() {
            self.bindings.clone()
        } else {
            metadata.bindings.clone()
        };

        for parameter in &self.parameters {
            if parameter.role != ParameterRole::Output {
                continue;
            }
            let declared = bindings.iter().any(|(name, info)| {
                name.eq_ignore_ascii_case(&parameter.name) && info.direction.is_output()
            });
            if !declared {
                return Err(WorkerError::UndeclaredOutput {
                    function: self.name.clone(),
                    output: parameter.name.clone(),
                });
            }
        }

        let outputs = bindings
            .iter()
            .filter(|(_, info)| info.direction.is_output())
            .map(|(name, _)| name.clone())
            .collect();
        let name = if metadata.name.is_empty() {
            self.name.clone()
        } else {
            metadata.name.clone()
        };

        Ok(FunctionDefinition {
            id: request.function_id.clone(),
            name,
            entry_point: self.entry_point.clone(),
            parameters: self.parameters.clone(),
            bindings,
            outputs,
            retry: metadata.retry_options.clone().or_else(|| self.retry.clone()),
            invoker: Arc::clone(&self.invoker),
        })
    }
}

impl fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("name", &self.name)
            .field("entry_point", &self.entry_point)
            .field("parameters", &self.parameters)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

/// The set of functions this worker can load.
#[derive(Debug, Clone, Default)]
pub struct FunctionCatalog {
    entries: Vec<CatalogEntry>,
}

impl FunctionCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    pub fn with(mut self, entry: CatalogEntry) -> Self {
        self.register(entry);
        self
    }

    /// Adds an entry.
    pub fn register(&mut self, entry: CatalogEntry) {
        debug!(function = %entry.name, entry_point = %entry.entry_point, "Function registered");
        self.entries.push(entry);
    }

    /// Finds the entry for a load request: by entry point, then by name.
    pub fn resolve(&self, metadata: &RpcFunctionMetadata) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| !metadata.entry_point.is_empty() && e.entry_point == metadata.entry_point)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| e.name.eq_ignore_ascii_case(&metadata.name))
            })
    }

    /// Builds the definition for a load request.
    pub fn instantiate(
        &self,
        request: &FunctionLoadRequest,
    ) -> Result<FunctionDefinition, WorkerError> {
        let entry = self.resolve(&request.metadata).ok_or_else(|| {
            let reference = if request.metadata.entry_point.is_empty() {
                request.metadata.name.clone()
            } else {
                request.metadata.entry_point.clone()
            };
            WorkerError::UnknownEntryPoint(reference)
        })?;
        entry.instantiate(request)
    }

    /// Iterates over the entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::sync_handler_fn;
    use crate::triggers::HttpRequestData;

    fn greet() -> CatalogEntry {
        CatalogEntry::new("greet", sync_handler_fn(|_| ()))
            .with_entry_point("app::greet")
            .trigger::<HttpRequestData>("req", "httpTrigger")
            .output::<String>("queue", "queue")
            .returns("http")
    }

    fn load(metadata: RpcFunctionMetadata) -> FunctionLoadRequest {
        FunctionLoadRequest {
            function_id: "fn-1".into(),
            metadata,
        }
    }

    #[test]
    fn metadata_describes_bindings() {
        let metadata = greet().to_metadata("fn-1", "/app");

        assert_eq!(metadata.language, "rust");
        assert_eq!(metadata.entry_point, "app::greet");
        assert_eq!(metadata.bindings.len(), 3);
        assert!(metadata.binding("REQ").unwrap().is_trigger());
        assert!(metadata.raw_bindings[1].contains(r#""direction":"out""#));
        assert!(metadata.raw_bindings[2].contains("$return"));
    }

    #[test]
    fn resolves_by_entry_point_then_name() {
        let catalog = FunctionCatalog::new().with(greet());

        let by_entry = RpcFunctionMetadata {
            entry_point: "app::greet".into(),
            ..RpcFunctionMetadata::default()
        };
        assert!(catalog.resolve(&by_entry).is_some());

        let by_name = RpcFunctionMetadata {
            name: "Greet".into(),
            ..RpcFunctionMetadata::default()
        };
        assert!(catalog.resolve(&by_name).is_some());

        let unknown = RpcFunctionMetadata {
            entry_point: "app::other".into(),
            name: "other".into(),
            ..RpcFunctionMetadata::default()
        };
        let err = catalog.instantiate(&load(unknown)).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::UnknownEntryPoint(reference) if reference == "app::other"
        ));
    }

    #[test]
    fn instantiate_collects_outputs_in_declaration_order() {
        let catalog = FunctionCatalog::new().with(greet());
        let definition = catalog
            .instantiate(&load(greet().to_metadata("fn-1", "/app")))
            .unwrap();

        assert_eq!(definition.id, "fn-1");
        assert_eq!(definition.outputs, vec!["queue".to_owned(), "$return".to_owned()]);
        assert!(definition.has_return_value());
        assert_eq!(definition.parameters.len(), 2);
    }

    #[test]
    fn output_parameter_requires_output_binding() {
        let catalog = FunctionCatalog::new().with(greet());
        let mut metadata = greet().to_metadata("fn-1", "/app");
        metadata.bindings = vec![(
            "req".into(),
            BindingInfo::new("httpTrigger", BindingDirection::In),
        )];

        let err = catalog.instantiate(&load(metadata)).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::UndeclaredOutput { ref output, .. } if output == "queue"
        ));
    }
}
