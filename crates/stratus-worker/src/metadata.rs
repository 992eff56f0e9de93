//! Function metadata discovery.
//!
//! The host asks the worker which functions exist before loading them.
//! Metadata comes either from the compiled-in [`FunctionCatalog`] or from a
//! `functions.metadata` file in the function app directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use stratus_proto::{
    BindingDirection, BindingInfo, RetryOptions, RetryStrategy, RpcFunctionMetadata,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{FunctionCatalog, LANGUAGE};

/// File name read by [`JsonMetadataProvider`].
pub const METADATA_FILE_NAME: &str = "functions.metadata";

/// Errors produced while gathering function metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The metadata file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The metadata file is not valid.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A binding direction is not one of `in`, `out` or `inout`.
    #[error("function '{function}' binding '{binding}' has invalid direction '{direction}'")]
    InvalidDirection {
        function: String,
        binding: String,
        direction: String,
    },

    /// A function declares no bindings.
    #[error("function '{0}' declares no bindings")]
    MissingBindings(String),
}

/// Source of function metadata.
#[async_trait]
pub trait FunctionMetadataProvider: Send + Sync {
    /// Returns metadata for every function in the app directory.
    async fn function_metadata(
        &self,
        function_app_directory: &Path,
    ) -> Result<Vec<RpcFunctionMetadata>, MetadataError>;
}

#[async_trait]
impl FunctionMetadataProvider for FunctionCatalog {
    async fn function_metadata(
        &self,
        function_app_directory: &Path,
    ) -> Result<Vec<RpcFunctionMetadata>, MetadataError> {
        let directory = function_app_directory.to_string_lossy();
        Ok(self
            .iter()
            .map(|entry| entry.to_metadata(ulid::Ulid::new().to_string(), &directory))
            .collect())
    }
}

/// Checks that every function declares at least one binding.
pub fn validate(functions: &[RpcFunctionMetadata]) -> Result<(), MetadataError> {
    match functions.iter().find(|f| f.bindings.is_empty()) {
        Some(function) => Err(MetadataError::MissingBindings(function.name.clone())),
        None => Ok(()),
    }
}

/// Reads function metadata from `functions.metadata`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMetadataProvider;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionEntry {
    name: String,
    #[serde(default)]
    entry_point: Option<String>,
    #[serde(default)]
    script_file: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    bindings: Vec<BindingEntry>,
    #[serde(default)]
    retry: Option<RetryEntry>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct BindingEntry {
    name: String,
    #[serde(rename = "type")]
    binding_type: String,
    direction: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "strategy")]
enum RetryEntry {
    #[serde(rename_all = "camelCase")]
    FixedDelay {
        max_retry_count: i32,
        delay_interval_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    ExponentialBackoff {
        max_retry_count: i32,
        minimum_interval_ms: u64,
        maximum_interval_ms: u64,
    },
}

impl From<RetryEntry> for RetryOptions {
    fn from(entry: RetryEntry) -> Self {
        match entry {
            RetryEntry::FixedDelay {
                max_retry_count,
                delay_interval_ms,
            } => Self {
                max_retry_count,
                strategy: RetryStrategy::FixedDelay {
                    delay_ms: delay_interval_ms,
                },
            },
            RetryEntry::ExponentialBackoff {
                max_retry_count,
                minimum_interval_ms,
                maximum_interval_ms,
            } => Self {
                max_retry_count,
                strategy: RetryStrategy::ExponentialBackoff {
                    minimum_interval_ms,
                    maximum_interval_ms,
                },
            },
        }
    }
}

fn parse_direction(
    function: &str,
    binding: &BindingEntry,
) -> Result<BindingDirection, MetadataError> {
    match binding.direction.to_ascii_lowercase().as_str() {
        "in" => Ok(BindingDirection::In),
        "out" => Ok(BindingDirection::Out),
        "inout" => Ok(BindingDirection::InOut),
        _ => Err(MetadataError::InvalidDirection {
            function: function.to_owned(),
            binding: binding.name.clone(),
            direction: binding.direction.clone(),
        }),
    }
}

impl FunctionEntry {
    fn into_metadata(self, directory: &str) -> Result<RpcFunctionMetadata, MetadataError> {
        let mut bindings = Vec::with_capacity(self.bindings.len());
        let mut raw_bindings = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            let direction = parse_direction(&self.name, binding)?;
            bindings.push((
                binding.name.clone(),
                BindingInfo::new(binding.binding_type.clone(), direction),
            ));
            raw_bindings.push(serde_json::to_string(binding).unwrap_or_default());
        }

        Ok(RpcFunctionMetadata {
            function_id: ulid::Ulid::new().to_string(),
            entry_point: self.entry_point.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            script_file: self.script_file,
            directory: directory.to_owned(),
            language: self.language.unwrap_or_else(|| LANGUAGE.to_owned()),
            bindings,
            raw_bindings,
            retry_options: self.retry.map(RetryOptions::from),
            is_proxy: false,
        })
    }
}

#[async_trait]
impl FunctionMetadataProvider for JsonMetadataProvider {
    async fn function_metadata(
        &self,
        function_app_directory: &Path,
    ) -> Result<Vec<RpcFunctionMetadata>, MetadataError> {
        let path = function_app_directory.join(METADATA_FILE_NAME);
        debug!(path = %path.display(), "Reading function metadata");

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| MetadataError::Io {
                path: path.clone(),
                source,
            })?;
        let entries: Vec<FunctionEntry> =
            serde_json::from_str(&text).map_err(|source| MetadataError::Parse {
                path: path.clone(),
                source,
            })?;

        let directory = function_app_directory.to_string_lossy();
        let functions = entries
            .into_iter()
            .map(|entry| entry.into_metadata(&directory))
            .collect::<Result<Vec<_>, _>>()?;

        info!(path = %path.display(), functions = functions.len(), "Function metadata read");
        Ok(functions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::handler::sync_handler_fn;

    const METADATA: &str = r#"[
        {
            "name": "greet",
            "entryPoint": "app::greet",
            "scriptFile": "app",
            "bindings": [
                { "name": "req", "type": "httpTrigger", "direction": "in" },
                { "name": "$return", "type": "http", "direction": "Out" }
            ],
            "retry": { "strategy": "fixedDelay", "maxRetryCount": 3, "delayIntervalMs": 500 }
        },
        {
            "name": "tick",
            "bindings": [{ "name": "timer", "type": "timerTrigger", "direction": "in" }]
        }
    ]"#;

    fn write_metadata(contents: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE_NAME), contents).unwrap();
        dir
    }

    #[tokio::test]
    async fn reads_metadata_file() {
        let dir = write_metadata(METADATA);
        let functions = JsonMetadataProvider
            .function_metadata(dir.path())
            .await
            .unwrap();

        assert_eq!(functions.len(), 2);
        let greet = &functions[0];
        assert_eq!(greet.entry_point, "app::greet");
        assert_eq!(greet.language, "rust");
        assert_eq!(greet.binding("$return").unwrap().direction, BindingDirection::Out);
        assert_eq!(greet.raw_bindings.len(), 2);
        assert_eq!(
            greet.retry_options,
            Some(RetryOptions {
                max_retry_count: 3,
                strategy: RetryStrategy::FixedDelay { delay_ms: 500 },
            })
        );

        assert_eq!(functions[1].entry_point, "tick");
        assert_ne!(functions[0].function_id, functions[1].function_id);
        validate(&functions).unwrap();
    }

    #[tokio::test]
    async fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonMetadataProvider
            .function_metadata(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Io { .. }));
    }

    #[tokio::test]
    async fn invalid_direction() {
        let dir = write_metadata(
            r#"[{
                "name": "f",
                "bindings": [{ "name": "x", "type": "queue", "direction": "sideways" }]
            }]"#,
        );
        let err = JsonMetadataProvider
            .function_metadata(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MetadataError::InvalidDirection { ref direction, .. } if direction == "sideways"
        ));
    }

    #[tokio::test]
    async fn malformed_file() {
        let dir = write_metadata("{ not json");
        let err = JsonMetadataProvider
            .function_metadata(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Parse { .. }));
    }

    #[tokio::test]
    async fn catalog_metadata_and_validation() {
        let catalog = FunctionCatalog::new()
            .with(CatalogEntry::new("bare", sync_handler_fn(|_| ())));
        let functions = catalog
            .function_metadata(Path::new("/app"))
            .await
            .unwrap();

        assert_eq!(functions[0].directory, "/app");
        let err = validate(&functions).unwrap_err();
        assert!(matches!(err, MetadataError::MissingBindings(name) if name == "bare"));
    }
}
