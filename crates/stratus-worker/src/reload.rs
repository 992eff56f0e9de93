//! Function environment reload.
//!
//! A host that pre-starts workers (placeholder mode) later sends the real
//! environment of the function app. The variables are kept in a shared
//! [`WorkerEnvironment`]; the process environment is never mutated.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::error::WorkerError;

/// Applies an environment reload request.
#[async_trait]
pub trait EnvironmentReloader: Send + Sync {
    /// Replaces the function app environment.
    async fn reload(
        &self,
        variables: Vec<(String, String)>,
        function_app_directory: Option<PathBuf>,
    ) -> Result<(), WorkerError>;
}

#[derive(Debug, Default)]
struct EnvironmentState {
    variables: HashMap<String, String>,
    function_app_directory: Option<PathBuf>,
}

/// Environment of the function app as last reloaded by the host.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct WorkerEnvironment {
    state: Arc<RwLock<EnvironmentState>>,
}

impl WorkerEnvironment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a variable.
    pub fn get(&self, name: &str) -> Option<String> {
        self.state.read().variables.get(name).cloned()
    }

    /// Returns the function app directory, if one has been set.
    pub fn function_app_directory(&self) -> Option<PathBuf> {
        self.state.read().function_app_directory.clone()
    }

    /// Returns the number of variables.
    pub fn len(&self) -> usize {
        self.state.read().variables.len()
    }

    /// Returns true if no variables are set.
    pub fn is_empty(&self) -> bool {
        self.state.read().variables.is_empty()
    }
}

#[async_trait]
impl EnvironmentReloader for WorkerEnvironment {
    async fn reload(
        &self,
        variables: Vec<(String, String)>,
        function_app_directory: Option<PathBuf>,
    ) -> Result<(), WorkerError> {
        if let Some((_, value)) = variables.iter().find(|(name, _)| name.is_empty()) {
            return Err(WorkerError::Reload(format!(
                "variable with empty name (value length {})",
                value.len()
            )));
        }

        let mut state = self.state.write();
        state.variables = variables.into_iter().collect();
        if function_app_directory.is_some() {
            state.function_app_directory = function_app_directory;
        }
        info!(
            variables = state.variables.len(),
            directory = ?state.function_app_directory,
            "Function environment reloaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reload_replaces_variables() {
        let env = WorkerEnvironment::new();
        env.reload(vec![("A".into(), "1".into())], Some(PathBuf::from("/app")))
            .await
            .unwrap();
        env.reload(vec![("B".into(), "2".into())], None).await.unwrap();

        assert_eq!(env.get("A"), None);
        assert_eq!(env.get("B").as_deref(), Some("2"));
        assert_eq!(env.function_app_directory(), Some(PathBuf::from("/app")));
    }

    #[tokio::test]
    async fn empty_name_rejected() {
        let env = WorkerEnvironment::new();
        let err = env
            .reload(vec![(String::new(), "x".into())], None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Reload(_)));
        assert!(env.is_empty());
    }
}
