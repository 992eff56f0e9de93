//! Table of loaded functions.
//!
//! Populated only by load requests and read by every invocation, so reads
//! never take a lock shared with other functions.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::definition::FunctionDefinition;
use crate::error::WorkerError;

/// Loaded function definitions keyed by function id.
#[derive(Debug, Default)]
pub struct FunctionTable {
    functions: DashMap<String, Arc<FunctionDefinition>>,
}

impl FunctionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
        }
    }

    /// Adds a loaded function. A function id can be loaded once.
    pub fn insert(
        &self,
        definition: FunctionDefinition,
    ) -> Result<Arc<FunctionDefinition>, WorkerError> {
        use dashmap::mapref::entry::Entry;

        match self.functions.entry(definition.id.clone()) {
            Entry::Occupied(_) => {
                debug!(function_id = %definition.id, "Function already loaded");
                Err(WorkerError::DuplicateFunction(definition.id))
            }
            Entry::Vacant(entry) => {
                info!(
                    function_id = %definition.id,
                    function = %definition.name,
                    parameters = definition.parameters.len(),
                    "Function loaded"
                );
                let definition = Arc::new(definition);
                entry.insert(Arc::clone(&definition));
                Ok(definition)
            }
        }
    }

    /// Looks up a loaded function.
    pub fn get(&self, function_id: &str) -> Option<Arc<FunctionDefinition>> {
        self.functions.get(function_id).map(|r| Arc::clone(r.value()))
    }

    /// Returns the number of loaded functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if no function is loaded.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::sync_handler_fn;

    fn definition(id: &str) -> FunctionDefinition {
        FunctionDefinition {
            id: id.into(),
            name: "hello".into(),
            entry_point: "hello".into(),
            parameters: Vec::new(),
            bindings: Vec::new(),
            outputs: Vec::new(),
            retry: None,
            invoker: sync_handler_fn(|_| ()),
        }
    }

    #[test]
    fn insert_and_get() {
        let table = FunctionTable::new();
        table.insert(definition("fn-1")).unwrap();

        assert_eq!(table.get("fn-1").unwrap().name, "hello");
        assert!(table.get("fn-2").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_load_rejected() {
        let table = FunctionTable::new();
        table.insert(definition("fn-1")).unwrap();

        let err = table.insert(definition("fn-1")).unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateFunction(id) if id == "fn-1"));
        assert_eq!(table.len(), 1);
    }
}
