//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```no_run
//! use stratus_worker::prelude::*;
//! # fn main() {}
//! ```

// Worker setup
pub use crate::config::{WorkerArgs, WorkerOptions};
pub use crate::dispatcher::Worker;
pub use crate::error::WorkerError;
pub use crate::logging::init_tracing;
pub use crate::server::run;

// Function declarations
pub use crate::catalog::{CatalogEntry, FunctionCatalog};
pub use crate::handler::{handler_fn, sync_handler_fn, Arguments, FunctionError, Outputs};

// Binding types
pub use crate::context::FunctionContext;
pub use crate::output::{Json, OutputBinding};
pub use crate::triggers::{HttpRequestData, HttpResponseData};

// Middleware
pub use crate::error::InvocationError;
pub use crate::pipeline::{from_fn, Middleware, Next};

// Re-export CancellationToken for cancellable handlers
pub use tokio_util::sync::CancellationToken;

// Re-export serde derives for user types
pub use serde::{Deserialize, Serialize};
