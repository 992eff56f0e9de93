//! Language worker for the Stratus function host.
//!
//! The worker connects to the host over a framed byte stream, performs the
//! handshake, reports and loads functions compiled into the process, and
//! runs invocations through a middleware pipeline.
//!
//! # Example
//!
//! ```no_run
//! use clap::Parser;
//! use stratus_worker::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkerError> {
//!     init_tracing();
//!     let options = WorkerOptions::load(&WorkerArgs::parse())?;
//!
//!     let greet = handler_fn(|mut args| async move {
//!         let name: String = args.take(0)?;
//!         Ok::<_, FunctionError>(format!("Hello, {name}!"))
//!     });
//!     let worker = Worker::builder(options)
//!         .function(
//!             CatalogEntry::new("greet", greet)
//!                 .trigger::<String>("name", "queueTrigger")
//!                 .returns("queue"),
//!         )
//!         .build();
//!
//!     run(worker).await
//! }
//! ```

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod context;
pub mod converters;
pub mod definition;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod invocation;
pub mod logging;
pub mod metadata;
pub mod output;
pub mod pipeline;
pub mod prelude;
pub mod registry;
pub mod reload;
pub mod server;
pub mod services;
pub mod triggers;

pub use bridge::{BridgeError, MessageProcessor, OutboundSender, RequestSummary, StreamBridge};
pub use catalog::{CatalogEntry, FunctionCatalog};
pub use config::{ConfigError, WorkerArgs, WorkerOptions};
pub use context::{ContextError, ContextState, FunctionContext};
pub use converters::{
    ConversionError, ConversionResult, ConverterChain, ConverterContext, InputConverter,
};
pub use definition::{BindingTarget, FunctionDefinition, FunctionParameter, ParameterRole};
pub use dispatcher::{Worker, WorkerBuilder, WorkerState};
pub use error::{InvocationError, WorkerError};
pub use handler::{
    handler_fn, sync_handler_fn, Arguments, FunctionError, FunctionInvoker, InvocationResult,
    Outputs,
};
pub use invocation::{CancelOutcome, CancellationRegistry, InvocationHandler};
pub use logging::{init_tracing, InvocationLogger, LogSink};
pub use metadata::{FunctionMetadataProvider, JsonMetadataProvider, MetadataError};
pub use output::{IntoWireValue, Json, OutputBinding, OutputBindingRegistry, OutputSerializer};
pub use pipeline::{from_fn, Middleware, Next};
pub use registry::FunctionTable;
pub use reload::{EnvironmentReloader, WorkerEnvironment};
pub use server::{run, serve};
pub use services::{ServiceCollection, ServiceProvider, ServiceScope};
pub use triggers::{HttpRequestData, HttpResponseData};
