//! Message dispatcher.
//!
//! The [`Worker`] routes each inbound envelope to its handler and tracks
//! the handshake state:
//!
//! ```text
//! Unstarted --start--> Handshaking --init--> Ready --terminate--> Closed
//! ```
//!
//! Metadata, load and invocation requests are only served once `Ready`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stratus_proto::{
    capabilities, Envelope, EnvelopeHeader, FunctionEnvironmentReloadRequest,
    FunctionEnvironmentReloadResponse, FunctionLoadRequest, FunctionLoadResponse,
    FunctionMetadataResponse, FunctionsMetadataRequest, InvocationCancel, InvocationRequest,
    InvocationResponse, RpcException, StartStream, StatusResult, WorkerInitRequest,
    WorkerInitResponse, WorkerMessage, WorkerMetadata, WorkerTerminate,
};
use tracing::{debug, info, warn};

use crate::bridge::{MessageProcessor, OutboundSender, RequestSummary};
use crate::catalog::{CatalogEntry, FunctionCatalog, LANGUAGE};
use crate::config::WorkerOptions;
use crate::converters::{ConversionError, ConverterChain, InputConverter};
use crate::error::{InvocationError, WorkerError, WORKER_SOURCE};
use crate::invocation::InvocationHandler;
use crate::logging::OutboundLogSink;
use crate::metadata::{self, FunctionMetadataProvider};
use crate::output::{OutputBindingRegistry, OutputSerializer};
use crate::pipeline::{Middleware, PipelineBuilder};
use crate::registry::FunctionTable;
use crate::reload::{EnvironmentReloader, WorkerEnvironment};
use crate::services::{ScopeFactory, ServiceProvider};

/// Version reported in the handshake.
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capabilities always advertised, overriding configured values.
const REQUIRED_CAPABILITIES: &[&str] = &[
    capabilities::RPC_HTTP_BODY_ONLY,
    capabilities::RAW_HTTP_BODY_BYTES,
    capabilities::TYPED_DATA_COLLECTION,
    capabilities::WORKER_STATUS,
    capabilities::HANDLES_WORKER_TERMINATE,
    capabilities::HANDLES_INVOCATION_CANCEL,
];

/// Handshake state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// The stream has not been opened.
    Unstarted,
    /// Start-stream sent, waiting for the init request.
    Handshaking,
    /// Serving requests.
    Ready,
    /// Terminating. Terminal.
    Closed,
}

impl WorkerState {
    /// Returns the state name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    options: WorkerOptions,
    catalog: FunctionCatalog,
    converters: ConverterChain,
    pipeline: PipelineBuilder,
    outputs: OutputBindingRegistry,
    scope_factory: Arc<dyn ScopeFactory>,
    metadata_provider: Option<Arc<dyn FunctionMetadataProvider>>,
    environment: WorkerEnvironment,
    reloader: Option<Arc<dyn EnvironmentReloader>>,
}

impl WorkerBuilder {
    fn new(options: WorkerOptions) -> Self {
        Self {
            options,
            catalog: FunctionCatalog::new(),
            converters: ConverterChain::with_defaults(),
            pipeline: PipelineBuilder::new(),
            outputs: OutputBindingRegistry::new(),
            scope_factory: Arc::new(ServiceProvider::empty()),
            metadata_provider: None,
            environment: WorkerEnvironment::new(),
            reloader: None,
        }
    }

    /// Replaces the function catalog.
    pub fn catalog(mut self, catalog: FunctionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Adds one function to the catalog.
    pub fn function(mut self, entry: CatalogEntry) -> Self {
        self.catalog.register(entry);
        self
    }

    /// Appends an input converter after the built-in ones.
    pub fn converter(mut self, converter: Arc<dyn InputConverter>) -> Self {
        self.converters.push(converter);
        self
    }

    /// Inserts an input converter ahead of the one named `anchor`.
    pub fn converter_before(
        mut self,
        anchor: &str,
        converter: Arc<dyn InputConverter>,
    ) -> Result<Self, ConversionError> {
        self.converters.insert_before(anchor, converter)?;
        Ok(self)
    }

    /// Appends middleware. Earlier registrations run first.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.pipeline.push(middleware);
        self
    }

    /// Adds an output serializer consulted before the built-in rules.
    pub fn output_serializer(mut self, serializer: Arc<dyn OutputSerializer>) -> Self {
        self.outputs.push(serializer);
        self
    }

    /// Sets the source of per-invocation service scopes.
    pub fn services(mut self, scope_factory: impl ScopeFactory + 'static) -> Self {
        self.scope_factory = Arc::new(scope_factory);
        self
    }

    /// Replaces the metadata source. Defaults to the catalog.
    pub fn metadata_provider(mut self, provider: Arc<dyn FunctionMetadataProvider>) -> Self {
        self.metadata_provider = Some(provider);
        self
    }

    /// Shares an existing function app environment with the worker. The
    /// default reload handler writes into it and every invocation context
    /// reads from it.
    pub fn environment(mut self, environment: WorkerEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Replaces the environment reload handler. Defaults to the worker's
    /// [`WorkerEnvironment`].
    pub fn reloader(mut self, reloader: Arc<dyn EnvironmentReloader>) -> Self {
        self.reloader = Some(reloader);
        self
    }

    /// Builds the worker.
    pub fn build(self) -> Worker {
        let catalog = Arc::new(self.catalog);
        let functions = Arc::new(FunctionTable::new());
        let pipeline = Arc::new(self.pipeline.build(Arc::new(self.converters)));
        let invocations = Arc::new(InvocationHandler::new(
            Arc::clone(&functions),
            pipeline,
            Arc::new(self.outputs),
            self.scope_factory,
            self.options.enable_user_code_exception,
        )
        .with_environment(self.environment.clone()));
        let metadata_provider = self
            .metadata_provider
            .unwrap_or_else(|| Arc::clone(&catalog) as Arc<dyn FunctionMetadataProvider>);
        let reloader = self
            .reloader
            .unwrap_or_else(|| Arc::new(self.environment.clone()) as Arc<dyn EnvironmentReloader>);

        info!(
            worker_id = %self.options.worker_id,
            functions = catalog.len(),
            "Worker built"
        );

        Worker {
            app_directory: Mutex::new(self.options.function_app_directory.clone()),
            options: self.options,
            state: Mutex::new(WorkerState::Unstarted),
            catalog,
            functions,
            invocations,
            metadata_provider,
            environment: self.environment,
            reloader,
        }
    }
}

impl fmt::Debug for WorkerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerBuilder")
            .field("options", &self.options)
            .field("catalog", &self.catalog.len())
            .field("converters", &self.converters.names())
            .finish_non_exhaustive()
    }
}

/// The language worker: dispatches host requests.
pub struct Worker {
    options: WorkerOptions,
    state: Mutex<WorkerState>,
    catalog: Arc<FunctionCatalog>,
    functions: Arc<FunctionTable>,
    invocations: Arc<InvocationHandler>,
    metadata_provider: Arc<dyn FunctionMetadataProvider>,
    environment: WorkerEnvironment,
    reloader: Arc<dyn EnvironmentReloader>,
    app_directory: Mutex<Option<PathBuf>>,
}

impl Worker {
    /// Starts building a worker.
    pub fn builder(options: WorkerOptions) -> WorkerBuilder {
        WorkerBuilder::new(options)
    }

    /// Returns the options the worker was built with.
    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Returns the current handshake state.
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Returns the loaded functions.
    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Returns the invocation handler.
    pub fn invocations(&self) -> &InvocationHandler {
        &self.invocations
    }

    /// Returns the function app environment.
    pub fn environment(&self) -> &WorkerEnvironment {
        &self.environment
    }

    fn ensure_ready(&self) -> Result<(), WorkerError> {
        match self.state() {
            WorkerState::Ready => Ok(()),
            state => Err(WorkerError::NotReady(state.as_str())),
        }
    }

    fn capabilities(&self) -> Vec<(String, String)> {
        let mut capabilities: BTreeMap<String, String> = self.options.capabilities.clone();
        for name in REQUIRED_CAPABILITIES {
            capabilities.insert((*name).to_owned(), "true".to_owned());
        }
        capabilities.into_iter().collect()
    }

    fn worker_metadata(&self) -> WorkerMetadata {
        let bitness = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            other => other,
        };
        WorkerMetadata {
            runtime_name: LANGUAGE.to_owned(),
            runtime_version: option_env!("CARGO_PKG_RUST_VERSION")
                .unwrap_or_default()
                .to_owned(),
            worker_version: WORKER_VERSION.to_owned(),
            worker_bitness: bitness.to_owned(),
            custom_properties: vec![("worker_id".to_owned(), self.options.worker_id.clone())],
        }
    }

    fn function_app_directory(&self, requested: &str) -> PathBuf {
        if !requested.is_empty() {
            return PathBuf::from(requested);
        }
        self.app_directory
            .lock()
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn init(&self, request: WorkerInitRequest) -> WorkerMessage {
        let result = {
            let mut state = self.state.lock();
            match *state {
                WorkerState::Handshaking | WorkerState::Ready => {
                    *state = WorkerState::Ready;
                    Ok(())
                }
                other => Err(WorkerError::NotReady(other.as_str())),
            }
        };

        match &result {
            Ok(()) => {
                if !request.function_app_directory.is_empty() {
                    *self.app_directory.lock() =
                        Some(PathBuf::from(&request.function_app_directory));
                }
                info!(
                    host_version = %request.host_version,
                    host_capabilities = request.capabilities.len(),
                    "Worker initialised"
                );
            }
            Err(e) => warn!(error = %e, "Init request rejected"),
        }

        WorkerMessage::WorkerInitResponse(WorkerInitResponse {
            worker_version: WORKER_VERSION.to_owned(),
            capabilities: self.capabilities(),
            worker_metadata: self.worker_metadata(),
            result: status(&result),
        })
    }

    async fn function_metadata(&self, request: FunctionsMetadataRequest) -> WorkerMessage {
        let result = match self.ensure_ready() {
            Ok(()) => {
                let directory = self.function_app_directory(&request.function_app_directory);
                self.metadata_provider
                    .function_metadata(&directory)
                    .await
                    .and_then(|functions| {
                        metadata::validate(&functions)?;
                        Ok(functions)
                    })
                    .map_err(WorkerError::from)
            }
            Err(e) => Err(e),
        };

        let (function_metadata, result) = match result {
            Ok(functions) => {
                info!(functions = functions.len(), "Function metadata indexed");
                (functions, StatusResult::success())
            }
            Err(e) => {
                warn!(error = %e, "Function metadata request failed");
                (Vec::new(), StatusResult::failure(e.to_rpc_exception()))
            }
        };

        WorkerMessage::FunctionMetadataResponse(FunctionMetadataResponse {
            function_metadata,
            use_default_metadata_indexing: false,
            result,
        })
    }

    fn load(&self, request: FunctionLoadRequest) -> WorkerMessage {
        let result = self
            .ensure_ready()
            .and_then(|()| self.catalog.instantiate(&request))
            .and_then(|definition| self.functions.insert(definition));

        if let Err(e) = &result {
            warn!(
                function_id = %request.function_id,
                function = %request.metadata.name,
                error = %e,
                "Function load failed"
            );
        }

        WorkerMessage::FunctionLoadResponse(FunctionLoadResponse {
            function_id: request.function_id,
            result: status(&result),
        })
    }

    async fn invoke(&self, request: InvocationRequest, outbound: OutboundSender) -> WorkerMessage {
        if let Err(e) = self.ensure_ready() {
            warn!(invocation_id = %request.invocation_id, error = %e, "Invocation rejected");
            return WorkerMessage::InvocationResponse(InvocationResponse {
                invocation_id: request.invocation_id,
                output_data: Vec::new(),
                return_value: None,
                result: StatusResult::failure(e.to_rpc_exception()),
                trace_context: request.trace_context,
                retry_context: request.retry_context,
            });
        }

        let sink = Arc::new(OutboundLogSink::new(outbound));
        WorkerMessage::InvocationResponse(self.invocations.invoke(request, sink).await)
    }

    fn cancel(&self, cancel: &InvocationCancel) {
        self.invocations.try_cancel(&cancel.invocation_id);
    }

    async fn reload(&self, request: FunctionEnvironmentReloadRequest) -> WorkerMessage {
        let directory = (!request.function_app_directory.is_empty())
            .then(|| PathBuf::from(&request.function_app_directory));
        let result = self
            .reloader
            .reload(request.environment_variables, directory.clone())
            .await;

        match &result {
            Ok(()) => {
                if let Some(directory) = directory {
                    *self.app_directory.lock() = Some(directory);
                }
            }
            Err(e) => warn!(error = %e, "Environment reload failed"),
        }

        WorkerMessage::FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse {
            worker_metadata: self.worker_metadata(),
            capabilities: self.capabilities(),
            result: status(&result),
        })
    }

    fn terminate(&self, terminate: &WorkerTerminate, outbound: OutboundSender) {
        *self.state.lock() = WorkerState::Closed;
        let grace = Duration::from_millis(terminate.grace_period_ms);
        info!(grace_period_ms = terminate.grace_period_ms, "Worker terminating");

        let invocations = Arc::clone(&self.invocations);
        tokio::spawn(async move {
            let drained = tokio::time::timeout(grace, async {
                while !invocations.cancellations().is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    in_flight = invocations.cancellations().len(),
                    "Grace period elapsed with invocations in flight"
                );
            }
            outbound.close();
        });
    }

    fn respond(header: &EnvelopeHeader, payload: WorkerMessage) -> Envelope {
        Envelope::response_to(header, payload)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.options.worker_id)
            .field("state", &self.state())
            .field("functions", &self.functions.len())
            .finish_non_exhaustive()
    }
}

fn status<T>(result: &Result<T, WorkerError>) -> StatusResult {
    match result {
        Ok(_) => StatusResult::success(),
        Err(e) => StatusResult::failure(e.to_rpc_exception()),
    }
}

#[async_trait]
impl MessageProcessor for Worker {
    fn start(&self) -> Option<Envelope> {
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Unstarted {
                *state = WorkerState::Handshaking;
            }
        }
        info!(worker_id = %self.options.worker_id, "Starting stream");
        Some(Envelope::new(
            self.options.request_id.clone(),
            WorkerMessage::StartStream(StartStream {
                worker_id: self.options.worker_id.clone(),
            }),
        ))
    }

    async fn process(&self, envelope: Envelope, outbound: OutboundSender) -> Option<Envelope> {
        let Envelope { header, payload } = envelope;
        let kind = payload.kind();
        debug!(request_id = %header.request_id, kind, "Dispatching");

        let response = match payload {
            WorkerMessage::WorkerInitRequest(request) => Some(self.init(request)),
            WorkerMessage::WorkerStatusRequest => match self.state() {
                WorkerState::Closed => None,
                _ => Some(WorkerMessage::WorkerStatusResponse),
            },
            WorkerMessage::FunctionsMetadataRequest(request) => {
                Some(self.function_metadata(request).await)
            }
            WorkerMessage::FunctionLoadRequest(request) => Some(self.load(request)),
            WorkerMessage::InvocationRequest(request) => Some(self.invoke(request, outbound).await),
            WorkerMessage::InvocationCancel(cancel) => {
                self.cancel(&cancel);
                None
            }
            WorkerMessage::FunctionEnvironmentReloadRequest(request) => {
                Some(self.reload(request).await)
            }
            WorkerMessage::WorkerTerminate(terminate) => {
                self.terminate(&terminate, outbound);
                None
            }
            WorkerMessage::StartStream(_)
            | WorkerMessage::WorkerInitResponse(_)
            | WorkerMessage::WorkerStatusResponse
            | WorkerMessage::FunctionMetadataResponse(_)
            | WorkerMessage::FunctionLoadResponse(_)
            | WorkerMessage::InvocationResponse(_)
            | WorkerMessage::FunctionEnvironmentReloadResponse(_)
            | WorkerMessage::RpcLog(_) => {
                warn!(
                    request_id = %header.request_id,
                    kind,
                    "Unexpected message from host ignored"
                );
                None
            }
        };

        response.map(|payload| Self::respond(&header, payload))
    }

    fn failure_response(&self, request: &RequestSummary, message: &str) -> Option<Envelope> {
        let exception = RpcException::new("panic", message).with_source(WORKER_SOURCE);
        let payload = match request.kind {
            "invocation_request" => WorkerMessage::InvocationResponse(InvocationResponse {
                invocation_id: request.invocation_id.clone().unwrap_or_default(),
                output_data: Vec::new(),
                return_value: None,
                result: StatusResult::failure(
                    InvocationError::Panicked(message.to_owned())
                        .to_rpc_exception(self.options.enable_user_code_exception),
                ),
                trace_context: None,
                retry_context: None,
            }),
            "function_load_request" => WorkerMessage::FunctionLoadResponse(FunctionLoadResponse {
                function_id: request.function_id.clone().unwrap_or_default(),
                result: StatusResult::failure(exception),
            }),
            "worker_init_request" => WorkerMessage::WorkerInitResponse(WorkerInitResponse {
                worker_version: WORKER_VERSION.to_owned(),
                capabilities: self.capabilities(),
                worker_metadata: self.worker_metadata(),
                result: StatusResult::failure(exception),
            }),
            "functions_metadata_request" => {
                WorkerMessage::FunctionMetadataResponse(FunctionMetadataResponse {
                    function_metadata: Vec::new(),
                    use_default_metadata_indexing: false,
                    result: StatusResult::failure(exception),
                })
            }
            "function_environment_reload_request" => {
                WorkerMessage::FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse {
                    worker_metadata: self.worker_metadata(),
                    capabilities: self.capabilities(),
                    result: StatusResult::failure(exception),
                })
            }
            _ => return None,
        };
        Some(Self::respond(&request.header, payload))
    }
}
