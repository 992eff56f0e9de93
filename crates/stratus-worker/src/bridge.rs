//! Stream bridge between the host transport and the worker.
//!
//! The bridge owns two unbounded queues. A read loop moves envelopes from
//! the transport onto the inbound queue, a dispatch loop hands each inbound
//! envelope to its own task, and a write loop drains the outbound queue
//! onto the transport one envelope at a time.
//!
//! ```text
//! transport ──read──▶ inbound ──dispatch──▶ processor ──▶ outbound ──write──▶ transport
//! ```
//!
//! A read or write failure is fatal and is returned from [`StreamBridge::run`].
//! A panic while processing one envelope is contained to that envelope.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use stratus_proto::{Envelope, EnvelopeHeader, WorkerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::panic_message;

/// Errors raised by the stream bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The bridge has shut down.
    #[error("stream bridge is closed")]
    Closed,

    /// Reading from the transport failed.
    #[error("failed to read from host stream: {0}")]
    Read(String),

    /// Writing to the transport failed.
    #[error("failed to write to host stream: {0}")]
    Write(String),

    /// A bridge task ended abnormally.
    #[error("bridge task failed: {0}")]
    Join(String),
}

/// Handle for enqueueing envelopes to the host.
///
/// Cheap to clone. Sending never blocks.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
}

impl OutboundSender {
    pub(crate) fn channel(
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, shutdown }, rx)
    }

    /// Enqueues an envelope for the write loop.
    pub fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Closed);
        }
        self.tx.send(envelope).map_err(|_| BridgeError::Closed)
    }

    /// Shuts the bridge down. Envelopes already queued are still written.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Checks if the bridge has shut down.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// What is known about a request before it is processed.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    /// Header of the request envelope.
    pub header: EnvelopeHeader,
    /// Payload kind.
    pub kind: &'static str,
    /// Invocation id, for invocation requests.
    pub invocation_id: Option<String>,
    /// Function id, for requests naming a function.
    pub function_id: Option<String>,
}

impl RequestSummary {
    /// Summarises an envelope.
    pub fn of(envelope: &Envelope) -> Self {
        let (invocation_id, function_id) = match &envelope.payload {
            WorkerMessage::InvocationRequest(request) => (
                Some(request.invocation_id.clone()),
                Some(request.function_id.clone()),
            ),
            WorkerMessage::FunctionLoadRequest(request) => {
                (None, Some(request.function_id.clone()))
            }
            WorkerMessage::InvocationCancel(cancel) => (Some(cancel.invocation_id.clone()), None),
            _ => (None, None),
        };
        Self {
            header: envelope.header.clone(),
            kind: envelope.payload.kind(),
            invocation_id,
            function_id,
        }
    }
}

/// Handles envelopes received from the host.
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    /// Returns the envelope written before any other, if any.
    fn start(&self) -> Option<Envelope>;

    /// Processes one envelope and returns the response, if one is due.
    async fn process(&self, envelope: Envelope, outbound: OutboundSender) -> Option<Envelope>;

    /// Builds the response for a request whose processing panicked.
    fn failure_response(&self, request: &RequestSummary, message: &str) -> Option<Envelope>;
}

/// Connects a [`MessageProcessor`] to a host transport.
pub struct StreamBridge<P> {
    processor: Arc<P>,
    shutdown: CancellationToken,
}

impl<P: MessageProcessor> StreamBridge<P> {
    /// Creates a bridge for the given processor.
    pub fn new(processor: Arc<P>) -> Self {
        Self {
            processor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the processor.
    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    /// Returns a token that shuts the bridge down when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until the host closes the stream, the bridge is shut down, or
    /// the transport fails.
    pub async fn run<R, W, RE, WE>(self, reader: R, writer: W) -> Result<(), BridgeError>
    where
        R: Stream<Item = Result<Envelope, RE>> + Unpin + Send + 'static,
        RE: fmt::Display + Send + 'static,
        W: Sink<Envelope, Error = WE> + Unpin,
        WE: fmt::Display,
    {
        let (outbound, outbound_rx) = OutboundSender::channel(self.shutdown.clone());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        if let Some(start) = self.processor.start() {
            outbound.send(start)?;
        }

        let read_task = tokio::spawn(read_loop(reader, inbound_tx, self.shutdown.clone()));
        let dispatch_task = tokio::spawn(dispatch_loop(
            Arc::clone(&self.processor),
            inbound_rx,
            outbound.clone(),
        ));

        info!("Stream bridge started");
        let write_result = write_loop(writer, outbound_rx, &self.shutdown).await;
        self.shutdown.cancel();

        let read_result = match read_task.await {
            Ok(result) => result,
            Err(e) => Err(BridgeError::Join(e.to_string())),
        };
        if let Err(e) = dispatch_task.await {
            warn!(error = %e, "Dispatch loop ended abnormally");
        }

        info!("Stream bridge stopped");
        write_result.and(read_result)
    }
}

impl<P> fmt::Debug for StreamBridge<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBridge")
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn read_loop<R, RE>(
    mut reader: R,
    inbound: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
) -> Result<(), BridgeError>
where
    R: Stream<Item = Result<Envelope, RE>> + Unpin,
    RE: fmt::Display,
{
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                debug!("Read loop stopping");
                return Ok(());
            }

            next = reader.next() => match next {
                Some(Ok(envelope)) => {
                    debug!(
                        request_id = %envelope.request_id(),
                        kind = envelope.payload.kind(),
                        "Envelope received"
                    );
                    if inbound.send(envelope).is_err() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Failed to read from host stream");
                    shutdown.cancel();
                    return Err(BridgeError::Read(e.to_string()));
                }
                None => {
                    info!("Host closed the stream");
                    shutdown.cancel();
                    return Ok(());
                }
            }
        }
    }
}

async fn dispatch_loop<P: MessageProcessor>(
    processor: Arc<P>,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    outbound: OutboundSender,
) {
    while let Some(envelope) = inbound.recv().await {
        tokio::spawn(dispatch(Arc::clone(&processor), envelope, outbound.clone()));
    }
}

async fn dispatch<P: MessageProcessor>(
    processor: Arc<P>,
    envelope: Envelope,
    outbound: OutboundSender,
) {
    let summary = RequestSummary::of(&envelope);

    let outcome = AssertUnwindSafe(processor.process(envelope, outbound.clone()))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                request_id = %summary.header.request_id,
                kind = summary.kind,
                panic = %message,
                "Panic while processing envelope"
            );
            processor.failure_response(&summary, &message)
        }
    };

    if let Some(response) = response {
        if let Err(e) = outbound.send(response) {
            debug!(
                request_id = %summary.header.request_id,
                kind = summary.kind,
                error = %e,
                "Response dropped"
            );
        }
    }
}

async fn write_loop<W, WE>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    shutdown: &CancellationToken,
) -> Result<(), BridgeError>
where
    W: Sink<Envelope, Error = WE> + Unpin,
    WE: fmt::Display,
{
    let result = loop {
        tokio::select! {
            biased;

            next = outbound.recv() => match next {
                Some(envelope) => {
                    if let Err(e) = write_one(&mut writer, envelope).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },

            () = shutdown.cancelled() => {
                let mut drained = Ok(());
                while let Ok(envelope) = outbound.try_recv() {
                    if let Err(e) = write_one(&mut writer, envelope).await {
                        drained = Err(e);
                        break;
                    }
                }
                break drained;
            }
        }
    };

    if result.is_err() {
        shutdown.cancel();
    } else if let Err(e) = writer.close().await {
        debug!(error = %e, "Failed to close host stream");
    }
    result
}

async fn write_one<W, WE>(writer: &mut W, envelope: Envelope) -> Result<(), BridgeError>
where
    W: Sink<Envelope, Error = WE> + Unpin,
    WE: fmt::Display,
{
    let request_id = envelope.header.request_id.clone();
    let kind = envelope.payload.kind();
    match writer.send(envelope).await {
        Ok(()) => {
            debug!(request_id = %request_id, kind, "Envelope written");
            Ok(())
        }
        Err(e) => {
            error!(request_id = %request_id, kind, error = %e, "Failed to write to host stream");
            Err(BridgeError::Write(e.to_string()))
        }
    }
}
