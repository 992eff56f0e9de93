//! Connection to the host.
//!
//! The worker dials the host, frames the stream with [`EnvelopeCodec`] and
//! runs a [`StreamBridge`] until the host closes the stream, sends a
//! terminate request, or the process receives Ctrl+C.
//!
//! # Example
//!
//! ```no_run
//! use clap::Parser;
//! use stratus_worker::{init_tracing, run, Worker, WorkerArgs, WorkerOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), stratus_worker::WorkerError> {
//!     init_tracing();
//!     let options = WorkerOptions::load(&WorkerArgs::parse())?;
//!     run(Worker::builder(options).build()).await
//! }
//! ```

use std::sync::Arc;

use stratus_proto::EnvelopeCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::StreamBridge;
use crate::dispatcher::Worker;
use crate::error::WorkerError;

/// Runs the worker over an already open byte stream.
pub async fn serve<IO>(io: IO, worker: Arc<Worker>) -> Result<(), WorkerError>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let bridge = StreamBridge::new(worker);
    serve_bridge(io, bridge).await
}

/// Connects to the host named in the worker's options and serves it.
pub async fn run(worker: Worker) -> Result<(), WorkerError> {
    let addr = worker.options().address();
    info!(addr = %addr, worker_id = %worker.options().worker_id, "Connecting to host");

    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| WorkerError::Connect {
            addr: addr.clone(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to disable Nagle's algorithm");
    }

    let bridge = StreamBridge::new(Arc::new(worker));
    let signal = spawn_signal_handler(bridge.shutdown_token());
    let result = serve_bridge(stream, bridge).await;
    signal.abort();

    info!("Worker stopped");
    result
}

async fn serve_bridge<IO>(io: IO, bridge: StreamBridge<Worker>) -> Result<(), WorkerError>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_message_length = bridge.processor().options().max_message_length;
    let (read_half, write_half) = tokio::io::split(io);
    let reader = FramedRead::new(
        read_half,
        EnvelopeCodec::with_max_message_size(max_message_length),
    );
    let writer = FramedWrite::new(
        write_half,
        EnvelopeCodec::with_max_message_size(max_message_length),
    );

    bridge.run(reader, writer).await?;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("Shutdown signal received");
                    shutdown.cancel();
                }
                Err(e) => debug!(error = %e, "Failed to install Ctrl+C handler"),
            }
        }
    })
}
