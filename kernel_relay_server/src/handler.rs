// THEORY:
// A `ConnectionHandler` owns exactly one request/response exchange per
// connection. It walks a fixed sequence of stages:
//
//   AwaitRequest -> DecodeRequest -> ApplyFilter -> EncodeResponse -> SendResponse -> Closed
//
// and any failure jumps straight to the error exit, which reports the failure
// to the peer (best effort) in the protocol's framing and closes.
//
// The CPU-bound filter call runs on tokio's blocking pool through
// `supervised`. That is the single supervisory boundary of the service: a panic
// in the filter (including one raised inside a rayon partition) is caught
// there and becomes `FilterError::InternalFault` for this request only.

use std::any::Any;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kernel_relay::{FilterError, FilterPipeline, ImageFormat, ImageRequest, ImageResponse, OutputFormat};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::protocol::{ProtocolKind, WireReply, WireRequest};
use crate::sequence::RequestSequence;

/// How long a rejected peer gets to finish sending before the socket closes.
const REJECT_LINGER: Duration = Duration::from_secs(1);
/// Sent to a connection turned away because the job queue is full.
pub const BUSY_MESSAGE: &str = "server busy: job queue is full";
/// Sent to a connection still waiting for a queue slot when shutdown begins.
pub const SHUTTING_DOWN_MESSAGE: &str = "server shutting down";

/// Where a connection currently is in its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitRequest,
    DecodeRequest,
    ApplyFilter,
    EncodeResponse,
    SendResponse,
    Closed,
}

/// Where a finished response goes.
enum Destination {
    /// Back over the socket as a binary record.
    Reply,
    /// Into a file on the server; the peer only gets the path.
    File(PathBuf),
}

#[derive(Debug)]
struct Progress {
    stage: Stage,
    name: String,
}

pub struct ConnectionHandler {
    protocol: ProtocolKind,
    pipeline: Arc<FilterPipeline>,
    sequence: Arc<RequestSequence>,
    max_payload_bytes: usize,
}

impl ConnectionHandler {
    pub fn new(
        protocol: ProtocolKind,
        pipeline: Arc<FilterPipeline>,
        sequence: Arc<RequestSequence>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            protocol,
            pipeline,
            sequence,
            max_payload_bytes,
        }
    }

    /// Serves one connection to completion. Never returns an error: failures
    /// are reported to the peer and logged.
    pub async fn handle<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request_id = self.sequence.next_id();
        let span = info_span!("connection", request_id, %peer);
        self.serve(stream).instrument(span).await
    }

    /// Answers a connection that will never be served with `reason`, then
    /// closes it.
    pub async fn reject<S>(&self, stream: S, peer: SocketAddr, reason: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        if let Err(err) = self.protocol.write_error(&mut writer, "", reason).await {
            debug!(%peer, error = %err, "could not deliver rejection");
            return;
        }
        let _ = writer.shutdown().await;

        // Closing with unread request bytes would reset the connection before
        // the peer reads the notice.
        let mut sink = [0u8; 4096];
        let _ = tokio::time::timeout(REJECT_LINGER, async {
            while let Ok(read) = reader.read(&mut sink).await {
                if read == 0 {
                    break;
                }
            }
        })
        .await;
        debug!(%peer, "rejected connection closed");
    }

    async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut progress = Progress {
            stage: Stage::AwaitRequest,
            name: String::new(),
        };

        match self.exchange(&mut reader, &mut writer, &mut progress).await {
            Ok(()) => info!(name = %progress.name, "response sent"),
            Err(err) => {
                warn!(stage = ?progress.stage, name = %progress.name, error = %err, "request failed");
                // A failed send means the peer is gone; nothing left to tell it.
                if progress.stage != Stage::SendResponse {
                    if let Err(report_err) = self
                        .protocol
                        .write_error(&mut writer, &progress.name, &err.to_string())
                        .await
                    {
                        debug!(error = %report_err, "could not deliver error report");
                    }
                }
            }
        }

        progress.stage = Stage::Closed;
        let _ = writer.shutdown().await;
        debug!(stage = ?progress.stage, "connection closed");
    }

    async fn exchange<R, W>(&self, reader: &mut R, writer: &mut W, progress: &mut Progress) -> Result<(), FilterError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request = self.protocol.read_request(reader, self.max_payload_bytes).await?;

        progress.stage = Stage::DecodeRequest;
        let (request, destination, output) = prepare(request).await?;
        progress.name = request.name.clone();
        debug!(name = %request.name, filter = request.filter_id, bytes = request.data.len(), "request received");

        progress.stage = Stage::ApplyFilter;
        let pipeline = Arc::clone(&self.pipeline);
        let filtered = supervised(move || pipeline.filter(&request)).await?;

        progress.stage = Stage::EncodeResponse;
        let pipeline = Arc::clone(&self.pipeline);
        let response = supervised(move || pipeline.encode(filtered, output)).await?;
        let reply = deliver(response, destination).await?;

        progress.stage = Stage::SendResponse;
        self.protocol.write_reply(writer, &reply).await
    }
}

/// Turns a wire request into a pipeline request. The line protocol reads its
/// input from the server's filesystem here.
async fn prepare(request: WireRequest) -> Result<(ImageRequest, Destination, OutputFormat), FilterError> {
    match request {
        WireRequest::Binary(request) => Ok((request, Destination::Reply, OutputFormat::SameAsInput)),
        WireRequest::Line {
            filter_id,
            input,
            output,
        } => {
            // Unknown output extensions fail before any work is done.
            let format = ImageFormat::from_path(&output)?;
            let data = tokio::fs::read(&input)
                .await
                .map_err(|err| FilterError::io_context(input.display(), err))?;
            let name = input
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| input.display().to_string());
            let request = ImageRequest { name, data, filter_id };
            Ok((request, Destination::File(output), OutputFormat::Exactly(format)))
        }
    }
}

async fn deliver(response: ImageResponse, destination: Destination) -> Result<WireReply, FilterError> {
    match destination {
        Destination::Reply => Ok(WireReply::Record(response)),
        Destination::File(path) => {
            tokio::fs::write(&path, &response.data)
                .await
                .map_err(|err| FilterError::io_context(path.display(), err))?;
            Ok(WireReply::Status(path.display().to_string()))
        }
    }
}

/// Runs a CPU-bound job on the blocking pool. A panic inside the job becomes
/// `InternalFault` instead of unwinding into the caller.
pub async fn supervised<F, T>(job: F) -> Result<T, FilterError>
where
    F: FnOnce() -> Result<T, FilterError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(FilterError::InternalFault(panic_message(err.into_panic()))),
        Err(_) => Err(FilterError::InternalFault("filter task was cancelled".into())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "filter panicked".to_string()
    }
}
