//! Wire protocols spoken over one connection: a line-oriented text protocol and
//! a length-prefixed binary record protocol.
//!
//! Binary frame layout:
//!
//! ```text
//! u32 big-endian header length | JSON header | raw payload (header.data_len bytes)
//! ```
//!
//! Both the server side (`read_request`, `write_reply`, `write_error`) and the
//! client side (`send_*`, `read_*`) live here so the two can never drift apart.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use kernel_relay::{FilterError, ImageRequest, ImageResponse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted line in the text protocol, newline included.
pub const MAX_LINE_BYTES: u64 = 4096;
/// Longest accepted JSON header in the binary protocol.
pub const MAX_HEADER_BYTES: u32 = 64 * 1024;
/// Default cap on a binary payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

const ERROR_PREFIX: &str = "error: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Three request lines (filter id, input path, output path), one status line back.
    Line,
    /// One request record, one response record.
    Binary,
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "line" | "text" => Ok(ProtocolKind::Line),
            "binary" | "record" => Ok(ProtocolKind::Binary),
            other => Err(format!("unknown protocol {other:?} (expected `line` or `binary`)")),
        }
    }
}

/// A request as it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRequest {
    /// Paths are on the server's filesystem.
    Line {
        filter_id: i64,
        input: PathBuf,
        output: PathBuf,
    },
    Binary(ImageRequest),
}

/// What the server sends back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireReply {
    Status(String),
    Record(ImageResponse),
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestHeader {
    name: String,
    filter_type: i64,
    data_len: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseHeader {
    name: String,
    data_len: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ProtocolKind {
    /// Reads exactly one request. Anything that does not fit the framing is an
    /// `Io(InvalidData)` error.
    pub async fn read_request<R>(&self, reader: &mut R, max_payload: usize) -> Result<WireRequest, FilterError>
    where
        R: AsyncBufRead + Unpin,
    {
        match self {
            ProtocolKind::Line => {
                let filter = read_line(reader, "filter id").await?;
                let filter_id = filter.parse::<i64>().map_err(|_| {
                    FilterError::malformed(format!("filter id must be a decimal integer, got {filter:?}"))
                })?;
                let input = PathBuf::from(read_line(reader, "input path").await?);
                let output = PathBuf::from(read_line(reader, "output path").await?);
                Ok(WireRequest::Line {
                    filter_id,
                    input,
                    output,
                })
            }
            ProtocolKind::Binary => {
                let header: RequestHeader = read_header(reader).await?;
                let data = read_payload(reader, header.data_len, max_payload).await?;
                Ok(WireRequest::Binary(ImageRequest {
                    name: header.name,
                    data,
                    filter_id: header.filter_type,
                }))
            }
        }
    }

    pub async fn write_reply<W>(&self, writer: &mut W, reply: &WireReply) -> Result<(), FilterError>
    where
        W: AsyncWrite + Unpin,
    {
        match reply {
            WireReply::Status(status) => write_line(writer, status).await,
            WireReply::Record(response) => {
                let header = ResponseHeader {
                    name: response.name.clone(),
                    data_len: response.data.len() as u64,
                    error: None,
                };
                write_record(writer, &header, &response.data).await
            }
        }
    }

    /// Best-effort error report in this protocol's framing.
    pub async fn write_error<W>(&self, writer: &mut W, name: &str, message: &str) -> Result<(), FilterError>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            ProtocolKind::Line => write_line(writer, &format!("{ERROR_PREFIX}{message}")).await,
            ProtocolKind::Binary => {
                let header = ResponseHeader {
                    name: name.to_string(),
                    data_len: 0,
                    error: Some(message.to_string()),
                };
                write_record(writer, &header, &[]).await
            }
        }
    }
}

/// Client side of the binary protocol: uploads one request record.
pub async fn send_image_request<W>(writer: &mut W, request: &ImageRequest) -> Result<(), FilterError>
where
    W: AsyncWrite + Unpin,
{
    let header = RequestHeader {
        name: request.name.clone(),
        filter_type: request.filter_id,
        data_len: request.data.len() as u64,
    };
    write_record(writer, &header, &request.data).await
}

/// Client side of the binary protocol. A server-side failure comes back as
/// `FilterError::Remote`.
pub async fn read_image_response<R>(reader: &mut R, max_payload: usize) -> Result<ImageResponse, FilterError>
where
    R: AsyncRead + Unpin,
{
    let header: ResponseHeader = read_header(reader).await?;
    let data = read_payload(reader, header.data_len, max_payload).await?;
    match header.error {
        Some(message) => Err(FilterError::Remote(message)),
        None => Ok(ImageResponse {
            name: header.name,
            data,
        }),
    }
}

/// Client side of the line protocol.
pub async fn send_line_request<W>(
    writer: &mut W,
    filter_id: i64,
    input: &Path,
    output: &Path,
) -> Result<(), FilterError>
where
    W: AsyncWrite + Unpin,
{
    let request = format!("{filter_id}\n{}\n{}\n", input.display(), output.display());
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Client side of the line protocol: the output path, or `Remote` with the
/// server's error phrase.
pub async fn read_status_line<R>(reader: &mut R) -> Result<String, FilterError>
where
    R: AsyncBufRead + Unpin,
{
    let status = read_line(reader, "status").await?;
    match status.strip_prefix(ERROR_PREFIX) {
        Some(message) => Err(FilterError::Remote(message.to_string())),
        None => Ok(status),
    }
}

async fn read_line<R>(reader: &mut R, field: &str) -> Result<String, FilterError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader).take(MAX_LINE_BYTES).read_line(&mut line).await?;
    if read == 0 {
        return Err(FilterError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("connection closed before {field}"),
        )));
    }
    if !line.ends_with('\n') {
        if read as u64 >= MAX_LINE_BYTES {
            return Err(FilterError::malformed(format!("{field} line exceeds {MAX_LINE_BYTES} bytes")));
        }
        return Err(FilterError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("connection closed in the middle of {field}"),
        )));
    }
    Ok(line.trim().to_string())
}

async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), FilterError>
where
    W: AsyncWrite + Unpin,
{
    // A newline inside the message would split one status into two.
    let line = line.replace(['\r', '\n'], " ");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_header<R, H>(reader: &mut R) -> Result<H, FilterError>
where
    R: AsyncRead + Unpin,
    H: DeserializeOwned,
{
    let length = reader.read_u32().await?;
    if length > MAX_HEADER_BYTES {
        return Err(FilterError::malformed(format!(
            "record header of {length} bytes exceeds {MAX_HEADER_BYTES}"
        )));
    }
    let mut header = vec![0u8; length as usize];
    reader.read_exact(&mut header).await?;
    serde_json::from_slice(&header).map_err(|err| FilterError::malformed(format!("invalid record header: {err}")))
}

async fn read_payload<R>(reader: &mut R, length: u64, max_payload: usize) -> Result<Vec<u8>, FilterError>
where
    R: AsyncRead + Unpin,
{
    if length > max_payload as u64 {
        return Err(FilterError::malformed(format!(
            "payload of {length} bytes exceeds the {max_payload} byte limit"
        )));
    }
    let mut data = vec![0u8; length as usize];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

async fn write_record<W, H>(writer: &mut W, header: &H, data: &[u8]) -> Result<(), FilterError>
where
    W: AsyncWrite + Unpin,
    H: Serialize,
{
    let header =
        serde_json::to_vec(header).map_err(|err| FilterError::malformed(format!("unencodable header: {err}")))?;
    let length = u32::try_from(header.len())
        .ok()
        .filter(|length| *length <= MAX_HEADER_BYTES)
        .ok_or_else(|| FilterError::malformed("record header too large"))?;
    writer.write_u32(length).await?;
    writer.write_all(&header).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
