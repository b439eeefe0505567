use crate::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame body. Requests and replies are JSON and a
/// legitimate body never comes close; anything larger is a broken or hostile
/// peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One remote call. `param_types` carries the declared parameter type
/// descriptors in declaration order so the receiver can check the signature
/// before touching `params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub param_types: Vec<String>,
    pub params: Value,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: RpcResult,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResult {
    Ok(Value),
    Fault(RpcFault),
}

/// Error object carried in a reply. `kind` is a stable tag understood by
/// both peers; `message` is human-readable context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub kind: String,
    pub message: String,
}

impl RpcFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Reads one length-prefixed frame: 4-byte big-endian body length, then the
/// body bytes.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body =
        serde_json::to_vec(message).map_err(|e| RpcError::DecodeError(e.to_string()))?;
    write_frame(writer, &body).await
}

pub async fn read_message<R, T>(reader: &mut R) -> Result<T, RpcError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let body = read_frame(reader).await?;
    serde_json::from_slice(&body).map_err(|e| RpcError::DecodeError(e.to_string()))
}
