use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::envelope::{Envelope, Meta};
use crate::protocol::error::{MeshError, Result};

/// Maximum frame payload (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// JSON codec for envelopes.
///
/// # Example
///
/// ```
/// use meshact_common::protocol::{Call, Envelope, Message, Meta};
/// use meshact_common::transport::JsonCodec;
///
/// let message = Message::parse("c:1,d:A").unwrap();
/// let envelope = Envelope::act(Meta::new("m1/a", "t1"), Call::new(message.pattern, message.args));
///
/// let encoded = JsonCodec::encode(&envelope).unwrap();
/// let decoded = JsonCodec::decode(&encoded).unwrap();
/// assert_eq!(decoded, envelope);
/// ```
pub struct JsonCodec;

impl JsonCodec {
    /// Encode an envelope to JSON bytes
    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(MeshError::from)
    }

    /// Decode an envelope from JSON bytes
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Decode`] when the payload is not JSON, lacks
    /// `meta`, `meta.id`, `meta.tx` or a body, or carries a nested value in
    /// a pattern.
    pub fn decode(data: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(data).map_err(|e| MeshError::Decode(e.to_string()))
    }

    /// Best-effort recovery of `meta` from a payload that failed to decode,
    /// so the error reply can still carry the caller's id and tx.
    pub fn salvage_meta(data: &[u8]) -> Option<Meta> {
        let value: Value = serde_json::from_slice(data).ok()?;
        serde_json::from_value(value.get("meta")?.clone()).ok()
    }
}

/// Writes one frame: `[4-byte length as u32 big-endian] + [data]`.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(MeshError::Transport(format!(
            "Message too large: {} bytes (max {} bytes)",
            data.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let len = data.len() as u32;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| map_io_error(e, "writing data"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the connection between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(map_io_error(e, "reading length prefix")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    // Validate length to prevent allocation of excessively large buffers
    if len > MAX_MESSAGE_SIZE {
        return Err(MeshError::Transport(format!(
            "Message too large: {} bytes (max {} bytes)",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading data"))?;

    Ok(Some(buf))
}

/// Map IO errors to connection errors where the link itself is gone
fn map_io_error(err: std::io::Error, context: &str) -> MeshError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => {
            MeshError::Connection(format!("{}: Connection lost", context))
        }
        _ => MeshError::Io(err),
    }
}
