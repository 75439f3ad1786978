//! Wire messages and length-prefixed framing shared by all three roles.
//!
//! Every message on every connection is a 4-byte big-endian payload length
//! followed by exactly that many bytes of bincode-encoded payload. Partial
//! reads and writes are the norm; readers buffer until the whole message
//! has arrived. Declared lengths above [`MAX_MESSAGE_SIZE`] fail the
//! connection before any allocation happens.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single message payload. Large enough for per-frame
/// output files, small enough to bound a misbehaving peer.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Which request a message belongs to. Responses echo the discriminator of
/// the request that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Welcome,
    CopyIn,
    Execute,
    CopyOut,
}

/// A controller-to-worker request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Welcome,
    CopyIn {
        pathname: String,
        content: Vec<u8>,
    },
    Execute {
        executable: String,
        arguments: Vec<String>,
    },
    CopyOut {
        pathname: String,
    },
}

/// A worker-to-controller response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Welcome {
        hostname: String,
        core_count: u32,
        password: String,
    },
    CopyIn {
        success: bool,
    },
    Execute {
        status: i32,
    },
    CopyOut {
        success: bool,
        content: Vec<u8>,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Welcome => RequestKind::Welcome,
            Request::CopyIn { .. } => RequestKind::CopyIn,
            Request::Execute { .. } => RequestKind::Execute,
            Request::CopyOut { .. } => RequestKind::CopyOut,
        }
    }
}

impl Response {
    pub fn kind(&self) -> RequestKind {
        match self {
            Response::Welcome { .. } => RequestKind::Welcome,
            Response::CopyIn { .. } => RequestKind::CopyIn,
            Response::Execute { .. } => RequestKind::Execute,
            Response::CopyOut { .. } => RequestKind::CopyOut,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed by peer")]
    Closed,
    #[error("transport error: {0}")]
    Io(std::io::Error),
    #[error("declared payload of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    TooLarge(u32),
    #[error("malformed payload: {0}")]
    Decode(bincode::Error),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => WireError::Closed,
            _ => WireError::Io(err),
        }
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(message).map_err(WireError::Decode)?;
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::TooLarge(payload.len() as u32));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn checked_len(header: [u8; 4]) -> Result<usize, WireError> {
    let len = u32::from_be_bytes(header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(len));
    }
    Ok(len as usize)
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(payload).map_err(WireError::Decode)
}

/// Write one framed message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message, waiting for the whole payload to arrive.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = checked_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode(&payload)
}

/// Blocking twins of the framed codec, for the synchronous worker loop.
pub mod blocking {
    use std::io::{Read, Write};

    use serde::de::DeserializeOwned;
    use serde::Serialize;

    use super::{checked_len, decode, encode, WireError};

    pub fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), WireError>
    where
        W: Write,
        T: Serialize,
    {
        let frame = encode(message)?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_message<R, T>(reader: &mut R) -> Result<T, WireError>
    where
        R: Read,
        T: DeserializeOwned,
    {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header)?;
        let len = checked_len(header)?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        decode(&payload)
    }
}
