//! Length-prefixed framing for the socket transport family.
//!
//! ```text
//! [u32 BE length][u8 kind][u8 id length][marshaller id][body]
//! ```
//!
//! `length` counts every byte after the prefix. Frames larger than
//! [`MAX_MESSAGE_SIZE`] or cut short by EOF are framing violations; the
//! connection carrying them must be closed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::marshal::{Marshaller, MarshallerRegistry};
use crate::protocol::error::{Result, RinvokeError};
use crate::protocol::{InvocationRequest, InvocationResponse};

/// Maximum frame size (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Request => KIND_REQUEST,
            FrameKind::Response => KIND_RESPONSE,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            KIND_REQUEST => Ok(FrameKind::Request),
            KIND_RESPONSE => Ok(FrameKind::Response),
            other => Err(RinvokeError::Framing(format!("unknown frame kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Id of the marshaller that produced `body`.
    pub marshaller: String,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn request(marshaller: &dyn Marshaller, request: &InvocationRequest) -> Result<Self> {
        Ok(Frame {
            kind: FrameKind::Request,
            marshaller: marshaller.id().to_string(),
            body: marshaller.encode_request(request)?,
        })
    }

    pub fn response(marshaller: &dyn Marshaller, response: &InvocationResponse) -> Result<Self> {
        Ok(Frame {
            kind: FrameKind::Response,
            marshaller: marshaller.id().to_string(),
            body: marshaller.encode_response(response)?,
        })
    }

    pub fn decode_request(&self, registry: &MarshallerRegistry) -> Result<InvocationRequest> {
        self.expect_kind(FrameKind::Request)?;
        registry.get(&self.marshaller)?.decode_request(&self.body)
    }

    pub fn decode_response(&self, registry: &MarshallerRegistry) -> Result<InvocationResponse> {
        self.expect_kind(FrameKind::Response)?;
        registry.get(&self.marshaller)?.decode_response(&self.body)
    }

    fn expect_kind(&self, kind: FrameKind) -> Result<()> {
        if self.kind != kind {
            return Err(RinvokeError::Framing(format!(
                "expected {:?} frame, got {:?}",
                kind, self.kind
            )));
        }
        Ok(())
    }
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
///
/// # Errors
///
/// - `Framing` if the frame is oversized, malformed or truncated
/// - `ConnectionFailure`/`Io` for other read failures
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let first = reader
        .read(&mut len_buf)
        .await
        .map_err(|e| read_error(e, "reading length prefix"))?;
    if first == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut len_buf[first..])
        .await
        .map_err(|e| read_error(e, "reading length prefix"))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RinvokeError::Framing(format!(
            "Message too large: {} bytes (max {} bytes)",
            len, MAX_MESSAGE_SIZE
        )));
    }
    if len < 2 {
        return Err(RinvokeError::Framing(format!("frame of {} bytes has no header", len)));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| read_error(e, "reading frame"))?;

    let kind = FrameKind::from_byte(buf[0])?;
    let id_len = buf[1] as usize;
    if 2 + id_len > len {
        return Err(RinvokeError::Framing("marshaller id overruns frame".to_string()));
    }
    let marshaller = std::str::from_utf8(&buf[2..2 + id_len])
        .map_err(|_| RinvokeError::Framing("marshaller id is not UTF-8".to_string()))?
        .to_string();
    let body = buf.split_off(2 + id_len);

    Ok(Some(Frame {
        kind,
        marshaller,
        body,
    }))
}

/// Writes one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let id = frame.marshaller.as_bytes();
    if id.len() > u8::MAX as usize {
        return Err(RinvokeError::Framing(format!(
            "marshaller id '{}' too long",
            frame.marshaller
        )));
    }
    let len = 2 + id.len() + frame.body.len();
    if len > MAX_MESSAGE_SIZE {
        return Err(RinvokeError::Framing(format!(
            "Message too large: {} bytes (max {} bytes)",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.push(frame.kind.to_byte());
    buf.push(id.len() as u8);
    buf.extend_from_slice(id);
    buf.extend_from_slice(&frame.body);

    writer
        .write_all(&buf)
        .await
        .map_err(|e| write_error(e, "writing frame"))?;
    writer
        .flush()
        .await
        .map_err(|e| write_error(e, "flushing stream"))?;
    Ok(())
}

fn read_error(err: std::io::Error, context: &str) -> RinvokeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        return RinvokeError::Framing(format!("{}: truncated frame", context));
    }
    write_error(err, context)
}

fn write_error(err: std::io::Error, context: &str) -> RinvokeError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe => {
            RinvokeError::ConnectionFailure(format!("{}: connection lost", context))
        }
        _ => RinvokeError::Io(err),
    }
}
