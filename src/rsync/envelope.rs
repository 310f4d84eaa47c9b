//! Multiplexed framing envelope.
//!
//! After the handshake the server wraps everything it sends in 4-byte-header
//! frames so diagnostic messages can be interleaved with file data on the one
//! socket. [`EnvelopeRead`] strips that framing on the read side; writes from
//! the client are never enveloped.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, error, info, warn};

pub const MUX_BASE: u8 = 7;

const MSG_DATA: u8 = 0;
const MSG_ERROR_XFER: u8 = 1;
const MSG_INFO: u8 = 2;
const MSG_ERROR: u8 = 3;
const MSG_WARNING: u8 = 4;
const MSG_IO_ERROR: u8 = 22;
const MSG_NOOP: u8 = 42;
const MSG_SUCCESS: u8 = 100;
const MSG_DELETED: u8 = 101;
const MSG_NO_SEND: u8 = 102;

/// Read extension for rsync's variable-width long: an i32, widened, unless it
/// is -1, in which case the actual value follows as an i64.
#[async_trait]
pub trait RsyncReadExt: AsyncRead + Unpin + Send {
    async fn read_rsync_long(&mut self) -> io::Result<i64> {
        let v = self.read_i32_le().await?;
        if v == -1 {
            self.read_i64_le().await
        } else {
            Ok(i64::from(v))
        }
    }
}

impl<T: AsyncRead + Unpin + Send> RsyncReadExt for T {}

/// Demultiplexing reader.
///
/// Data frames surface as plain bytes; info/error/warning frames become log
/// events; an error-xfer frame fails the stream with the server's message.
/// The header is read with a blocking full-read, so a connection dropped
/// mid-header is an error, while EOF on a frame boundary is a clean EOF.
#[derive(Debug)]
pub struct EnvelopeRead<T> {
    inner: T,
    state: State,
    io_error_code: Option<i32>,
}

#[derive(Debug)]
enum State {
    Payload { remaining: u32 },
    Header { buf: [u8; 4], filled: usize },
    Control { tag: u8, buf: Vec<u8>, filled: usize },
}

impl<T> EnvelopeRead<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            state: State::Payload { remaining: 0 },
            io_error_code: None,
        }
    }

    /// Out-of-band error number the server asked us to remember, if any.
    pub fn io_error_code(&self) -> Option<i32> {
        self.io_error_code
    }

    fn on_control_frame(&mut self, tag: u8, body: Vec<u8>) -> io::Result<()> {
        let Some(kind) = tag.checked_sub(MUX_BASE) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown multiplex tag {tag}"),
            ));
        };
        let text = || String::from_utf8_lossy(&body).trim_end().to_string();
        match kind {
            MSG_ERROR_XFER => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("server error: {}", text()),
            )),
            MSG_INFO => {
                info!("server: {}", text());
                Ok(())
            }
            MSG_ERROR => {
                error!("server: {}", text());
                Ok(())
            }
            MSG_WARNING => {
                warn!("server: {}", text());
                Ok(())
            }
            MSG_IO_ERROR => {
                let code: [u8; 4] = body.as_slice().try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("io-error frame with {} byte payload", body.len()),
                    )
                })?;
                let code = i32::from_le_bytes(code);
                warn!(code, "server reported an I/O error");
                self.io_error_code = Some(code);
                Ok(())
            }
            MSG_NOOP | MSG_SUCCESS | MSG_DELETED | MSG_NO_SEND => {
                debug!(tag, len = body.len(), "control frame");
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown multiplex tag {tag}"),
            )),
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for EnvelopeRead<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Payload { remaining } => {
                    if *remaining == 0 {
                        this.state = State::Header {
                            buf: [0; 4],
                            filled: 0,
                        };
                        continue;
                    }
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let want = (*remaining as usize).min(buf.remaining());
                    let mut limited = ReadBuf::new(buf.initialize_unfilled_to(want));
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
                    let n = limited.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside a data frame",
                        )));
                    }
                    buf.advance(n);
                    *remaining -= n as u32;
                    return Poll::Ready(Ok(()));
                }
                State::Header { buf: header, filled } => {
                    while *filled < header.len() {
                        let mut part = ReadBuf::new(&mut header[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut part))?;
                        let n = part.filled().len();
                        if n == 0 {
                            return if *filled == 0 {
                                Poll::Ready(Ok(()))
                            } else {
                                Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "truncated frame header",
                                )))
                            };
                        }
                        *filled += n;
                    }
                    let word = u32::from_le_bytes(*header);
                    let tag = (word >> 24) as u8;
                    let len = word & 0x00ff_ffff;
                    if tag == MUX_BASE + MSG_DATA {
                        this.state = State::Payload { remaining: len };
                    } else {
                        this.state = State::Control {
                            tag,
                            buf: vec![0; len as usize],
                            filled: 0,
                        };
                    }
                }
                State::Control { tag, buf: body, filled } => {
                    while *filled < body.len() {
                        let mut part = ReadBuf::new(&mut body[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut part))?;
                        let n = part.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "truncated control frame",
                            )));
                        }
                        *filled += n;
                    }
                    let tag = *tag;
                    let body = std::mem::take(body);
                    this.state = State::Payload { remaining: 0 };
                    if let Err(e) = this.on_control_frame(tag, body) {
                        return Poll::Ready(Err(e));
                    }
                }
            }
        }
    }
}
