//! Buffered read and write over a [`Socket`], with protocol framing.
use bytes::{Buf, Bytes, BytesMut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::io::AsyncWrite;
use tokio_util::io::poll_read_buf;

use super::Socket;
use crate::{
    Result,
    postgres::{FrontendProtocol, ProtocolError, write},
};

const DEFAULT_BUF_CAPACITY: usize = 4096;

/// Envelope header: message-type byte plus the four-byte length.
const HEADER: usize = 5;

/// Buffered framing over the socket.
///
/// Outbound messages accumulate in the write buffer until flushed, so
/// bytes are produced only when the channel is being written. Inbound
/// bytes accumulate until a whole frame is available; the frame body is
/// split off as a shared [`Bytes`] view without copying.
#[derive(Debug)]
pub struct BufferedSocket {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl BufferedSocket {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        }
    }

    /// Queue a tagged frontend message.
    pub fn encode<F: FrontendProtocol>(&mut self, message: &F) {
        write(message, &mut self.write_buf);
    }

    /// The raw write buffer, for the untagged startup-phase messages.
    pub fn write_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    pub fn wants_flush(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Write the buffered messages out and flush the underlying io.
    pub fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.socket).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.socket).poll_flush(cx)
    }

    /// Receive one frame: the message-type byte and the message body
    /// with the envelope stripped.
    ///
    /// A clean EOF mid-frame is a truncated envelope and fails the
    /// channel.
    pub fn poll_frame(&mut self, cx: &mut Context) -> Poll<Result<(u8, Bytes)>> {
        loop {
            if self.read_buf.len() >= HEADER {
                let tag = self.read_buf[0];
                let len = u32::from_be_bytes(self.read_buf[1..HEADER].try_into().unwrap()) as usize;
                if len < 4 {
                    return Poll::Ready(Err(ProtocolError::new(format!(
                        "message length {len} below envelope minimum",
                    ))
                    .into()));
                }

                let total = 1 + len;
                if self.read_buf.len() >= total {
                    self.read_buf.advance(HEADER);
                    let body = self.read_buf.split_to(len - 4).freeze();
                    return Poll::Ready(Ok((tag, body)));
                }
                self.read_buf.reserve(total - self.read_buf.len());
            }

            let n = ready!(poll_read_buf(Pin::new(&mut self.socket), cx, &mut self.read_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by the server",
                )
                .into()));
            }
        }
    }
}
