//! The logical stream handed to protocol code: an `AsyncRead +
//! AsyncWrite` channel multiplexed inside exactly one connection.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use weft_host_primitives::error::StreamError;
use weft_host_primitives::frame::{Frame, FrameFlag};

use super::{Command, Control};

/// State visible to the stream, its detached handle and the connection
/// task. Reset preempts queued data; a remote close is only observed
/// once the data queue has drained, so EOF stays in order.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub write_closed: AtomicBool,
    pub reset: AtomicBool,
    pub remote_closed: AtomicBool,
}

pub struct Stream {
    id: u64,
    initiator: bool,
    protocol: Option<String>,
    events: mpsc::Receiver<Bytes>,
    buffer: BytesMut,
    remote_closed: bool,
    connection_gone: bool,
    writer: PollSender<Command>,
    commands: mpsc::Sender<Command>,
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<SharedState>,
    max_payload: usize,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        initiator: bool,
        events: mpsc::Receiver<Bytes>,
        commands: mpsc::Sender<Command>,
        control: mpsc::UnboundedSender<Control>,
        shared: Arc<SharedState>,
        max_payload: usize,
    ) -> Self {
        Self {
            id,
            initiator,
            protocol: None,
            events,
            buffer: BytesMut::new(),
            remote_closed: false,
            connection_gone: false,
            writer: PollSender::new(commands.clone()),
            commands,
            control,
            shared,
            max_payload,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the local side opened this stream.
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// The negotiated protocol id, once negotiation has bound one.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub(crate) fn set_protocol(&mut self, protocol: String) {
        self.protocol = Some(protocol);
    }

    /// Detached control handle for this stream, usable after the stream
    /// itself moves into a protocol controller.
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            id: self.id,
            initiator: self.initiator,
            protocol: self.protocol.clone(),
            commands: self.commands.clone(),
            control: self.control.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Writes a whole message and flushes it.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.write_all(data).await.map_err(stream_err)?;
        self.flush().await.map_err(stream_err)
    }

    /// Half-closes the write side. Reads continue to drain.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        self.shutdown().await.map_err(stream_err)
    }

    /// Abortively resets the stream in both directions.
    pub fn reset(&mut self) {
        reset_via(&self.control, &self.shared, self.id, self.initiator);
    }

    fn failure(&self) -> Option<StreamError> {
        if self.shared.reset.load(Ordering::Acquire) {
            Some(StreamError::Reset)
        } else if self.connection_gone {
            Some(StreamError::ConnectionClosed)
        } else {
            None
        }
    }
}

fn stream_err(err: io::Error) -> StreamError {
    StreamError::from_io(&err).unwrap_or(StreamError::ConnectionClosed)
}

fn reset_via(
    control: &mpsc::UnboundedSender<Control>,
    shared: &SharedState,
    id: u64,
    initiator: bool,
) {
    if shared.reset.swap(true, Ordering::AcqRel) {
        return;
    }
    // Unbounded, so a reset cannot be lost behind saturated data writes.
    drop(control.send(Control::Reset { id, initiator }));
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(err) = this.failure() {
                return Poll::Ready(Err(err.into_io()));
            }
            if !this.buffer.is_empty() {
                let n = this.buffer.len().min(buf.remaining());
                buf.put_slice(&this.buffer.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.remote_closed {
                // End of stream; a half-close is not an error.
                return Poll::Ready(Ok(()));
            }

            match ready!(this.events.poll_recv(cx)) {
                Some(data) => this.buffer.extend_from_slice(&data),
                // The sender is dropped once the remote half-closed or the
                // connection task exited; queued data has drained by now.
                None => {
                    if this.shared.remote_closed.load(Ordering::Acquire) {
                        this.remote_closed = true;
                    } else {
                        this.connection_gone = true;
                    }
                }
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shared.reset.load(Ordering::Acquire) {
            return Poll::Ready(Err(StreamError::Reset.into_io()));
        }
        if this.shared.write_closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(StreamError::Closed.into_io()));
        }
        if ready!(this.writer.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(StreamError::ConnectionClosed.into_io()));
        }

        let n = buf.len().min(this.max_payload);
        let frame = Frame::new(
            this.id,
            FrameFlag::message(this.initiator),
            Bytes::copy_from_slice(&buf[..n]),
        );
        if this.writer.send_item(Command::Frame(frame)).is_err() {
            return Poll::Ready(Err(StreamError::ConnectionClosed.into_io()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the connection task as they are written.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shared.reset.load(Ordering::Acquire)
            || this.shared.write_closed.load(Ordering::Acquire)
        {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.writer.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(StreamError::ConnectionClosed.into_io()));
        }

        this.shared.write_closed.store(true, Ordering::Release);
        let frame = Frame::header(this.id, FrameFlag::close(this.initiator));
        if this.writer.send_item(Command::Frame(frame)).is_err() {
            return Poll::Ready(Err(StreamError::ConnectionClosed.into_io()));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // After a clean local close the peer may still be reading what we
        // sent; the connection task finishes the entry once the remote
        // side closes. Only an abandoned open write side gets reset.
        let reset = self.shared.reset.load(Ordering::Acquire);
        let closed = self.shared.write_closed.load(Ordering::Acquire);
        if !reset && !closed {
            reset_via(&self.control, &self.shared, self.id, self.initiator);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Control-plane handle to a stream whose data side lives elsewhere
/// (typically inside a protocol controller).
#[derive(Clone)]
pub struct StreamHandle {
    id: u64,
    initiator: bool,
    protocol: Option<String>,
    commands: mpsc::Sender<Command>,
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<SharedState>,
}

impl StreamHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Half-closes the stream's write side.
    pub async fn close(&self) -> Result<(), StreamError> {
        if self.shared.reset.load(Ordering::Acquire) {
            return Err(StreamError::Reset);
        }
        if self.shared.write_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = Frame::header(self.id, FrameFlag::close(self.initiator));
        self.commands
            .send(Command::Frame(frame))
            .await
            .map_err(|_| StreamError::ConnectionClosed)
    }

    /// Abortively resets the stream.
    pub fn reset(&self) {
        reset_via(&self.control, &self.shared, self.id, self.initiator);
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}
