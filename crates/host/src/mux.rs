//! Stream multiplexing over one secured connection.
//!
//! Each connection is owned by a single spawned task that polls two halves
//! concurrently. The write half is the only writer of the underlying
//! session: stream data funnels through a bounded command channel into it,
//! which is where connection backpressure lands on stream writers. Resets
//! and connection close travel on a separate unbounded control channel, so
//! they stay deliverable while the data path is saturated. The read half
//! demultiplexes incoming frames onto per-stream queues without ever
//! blocking on them; a stream whose consumer falls a full queue behind is
//! reset instead of stalling the rest of the connection.

use std::collections::hash_map::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use weft_host_primitives::config::MuxConfig;
use weft_host_primitives::error::{MuxerError, StreamError};
use weft_host_primitives::frame::{Frame, FrameCodec, FrameFlag};

pub use self::stream::{Stream, StreamHandle};
use self::stream::SharedState;

mod stream;

/// Requests from connection and stream handles into the write half.
pub(crate) enum Command {
    OpenStream {
        reply: oneshot::Sender<Result<Stream, StreamError>>,
    },
    Frame(Frame),
}

/// Out-of-band requests that must not queue behind stream data.
pub(crate) enum Control {
    Reset { id: u64, initiator: bool },
    Close { reply: oneshot::Sender<()> },
}

/// Streams are keyed by id plus whether the local side initiated them; the
/// two sides' id counters live in disjoint namespaces.
type StreamKey = (u64, bool);

struct StreamEntry {
    events: Option<mpsc::Sender<Bytes>>,
    shared: Arc<SharedState>,
    local_closed: bool,
    remote_closed: bool,
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<StreamKey, StreamEntry>,
    next_stream_id: u64,
}

/// Cheap, cloneable handle to a multiplexed connection.
#[derive(Clone, Debug)]
pub struct Connection {
    peer_id: PeerId,
    remote_addr: Multiaddr,
    commands: mpsc::Sender<Command>,
    control: mpsc::UnboundedSender<Control>,
}

impl Connection {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[must_use]
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    /// Whether the connection task has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Opens a new outbound stream on this connection.
    pub async fn open_stream(&self) -> Result<Stream, StreamError> {
        let (reply, opened) = oneshot::channel();
        self.commands
            .send(Command::OpenStream { reply })
            .await
            .map_err(|_| StreamError::ConnectionClosed)?;
        opened.await.map_err(|_| StreamError::ConnectionClosed)?
    }

    /// Closes the connection. Every open stream on it, local and remote,
    /// fails with [`StreamError::ConnectionClosed`]. Delivered out of band
    /// of the data path, so it works even with every stream writer stuck
    /// in backpressure.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.control.send(Control::Close { reply }).is_ok() {
            drop(done.await);
        }
    }

    /// Resolves once the connection task has exited, for any reason.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }
}

/// Spawns the connection task over a secured duplex session and returns the
/// connection handle plus the queue of remotely opened streams.
pub(crate) fn spawn<T>(
    io: T,
    peer_id: PeerId,
    remote_addr: Multiaddr,
    config: MuxConfig,
) -> (Connection, mpsc::Receiver<Stream>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(config.write_buffer);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);

    let (sink, frames) = Framed::new(io, FrameCodec::new(config.max_frame_size)).split();
    let table = Arc::new(Mutex::new(StreamTable::default()));
    let shutdown = CancellationToken::new();

    let writer = WriteHalf {
        sink,
        commands: command_rx,
        control: control_rx,
        // Weak so that dropping every external handle tears the task down
        // instead of leaking it.
        command_tx: command_tx.downgrade(),
        control_tx: control_tx.clone(),
        table: Arc::clone(&table),
        pending_close: Vec::new(),
        shutdown: shutdown.clone(),
        config,
    };
    let reader = ReadHalf {
        frames,
        inbound: inbound_tx,
        command_tx: command_tx.downgrade(),
        control_tx: control_tx.clone(),
        table,
        shutdown,
        config,
        peer_id,
    };
    drop(tokio::spawn(run(writer, reader, peer_id)));

    let connection = Connection {
        peer_id,
        remote_addr,
        commands: command_tx,
        control: control_tx,
    };
    (connection, inbound_rx)
}

async fn run<T>(mut writer: WriteHalf<T>, mut reader: ReadHalf<T>, peer_id: PeerId)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // Both halves run until one finishes and cancels the other; the read
    // half keeps draining the socket while the write half sits in
    // backpressure, which is what keeps two busy peers from deadlocking.
    let write = async {
        let result = writer.drive().await;
        writer.shutdown.cancel();
        result
    };
    let read = async {
        let result = reader.drive().await;
        reader.shutdown.cancel();
        result
    };
    let (write_result, read_result) = tokio::join!(write, read);

    match read_result.and(write_result) {
        Ok(()) => debug!(peer=%peer_id, "connection closed"),
        Err(MuxerError::Io(err)) => debug!(peer=%peer_id, %err, "connection failed"),
        Err(err) => {
            warn!(peer=%peer_id, %err, "peer violated the muxing protocol, dropping connection")
        }
    }

    // Dropping the entries wakes every stream reader; writers fail once
    // the command receiver goes away with the task.
    let entries: Vec<_> = {
        let mut table = writer.table.lock();
        table.streams.drain().map(|(_, entry)| entry).collect()
    };
    drop(entries);
    drop(writer.sink.close().await);

    for reply in writer.pending_close.drain(..) {
        let _ignored = reply.send(());
    }
}

struct WriteHalf<T> {
    sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    commands: mpsc::Receiver<Command>,
    control: mpsc::UnboundedReceiver<Control>,
    command_tx: mpsc::WeakSender<Command>,
    control_tx: mpsc::UnboundedSender<Control>,
    table: Arc<Mutex<StreamTable>>,
    pending_close: Vec<oneshot::Sender<()>>,
    shutdown: CancellationToken,
    config: MuxConfig,
}

impl<T> WriteHalf<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn drive(&mut self) -> Result<(), MuxerError> {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                control = self.control.recv() => match control {
                    Some(Control::Reset { id, initiator }) => self.reset(id, initiator).await?,
                    Some(Control::Close { reply }) => {
                        self.pending_close.push(reply);
                        return Ok(());
                    }
                    None => return Ok(()),
                },
                command = self.commands.recv() => match command {
                    Some(Command::OpenStream { reply }) => self.open_stream(reply).await?,
                    Some(Command::Frame(frame)) => self.outgoing(frame).await?,
                    // Every external handle was dropped.
                    None => return Ok(()),
                },
            }
        }
    }

    async fn open_stream(
        &mut self,
        reply: oneshot::Sender<Result<Stream, StreamError>>,
    ) -> Result<(), MuxerError> {
        let Some(commands) = self.command_tx.upgrade() else {
            drop(reply.send(Err(StreamError::ConnectionClosed)));
            return Ok(());
        };

        let (stream, id) = {
            let mut table = self.table.lock();
            let id = table.next_stream_id;
            table.next_stream_id += 1;
            let (stream, entry) =
                make_stream(id, true, commands, self.control_tx.clone(), &self.config);
            drop(table.streams.insert((id, true), entry));
            (stream, id)
        };

        self.sink.send(Frame::header(id, FrameFlag::NewStream)).await?;

        // A dropped receiver lets the stream's own drop path reset it.
        drop(reply.send(Ok(stream)));
        Ok(())
    }

    /// Writes a frame queued by one of this connection's stream handles.
    async fn outgoing(&mut self, frame: Frame) -> Result<(), MuxerError> {
        let key = (
            frame.stream_id,
            matches!(
                frame.flag,
                FrameFlag::MessageInitiator | FrameFlag::CloseInitiator
            ),
        );

        match frame.flag {
            FrameFlag::MessageInitiator | FrameFlag::MessageReceiver => {
                let live = self
                    .table
                    .lock()
                    .streams
                    .get(&key)
                    .is_some_and(|entry| !entry.local_closed);
                if live {
                    self.sink.send(frame).await?;
                }
            }
            FrameFlag::CloseInitiator | FrameFlag::CloseReceiver => {
                let send = {
                    let mut table = self.table.lock();
                    let finished = match table.streams.get_mut(&key) {
                        Some(entry) if !entry.local_closed => {
                            entry.local_closed = true;
                            Some(entry.remote_closed)
                        }
                        _ => None,
                    };
                    if finished == Some(true) {
                        drop(table.streams.remove(&key));
                    }
                    finished.is_some()
                };
                if send {
                    self.sink.send(frame).await?;
                }
            }
            // Resets travel on the control channel; NewStream is never
            // produced by stream handles.
            FrameFlag::ResetInitiator | FrameFlag::ResetReceiver | FrameFlag::NewStream => {}
        }
        Ok(())
    }

    async fn reset(&mut self, id: u64, initiator: bool) -> Result<(), MuxerError> {
        let removed = self.table.lock().streams.remove(&(id, initiator));
        if let Some(entry) = removed {
            entry.shared.reset.store(true, Ordering::Release);
        }
        // Sent even when the read half already removed the entry: the
        // remote still needs to hear about the refusal.
        self.sink.send(Frame::header(id, FrameFlag::reset(initiator))).await
    }
}

struct ReadHalf<T> {
    frames: SplitStream<Framed<T, FrameCodec>>,
    inbound: mpsc::Sender<Stream>,
    command_tx: mpsc::WeakSender<Command>,
    control_tx: mpsc::UnboundedSender<Control>,
    table: Arc<Mutex<StreamTable>>,
    shutdown: CancellationToken,
    config: MuxConfig,
    peer_id: PeerId,
}

impl<T> ReadHalf<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn drive(&mut self) -> Result<(), MuxerError> {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                frame = self.frames.next() => match frame {
                    Some(Ok(frame)) => self.incoming(frame)?,
                    Some(Err(err)) => return Err(err),
                    // Remote closed the connection.
                    None => return Ok(()),
                },
            }
        }
    }

    /// Dispatches one incoming frame. Deliberately synchronous: the decode
    /// loop must keep draining the socket no matter what any single stream
    /// is doing.
    fn incoming(&mut self, frame: Frame) -> Result<(), MuxerError> {
        match frame.flag {
            FrameFlag::NewStream => self.accept_stream(frame.stream_id),
            FrameFlag::MessageInitiator => self.deliver((frame.stream_id, false), frame.payload),
            FrameFlag::MessageReceiver => self.deliver((frame.stream_id, true), frame.payload),
            FrameFlag::CloseInitiator => self.remote_close((frame.stream_id, false)),
            FrameFlag::CloseReceiver => self.remote_close((frame.stream_id, true)),
            FrameFlag::ResetInitiator => {
                self.remote_reset((frame.stream_id, false));
                Ok(())
            }
            FrameFlag::ResetReceiver => {
                self.remote_reset((frame.stream_id, true));
                Ok(())
            }
        }
    }

    fn accept_stream(&mut self, id: u64) -> Result<(), MuxerError> {
        if self.table.lock().streams.contains_key(&(id, false)) {
            return Err(MuxerError::ProtocolViolation("duplicate inbound stream id"));
        }

        let Some(commands) = self.command_tx.upgrade() else {
            return self.refuse(id);
        };

        let (stream, entry) =
            make_stream(id, false, commands, self.control_tx.clone(), &self.config);
        drop(self.table.lock().streams.insert((id, false), entry));

        if let Err(rejected) = self.inbound.try_send(stream) {
            // Nobody is accepting inbound streams, or the accept queue is
            // saturated; refuse the stream rather than stall the decode
            // loop behind it.
            let removed = self.table.lock().streams.remove(&(id, false));
            if let Some(entry) = removed {
                entry.shared.reset.store(true, Ordering::Release);
            }
            drop(rejected);
            return self.refuse(id);
        }
        Ok(())
    }

    fn deliver(&mut self, key: StreamKey, payload: Bytes) -> Result<(), MuxerError> {
        let mut table = self.table.lock();
        let Some(entry) = table.streams.get_mut(&key) else {
            // Late data for a stream we already reset or finished.
            trace!(peer=%self.peer_id, stream=key.0, "discarding data for unknown stream");
            return Ok(());
        };
        if entry.remote_closed {
            return Err(MuxerError::ProtocolViolation("data after close"));
        }

        let result = match &entry.events {
            Some(events) => events.try_send(payload),
            None => return Ok(()),
        };
        match result {
            // The receiver disappearing just means the stream was dropped;
            // its reset catches up with us through the control channel.
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => {
                if let Some(entry) = table.streams.remove(&key) {
                    entry.shared.reset.store(true, Ordering::Release);
                }
                drop(table);
                warn!(
                    peer=%self.peer_id,
                    stream=key.0,
                    "stream consumer fell a full queue behind, resetting it"
                );
                drop(self.control_tx.send(Control::Reset {
                    id: key.0,
                    initiator: key.1,
                }));
                Ok(())
            }
        }
    }

    fn remote_close(&mut self, key: StreamKey) -> Result<(), MuxerError> {
        let mut table = self.table.lock();
        let finished = match table.streams.get_mut(&key) {
            None => return Ok(()),
            Some(entry) if entry.remote_closed => {
                return Err(MuxerError::ProtocolViolation("duplicate close"))
            }
            Some(entry) => {
                entry.remote_closed = true;
                entry.shared.remote_closed.store(true, Ordering::Release);
                // Dropping the sender delivers EOF to the reader once the
                // queue has drained.
                drop(entry.events.take());
                entry.local_closed
            }
        };
        if finished {
            drop(table.streams.remove(&key));
        }
        Ok(())
    }

    fn remote_reset(&mut self, key: StreamKey) {
        let removed = self.table.lock().streams.remove(&key);
        if let Some(entry) = removed {
            entry.shared.reset.store(true, Ordering::Release);
            // Dropping the events sender wakes the reader, which then
            // observes the reset flag.
        }
    }

    fn refuse(&self, id: u64) -> Result<(), MuxerError> {
        drop(self.control_tx.send(Control::Reset {
            id,
            initiator: false,
        }));
        Ok(())
    }
}

fn make_stream(
    id: u64,
    initiator: bool,
    commands: mpsc::Sender<Command>,
    control: mpsc::UnboundedSender<Control>,
    config: &MuxConfig,
) -> (Stream, StreamEntry) {
    let (events_tx, events_rx) = mpsc::channel(config.stream_buffer);
    let shared = Arc::new(SharedState::default());
    let stream = Stream::new(
        id,
        initiator,
        events_rx,
        commands,
        control,
        Arc::clone(&shared),
        config.max_frame_size,
    );
    let entry = StreamEntry {
        events: Some(events_tx),
        shared,
        local_closed: false,
        remote_closed: false,
    };
    (stream, entry)
}
