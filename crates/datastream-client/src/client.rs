//! Stream client
//!
//! One TCP connection carries both command round-trips and the entry
//! stream. A background receive loop reads every server packet: entries go
//! to the attached [`EntryStream`], command results go back to the caller
//! waiting on the command.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use datastream_core::{
    Command, CommandResult, Entry, EntryTypeRegistry, Packet, ProtocolError, ResultCode,
    StreamHeader,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::stream::EntryStream;

type EntrySender = mpsc::Sender<Result<Entry, ClientError>>;

/// Instructions from the client handle to the receive loop
enum Control {
    Attach { from_entry: u64, sink: EntrySender },
    Detach,
}

/// Write half and the queue of command responses, used under one lock so
/// responses pair with the command that caused them
struct CommandChannel {
    writer: BufWriter<OwnedWriteHalf>,
    responses: mpsc::Receiver<Packet>,
}

/// Client for a data stream server
pub struct StreamClient {
    config: ClientConfig,
    registry: Arc<EntryTypeRegistry>,
    commands: Mutex<CommandChannel>,
    control: mpsc::UnboundedSender<Control>,
    /// Whether the server is believed to be streaming to us
    streaming: Arc<AtomicBool>,
    cancel: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    /// Connect to the server and start the receive loop
    #[instrument(skip_all, fields(server = %config.server_addr))]
    pub async fn connect(config: ClientConfig, registry: EntryTypeRegistry) -> ClientResult<Self> {
        let addr = config.server_addr;
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(addr))??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (response_tx, responses) = mpsc::channel(16);
        let (control, control_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(registry);
        let streaming = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let receive_loop = ReceiveLoop {
            reader: BufReader::new(read_half),
            max_payload_size: config.max_payload_size,
            registry: registry.clone(),
            responses: response_tx,
            control: control_rx,
            sink: None,
            streaming: streaming.clone(),
            cancel: cancel.clone(),
        };
        let receive_task = tokio::spawn(receive_loop.run());

        info!("Connected to stream server");
        Ok(Self {
            config,
            registry,
            commands: Mutex::new(CommandChannel {
                writer: BufWriter::new(write_half),
                responses,
            }),
            control,
            streaming,
            cancel,
            receive_task: Mutex::new(Some(receive_task)),
        })
    }

    /// Entry type registry used to describe received entries
    pub fn registry(&self) -> &EntryTypeRegistry {
        &self.registry
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a started session is streaming entries
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Whether the connection has been stopped or lost
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Query the stream header
    pub async fn header(&self) -> ClientResult<StreamHeader> {
        let mut channel = self.commands.lock().await;
        self.round_trip(
            &mut channel,
            Command::Header {
                stream_type: self.config.stream_type,
            },
        )
        .await?;

        match self.next_response(&mut channel).await? {
            Packet::Header(header) => Ok(header),
            _ => Err(ClientError::UnexpectedPacket("expected header")),
        }
    }

    /// Start streaming from `from_entry`
    ///
    /// The returned stream yields stored entries from `from_entry` onwards
    /// and then new commits as they happen, in entry number order.
    #[instrument(skip(self))]
    pub async fn start(&self, from_entry: u64) -> ClientResult<EntryStream> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        if self.streaming.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyStreaming);
        }

        let (sink, entries) = mpsc::channel(self.config.entry_buffer.max(1));
        // Attach before the command goes out so no entry can beat the sink
        if self.control.send(Control::Attach { from_entry, sink }).is_err() {
            self.streaming.store(false, Ordering::Release);
            return Err(ClientError::Closed);
        }

        let command = Command::Start {
            stream_type: self.config.stream_type,
            from_entry,
        };
        let mut channel = self.commands.lock().await;
        match self.round_trip(&mut channel, command).await {
            Ok(()) => {
                info!(from_entry, "Streaming started");
                Ok(EntryStream::new(entries))
            }
            Err(e) => {
                let _ = self.control.send(Control::Detach);
                self.streaming.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Stop streaming and close the connection
    ///
    /// Detaches the entry stream, sends `Stop`, then ends the receive loop
    /// and releases the socket. Entries still in flight are discarded.
    /// Calling `stop` again is a no-op; other commands fail with `Closed`.
    pub async fn stop(&self) -> ClientResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let _ = self.control.send(Control::Detach);

        let mut channel = self.commands.lock().await;
        let result = self
            .round_trip(
                &mut channel,
                Command::Stop {
                    stream_type: self.config.stream_type,
                },
            )
            .await;

        self.streaming.store(false, Ordering::Release);
        self.cancel.cancel();
        if let Err(e) = channel.writer.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
        drop(channel);

        if let Some(task) = self.receive_task.lock().await.take() {
            let _ = task.await;
        }
        info!("Stream client stopped");

        match result {
            // The server may have gone first; the connection is closed either way
            Err(ClientError::Closed) => Ok(()),
            other => other,
        }
    }

    /// Send a command and wait for its result packet
    async fn round_trip(&self, channel: &mut CommandChannel, command: Command) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        debug!(%command, "Sending command");
        command.write_to(&mut channel.writer).await?;

        match self.next_response(channel).await? {
            Packet::Result(CommandResult { code, .. }) if code.is_ok() => Ok(()),
            Packet::Result(CommandResult { code, message }) => {
                warn!(%command, ?code, %message, "Command rejected");
                Err(ClientError::Rejected { code, message })
            }
            _ => Err(ClientError::UnexpectedPacket("expected result")),
        }
    }

    /// Wait for the next command response
    ///
    /// A timed out command closes the connection: its late reply would
    /// otherwise be taken as the answer to the next command.
    async fn next_response(&self, channel: &mut CommandChannel) -> ClientResult<Packet> {
        match tokio::time::timeout(self.config.command_timeout(), channel.responses.recv()).await {
            Ok(response) => response.ok_or(ClientError::Closed),
            Err(_) => {
                warn!(timeout = ?self.config.command_timeout(), "Command timed out, closing connection");
                self.streaming.store(false, Ordering::Release);
                self.cancel.cancel();
                if let Err(e) = channel.writer.shutdown().await {
                    debug!(error = %e, "Socket shutdown failed");
                }
                Err(ClientError::Timeout)
            }
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("server_addr", &self.config.server_addr)
            .field("streaming", &self.is_streaming())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Attached entry consumer
struct Sink {
    next: u64,
    sender: EntrySender,
}

/// Background task reading every packet from the server
struct ReceiveLoop {
    reader: BufReader<OwnedReadHalf>,
    max_payload_size: usize,
    registry: Arc<EntryTypeRegistry>,
    responses: mpsc::Sender<Packet>,
    control: mpsc::UnboundedReceiver<Control>,
    sink: Option<Sink>,
    streaming: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    async fn run(mut self) {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                packet = Packet::read_from(&mut self.reader, self.max_payload_size) => packet,
            };
            self.apply_control();

            match packet {
                Ok(Packet::Entry(entry)) => self.deliver(entry).await,
                Ok(Packet::Result(result)) if is_session_notice(result.code) => {
                    self.streaming.store(false, Ordering::Release);
                    let err = match result.code {
                        ResultCode::SubscriberLagged => ClientError::Lagged {
                            resume_from: self.sink.as_ref().map_or(0, |s| s.next),
                        },
                        code => ClientError::Rejected {
                            code,
                            message: result.message,
                        },
                    };
                    warn!(error = %err, "Session ended by server");
                    self.fail_sink(err).await;
                }
                Ok(packet) => {
                    if self.responses.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(ProtocolError::ConnectionClosed) => {
                    debug!("Server closed the connection");
                    self.fail_sink(ClientError::Closed).await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Receive failed, closing connection");
                    self.fail_sink(ClientError::Protocol(e)).await;
                    break;
                }
            }
        }

        self.streaming.store(false, Ordering::Release);
        self.cancel.cancel();
        debug!("Receive loop stopped");
    }

    fn apply_control(&mut self) {
        while let Ok(control) = self.control.try_recv() {
            self.apply(control);
        }
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::Attach { from_entry, sink } => {
                self.sink = Some(Sink {
                    next: from_entry,
                    sender: sink,
                });
            }
            Control::Detach => self.sink = None,
        }
    }

    async fn deliver(&mut self, entry: Entry) {
        let Some(expected) = self.sink.as_ref().map(|sink| sink.next) else {
            debug!(entry_number = entry.number, "Entry without a consumer, dropped");
            return;
        };

        if entry.number != expected {
            let err = ClientError::OutOfOrder {
                expected,
                found: entry.number,
            };
            warn!(error = %err, "Entry stream broken");
            self.fail_sink(err).await;
            return;
        }

        debug!(entry = %self.registry.describe(&entry), "Entry received");
        if let Some(permit) = self.reserve().await {
            permit.send(Ok(entry));
            if let Some(sink) = self.sink.as_mut() {
                sink.next += 1;
            }
        }
    }

    /// Hand a final error to the consumer and detach it
    async fn fail_sink(&mut self, err: ClientError) {
        if let Some(permit) = self.reserve().await {
            permit.send(Err(err));
        }
        self.sink = None;
    }

    /// Wait for room in the attached sink
    ///
    /// Keeps applying control messages while the consumer is slow, so a
    /// detach never waits on a consumer that stopped reading.
    async fn reserve(&mut self) -> Option<OwnedPermit<Result<Entry, ClientError>>> {
        loop {
            let sender = self.sink.as_ref()?.sender.clone();
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                control = self.control.recv() => Reserve::Control(control),
                permit = sender.reserve_owned() => match permit {
                    Ok(permit) => return Some(permit),
                    Err(_) => Reserve::ConsumerGone,
                },
            };

            match step {
                Reserve::Control(Some(control)) => self.apply(control),
                Reserve::Control(None) => return None,
                Reserve::ConsumerGone => {
                    debug!("Entry stream dropped by consumer");
                    self.sink = None;
                    return None;
                }
            }
        }
    }
}

enum Reserve {
    Control(Option<Control>),
    ConsumerGone,
}

/// Result codes the server sends on its own to end a session
fn is_session_notice(code: ResultCode) -> bool {
    matches!(code, ResultCode::SubscriberLagged | ResultCode::Internal)
}
