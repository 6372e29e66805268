//! Stream server
//!
//! Owns the entry store, the atomic commit manager and the broadcaster, and
//! serves client connections over TCP. Each connection gets a command loop,
//! a writer task draining its outgoing packet queue, and at most one
//! streaming session at a time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use datastream_core::{
    Command, CommandResult, Entry, EntryType, EntryTypeRegistry, Packet, ProtocolError,
    ResultCode, StreamHeader,
};
use datastream_storage::EntryStore;

use crate::atomic::{AtomicCommitManager, ProvisionalEntry};
use crate::broadcaster::Broadcaster;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::session::{Session, SessionEnd, SessionInfo, SessionMode};

/// State shared between the server handle, connections and sessions
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) store: Arc<EntryStore>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) sessions: DashMap<u64, SessionInfo>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    next_session_id: AtomicU64,
}

/// The data stream server
///
/// The producing process drives the atomic operation methods; remote
/// clients connect once [`start`](Self::start) has bound the listener.
pub struct StreamServer {
    shared: Arc<Shared>,
    commits: AtomicCommitManager,
    registry: Arc<EntryTypeRegistry>,
    local_addr: OnceLock<SocketAddr>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamServer {
    /// Open the stream file and prepare the engine
    ///
    /// No socket is bound until [`start`](Self::start).
    #[instrument(skip_all, fields(path = %config.store.path.display()))]
    pub async fn new(config: ServerConfig, registry: EntryTypeRegistry) -> ServerResult<Self> {
        config.validate()?;

        let store = Arc::new(EntryStore::open(config.store.clone()).await?);
        let broadcaster = Broadcaster::new(config.broadcast_capacity);
        let registry = Arc::new(registry);
        let commits = AtomicCommitManager::new(store.clone(), broadcaster.clone(), registry.clone());

        info!(
            stream_type = %config.stream_type(),
            total_entries = store.count(),
            entry_types = registry.len(),
            "Stream server created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                broadcaster,
                sessions: DashMap::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                next_session_id: AtomicU64::new(1),
            }),
            commits,
            registry,
            local_addr: OnceLock::new(),
            listener_task: Mutex::new(None),
        })
    }

    /// Bind the listener and start accepting clients
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn start(&self) -> ServerResult<SocketAddr> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ServerError::ShutDown);
        }
        let mut listener_task = self.listener_task.lock().await;
        if listener_task.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        info!(%local_addr, "Stream server listening");
        *listener_task = Some(tokio::spawn(accept_loop(listener, self.shared.clone())));
        Ok(local_addr)
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Open an atomic operation
    pub async fn start_atomic_op(&self) -> ServerResult<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ServerError::ShutDown);
        }
        self.commits.start_atomic_op().await
    }

    /// Add an entry to the open atomic operation
    pub async fn add_stream_entry(
        &self,
        entry_type: EntryType,
        payload: impl Into<Bytes>,
    ) -> ServerResult<ProvisionalEntry> {
        self.commits.add_stream_entry(entry_type, payload).await
    }

    /// Commit the open atomic operation and notify live sessions
    pub async fn commit_atomic_op(&self) -> ServerResult<StreamHeader> {
        self.commits.commit_atomic_op().await
    }

    /// Discard the open atomic operation
    ///
    /// Returns the number of discarded entries.
    pub async fn rollback_atomic_op(&self) -> ServerResult<usize> {
        self.commits.rollback_atomic_op().await
    }

    /// Current stream header
    pub fn header(&self) -> StreamHeader {
        self.shared.store.header()
    }

    /// Read a committed entry
    pub async fn get_entry(&self, entry_number: u64) -> ServerResult<Entry> {
        Ok(self.shared.store.read(entry_number).await?)
    }

    /// Entry type registry
    pub fn registry(&self) -> &EntryTypeRegistry {
        &self.registry
    }

    /// Number of streaming sessions
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Snapshot of the streaming sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Stop accepting clients, end every session and sync the store
    pub async fn shutdown(&self) -> ServerResult<()> {
        info!("Stream server shutting down");
        self.shared.shutdown.cancel();

        if let Some(task) = self.listener_task.lock().await.take() {
            let _ = task.await;
        }
        self.shared.tasks.close();
        self.shared.tasks.wait().await;

        self.shared.store.close().await?;
        info!(total_entries = self.shared.store.count(), "Stream server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("local_addr", &self.local_addr())
            .field("store", &self.shared.store)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                shared
                    .tasks
                    .spawn(handle_connection(stream, peer, shared.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Session running on a connection
struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<SessionEnd>,
}

impl ActiveSession {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(session_id = self.id, error = %e, "Session task failed");
        }
    }
}

/// Per-connection command loop
struct Connection {
    peer: SocketAddr,
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    session: Option<ActiveSession>,
}

#[instrument(skip_all, fields(peer = %peer))]
async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    debug!("Client connected");

    let (read_half, write_half) = stream.into_split();
    let (outgoing, queue) = mpsc::channel(shared.config.outgoing_queue_depth);
    let cancel = shared.shutdown.child_token();

    let writer = tokio::spawn(write_loop(
        BufWriter::new(write_half),
        queue,
        shared.config.write_timeout(),
        cancel.clone(),
    ));

    let mut connection = Connection {
        peer,
        shared,
        outgoing,
        cancel,
        session: None,
    };
    let mut reader = BufReader::new(read_half);

    loop {
        let command = tokio::select! {
            _ = connection.cancel.cancelled() => break,
            command = Command::read_from(&mut reader) => command,
        };

        match command {
            Ok(command) => {
                if !connection.handle_command(command).await {
                    break;
                }
            }
            Err(ProtocolError::ConnectionClosed) => {
                debug!("Client disconnected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Protocol error, closing connection");
                break;
            }
        }
    }

    if let Some(session) = connection.session.take() {
        session.stop().await;
    }
    connection.cancel.cancel();
    drop(connection);
    if let Err(e) = writer.await {
        error!(error = %e, "Writer task failed");
    }
    debug!("Connection closed");
}

impl Connection {
    /// Execute one command; returns false once the connection is unusable
    async fn handle_command(&mut self, command: Command) -> bool {
        debug!(%command, "Command received");

        let expected = self.shared.config.stream_type();
        if command.stream_type() != expected {
            return self
                .reply(CommandResult::error(
                    ResultCode::StreamTypeMismatch,
                    format!(
                        "stream type {} not served (expected {expected})",
                        command.stream_type()
                    ),
                ))
                .await;
        }

        match command {
            Command::Header { .. } => {
                let header = self.shared.store.header();
                self.reply(CommandResult::ok()).await && self.send(Packet::Header(header)).await
            }
            Command::Start { from_entry, .. } => self.start_session(from_entry).await,
            Command::Stop { .. } => {
                if let Some(session) = self.session.take() {
                    session.stop().await;
                }
                self.reply(CommandResult::ok()).await
            }
        }
    }

    async fn start_session(&mut self, from_entry: u64) -> bool {
        if let Some(active) = &self.session {
            if self.shared.sessions.contains_key(&active.id) {
                return self
                    .reply(CommandResult::error(
                        ResultCode::AlreadyStarted,
                        format!("session {} is already streaming", active.id),
                    ))
                    .await;
            }
        }
        // Reap a session that ended on its own
        if let Some(finished) = self.session.take() {
            finished.stop().await;
        }

        let total_entries = self.shared.store.count();
        if from_entry > total_entries {
            return self
                .reply(CommandResult::error(
                    ResultCode::InvalidOffset,
                    format!("from entry {from_entry} is past the end of the stream ({total_entries} entries)"),
                ))
                .await;
        }

        let info = SessionInfo {
            id: self.shared.next_session_id.fetch_add(1, Ordering::Relaxed),
            peer: self.peer,
            from_entry,
            cursor: from_entry,
            mode: SessionMode::CatchingUp,
        };
        self.shared.sessions.insert(info.id, info.clone());

        // The Ok result is queued before any entry the session sends
        if !self.reply(CommandResult::ok()).await {
            self.shared.sessions.remove(&info.id);
            return false;
        }

        let cancel = self.cancel.child_token();
        let session = Session::new(self.shared.clone(), &info, self.outgoing.clone(), cancel.clone());
        self.session = Some(ActiveSession {
            id: info.id,
            cancel,
            handle: tokio::spawn(session.run()),
        });
        true
    }

    async fn reply(&self, result: CommandResult) -> bool {
        if !result.code.is_ok() {
            debug!(code = ?result.code, message = %result.message, "Command rejected");
        }
        self.send(Packet::Result(result)).await
    }

    async fn send(&self, packet: Packet) -> bool {
        self.outgoing.send(packet).await.is_ok()
    }
}

/// Drain the outgoing queue into the socket
///
/// Flushes whenever the queue runs empty. A write that exceeds the timeout
/// or fails closes the connection.
async fn write_loop(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut queue: mpsc::Receiver<Packet>,
    write_timeout: Duration,
    cancel: CancellationToken,
) {
    let result = async {
        while let Some(packet) = queue.recv().await {
            with_timeout(write_timeout, packet.write_to(&mut writer)).await?;
            if queue.is_empty() {
                with_timeout(write_timeout, async {
                    writer.flush().await.map_err(ProtocolError::from)
                })
                .await?;
            }
        }
        writer.shutdown().await?;
        Ok::<(), ProtocolError>(())
    }
    .await;

    if let Err(e) = result {
        debug!(error = %e, "Connection write failed");
        cancel.cancel();
    }
}

async fn with_timeout<F>(limit: Duration, write: F) -> Result<(), ProtocolError>
where
    F: std::future::Future<Output = Result<(), ProtocolError>>,
{
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datastream_core::{EntryDefinition, StreamType};
    use tempfile::TempDir;

    const STREAM: StreamType = StreamType(1);

    async fn create_test_server() -> (StreamServer, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ServerConfig::with_stream_file(temp_dir.path().join("stream.bin"), STREAM)
            .with_listen_addr("127.0.0.1:0".parse().unwrap());
        config.store.sync_on_write = false;
        let registry = EntryTypeRegistry::new()
            .with_entry(EntryType(1), EntryDefinition::new("A", STREAM))
            .with_entry(EntryType(2), EntryDefinition::new("B", STREAM));
        (StreamServer::new(config, registry).await.unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn test_get_entry_and_header() {
        let (server, _temp) = create_test_server().await;

        server.start_atomic_op().await.unwrap();
        server.add_stream_entry(EntryType(1), &b"one"[..]).await.unwrap();
        server.add_stream_entry(EntryType(2), &b"two"[..]).await.unwrap();
        server.commit_atomic_op().await.unwrap();

        let header = server.header();
        assert_eq!(header.total_entries, 2);
        assert_eq!(header.stream_type, STREAM);

        let entry = server.get_entry(1).await.unwrap();
        assert_eq!(entry.entry_type, EntryType(2));
        assert_eq!(entry.payload, Bytes::from_static(b"two"));
        assert!(matches!(server.get_entry(2).await, Err(ServerError::NotFound(2))));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (server, _temp) = create_test_server().await;
        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert_ne!(addr.port(), 0);
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_writes() {
        let (server, _temp) = create_test_server().await;
        server.start().await.unwrap();
        server.shutdown().await.unwrap();
        assert!(matches!(server.start_atomic_op().await, Err(ServerError::ShutDown)));
        assert!(matches!(server.start().await, Err(ServerError::ShutDown)));
    }

    #[tokio::test]
    async fn test_reopen_keeps_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stream.bin");
        let registry = || EntryTypeRegistry::new().with_entry(EntryType(1), EntryDefinition::new("A", STREAM));

        {
            let server = StreamServer::new(ServerConfig::with_stream_file(&path, STREAM), registry())
                .await
                .unwrap();
            server.start_atomic_op().await.unwrap();
            server.add_stream_entry(EntryType(1), &b"durable"[..]).await.unwrap();
            server.commit_atomic_op().await.unwrap();
            server.shutdown().await.unwrap();
        }

        let server = StreamServer::new(ServerConfig::with_stream_file(&path, STREAM), registry())
            .await
            .unwrap();
        assert_eq!(server.header().total_entries, 1);
        assert_eq!(
            server.get_entry(0).await.unwrap().payload,
            Bytes::from_static(b"durable")
        );
    }
}
