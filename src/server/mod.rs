use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config;
use crate::intake::{ConnectionRegistry, IntakeHandler};
use crate::logging::{LogLevel, Logger};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_IO_THREADS: usize = 2;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 8 * 1024;
const IDLE_SLEEP: Duration = Duration::from_millis(2);
const WRITE_RETRY_SLEEP: Duration = Duration::from_millis(1);
const WRITE_RETRY_LIMIT: u32 = 1_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub io_threads: usize,
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            io_threads: DEFAULT_IO_THREADS,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
            io_threads: value.io_threads,
            read_timeout: Duration::from_secs(value.read_timeout_seconds),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    SpawnIoThread {
        index: usize,
        source: io::Error,
    },
    NoIoThreads,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::SpawnIoThread { index, source } => {
                write!(f, "failed to spawn I/O thread {index}: {source}")
            }
            Self::NoIoThreads => write!(f, "server needs at least one I/O thread"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. }
            | Self::SetNonBlocking { source }
            | Self::ConfigureAcceptedStream { source }
            | Self::Accept { source }
            | Self::SpawnIoThread { source, .. } => Some(source),
            Self::NoIoThreads => None,
        }
    }
}

/// An accepted client socket owned by exactly one I/O thread.
pub struct InboundConnection {
    id: u64,
    peer_addr: SocketAddr,
    stream: TcpStream,
    inbound: Vec<u8>,
    last_activity: Instant,
}

impl InboundConnection {
    fn new(id: u64, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        Ok(Self {
            id,
            peer_addr,
            stream,
            inbound: Vec::new(),
            last_activity: Instant::now(),
        })
    }

    fn try_read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buffer)
    }

    /// Writes the whole reply on the non-blocking socket, retrying briefly
    /// while the send buffer is full.
    fn write_reply(&mut self, reply: &[u8]) -> io::Result<()> {
        let mut written = 0;
        let mut retries = 0;
        while written < reply.len() {
            match self.stream.write(&reply[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(size) => written += size,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > WRITE_RETRY_LIMIT {
                        return Err(io::Error::from(io::ErrorKind::TimedOut));
                    }
                    thread::sleep(WRITE_RETRY_SLEEP);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        self.stream.flush()
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[derive(Clone)]
struct IoContext {
    handler: Arc<IntakeHandler>,
    registry: Arc<ConnectionRegistry>,
    logger: Logger,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
}

enum PollResult {
    Active,
    Idle,
    Close(&'static str),
}

/// Non-blocking listener plus a fixed pool of I/O threads.
///
/// The owner polls [`TcpServer::try_accept`]; every accepted socket is handed
/// round-robin to one I/O thread, which reads it, runs the intake handler and
/// writes replies until the peer leaves, errors or idles out.
pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
    next_dispatch: AtomicUsize,
    dispatchers: Vec<Sender<InboundConnection>>,
    io_threads: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    logger: Logger,
}

impl TcpServer {
    pub fn start(
        config: &ServerConfig,
        handler: Arc<IntakeHandler>,
        registry: Arc<ConnectionRegistry>,
        logger: Logger,
    ) -> Result<Self, ServerError> {
        if config.io_threads == 0 {
            return Err(ServerError::NoIoThreads);
        }

        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        let mut server = Self {
            listener,
            next_connection_id: AtomicU64::new(1),
            next_dispatch: AtomicUsize::new(0),
            dispatchers: Vec::with_capacity(config.io_threads),
            io_threads: Vec::with_capacity(config.io_threads),
            stop: Arc::new(AtomicBool::new(false)),
            logger: logger.clone(),
        };

        let context = IoContext {
            handler,
            registry,
            logger,
            stop: Arc::clone(&server.stop),
            read_timeout: config.read_timeout,
        };
        for index in 0..config.io_threads {
            let (sender, receiver) = mpsc::channel();
            let thread_context = context.clone();
            let spawned = thread::Builder::new()
                .name(format!("intake-io-{index}"))
                .spawn(move || run_io_thread(receiver, thread_context));
            match spawned {
                Ok(handle) => {
                    server.dispatchers.push(sender);
                    server.io_threads.push(handle);
                }
                Err(source) => {
                    server.shutdown();
                    return Err(ServerError::SpawnIoThread { index, source });
                }
            }
        }

        Ok(server)
    }

    pub fn from_app_config(
        app_config: &config::AppConfig,
        handler: Arc<IntakeHandler>,
        registry: Arc<ConnectionRegistry>,
        logger: Logger,
    ) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Self::start(&cfg, handler, registry, logger)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn io_thread_count(&self) -> usize {
        self.io_threads.len()
    }

    /// Accepts one pending connection, if any, and hands it to an I/O thread.
    pub fn try_accept(&self) -> Result<Option<SocketAddr>, ServerError> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(source) => return Err(ServerError::Accept { source }),
        };

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = InboundConnection::new(id, stream, peer_addr)?;
        let slot = self.next_dispatch.fetch_add(1, Ordering::Relaxed) % self.dispatchers.len();
        if let Err(returned) = self.dispatchers[slot].send(connection) {
            returned.0.shutdown();
            return Ok(None);
        }

        self.logger.log(
            LogLevel::Debug,
            Some("server::accept"),
            "Accepted intake connection",
            Some(json!({
                "connection_id": id,
                "remote_addr": peer_addr.to_string(),
                "io_thread": slot,
            })),
        );
        Ok(Some(peer_addr))
    }

    /// Closes every connection and joins the I/O threads.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.dispatchers.clear();
        for handle in self.io_threads.drain(..) {
            if handle.join().is_err() {
                self.logger.log(
                    LogLevel::Error,
                    Some("server::shutdown"),
                    "I/O thread panicked",
                    None,
                );
            }
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_io_thread(receiver: Receiver<InboundConnection>, context: IoContext) {
    let mut connections: Vec<InboundConnection> = Vec::new();
    let mut read_buffer = vec![0_u8; READ_BUFFER_SIZE];

    while !context.stop.load(Ordering::SeqCst) {
        loop {
            match receiver.try_recv() {
                Ok(connection) => connections.push(connection),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let mut active = false;
        connections.retain_mut(|connection| {
            match poll_connection(connection, &mut read_buffer, &context) {
                PollResult::Active => {
                    active = true;
                    true
                }
                PollResult::Idle => true,
                PollResult::Close(reason) => {
                    close_connection(connection, &context, reason);
                    false
                }
            }
        });

        if !active {
            thread::sleep(IDLE_SLEEP);
        }
    }

    for connection in &connections {
        close_connection(connection, &context, "server shutdown");
    }
}

fn poll_connection(
    connection: &mut InboundConnection,
    read_buffer: &mut [u8],
    context: &IoContext,
) -> PollResult {
    let size = match connection.try_read(read_buffer) {
        Ok(0) => return PollResult::Close("peer closed"),
        Ok(size) => size,
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
            if connection.last_activity.elapsed() >= context.read_timeout {
                return PollResult::Close("read timeout");
            }
            return PollResult::Idle;
        }
        Err(error) if error.kind() == io::ErrorKind::Interrupted => return PollResult::Idle,
        Err(_) => return PollResult::Close("transport error"),
    };

    connection.last_activity = Instant::now();
    connection.inbound.extend_from_slice(&read_buffer[..size]);

    let (shared, _) = context.registry.get_or_register(connection.peer_addr);
    let handled = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
        context
            .handler
            .drain_inbound(&mut state, &mut connection.inbound)
    }));

    let replies = match handled {
        Ok(Ok(replies)) => replies,
        Ok(Err(error)) => {
            context.logger.log(
                LogLevel::Error,
                Some("server::intake"),
                "Intake handler rejected message",
                Some(json!({
                    "connection_id": connection.id,
                    "remote_addr": connection.peer_addr.to_string(),
                    "error": error.to_string(),
                })),
            );
            connection.inbound.clear();
            return PollResult::Active;
        }
        Err(_) => {
            context.logger.log(
                LogLevel::Error,
                Some("server::intake"),
                "Intake handler panicked; discarding buffered input",
                Some(json!({
                    "connection_id": connection.id,
                    "remote_addr": connection.peer_addr.to_string(),
                })),
            );
            connection.inbound.clear();
            return PollResult::Active;
        }
    };

    for reply in replies {
        if connection.write_reply(&reply).is_err() {
            return PollResult::Close("write failed");
        }
    }
    PollResult::Active
}

fn close_connection(connection: &InboundConnection, context: &IoContext, reason: &str) {
    connection.shutdown();
    let (opened_at, entity) = match context.registry.remove(connection.peer_addr) {
        Some(state) => {
            let state = state.lock().unwrap_or_else(PoisonError::into_inner);
            (
                Some(state.created_at().to_rfc3339()),
                state.entity().map(|entity| entity.to_string()),
            )
        }
        None => (None, None),
    };
    context.logger.log(
        LogLevel::Debug,
        Some("server::close"),
        "Closed intake connection",
        Some(json!({
            "connection_id": connection.id,
            "remote_addr": connection.peer_addr.to_string(),
            "opened_at": opened_at,
            "entity": entity,
            "reason": reason,
        })),
    );
}
