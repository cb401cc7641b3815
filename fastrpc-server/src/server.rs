//! TCP server implementation.

use crate::error::ServerError;
use crate::handler::{Handler, Registry};
use crate::session::Session;
use bytes::Bytes;
use fastrpc_protocol::{
    route, Completion, Decoder, FrameSink, Message, RoutedBody, RpcEncoder, RpcError, Status,
    INTERNAL_ERROR,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default event channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Reject calls to methods without a handler.
    pub check_defined: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, fastrpc_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            check_defined: true,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_check_defined(mut self, check: bool) -> Self {
        self.check_defined = check;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub cancelled_total: AtomicU64,
    pub handler_faults: AtomicU64,
}

/// Observable server events.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection failed or sent something unusable.
    ClientError {
        session_id: String,
        addr: SocketAddr,
        error: String,
    },
    /// A call completed with `END`.
    After(Completion),
    /// A handler panicked. The call has already been failed with an
    /// `InternalError`; `rpc` is its encoder.
    HandlerFault {
        method: String,
        msgid: u32,
        fault: String,
        args: Arc<Vec<Value>>,
        rpc: RpcEncoder,
    },
    /// The client canceled a call in flight.
    Cancelled { method: String, msgid: u32 },
}

struct Inner {
    config: ServerConfig,
    handlers: Registry,
    stats: ServerStats,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// TCP server for fastrpc.
///
/// Cheap to clone; clones share handlers, stats and shutdown.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                handlers: Registry::new(),
                stats: ServerStats::default(),
                events,
                shutdown: CancellationToken::new(),
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Registers the handler for `name`.
    pub fn rpc(&self, name: impl Into<String>, handler: impl Handler) -> Result<(), ServerError> {
        self.inner.handlers.register(name, handler)
    }

    pub fn handlers(&self) -> &Registry {
        &self.inner.handlers
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &ServerStats {
        &self.inner.stats
    }

    /// Subscribes to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the bound address once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Binds and accepts connections in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// binding port 0.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        tokio::spawn(self.inner.clone().accept_loop(listener));
        Ok(addr)
    }

    /// Binds and accepts connections until [`Server::close`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.inner.clone().accept_loop(listener).await;
        Ok(())
    }

    /// Stops accepting and closes every connection. Calls in flight are
    /// canceled.
    pub fn close(&self) {
        tracing::debug!("Server close requested");
        self.inner.shutdown.cancel();
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ServerError::ShuttingDown);
        }
        let listener = TcpListener::bind(self.inner.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);
        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", addr);
        Ok(listener)
    }
}

impl Inner {
    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let inner = self.clone();
                            tokio::spawn(async move {
                                inner.handle_connection(stream, addr).await;
                                inner.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut session = Session::new(addr);
        tracing::debug!("[{}] New connection from {}", session.id, addr);

        stream.set_nodelay(true).ok();
        let (mut reader, writer) = stream.into_split();
        let (sink, frames) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let writer_stop = CancellationToken::new();
        let mut writer_task = tokio::spawn(write_loop(writer, frames, writer_stop.clone()));

        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result: Result<(), ServerError> = loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break Ok(()),
                        Ok(n) => n,
                        Err(e) => break Err(e.into()),
                    };
                    tracing::trace!("[{}] Received {} bytes", session.id, n);
                    decoder.extend(&buf[..n]);

                    if let Err(e) = self.drain(&mut session, &mut decoder, &sink, &done_tx) {
                        break Err(e.into());
                    }
                }
                Some(done) = done_rx.recv() => {
                    self.complete(&mut session, done);
                }
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("[{}] Closing connection: server shutting down", session.id);
                    break Ok(());
                }
            }
        };

        // Handlers may outlive the connection holding encoder clones, and with
        // them the sink. Cancel the calls and stop the writer explicitly.
        let canceled = session.cancel_all();
        if !canceled.is_empty() {
            tracing::debug!(
                "[{}] Canceled {} calls on disconnect",
                session.id,
                canceled.len()
            );
        }
        drop(canceled);
        drop(sink);
        drop(done_tx);
        writer_stop.cancel();

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
            .await
            .is_err()
        {
            writer_task.abort();
        }

        if let Err(e) = result {
            tracing::debug!("[{}] Connection error: {}", session.id, e);
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            self.emit(ServerEvent::ClientError {
                session_id: session.id.clone(),
                addr,
                error: e.to_string(),
            });
        }

        tracing::debug!(
            "[{}] Connection closed after {:?} ({} calls)",
            session.id,
            session.age(),
            session.request_count()
        );
    }

    /// Dispatches every complete message in the buffer. Returns the error that
    /// makes the stream unusable, if any.
    fn drain(
        &self,
        session: &mut Session,
        decoder: &mut Decoder,
        sink: &FrameSink,
        done_tx: &mpsc::UnboundedSender<Completion>,
    ) -> Result<(), fastrpc_protocol::ProtocolError> {
        loop {
            match decoder.decode_message() {
                Ok(Some(msg)) => self.dispatch(session, msg, sink, done_tx),
                Ok(None) => return Ok(()),
                Err(e) if !e.is_fatal() => {
                    tracing::warn!("[{}] Dropping frame: {}", session.id, e);
                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    self.emit(ServerEvent::ClientError {
                        session_id: session.id.clone(),
                        addr: session.remote_addr,
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(
        &self,
        session: &mut Session,
        msg: Message,
        sink: &FrameSink,
        done_tx: &mpsc::UnboundedSender<Completion>,
    ) {
        let routed = match route(msg) {
            Ok(routed) => routed,
            Err(e) => {
                tracing::warn!("[{}] Invalid message: {}", session.id, e);
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                self.emit(ServerEvent::ClientError {
                    session_id: session.id.clone(),
                    addr: session.remote_addr,
                    error: e.to_string(),
                });
                return;
            }
        };

        let msgid = routed.msgid;
        let method = routed.method.name;

        // An error from the client cancels the call it names.
        let args = match routed.body {
            RoutedBody::Error(err) => {
                match session.cancel(msgid) {
                    Some(rpc) => {
                        tracing::debug!(
                            "[{}] Call {} ({}) canceled by client: {}",
                            session.id,
                            msgid,
                            rpc.method(),
                            err
                        );
                        self.stats.cancelled_total.fetch_add(1, Ordering::Relaxed);
                        self.emit(ServerEvent::Cancelled {
                            method: rpc.method().to_string(),
                            msgid,
                        });
                    }
                    None => {
                        tracing::debug!(
                            "[{}] Ignoring cancellation of unknown call {}",
                            session.id,
                            msgid
                        );
                    }
                }
                return;
            }
            RoutedBody::Args(args) => args,
        };

        if session.contains(msgid) {
            tracing::warn!(
                "[{}] Ignoring {:?} for call {} already in flight",
                session.id,
                routed.status,
                msgid
            );
            return;
        }

        let shared_args = Arc::new(args.clone());
        let rpc = RpcEncoder::new(sink.clone(), msgid, method.as_str())
            .with_args(shared_args.clone())
            .with_completions(done_tx.clone());

        let Some(handler) = self.handlers.get(&method) else {
            if self.config.check_defined {
                tracing::debug!("[{}] No handler for {}", session.id, method);
                if let Err(e) = rpc.send_error(&RpcError::no_handler(&method)) {
                    tracing::warn!("[{}] Failed to reject call {}: {}", session.id, msgid, e);
                }
            } else {
                tracing::debug!("[{}] No handler for {}, ignoring call", session.id, method);
            }
            return;
        };

        tracing::debug!("[{}] Call {} ({})", session.id, msgid, method);
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        session.begin(rpc.clone());

        let invoked = {
            let rpc = rpc.clone();
            std::panic::catch_unwind(AssertUnwindSafe(move || handler.call(args, rpc)))
        };

        if let Err(panic) = invoked {
            let fault = panic_message(panic.as_ref());
            tracing::error!(
                "[{}] Handler for {} panicked on call {}: {}",
                session.id,
                method,
                msgid,
                fault
            );
            self.stats.handler_faults.fetch_add(1, Ordering::Relaxed);

            if let Err(e) = rpc.send_error(&RpcError::new(INTERNAL_ERROR, fault.clone())) {
                tracing::warn!("[{}] Failed to fail call {}: {}", session.id, msgid, e);
            }
            self.emit(ServerEvent::HandlerFault {
                method,
                msgid,
                fault,
                args: shared_args,
                rpc,
            });
        }
    }

    fn complete(&self, session: &mut Session, done: Completion) {
        if session.finish(done.msgid).is_some() {
            tracing::debug!(
                "[{}] Call {} ({}) finished with {:?} in {:?}",
                session.id,
                done.msgid,
                done.method,
                done.status,
                done.elapsed
            );
        }
        if done.status == Status::End {
            self.emit(ServerEvent::After(done));
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Writes queued frames until every sink is gone or `stop` fires. On stop,
/// frames already queued are flushed and the queue is closed.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    stop: CancellationToken,
) -> Result<(), std::io::Error> {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => writer.write_all(&frame).await?,
                None => break,
            },
            _ = stop.cancelled() => {
                frames.close();
                while let Ok(frame) = frames.try_recv() {
                    writer.write_all(&frame).await?;
                }
                break;
            }
        }
    }
    writer.shutdown().await
}
