//! Client connection manager.
//!
//! A [`Client`] owns one connection at a time, the message id counter and the
//! table of outstanding calls. A background task drives the connection state
//! machine: `Disconnected -> Connecting -> Connected -> (Closed | Connecting)`.

use crate::call::{Call, CallEvent};
use crate::connection::{self, ClientConfig};
use crate::error::ClientError;
use crate::event::{ClientEvent, Events};
use bytes::Bytes;
use fastrpc_protocol::{
    next_msgid, route, Decoder, FrameSink, Message, RoutedBody, RpcEncoder, RpcError, Status,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};

/// How long queued frames may take to flush once a connection is detached.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet, or waiting to reconnect.
    Disconnected,
    /// Establishing a connection.
    Connecting,
    /// Connected; calls can be issued.
    Connected,
    /// Finished for good.
    Closed,
}

struct PendingCall {
    method: Arc<str>,
    started: Instant,
    tx: mpsc::UnboundedSender<CallEvent>,
}

/// Call table entry. Canceled ids stay reserved so late frames are discarded
/// instead of being reported as unsolicited or reaching a reused id.
enum CallSlot {
    Active(PendingCall),
    Canceled,
}

struct State {
    sink: Option<FrameSink>,
    calls: HashMap<u32, CallSlot>,
    /// Canceled ids in cancellation order, oldest first.
    canceled: VecDeque<u32>,
    last_msgid: u32,
    started: bool,
    user_closed: bool,
    idle_timeout: Option<Duration>,
    last_error: Option<ClientError>,
}

impl State {
    fn new() -> Self {
        Self {
            sink: None,
            calls: HashMap::new(),
            canceled: VecDeque::new(),
            last_msgid: 0,
            started: false,
            user_closed: false,
            idle_timeout: None,
            last_error: None,
        }
    }

    /// Next id not held by an active or canceled call.
    fn allocate_msgid(&mut self) -> u32 {
        loop {
            self.last_msgid = next_msgid(self.last_msgid);
            if !self.calls.contains_key(&self.last_msgid) {
                return self.last_msgid;
            }
        }
    }

    /// Reserves a canceled id. Past `limit` placeholders the oldest is
    /// released, and a late frame for it is reported as unsolicited.
    fn park_canceled(&mut self, msgid: u32, limit: usize) {
        self.calls.insert(msgid, CallSlot::Canceled);
        self.canceled.push_back(msgid);
        while self.canceled.len() > limit {
            let Some(oldest) = self.canceled.pop_front() else {
                break;
            };
            if matches!(self.calls.get(&oldest), Some(CallSlot::Canceled)) {
                self.calls.remove(&oldest);
            }
        }
    }

    /// Removes a finished call.
    fn release(&mut self, msgid: u32) {
        if let Some(CallSlot::Canceled) = self.calls.remove(&msgid) {
            self.canceled.retain(|id| *id != msgid);
        }
    }

    fn active_ids(&self) -> Vec<u32> {
        self.calls
            .iter()
            .filter(|(_, slot)| matches!(slot, CallSlot::Active(_)))
            .map(|(id, _)| *id)
            .collect()
    }
}

pub(crate) struct Shared {
    config: ClientConfig,
    state: Mutex<State>,
    events: Events,
    phase: watch::Sender<ConnectionState>,
}

impl Shared {
    fn set_phase(&self, phase: ConnectionState) {
        self.phase.send_replace(phase);
    }

    fn is_closed(&self) -> bool {
        self.state.lock().user_closed
    }

    /// Installs the outbound queue of a fresh connection.
    fn attach(&self, sink: FrameSink) -> bool {
        let mut state = self.state.lock();
        if state.user_closed {
            return false;
        }
        state.sink = Some(sink);
        true
    }

    /// Drops the outbound queue and fails every call still in the table.
    fn detach(&self) {
        let calls = {
            let mut state = self.state.lock();
            state.sink = None;
            state.canceled.clear();
            std::mem::take(&mut state.calls)
        };

        let mut failed = 0;
        for (_, slot) in calls {
            if let CallSlot::Active(call) = slot {
                let _ = call.tx.send(CallEvent::Error(ClientError::ConnectionClosed));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!("Failed {} pending calls: connection closed", failed);
        }
    }

    pub(crate) fn cancel(&self, msgid: u32, err: Option<RpcError>) {
        let err = err.unwrap_or_else(RpcError::canceled);
        self.abort_call(msgid, &err, ClientError::Canceled(err.clone()));
    }

    /// Fails an active call locally with `local` and sends `wire` to the peer.
    fn abort_call(&self, msgid: u32, wire: &RpcError, local: ClientError) {
        let mut state = self.state.lock();
        if !matches!(state.calls.get(&msgid), Some(CallSlot::Active(_))) {
            return;
        }
        let Some(CallSlot::Active(call)) = state.calls.remove(&msgid) else {
            return;
        };
        state.park_canceled(msgid, self.config.max_canceled);

        tracing::debug!("Canceling call {} ({}): {}", msgid, call.method, wire);
        let _ = call.tx.send(CallEvent::Error(local));

        if let Some(sink) = state.sink.clone() {
            let encoder = RpcEncoder::new(sink, msgid, call.method).with_start(call.started);
            if let Err(e) = encoder.send_error(wire) {
                tracing::warn!("Failed to send cancellation for call {}: {}", msgid, e);
            }
        }
    }

    /// Delivers one inbound message to the call that owns its id.
    fn dispatch(&self, msg: Message) {
        let routed = match route(msg) {
            Ok(routed) => routed,
            Err(e) => {
                tracing::warn!("Dropping invalid message: {}", e);
                self.events.emit(ClientEvent::Error(e.into()));
                return;
            }
        };

        let msgid = routed.msgid;
        let terminal = routed.status.is_terminal();
        let mut state = self.state.lock();

        match state.calls.get(&msgid) {
            None => {
                drop(state);
                tracing::warn!("Unsolicited message for msgid {}", msgid);
                self.events
                    .emit(ClientEvent::Error(ClientError::UnsolicitedMessage(msgid)));
                return;
            }
            Some(CallSlot::Canceled) => {
                tracing::trace!("Discarding message for canceled call {}", msgid);
            }
            Some(CallSlot::Active(call)) => {
                // One ordered channel per call: trailing END data is queued
                // ahead of End, so the end never overtakes a data item.
                match routed.body {
                    RoutedBody::Args(args) if routed.status == Status::Data => {
                        let _ = call.tx.send(CallEvent::Message(args));
                    }
                    RoutedBody::Args(args) => {
                        if !args.is_empty() {
                            let _ = call.tx.send(CallEvent::Message(args));
                        }
                        let _ = call.tx.send(CallEvent::End);
                    }
                    RoutedBody::Error(err) => {
                        let _ = call.tx.send(CallEvent::Error(ClientError::Remote(err)));
                    }
                }
                if terminal {
                    tracing::debug!(
                        "Call {} ({}) finished in {:?}",
                        msgid,
                        call.method,
                        call.started.elapsed()
                    );
                }
            }
        }

        if terminal {
            state.release(msgid);
        }
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.state.lock().idle_timeout
    }

    /// Runs one established connection until it is lost or the client closes.
    async fn serve(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        let (sink, frames) = mpsc::unbounded_channel();

        if !self.attach(sink) {
            tracing::debug!("Client closed while connecting, dropping connection to {}", addr);
            return Ok(());
        }

        let mut writer_task = tokio::spawn(write_loop(writer, frames));
        self.set_phase(ConnectionState::Connected);
        tracing::info!("Connected to {}", addr);
        self.events.emit(ClientEvent::Connect { addr });

        let mut writer_done = false;
        let result = tokio::select! {
            r = self.read_loop(reader) => r,
            r = &mut writer_task => {
                writer_done = true;
                match r {
                    Ok(res) => res,
                    Err(e) => Err(ClientError::from(std::io::Error::other(e))),
                }
            }
            _ = shutdown.changed() => Ok(()),
        };

        self.detach();
        self.set_phase(ConnectionState::Disconnected);

        // Let already queued frames (cancellations) reach the wire.
        if !writer_done
            && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
                .await
                .is_err()
        {
            writer_task.abort();
        }

        tracing::info!("Disconnected from {}", addr);
        result
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf) -> Result<(), ClientError> {
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            // A new idle timeout applies from the next read on.
            let read = match self.idle_timeout() {
                Some(idle) => match tokio::time::timeout(idle, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        tracing::debug!("No data for {:?}", idle);
                        self.events.emit(ClientEvent::Timeout { idle });
                        continue;
                    }
                },
                None => reader.read(&mut buf).await,
            };

            let n = read?;
            if n == 0 {
                tracing::debug!("Connection closed by server");
                return Ok(());
            }

            tracing::trace!("Received {} bytes", n);
            decoder.extend(&buf[..n]);

            loop {
                match decoder.decode_message() {
                    Ok(Some(msg)) => self.dispatch(msg),
                    Ok(None) => break,
                    Err(e) if !e.is_fatal() => {
                        tracing::warn!("Dropping frame: {}", e);
                        self.events.emit(ClientEvent::Error(e.into()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// Final transition to `Closed`.
    fn finish(&self, had_error: bool) {
        self.detach();
        self.set_phase(ConnectionState::Closed);
        tracing::info!("Client for {}:{} closed", self.config.host, self.config.port);
        self.events.emit(ClientEvent::Close {
            had_error,
            reconnecting: false,
        });
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), ClientError> {
    while let Some(frame) = frames.recv().await {
        writer.write_all(&frame).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Drives connect, serve and reconnect until the client is done.
async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut had_error = false;

    loop {
        if shared.is_closed() {
            break;
        }
        shared.set_phase(ConnectionState::Connecting);

        let established = tokio::select! {
            res = connection::establish(&shared.config, &shared.events) => res,
            // Closing mid-attempt discards whatever the attempt would yield.
            _ = shutdown.changed() => break,
        };

        let (stream, addr) = match established {
            Ok(connected) => connected,
            Err(e) => {
                if !shared.is_closed() {
                    tracing::warn!(
                        "Unable to connect to {}:{}: {}",
                        shared.config.host,
                        shared.config.port,
                        e
                    );
                    shared.state.lock().last_error = Some(e.clone());
                    shared.events.emit(ClientEvent::Error(e));
                }
                break;
            }
        };

        had_error = match shared.serve(stream, addr, &mut shutdown).await {
            Ok(()) => false,
            Err(e) => {
                tracing::debug!("Connection to {} failed: {}", addr, e);
                shared.events.emit(ClientEvent::Error(e));
                true
            }
        };

        let delay = match shared.config.reconnect.delay() {
            Some(delay) if !shared.is_closed() => delay,
            _ => break,
        };

        shared.events.emit(ClientEvent::Close {
            had_error,
            reconnecting: true,
        });
        tracing::info!("Reconnecting in {:?}", delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.finish(had_error);
}

/// Client for a fastrpc server.
pub struct Client {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Client {
    /// Creates a new client (not yet connecting).
    pub fn new(config: ClientConfig) -> Self {
        let (phase, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::new()),
                events: Events::new(),
                phase,
            }),
            shutdown,
            shutdown_rx,
        }
    }

    /// Starts the background connection manager. Must be called from within
    /// a Tokio runtime. Calling it again has no effect.
    pub fn start(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.started || state.user_closed {
                return;
            }
            state.started = true;
        }
        tracing::debug!(
            "Starting client for {}:{}",
            self.shared.config.host,
            self.shared.config.port
        );
        tokio::spawn(run(self.shared.clone(), self.shutdown_rx.clone()));
    }

    /// Starts the client and waits until it is connected, or until connection
    /// establishment has failed for good.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.start();
        let mut phase = self.shared.phase.subscribe();
        loop {
            let current = *phase.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => {
                    let state = self.shared.state.lock();
                    return Err(state
                        .last_error
                        .clone()
                        .unwrap_or(ClientError::ConnectionClosed));
                }
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }
            if phase.changed().await.is_err() {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.phase.borrow()
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Issues a call.
    ///
    /// Without an open connection the call fails with
    /// [`ClientError::NotConnected`] on its first event and is never
    /// registered.
    pub fn rpc(&self, method: &str, args: Vec<Value>) -> Call {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&self.shared);
        let mut state = self.shared.state.lock();

        let Some(sink) = state.sink.clone() else {
            drop(state);
            tracing::debug!("rpc({}) called but not connected", method);
            let _ = tx.send(CallEvent::Error(ClientError::NotConnected));
            return Call::new(0, method.to_string(), rx, weak);
        };

        let msgid = state.allocate_msgid();
        let encoder = RpcEncoder::new(sink, msgid, method);
        if let Err(e) = encoder.send_data(args) {
            drop(state);
            tracing::warn!("Failed to encode call {} ({}): {}", msgid, method, e);
            let _ = tx.send(CallEvent::Error(e.into()));
            return Call::new(0, method.to_string(), rx, weak);
        }

        tracing::debug!("Sent call {} ({})", msgid, method);
        state.calls.insert(
            msgid,
            CallSlot::Active(PendingCall {
                method: Arc::from(method),
                started: Instant::now(),
                tx,
            }),
        );
        Call::new(msgid, method.to_string(), rx, weak)
    }

    /// Cancels a pending call; a no-op if it already finished.
    pub fn cancel(&self, msgid: u32, err: Option<RpcError>) {
        self.shared.cancel(msgid, err);
    }

    /// Cancels every pending call.
    pub fn cancel_all(&self, err: Option<RpcError>) {
        let ids = self.shared.state.lock().active_ids();
        for msgid in ids {
            self.shared.cancel(msgid, err.clone());
        }
    }

    /// Returns the number of calls awaiting completion.
    pub fn pending_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .calls
            .values()
            .filter(|slot| matches!(slot, CallSlot::Active(_)))
            .count()
    }

    /// Emits [`ClientEvent::Timeout`] whenever no bytes arrive for `timeout`.
    /// A zero duration turns the timeout off.
    pub fn set_timeout(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut state = self.shared.state.lock();
        if state.sink.is_none() {
            return Err(ClientError::NotConnected);
        }
        state.idle_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        Ok(())
    }

    /// Closes the client.
    ///
    /// Pending calls fail with [`ClientError::ConnectionClosed`], no further
    /// connection attempt is made and only the final close event is emitted.
    pub fn close(&self) {
        let started = {
            let mut state = self.shared.state.lock();
            if state.user_closed {
                return;
            }
            state.user_closed = true;
            state.started
        };
        tracing::debug!(
            "Closing client for {}:{}",
            self.shared.config.host,
            self.shared.config.port
        );
        self.shared.events.mute();

        let ids = self.shared.state.lock().active_ids();
        let wire = RpcError::new("ConnectionClosedError", ClientError::ConnectionClosed.to_string());
        for msgid in ids {
            self.shared
                .abort_call(msgid, &wire, ClientError::ConnectionClosed);
        }

        let _ = self.shutdown.send(true);
        if !started {
            self.shared.finish(false);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
