//! Client lifecycle events.

use crate::error::ClientError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default capacity for the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observable connection events.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A connection was established.
    Connect { addr: SocketAddr },
    /// The connection went away. `reconnecting` is false for the final close.
    Close { had_error: bool, reconnecting: bool },
    /// A connection-level failure. Never tied to a single call.
    Error(ClientError),
    /// A connection attempt is starting.
    ConnectAttempt { attempt: u32, addr: SocketAddr },
    /// A connection attempt failed; a retry may follow.
    ConnectError { attempt: u32, error: ClientError },
    /// No bytes were received for the configured idle timeout.
    Timeout { idle: Duration },
}

/// Event fan-out that goes quiet once the client is closed by the user.
pub(crate) struct Events {
    tx: broadcast::Sender<ClientEvent>,
    muted: AtomicBool,
}

impl Events {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            muted: AtomicBool::new(false),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Suppresses everything but the final close event.
    pub(crate) fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        if self.muted.load(Ordering::SeqCst) && !matches!(event, ClientEvent::Close { .. }) {
            return;
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muted_events_only_pass_close() {
        let events = Events::new();
        let mut rx = events.subscribe();

        events.emit(ClientEvent::Error(ClientError::NotConnected));
        events.mute();
        events.emit(ClientEvent::Error(ClientError::ConnectionClosed));
        events.emit(ClientEvent::Close {
            had_error: false,
            reconnecting: false,
        });

        assert!(matches!(rx.try_recv(), Ok(ClientEvent::Error(ClientError::NotConnected))));
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::Close { .. })));
        assert!(rx.try_recv().is_err());
    }
}
