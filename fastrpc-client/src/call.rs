//! Handle for one outstanding RPC.

use crate::client::Shared;
use crate::error::ClientError;
use fastrpc_protocol::RpcError;
use serde_json::Value;
use std::sync::Weak;
use tokio::sync::mpsc;

/// Events delivered to a call, in send order.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// One data item (the arguments of a `DATA` frame or trailing `END` data).
    Message(Vec<Value>),
    /// The call completed.
    End,
    /// The call failed.
    Error(ClientError),
}

impl CallEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallEvent::End | CallEvent::Error(_))
    }
}

/// A call in flight.
///
/// Every call yields exactly one terminal event (`End` or `Error`), after which
/// [`Call::next`] returns `None`.
pub struct Call {
    msgid: u32,
    method: String,
    events: mpsc::UnboundedReceiver<CallEvent>,
    client: Weak<Shared>,
    done: bool,
}

impl Call {
    pub(crate) fn new(
        msgid: u32,
        method: String,
        events: mpsc::UnboundedReceiver<CallEvent>,
        client: Weak<Shared>,
    ) -> Self {
        Self {
            msgid,
            method,
            events,
            client,
            done: false,
        }
    }

    /// The call's message id; 0 if the call was never sent.
    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Waits for the next event.
    pub async fn next(&mut self) -> Option<CallEvent> {
        if self.done {
            return None;
        }
        let event = match self.events.recv().await {
            Some(event) => event,
            // The client went away without settling the call.
            None => CallEvent::Error(ClientError::ConnectionClosed),
        };
        if event.is_terminal() {
            self.done = true;
        }
        Some(event)
    }

    /// Cancels the call with the generic cancellation error.
    pub fn cancel(&self) {
        self.cancel_with(RpcError::canceled());
    }

    /// Cancels the call, failing it locally with `err` and telling the server.
    pub fn cancel_with(&self, err: RpcError) {
        if let Some(shared) = self.client.upgrade() {
            shared.cancel(self.msgid, Some(err));
        }
    }

    /// Collects every data item until the call ends.
    pub async fn collect(mut self) -> Result<Vec<Vec<Value>>, ClientError> {
        let mut items = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                CallEvent::Message(args) => items.push(args),
                CallEvent::End => return Ok(items),
                CallEvent::Error(e) => return Err(e),
            }
        }
        Ok(items)
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("msgid", &self.msgid)
            .field("method", &self.method)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detached() -> (mpsc::UnboundedSender<CallEvent>, Call) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Call::new(1, "test".to_string(), rx, Weak::new()))
    }

    #[tokio::test]
    async fn test_next_stops_after_terminal() {
        let (tx, mut call) = detached();
        tx.send(CallEvent::Message(vec![json!(1)])).unwrap();
        tx.send(CallEvent::End).unwrap();
        tx.send(CallEvent::Message(vec![json!(2)])).unwrap();

        assert!(matches!(call.next().await, Some(CallEvent::Message(_))));
        assert!(matches!(call.next().await, Some(CallEvent::End)));
        assert!(call.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_sender_is_connection_closed() {
        let (tx, mut call) = detached();
        drop(tx);

        assert!(matches!(
            call.next().await,
            Some(CallEvent::Error(ClientError::ConnectionClosed))
        ));
        assert!(call.next().await.is_none());
    }

    #[tokio::test]
    async fn test_collect() {
        let (tx, call) = detached();
        tx.send(CallEvent::Message(vec![json!("a")])).unwrap();
        tx.send(CallEvent::Message(vec![json!("b"), json!("c")])).unwrap();
        tx.send(CallEvent::End).unwrap();

        let items = call.collect().await.unwrap();
        assert_eq!(items, vec![vec![json!("a")], vec![json!("b"), json!("c")]]);
    }

    #[tokio::test]
    async fn test_collect_error() {
        let (tx, call) = detached();
        tx.send(CallEvent::Message(vec![json!("a")])).unwrap();
        tx.send(CallEvent::Error(ClientError::Remote(RpcError::msg("nope"))))
            .unwrap();

        let err = call.collect().await.unwrap_err();
        assert_eq!(err.remote().unwrap().message, "nope");
    }

    #[test]
    fn test_cancel_without_client_is_noop() {
        let (_tx, call) = detached();
        call.cancel();
    }
}
