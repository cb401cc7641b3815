//! RPC correlation layer.
//!
//! [`RpcEncoder`] shapes the outbound side of one call (`msgid` + method) into
//! frames; [`route`] turns an inbound [`Message`] into a call-scoped event.

use crate::codec::Encoder;
use crate::error::{ProtocolError, RpcError};
use crate::frame::Status;
use crate::message::{Envelope, Message, MethodMeta, WireError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Outbound frame queue of one connection, drained in order by its writer.
pub type FrameSink = mpsc::UnboundedSender<Bytes>;

/// Emitted when an encoder sends a terminal frame.
#[derive(Debug, Clone)]
pub struct Completion {
    pub msgid: u32,
    pub method: String,
    /// `End` or `Error`.
    pub status: Status,
    /// Time since the call started.
    pub elapsed: Duration,
    /// Arguments the call was started with.
    pub args: Arc<Vec<Value>>,
}

/// Sends the frames of one call.
///
/// Clones share cancellation and completion state. Once the call is canceled
/// or a terminal frame has been sent, further sends are dropped without
/// touching the wire.
#[derive(Debug, Clone)]
pub struct RpcEncoder {
    msgid: u32,
    method: Arc<str>,
    sink: FrameSink,
    started: Instant,
    args: Arc<Vec<Value>>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    completions: Option<mpsc::UnboundedSender<Completion>>,
}

impl RpcEncoder {
    pub fn new(sink: FrameSink, msgid: u32, method: impl Into<Arc<str>>) -> Self {
        Self {
            msgid,
            method: method.into(),
            sink,
            started: Instant::now(),
            args: Arc::new(Vec::new()),
            cancel: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
            completions: None,
        }
    }

    /// Records the arguments the call was started with.
    pub fn with_args(mut self, args: Arc<Vec<Value>>) -> Self {
        self.args = args;
        self
    }

    /// Overrides the call start time used for elapsed measurements.
    pub fn with_start(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }

    /// Reports terminal sends on `tx`.
    pub fn with_completions(mut self, tx: mpsc::UnboundedSender<Completion>) -> Self {
        self.completions = Some(tx);
        self
    }

    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Sends one `DATA` frame carrying `args`.
    pub fn send_data(&self, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.send(Status::Data, Payload::Args(args))
    }

    /// Sends the `END` frame, optionally carrying trailing data.
    pub fn send_end(&self, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.send(Status::End, Payload::Args(args))
    }

    /// Terminates the call with an `ERROR` frame.
    pub fn send_error(&self, err: &RpcError) -> Result<(), ProtocolError> {
        self.send(Status::Error, Payload::Error(err))
    }

    /// Marks the call canceled and wakes anyone waiting on [`Self::canceled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the call has been canceled.
    pub fn canceled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Returns a token tied to this call's cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns whether a terminal frame has been sent.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn send(&self, status: Status, payload: Payload<'_>) -> Result<(), ProtocolError> {
        if self.is_canceled() {
            tracing::debug!(msgid = self.msgid, method = %self.method, "dropping send on canceled call");
            return Ok(());
        }
        if self.is_finished() {
            tracing::debug!(msgid = self.msgid, method = %self.method, "call already finished");
            return Ok(());
        }

        let meta = MethodMeta::now(self.method.as_ref());
        let envelope = match payload {
            Payload::Args(args) => Envelope::args(meta, args),
            Payload::Error(err) => Envelope::error(meta, err),
        };
        let encoded = Encoder::encode_envelope(self.msgid, status, &envelope)?;

        // Only one terminal frame per call, even across clones.
        if status.is_terminal() && self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::trace!(
            msgid = self.msgid,
            method = %self.method,
            status = ?status,
            data = %envelope.data,
            "rpc-msg"
        );

        if self.sink.send(encoded.freeze()).is_err() {
            tracing::debug!(msgid = self.msgid, method = %self.method, "connection gone, frame dropped");
        }

        if status.is_terminal() {
            let elapsed = self.started.elapsed();
            tracing::trace!(msgid = self.msgid, method = %self.method, ?elapsed, "rpc-done");
            if let Some(ref tx) = self.completions {
                let _ = tx.send(Completion {
                    msgid: self.msgid,
                    method: self.method.to_string(),
                    status,
                    elapsed,
                    args: self.args.clone(),
                });
            }
        }

        Ok(())
    }
}

enum Payload<'a> {
    Args(Vec<Value>),
    Error(&'a RpcError),
}

/// Body of a routed message.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedBody {
    /// Arguments of a call, or result items of a response.
    Args(Vec<Value>),
    /// Error carried by an `ERROR` frame.
    Error(RpcError),
}

/// A message resolved to its call.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub msgid: u32,
    pub status: Status,
    pub method: MethodMeta,
    pub body: RoutedBody,
    pub received_at: DateTime<Utc>,
}

/// Extracts the method and body from a decoded message.
///
/// Fails with [`ProtocolError::MalformedMessage`] when the envelope lacks a
/// method name or data.
pub fn route(msg: Message) -> Result<RoutedMessage, ProtocolError> {
    let Value::Object(mut obj) = msg.data else {
        return Err(ProtocolError::MalformedMessage("payload is not an object"));
    };

    let method = match obj.remove("m") {
        Some(m) => serde_json::from_value::<MethodMeta>(m)
            .map_err(|_| ProtocolError::MalformedMessage("invalid method metadata"))?,
        None => return Err(ProtocolError::MalformedMessage("missing method")),
    };

    let data = match obj.remove("d") {
        Some(Value::Null) | None => return Err(ProtocolError::MalformedMessage("missing data")),
        Some(d) => d,
    };

    let body = match (msg.status, data) {
        (Status::Error, Value::Object(err)) => {
            let wire: WireError = serde_json::from_value(Value::Object(err))
                .map_err(|_| ProtocolError::MalformedMessage("invalid error object"))?;
            RoutedBody::Error(wire.into())
        }
        (Status::Error, other) => RoutedBody::Error(RpcError::msg(other.to_string())),
        (_, Value::Array(args)) => RoutedBody::Args(args),
        (_, _) => return Err(ProtocolError::MalformedMessage("data is not an array")),
    };

    Ok(RoutedMessage {
        msgid: msg.msgid,
        status: msg.status,
        method,
        body,
        received_at: msg.received_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use serde_json::json;

    fn drain_messages(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Message> {
        let mut decoder = Decoder::new();
        while let Ok(bytes) = rx.try_recv() {
            decoder.extend_bytes(bytes);
        }
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode_message().unwrap() {
            out.push(msg);
        }
        out
    }

    fn message(status: Status, data: Value) -> Message {
        Message {
            version: crate::PROTOCOL_VERSION,
            payload_type: crate::TYPE_JSON,
            status,
            msgid: 11,
            checksum: 0,
            length: 0,
            data,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_streaming_sends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let encoder = RpcEncoder::new(tx, 5, "stream");

        for i in 1..=3 {
            encoder.send_data(vec![json!({ "i": i })]).unwrap();
        }
        encoder.send_end(vec![]).unwrap();

        let msgs = drain_messages(&mut rx);
        assert_eq!(msgs.len(), 4);
        for (i, msg) in msgs[..3].iter().enumerate() {
            assert_eq!(msg.msgid, 5);
            assert_eq!(msg.status, Status::Data);
            assert_eq!(msg.data["m"]["name"], "stream");
            assert_eq!(msg.data["d"], json!([{ "i": i + 1 }]));
        }
        assert_eq!(msgs[3].status, Status::End);
        assert_eq!(msgs[3].data["d"], json!([]));
        assert!(encoder.is_finished());
    }

    #[test]
    fn test_send_error_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let encoder = RpcEncoder::new(tx, 9, "err");

        encoder
            .send_error(&RpcError::msg("suck it, mr. client"))
            .unwrap();

        let msgs = drain_messages(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status, Status::Error);
        assert_eq!(msgs[0].data["d"]["message"], "suck it, mr. client");
        assert_eq!(msgs[0].data["d"]["name"], "Error");
    }

    #[test]
    fn test_no_sends_after_terminal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let encoder = RpcEncoder::new(tx, 1, "once");

        encoder.send_end(vec![json!(1)]).unwrap();
        encoder.send_data(vec![json!(2)]).unwrap();
        encoder.send_end(vec![]).unwrap();
        encoder.send_error(&RpcError::msg("late")).unwrap();

        assert_eq!(drain_messages(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_canceled_call_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let encoder = RpcEncoder::new(tx, 1, "slow");
        let clone = encoder.clone();

        clone.cancel();
        assert!(encoder.is_canceled());
        encoder.canceled().await;

        encoder.send_data(vec![json!("x")]).unwrap();
        encoder.send_end(vec![]).unwrap();
        assert!(drain_messages(&mut rx).is_empty());
        assert!(!encoder.is_finished());
    }

    #[test]
    fn test_completion_reported_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (ctx, mut crx) = mpsc::unbounded_channel();
        let encoder = RpcEncoder::new(tx, 3, "echo")
            .with_args(Arc::new(vec![json!("world")]))
            .with_completions(ctx);

        encoder.send_data(vec![json!("a")]).unwrap();
        assert!(crx.try_recv().is_err());

        encoder.send_end(vec![json!("world")]).unwrap();
        encoder.send_end(vec![]).unwrap();

        let done = crx.try_recv().unwrap();
        assert_eq!(done.msgid, 3);
        assert_eq!(done.method, "echo");
        assert_eq!(done.status, Status::End);
        assert_eq!(done.args.as_slice(), &[json!("world")]);
        assert!(crx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_connection_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let encoder = RpcEncoder::new(tx, 1, "gone");
        assert!(encoder.send_end(vec![]).is_ok());
    }

    #[test]
    fn test_route_call() {
        let routed = route(message(
            Status::Data,
            json!({"m": {"name": "echo", "uts": 5}, "d": ["hello", 1]}),
        ))
        .unwrap();

        assert_eq!(routed.msgid, 11);
        assert_eq!(routed.method.name, "echo");
        assert_eq!(routed.body, RoutedBody::Args(vec![json!("hello"), json!(1)]));
    }

    #[test]
    fn test_route_error() {
        let routed = route(message(
            Status::Error,
            json!({"m": {"name": "x", "uts": 5}, "d": {"name": "RpcCanceledError", "message": "RPC canceled"}}),
        ))
        .unwrap();

        match routed.body {
            RoutedBody::Error(err) => assert!(err.is_canceled()),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_route_malformed() {
        let cases = [
            json!("just a string"),
            json!({"d": []}),
            json!({"m": {"uts": 1}, "d": []}),
            json!({"m": {"name": "x"}}),
            json!({"m": {"name": "x"}, "d": null}),
            json!({"m": {"name": "x"}, "d": {"not": "array"}}),
        ];
        for data in cases {
            let result = route(message(Status::Data, data.clone()));
            assert!(
                matches!(result, Err(ProtocolError::MalformedMessage(_))),
                "expected malformed for {}",
                data
            );
        }
    }
}
