//! Per-connection call tracking.

use fastrpc_protocol::RpcEncoder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// State of one accepted connection: its identity and the calls in flight.
///
/// Owned by the connection's task; never shared.
pub struct Session {
    /// Unique session ID, attached to log lines.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    /// In-flight calls by msgid.
    calls: HashMap<u32, RpcEncoder>,

    /// Calls started on this connection.
    request_count: u64,

    /// Session creation time.
    created_at: Instant,
}

impl Session {
    /// Creates a new session.
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            calls: HashMap::new(),
            request_count: 0,
            created_at: Instant::now(),
        }
    }

    /// Tracks a call whose handler is about to run.
    pub fn begin(&mut self, rpc: RpcEncoder) {
        self.request_count += 1;
        self.calls.insert(rpc.msgid(), rpc);
    }

    pub fn contains(&self, msgid: u32) -> bool {
        self.calls.contains_key(&msgid)
    }

    /// Drops a call once its terminal frame went out.
    ///
    /// An entry whose encoder has not finished belongs to a newer call that
    /// reused the id, and is kept.
    pub fn finish(&mut self, msgid: u32) -> Option<RpcEncoder> {
        match self.calls.get(&msgid) {
            Some(rpc) if rpc.is_finished() => self.calls.remove(&msgid),
            _ => None,
        }
    }

    /// Cancels and drops a call, returning it if it was in flight.
    pub fn cancel(&mut self, msgid: u32) -> Option<RpcEncoder> {
        let rpc = self.calls.remove(&msgid)?;
        rpc.cancel();
        Some(rpc)
    }

    /// Cancels every call in flight.
    pub fn cancel_all(&mut self) -> Vec<RpcEncoder> {
        let calls: Vec<RpcEncoder> = self.calls.drain().map(|(_, rpc)| rpc).collect();
        for rpc in &calls {
            rpc.cancel();
        }
        calls
    }

    /// Returns the number of calls in flight.
    pub fn pending(&self) -> usize {
        self.calls.len()
    }

    /// Returns the request count.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345)
    }

    fn encoder(msgid: u32) -> (mpsc::UnboundedReceiver<bytes::Bytes>, RpcEncoder) {
        let (tx, rx) = mpsc::unbounded_channel();
        (rx, RpcEncoder::new(tx, msgid, "test"))
    }

    #[test]
    fn test_session_creation() {
        let session = Session::new(test_addr());
        assert_eq!(session.pending(), 0);
        assert_eq!(session.request_count(), 0);
        assert_ne!(session.id, Session::new(test_addr()).id);
    }

    #[test]
    fn test_finish_requires_terminal_frame() {
        let mut session = Session::new(test_addr());
        let (_rx, rpc) = encoder(1);
        session.begin(rpc.clone());

        assert!(session.finish(1).is_none());
        assert!(session.contains(1));

        rpc.send_end(vec![]).unwrap();
        assert!(session.finish(1).is_some());
        assert_eq!(session.pending(), 0);
        assert_eq!(session.request_count(), 1);
    }

    #[test]
    fn test_cancel() {
        let mut session = Session::new(test_addr());
        let (mut rx, rpc) = encoder(7);
        session.begin(rpc.clone());

        let canceled = session.cancel(7).unwrap();
        assert!(canceled.is_canceled());
        assert!(rpc.is_canceled());
        assert!(session.cancel(7).is_none());

        // Nothing reaches the wire after cancellation.
        rpc.send_data(vec![serde_json::json!(1)]).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_all() {
        let mut session = Session::new(test_addr());
        let mut keep = Vec::new();
        for msgid in 1..=3 {
            let (rx, rpc) = encoder(msgid);
            keep.push(rx);
            session.begin(rpc);
        }

        let canceled = session.cancel_all();
        assert_eq!(canceled.len(), 3);
        assert!(canceled.iter().all(RpcEncoder::is_canceled));
        assert_eq!(session.pending(), 0);
    }
}
