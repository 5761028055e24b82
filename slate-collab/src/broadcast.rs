//! Fan-out of server messages to the connections in a room.
//!
//! Each connection owns a bounded outbound queue drained by its socket
//! task. A broadcast serializes the message once, shares the frame as an
//! `Arc<str>`, and pushes it into every target queue without waiting.
//!
//! A connection whose queue is closed is skipped. A connection whose queue
//! is full has already missed a frame, so it is asked to close: its socket
//! task tears it down like a leave and the client rejoins from a fresh
//! `joined` snapshot instead of drifting out of sync.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a connection, shared with the room it joins.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<str>>,
    closing: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id: ConnectionId::next(),
            sender,
            closing: Arc::new(AtomicBool::new(false)),
            close_signal: Arc::new(Notify::new()),
        }
    }

    /// Create a handle together with the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// True once [`ConnectionHandle::request_close`] has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Queue a pre-encoded frame without waiting. Returns false if the
    /// frame was not queued. A full queue also requests close.
    pub fn try_deliver(&self, frame: Arc<str>) -> bool {
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue of {} is full, closing connection", self.id);
                self.request_close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Encode and queue a message for this connection only.
    pub fn reply(&self, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let frame: Arc<str> = msg.encode()?.into();
        Ok(self.try_deliver(frame))
    }

    /// Ask the socket task owning this connection to shut down.
    pub fn request_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.close_signal.notify_one();
    }

    /// Resolves once [`ConnectionHandle::request_close`] has been called.
    pub async fn close_requested(&self) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        self.close_signal.notified().await;
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub deliveries: u64,
    pub deliveries_dropped: u64,
}

/// Lock-free counters behind [`BroadcastStats`].
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    deliveries_dropped: AtomicU64,
}

/// Serialize-once fan-out with per-target exclusion.
#[derive(Debug, Default)]
pub struct BroadcastDispatcher {
    stats: AtomicBroadcastStats,
}

impl BroadcastDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `msg` to every member except `exclude`. Returns the number of
    /// connections the frame was queued on.
    pub fn send<'a, I>(
        &self,
        members: I,
        msg: &ServerMessage,
        exclude: Option<Uuid>,
    ) -> Result<usize, ProtocolError>
    where
        I: IntoIterator<Item = (&'a Uuid, &'a ConnectionHandle)>,
    {
        let frame: Arc<str> = msg.encode()?.into();
        Ok(self.send_raw(members, frame, exclude))
    }

    /// Fan out an already-encoded frame.
    pub fn send_raw<'a, I>(&self, members: I, frame: Arc<str>, exclude: Option<Uuid>) -> usize
    where
        I: IntoIterator<Item = (&'a Uuid, &'a ConnectionHandle)>,
    {
        let mut delivered = 0usize;
        let mut dropped = 0u64;
        for (member_id, handle) in members {
            if Some(*member_id) == exclude {
                continue;
            }
            if handle.try_deliver(frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
                log::debug!("Skipped unwritable connection {} ({member_id})", handle.id());
            }
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        if dropped > 0 {
            self.stats
                .deliveries_dropped
                .fetch_add(dropped, Ordering::Relaxed);
        }
        delivered
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            deliveries_dropped: self.stats.deliveries_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn room(n: usize, capacity: usize) -> (HashMap<Uuid, ConnectionHandle>, Vec<(Uuid, mpsc::Receiver<Arc<str>>)>) {
        let mut members = HashMap::new();
        let mut receivers = Vec::new();
        for _ in 0..n {
            let id = Uuid::new_v4();
            let (handle, rx) = ConnectionHandle::channel(capacity);
            members.insert(id, handle);
            receivers.push((id, rx));
        }
        (members, receivers)
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_fan_out_excludes_author() {
        let dispatcher = BroadcastDispatcher::new();
        let (members, mut receivers) = room(3, 8);
        let author = receivers[0].0;

        let msg = ServerMessage::ObjectDelete {
            object_id: "x".into(),
        };
        let count = dispatcher.send(&members, &msg, Some(author)).unwrap();
        assert_eq!(count, 2);

        for (id, rx) in receivers.iter_mut() {
            let got = rx.try_recv();
            if *id == author {
                assert!(got.is_err());
            } else {
                let frame = got.unwrap();
                assert_eq!(ServerMessage::decode(&frame).unwrap(), msg);
            }
        }
    }

    #[test]
    fn test_frame_shared_not_copied() {
        let dispatcher = BroadcastDispatcher::new();
        let (members, mut receivers) = room(2, 8);
        let frame: Arc<str> = Arc::from("{}");
        dispatcher.send_raw(&members, frame.clone(), None);

        let a = receivers[0].1.try_recv().unwrap();
        let b = receivers[1].1.try_recv().unwrap();
        assert!(Arc::ptr_eq(&a, &frame));
        assert!(Arc::ptr_eq(&b, &frame));
    }

    #[test]
    fn test_unwritable_connections_skipped() {
        let dispatcher = BroadcastDispatcher::new();
        let (members, mut receivers) = room(3, 1);

        // Drop one receiver entirely and fill another's queue
        let (_, closed_rx) = receivers.remove(0);
        drop(closed_rx);
        let full = members.get(&receivers[0].0).unwrap();
        assert!(full.try_deliver(Arc::from("filler")));

        let count = dispatcher
            .send(&members, &ServerMessage::error("x"), None)
            .unwrap();
        assert_eq!(count, 1);

        let stats = dispatcher.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(stats.deliveries_dropped, 2);

        // Overflow closes the connection, a closed receiver does not
        assert!(full.is_closing());
        let healthy = members.get(&receivers[1].0).unwrap();
        assert!(!healthy.is_closing());
    }

    #[test]
    fn test_full_queue_requests_close() {
        let (handle, mut rx) = ConnectionHandle::channel(2);
        assert!(handle.try_deliver(Arc::from("one")));
        assert!(handle.try_deliver(Arc::from("two")));
        assert!(!handle.is_closing());

        assert!(!handle.try_deliver(Arc::from("three")));
        assert!(handle.is_closing());

        // Nothing more is queued once closing, even with room to spare
        rx.try_recv().unwrap();
        assert!(!handle.try_deliver(Arc::from("four")));
        assert_eq!(rx.try_recv().unwrap().as_ref(), "two");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_is_not_marked_closing() {
        let (handle, rx) = ConnectionHandle::channel(2);
        drop(rx);
        assert!(!handle.try_deliver(Arc::from("lost")));
        assert!(!handle.is_closing());
        assert!(!handle.is_writable());
    }

    #[test]
    fn test_reply_and_close() {
        let (handle, mut rx) = ConnectionHandle::channel(4);
        assert!(handle.is_writable());
        assert!(handle.reply(&ServerMessage::error("hello")).unwrap());
        assert!(rx.try_recv().unwrap().contains("hello"));

        handle.request_close();
        assert!(!handle.is_writable());
        assert!(!handle.reply(&ServerMessage::error("late")).unwrap());
    }

    #[tokio::test]
    async fn test_close_requested_resolves() {
        let (handle, _rx) = ConnectionHandle::channel(4);
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.close_requested().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.request_close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        // Already requested: resolves immediately
        handle.close_requested().await;
    }
}
