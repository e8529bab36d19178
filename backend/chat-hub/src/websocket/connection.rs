use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Unique identifier for one live WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full; the event was dropped.
    Full,
    Closed,
}

/// Producer side of one connection's outbound queue.
///
/// Any number of broadcasters push into the bounded queue; only the
/// connection's writer loop consumes it. Pushing never waits.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: Uuid,
    tx: mpsc::Sender<Arc<str>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Connection {
    pub fn new(user_id: Uuid, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            user_id,
            tx,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn push(&self, payload: Arc<str>) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }
        match self.tx.try_send(payload) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => PushOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Close the outbound queue. The writer sends a close frame and exits.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}
