use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use strider_core::{ConnectionId, Identity, Notification};
use strider_engine::Notifier;

/// App-level keepalive text frame.
pub const PING_TEXT: &str = "ping";

/// What the socket writer task should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Protocol-level ping frame.
    Ping,
    Close,
}

/// One live viewer connection.
pub struct ViewerHandle {
    pub conn_id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    alive: AtomicBool,
    closed: CancellationToken,
}

impl ViewerHandle {
    fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            conn_id: ConnectionId::new(),
            tx,
            alive: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    /// Any inbound frame counts as proof of life.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Fires once the registry closes this connection.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn close(&self) {
        self.closed.cancel();
        let _ = self.tx.try_send(Outbound::Close);
    }

    fn send(&self, message: Outbound) -> Result<(), &'static str> {
        if !self.is_open() {
            return Err("closed");
        }
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => "send queue full",
            mpsc::error::TrySendError::Closed(_) => "closed",
        })
    }
}

/// At most one viewer channel per identity.
pub struct SessionRegistry {
    viewers: DashMap<Identity, Arc<ViewerHandle>>,
    max_send_queue: usize,
}

impl SessionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            viewers: DashMap::new(),
            max_send_queue,
        }
    }

    /// Store a new channel for `identity`, closing any channel already there.
    pub fn register(&self, identity: &Identity) -> (Arc<ViewerHandle>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let handle = Arc::new(ViewerHandle::new(tx));
        if let Some(previous) = self.viewers.insert(identity.clone(), Arc::clone(&handle)) {
            info!(identity = %identity, evicted = %previous.conn_id, "viewer replaced");
            previous.close();
        }
        debug!(identity = %identity, conn_id = %handle.conn_id, "viewer registered");
        (handle, rx)
    }

    /// Remove the mapping only if it still points at `conn_id`.
    pub fn unregister(&self, identity: &Identity, conn_id: &ConnectionId) -> bool {
        let removed = self
            .viewers
            .remove_if(identity, |_, handle| &handle.conn_id == conn_id)
            .is_some();
        if removed {
            debug!(identity = %identity, conn_id = %conn_id, "viewer unregistered");
        }
        removed
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.viewers.contains_key(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<Arc<ViewerHandle>> {
        self.viewers.get(identity).map(|h| Arc::clone(h.value()))
    }

    pub fn count(&self) -> usize {
        self.viewers.len()
    }

    /// Best-effort delivery. Never fails.
    pub fn send(&self, identity: &Identity, notification: &Notification) -> bool {
        let Some(handle) = self.get(identity) else {
            debug!(identity = %identity, kind = ?notification.kind, "no viewer, notification dropped");
            return false;
        };
        match handle.send(Outbound::Text(notification.to_json())) {
            Ok(()) => true,
            Err(reason) => {
                warn!(identity = %identity, kind = ?notification.kind, reason, "notification dropped");
                false
            }
        }
    }

    /// Send the app-level ping text to every viewer.
    pub fn ping_all(&self) -> usize {
        let mut sent = 0;
        for entry in self.viewers.iter() {
            if entry.value().send(Outbound::Text(PING_TEXT.to_string())).is_ok() {
                sent += 1;
            }
        }
        trace!(sent, "ping sweep");
        sent
    }

    /// Terminate viewers that stayed silent since the previous check; reset
    /// and protocol-ping the rest. Returns the number terminated.
    pub fn check_liveness(&self) -> usize {
        let mut dead = Vec::new();
        for entry in self.viewers.iter() {
            let handle = entry.value();
            if handle.alive.swap(false, Ordering::Relaxed) && handle.is_open() {
                let _ = handle.send(Outbound::Ping);
            } else {
                dead.push((entry.key().clone(), Arc::clone(handle)));
            }
        }

        for (identity, handle) in &dead {
            handle.close();
            self.unregister(identity, &handle.conn_id);
            info!(identity = %identity, conn_id = %handle.conn_id, "terminated unresponsive viewer");
        }
        dead.len()
    }

    /// Close every viewer. Used on shutdown.
    pub fn close_all(&self) {
        for entry in self.viewers.iter() {
            entry.value().close();
        }
        self.viewers.clear();
    }
}

impl Notifier for SessionRegistry {
    fn notify(&self, identity: &Identity, notification: Notification) {
        self.send(identity, &notification);
    }
}

/// Drive the ping and liveness ticks until `cancel` fires.
pub fn start_heartbeat(
    registry: Arc<SessionRegistry>,
    ping_every: Duration,
    liveness_every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        let mut liveness = tokio::time::interval(liveness_every);
        // consume first immediate ticks
        ping.tick().await;
        liveness.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ping.tick() => {
                    registry.ping_all();
                }
                _ = liveness.tick() => {
                    let removed = registry.check_liveness();
                    if removed > 0 {
                        info!(removed, "liveness sweep");
                    }
                }
            }
        }
    })
}
