use std::{collections::HashMap, sync::Arc};

use devdeck_process::ServerEvent;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

#[derive(Debug)]
struct Observer {
    /// Script whose scoped events this connection wants.
    tag: Option<String>,
    tx: mpsc::Sender<ServerEvent>,
}

/// Fan-out of runner events to live observer connections.
///
/// Each connection owns a bounded queue drained by its socket writer.
/// Events are never dropped from an open connection: a connection whose
/// queue is full is removed, which ends its writer and closes the socket.
/// The client sees the close and reconnects for a fresh snapshot.
#[derive(Debug, Clone)]
pub struct ObserverHub {
    inner: Arc<RwLock<HashMap<Uuid, Observer>>>,
    queue: usize,
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ObserverHub {
    pub fn new(queue: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            queue: queue.max(1),
        }
    }

    /// Adds an untagged connection. `initial` is queued before the
    /// connection becomes visible to `publish`, so it is always first.
    pub async fn connect(&self, initial: ServerEvent) -> (Uuid, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.queue);
        let _ = tx.try_send(initial);
        let id = Uuid::new_v4();
        self.inner
            .write()
            .await
            .insert(id, Observer { tag: None, tx });
        (id, rx)
    }

    pub async fn disconnect(&self, id: Uuid) {
        self.inner.write().await.remove(&id);
    }

    /// Retags a connection. Returns false if it is no longer open.
    pub async fn register(&self, id: Uuid, script_id: impl Into<String>) -> bool {
        match self.inner.write().await.get_mut(&id) {
            Some(observer) => {
                observer.tag = Some(script_id.into());
                true
            }
            None => false,
        }
    }

    /// Direct reply on a single connection.
    pub async fn send_to(&self, id: Uuid, event: ServerEvent) {
        let closed = {
            let map = self.inner.read().await;
            let Some(observer) = map.get(&id) else {
                return;
            };
            !deliver(id, observer, event)
        };
        if closed {
            self.disconnect(id).await;
        }
    }

    /// Status events reach every connection; every other event only
    /// reaches connections tagged with its script id.
    pub async fn publish(&self, event: ServerEvent) {
        let mut closed = Vec::new();
        {
            let map = self.inner.read().await;
            let scope = event.script_id();
            for (id, observer) in map.iter() {
                let wanted = event.is_global()
                    || scope.is_none()
                    || observer.tag.as_deref() == scope;
                if wanted && !deliver(*id, observer, event.clone()) {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            let mut map = self.inner.write().await;
            for id in closed {
                map.remove(&id);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Returns false when the connection must be removed: its receiver is
/// gone, or it has fallen a whole queue behind.
fn deliver(id: Uuid, observer: &Observer, event: ServerEvent) -> bool {
    match observer.tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            tracing::warn!(
                observer = %id,
                script_id = event.script_id().unwrap_or_default(),
                "observer queue full; disconnecting"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devdeck_process::{RunningScript, ScriptStatus};

    fn out(script_id: &str, data: &str) -> ServerEvent {
        ServerEvent::Stdout {
            script_id: script_id.to_string(),
            pid: 1,
            data: data.to_string(),
        }
    }

    fn snapshot() -> ServerEvent {
        ServerEvent::AllRunningScripts {
            scripts: vec![RunningScript {
                script_id: "x".to_string(),
                pid: 9,
            }],
        }
    }

    #[tokio::test]
    async fn initial_snapshot_comes_first() {
        let hub = ObserverHub::new(8);
        let (_, mut rx) = hub.connect(snapshot()).await;
        hub.publish(ServerEvent::status(ScriptStatus::stopped("x")))
            .await;

        assert_eq!(rx.recv().await, Some(snapshot()));
        assert!(matches!(rx.recv().await, Some(ServerEvent::Status { .. })));
    }

    #[tokio::test]
    async fn scoped_events_only_reach_their_script() {
        let hub = ObserverHub::new(8);
        let (x, mut rx_x) = hub.connect(snapshot()).await;
        let (_, mut rx_none) = hub.connect(snapshot()).await;
        assert!(hub.register(x, "X").await);
        let _ = rx_x.recv().await;
        let _ = rx_none.recv().await;

        hub.publish(out("Y", "not for you")).await;
        hub.publish(ServerEvent::status(ScriptStatus::running("Y", 5)))
            .await;
        hub.publish(out("X", "hello")).await;

        assert_eq!(
            rx_x.recv().await,
            Some(ServerEvent::status(ScriptStatus::running("Y", 5)))
        );
        assert_eq!(rx_x.recv().await, Some(out("X", "hello")));

        assert_eq!(
            rx_none.recv().await,
            Some(ServerEvent::status(ScriptStatus::running("Y", 5)))
        );
        assert!(rx_none.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_connections_are_pruned() {
        let hub = ObserverHub::new(8);
        let (_, rx) = hub.connect(snapshot()).await;
        assert_eq!(hub.len().await, 1);
        drop(rx);

        hub.publish(ServerEvent::status(ScriptStatus::stopped("a")))
            .await;
        assert_eq!(hub.len().await, 0);
    }

    #[tokio::test]
    async fn lagging_observer_is_disconnected_not_skipped() {
        let hub = ObserverHub::new(2);
        let (id, mut rx) = hub.connect(snapshot()).await;
        let (_, mut keeps_up) = hub.connect(snapshot()).await;
        hub.register(id, "a").await;
        let _ = keeps_up.recv().await;

        hub.publish(out("a", "one")).await;
        hub.publish(ServerEvent::status(ScriptStatus::stopped("a")))
            .await;
        assert_eq!(hub.len().await, 1);

        // Everything queued before the overflow is still delivered, then
        // the stream ends instead of silently skipping the status.
        assert_eq!(rx.recv().await, Some(snapshot()));
        assert_eq!(rx.recv().await, Some(out("a", "one")));
        assert_eq!(rx.recv().await, None);

        assert_eq!(
            keeps_up.recv().await,
            Some(ServerEvent::status(ScriptStatus::stopped("a")))
        );
    }

    #[tokio::test]
    async fn register_on_unknown_connection_is_rejected() {
        let hub = ObserverHub::default();
        assert!(!hub.register(Uuid::new_v4(), "a").await);
    }
}
