use crate::domain_model::Timestamp;
use crate::domain_port::*;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, UnboundedSender};

/// Server side of the in-memory presence channel, shared by every client
/// connection created with [`MemoryPresenceHub::connect`].
pub struct MemoryPresenceHub {
    values: DashMap<String, StatusSnapshot>,
    watchers: Arc<DashMap<u64, (String, UnboundedSender<StatusSnapshot>)>>,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
    last_stamp: AtomicI64,
}

impl MemoryPresenceHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: DashMap::new(),
            watchers: Arc::new(DashMap::new()),
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            last_stamp: AtomicI64::new(0),
        })
    }

    /// Opens a client connection, initially connected.
    pub fn connect(self: &Arc<Self>) -> MemoryPresenceChannel {
        MemoryPresenceChannel {
            hub: self.clone(),
            connected: AtomicBool::new(true),
            available: AtomicBool::new(true),
            armed: Mutex::new(Vec::new()),
            connection_watchers: Arc::new(DashMap::new()),
        }
    }

    pub fn value(&self, key: &str) -> Option<StatusSnapshot> {
        self.values.get(key).map(|v| *v)
    }

    /// Number of live key subscriptions across all connections.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Server clock, never running backwards.
    fn server_time(&self) -> Timestamp {
        let now = Timestamp::now().0;
        let prev = self.last_stamp.fetch_max(now, Ordering::SeqCst);
        Timestamp(prev.max(now))
    }

    fn write(&self, key: &str, state: ConnectionState) -> StatusSnapshot {
        let _guard = self.write_lock.lock();
        let snapshot = StatusSnapshot {
            state,
            last_changed: self.server_time(),
        };
        self.values.insert(key.to_owned(), snapshot);

        let mut closed = Vec::new();
        for entry in self.watchers.iter() {
            let (watched, sender) = entry.value();
            if watched == key && sender.send(snapshot).is_err() {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.watchers.remove(&id);
        }
        snapshot
    }

    fn watch(&self, key: &str) -> Subscription<StatusSnapshot> {
        let _guard = self.write_lock.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(current) = self.values.get(key) {
            let _ = tx.send(*current);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(id, (key.to_owned(), tx));
        Subscription::new(
            rx,
            Box::new(DashMapRegistration {
                map: Arc::downgrade(&self.watchers),
                id,
            }),
        )
    }
}

struct DashMapRegistration<V> {
    map: Weak<DashMap<u64, V>>,
    id: u64,
}

impl<V: Send + Sync> ListenerRegistration for DashMapRegistration<V> {
    fn remove(&self) {
        if let Some(map) = self.map.upgrade() {
            map.remove(&self.id);
        }
    }
}

/// One client connection to a [`MemoryPresenceHub`].
pub struct MemoryPresenceChannel {
    hub: Arc<MemoryPresenceHub>,
    connected: AtomicBool,
    available: AtomicBool,
    armed: Mutex<Vec<(String, ConnectionState)>>,
    connection_watchers: Arc<DashMap<u64, UnboundedSender<bool>>>,
}

impl MemoryPresenceChannel {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Simulates the server noticing this connection is gone: armed writes fire,
    /// then the client learns it is disconnected.
    pub fn drop_connection(&self) {
        {
            let Ok(mut armed) = self.armed.lock() else {
                return;
            };
            if !self.connected.swap(false, Ordering::SeqCst) {
                return;
            }
            for (key, state) in std::mem::take(&mut *armed) {
                let snapshot = self.hub.write(&key, state);
                tracing::debug!(%key, ?snapshot, "disconnect handler fired");
            }
        }
        self.broadcast_connection(false);
    }

    pub fn restore_connection(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broadcast_connection(true);
    }

    /// Makes every call fail with `Unavailable` without dropping the connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn armed_count(&self) -> usize {
        self.armed.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn broadcast_connection(&self, connected: bool) {
        let mut closed = Vec::new();
        for entry in self.connection_watchers.iter() {
            if entry.value().send(connected).is_err() {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.connection_watchers.remove(&id);
        }
    }

    fn ensure_available(&self) -> Result<(), ChannelError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::Unavailable("memory channel switched off".into()))
        }
    }

    /// Armed writes, locked for as long as the caller needs the connection to
    /// stay up. Fails once the connection has dropped.
    fn live_connection(&self) -> Result<MutexGuard<'_, Vec<(String, ConnectionState)>>, ChannelError> {
        self.ensure_available()?;
        let armed = self
            .armed
            .lock()
            .map_err(|_| ChannelError::Unavailable("armed writes lock poisoned".into()))?;
        if !self.is_connected() {
            return Err(ChannelError::Unavailable("connection dropped".into()));
        }
        Ok(armed)
    }
}

#[async_trait::async_trait]
impl PresenceChannel for MemoryPresenceChannel {
    async fn set_value(&self, key: &str, state: ConnectionState) -> Result<(), ChannelError> {
        let _connection = self.live_connection()?;
        self.hub.write(key, state);
        Ok(())
    }

    async fn on_disconnect(&self, key: &str, state: ConnectionState) -> Result<(), ChannelError> {
        let mut armed = self.live_connection()?;
        armed.retain(|(k, _)| k != key);
        armed.push((key.to_owned(), state));
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<Subscription<StatusSnapshot>, ChannelError> {
        self.ensure_available()?;
        Ok(self.hub.watch(key))
    }

    async fn subscribe_connection(&self) -> Result<Subscription<bool>, ChannelError> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(self.is_connected());
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
        self.connection_watchers.insert(id, tx);
        Ok(Subscription::new(
            rx,
            Box::new(DashMapRegistration {
                map: Arc::downgrade(&self.connection_watchers),
                id,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn armed_write_fires_once_on_drop() {
        let hub = MemoryPresenceHub::new();
        let channel = hub.connect();
        channel
            .on_disconnect("status/u1", ConnectionState::Offline)
            .await
            .unwrap();
        channel
            .set_value("status/u1", ConnectionState::Online)
            .await
            .unwrap();
        let online = hub.value("status/u1").unwrap();
        assert!(online.is_online());

        channel.drop_connection();
        let offline = hub.value("status/u1").unwrap();
        assert_eq!(offline.state, ConnectionState::Offline);
        assert!(offline.last_changed >= online.last_changed);
        assert_eq!(channel.armed_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_current_value_then_changes() {
        let hub = MemoryPresenceHub::new();
        let channel = hub.connect();
        channel
            .set_value("status/u1", ConnectionState::Online)
            .await
            .unwrap();

        let mut sub = channel.subscribe("status/u1").await.unwrap();
        assert!(sub.next().await.unwrap().is_online());
        channel
            .set_value("status/u1", ConnectionState::Offline)
            .await
            .unwrap();
        assert!(!sub.next().await.unwrap().is_online());

        // other keys are not delivered
        channel
            .set_value("status/u2", ConnectionState::Online)
            .await
            .unwrap();
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn connection_feed_tracks_drop_and_restore() {
        let hub = MemoryPresenceHub::new();
        let channel = hub.connect();
        let mut feed = channel.subscribe_connection().await.unwrap();
        assert_eq!(feed.next().await, Some(true));
        channel.drop_connection();
        assert_eq!(feed.next().await, Some(false));
        channel.restore_connection();
        assert_eq!(feed.next().await, Some(true));
    }

    #[tokio::test]
    async fn writes_fail_while_disconnected() {
        let hub = MemoryPresenceHub::new();
        let channel = hub.connect();
        channel.drop_connection();

        let err = channel
            .set_value("status/u1", ConnectionState::Online)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable(_)));
        assert!(channel
            .on_disconnect("status/u1", ConnectionState::Offline)
            .await
            .is_err());
        assert!(hub.value("status/u1").is_none());
        assert_eq!(channel.armed_count(), 0);

        channel.restore_connection();
        channel
            .set_value("status/u1", ConnectionState::Online)
            .await
            .unwrap();
        assert!(hub.value("status/u1").unwrap().is_online());
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_receiving() {
        let hub = MemoryPresenceHub::new();
        let channel = hub.connect();
        let mut sub = channel.subscribe("status/u1").await.unwrap();
        sub.cancel();
        channel
            .set_value("status/u1", ConnectionState::Online)
            .await
            .unwrap();
        assert!(sub.next().await.is_none());
    }
}
