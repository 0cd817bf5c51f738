use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::fields;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Channel path under which `{root}/{uid}` status values live.
    pub status_root: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            status_root: "status".to_owned(),
        }
    }
}

/// Everything the two session tasks share.
#[derive(Clone)]
struct SessionContext {
    store: Arc<dyn DocumentStore>,
    channel: Arc<dyn PresenceChannel>,
    user: UserId,
    key: String,
    state: Arc<watch::Sender<SessionState>>,
    /// Largest `lastSeen` this session has written.
    high_water: Arc<AtomicI64>,
    /// Offline snapshots mirrored so far; held across every durable presence write.
    offline_mirrored: Arc<Mutex<u64>>,
}

impl SessionContext {
    /// Arm the disconnect write, announce online on the channel, mirror it to
    /// the store. A failed arm leaves the session connecting, and nothing is
    /// marked online if the connection drops before the durable write.
    async fn go_online(&self) {
        let offline_before = *self.offline_mirrored.lock().await;
        if let Err(e) = self.channel.on_disconnect(&self.key, ConnectionState::Offline).await {
            tracing::warn!(user = %self.user, error = %e, "cannot arm disconnect write");
            return;
        }
        if let Err(e) = self.channel.set_value(&self.key, ConnectionState::Online).await {
            tracing::warn!(user = %self.user, error = %e, "cannot publish online status");
            return;
        }
        self.state.send_replace(SessionState::Online);

        let offline_mirrored = self.offline_mirrored.lock().await;
        if *offline_mirrored != offline_before {
            tracing::debug!(user = %self.user, "went offline again before the online mirror");
            return;
        }
        if let Err(e) = self
            .store
            .set(
                &DocumentPath::user(&self.user),
                fields! { "isOnline" => true },
                SetMode::Merge,
            )
            .await
        {
            tracing::warn!(user = %self.user, error = %e, "cannot mirror online presence");
        }
        tracing::info!(user = %self.user, "online");
    }

    /// Converts one channel snapshot into the durable presence fields.
    async fn mirror(&self, snapshot: StatusSnapshot) {
        let mut offline_mirrored = self.offline_mirrored.lock().await;
        let fields = if snapshot.is_online() {
            fields! { "isOnline" => true }
        } else {
            let last_seen = snapshot.last_changed.as_millis();
            let previous = self.high_water.fetch_max(last_seen, Ordering::SeqCst);
            if last_seen < previous {
                tracing::trace!(user = %self.user, last_seen, previous, "skipping stale offline snapshot");
                return;
            }
            *offline_mirrored += 1;
            fields! { "isOnline" => false, "lastSeen" => snapshot.last_changed }
        };
        if let Err(e) = self
            .store
            .set(&DocumentPath::user(&self.user), fields, SetMode::Merge)
            .await
        {
            tracing::warn!(user = %self.user, error = %e, "cannot mirror presence");
        }
    }
}

struct Session {
    context: SessionContext,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct RealPresenceTracker {
    store: Arc<dyn DocumentStore>,
    channel: Arc<dyn PresenceChannel>,
    config: PresenceConfig,
    sessions: DashMap<UserId, Session>,
}

impl RealPresenceTracker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        channel: Arc<dyn PresenceChannel>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            store,
            channel,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Receiver of the session's state transitions, if the user is tracked.
    pub fn state_changes(&self, user: &UserId) -> Option<watch::Receiver<SessionState>> {
        self.sessions
            .get(user)
            .map(|session| session.context.state.subscribe())
    }

    pub fn tracked_users(&self) -> Vec<UserId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    fn spawn_tasks(
        context: &SessionContext,
        cancel: &CancellationToken,
        mut connection: Subscription<bool>,
        mut status: Subscription<StatusSnapshot>,
    ) -> Vec<JoinHandle<()>> {
        let ctx = context.clone();
        let token = cancel.clone();
        let connection_task = tokio::spawn(async move {
            loop {
                let connected = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    connected = connection.next() => connected,
                };
                match connected {
                    Some(true) => ctx.go_online().await,
                    Some(false) => {
                        ctx.state.send_replace(SessionState::Connecting);
                        tracing::info!(user = %ctx.user, "connection lost");
                    }
                    None => break,
                }
            }
            connection.cancel();
        });

        let ctx = context.clone();
        let token = cancel.clone();
        let mirror_task = tokio::spawn(async move {
            loop {
                let snapshot = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    snapshot = status.next() => snapshot,
                };
                match snapshot {
                    Some(snapshot) => ctx.mirror(snapshot).await,
                    None => break,
                }
            }
            status.cancel();
        });

        vec![connection_task, mirror_task]
    }
}

#[async_trait::async_trait]
impl PresenceService for RealPresenceTracker {
    async fn start(&self, user: &UserId) -> Result<(), PresenceError> {
        let context = SessionContext {
            store: self.store.clone(),
            channel: self.channel.clone(),
            user: user.clone(),
            key: status_key(&self.config.status_root, user),
            state: Arc::new(watch::channel(SessionState::Connecting).0),
            high_water: Arc::new(AtomicI64::new(i64::MIN)),
            offline_mirrored: Arc::new(Mutex::new(0)),
        };
        let cancel = CancellationToken::new();

        match self.sessions.entry(user.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(%user, "presence already tracked");
                return Ok(());
            }
            Entry::Vacant(entry) => {
                entry.insert(Session {
                    context: context.clone(),
                    cancel: cancel.clone(),
                    tasks: Vec::new(),
                });
            }
        }

        let subscriptions = async {
            let connection = self.channel.subscribe_connection().await?;
            let status = self.channel.subscribe(&context.key).await?;
            Ok::<_, ChannelError>((connection, status))
        };
        let (connection, status) = match subscriptions.await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                self.sessions.remove(user);
                tracing::warn!(%user, error = %e, "cannot subscribe to presence channel");
                return Err(e.into());
            }
        };

        let tasks = Self::spawn_tasks(&context, &cancel, connection, status);
        match self.sessions.get_mut(user) {
            Some(mut session) if Arc::ptr_eq(&session.context.state, &context.state) => {
                session.tasks.extend(tasks)
            }
            _ => cancel.cancel(),
        }
        tracing::debug!(%user, "presence tracking started");
        Ok(())
    }

    async fn stop(&self, user: &UserId) -> Result<(), PresenceError> {
        let Some((_, session)) = self.sessions.remove(user) else {
            return Ok(());
        };
        session.cancel.cancel();
        for result in futures_util::future::join_all(session.tasks).await {
            if let Err(e) = result {
                tracing::error!(%user, error = %e, "presence task failed");
            }
        }

        let context = session.context;
        context.state.send_replace(SessionState::Disconnected);

        let mut first_error: Option<PresenceError> = None;
        if let Err(e) = self
            .channel
            .set_value(&context.key, ConnectionState::Offline)
            .await
        {
            tracing::warn!(%user, error = %e, "cannot publish offline status");
            first_error.get_or_insert(e.into());
        }

        let now = Timestamp::now().as_millis();
        let last_seen = Timestamp(now.max(context.high_water.load(Ordering::SeqCst)));
        if let Err(e) = self
            .store
            .set(
                &DocumentPath::user(user),
                fields! { "isOnline" => false, "lastSeen" => last_seen },
                SetMode::Merge,
            )
            .await
        {
            tracing::warn!(%user, error = %e, "cannot mirror offline presence");
            first_error.get_or_insert(e.into());
        }

        tracing::info!(%user, %last_seen, "presence tracking stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn state(&self, user: &UserId) -> SessionState {
        self.sessions
            .get(user)
            .map(|session| *session.context.state.borrow())
            .unwrap_or(SessionState::Disconnected)
    }

    async fn presence_of(&self, user: &UserId) -> Result<Option<UserPresence>, PresenceError> {
        match self.store.get(&DocumentPath::user(user)).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }
}
