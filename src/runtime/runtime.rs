use crate::application_impl::*;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_memory::*;
use crate::logger::*;
use crate::runtime::*;
use crate::settings::Settings;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A signed-in user on this client.
struct ClientSession {
    notifier_handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

pub struct Runtime {
    pub store: Arc<dyn DocumentStore>,
    pub presence_service: Arc<dyn PresenceService>,
    pub receipt_service: Arc<dyn ReadReceiptService>,
    pub conversation_service: Arc<dyn ConversationService>,
    notification_sink: Arc<dyn NotificationSink>,
    sessions: DashMap<UserId, ClientSession>,
    cancel: CancellationToken,
}

impl Runtime {
    pub async fn try_new(settings: &Settings) -> anyhow::Result<Self> {
        let store: Arc<dyn DocumentStore> = match settings.store.backend.as_str() {
            "memory" => Arc::new(MemoryDocumentStore::new()),
            other => return Err(anyhow::anyhow!("Unknown store backend: {}", other)),
        };

        let channel: Arc<dyn PresenceChannel> = match settings.presence.backend.as_str() {
            "memory" => Arc::new(MemoryPresenceHub::new().connect()),
            other => return Err(anyhow::anyhow!("Unknown presence backend: {}", other)),
        };

        Ok(Self::with_backends(
            settings,
            store,
            channel,
            Arc::new(LogNotificationSink),
        ))
    }

    /// Wires the services on top of already built adapters.
    pub fn with_backends(
        settings: &Settings,
        store: Arc<dyn DocumentStore>,
        channel: Arc<dyn PresenceChannel>,
        notification_sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let presence_service: Arc<dyn PresenceService> = Arc::new(RealPresenceTracker::new(
            store.clone(),
            channel,
            PresenceConfig {
                status_root: settings.presence.status_root.clone(),
            },
        ));

        let receipt_service: Arc<dyn ReadReceiptService> = Arc::new(RealReadReceiptReconciler::new(
            store.clone(),
            settings.receipts.max_conflict_retries,
        ));

        let conversation_service: Arc<dyn ConversationService> = Arc::new(
            RealConversationService::new(store.clone(), receipt_service.clone()),
        );

        info!("runtime started");

        Self {
            store,
            presence_service,
            receipt_service,
            conversation_service,
            notification_sink,
            sessions: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts presence tracking and unread notifications for `user`.
    /// Signing in an already signed-in user does nothing.
    pub async fn sign_in(&self, user: &UserId) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(anyhow::anyhow!("runtime is shut down"));
        }
        if self.sessions.contains_key(user) {
            debug!(%user, "already signed in");
            return Ok(());
        }

        self.presence_service.start(user).await?;

        let cancellation_token = self.cancel.child_token();
        let notifier = UnreadNotifier::new(
            self.store.clone(),
            self.notification_sink.clone(),
            user.clone(),
            cancellation_token.clone(),
        );
        let notified_user = user.clone();
        let notifier_handle = tokio::spawn(async move {
            if let Err(e) = notifier.run().await {
                error!(user = %notified_user, "unread notifier stopped: {:#?}", e);
            }
        });

        let session = ClientSession {
            notifier_handle,
            cancellation_token,
        };
        if let Some(previous) = self.sessions.insert(user.clone(), session) {
            previous.cancellation_token.cancel();
        }
        info!(%user, "signed in");
        Ok(())
    }

    pub async fn sign_out(&self, user: &UserId) -> anyhow::Result<()> {
        if let Some((_, session)) = self.sessions.remove(user) {
            session.cancellation_token.cancel();
            let r = session.notifier_handle.await;
            debug!(%user, "notifier handle dropped: {:?}", r);
        }
        self.presence_service.stop(user).await?;
        info!(%user, "signed out");
        Ok(())
    }

    pub fn signed_in(&self) -> Vec<UserId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub async fn shutdown(&self) {
        info!("runtime shutting down...");

        self.cancel.cancel();

        for user in self.signed_in() {
            if let Err(e) = self.sign_out(&user).await {
                warn!(%user, "sign out during shutdown failed: {:#}", e);
            }
        }

        info!("runtime shut down");
    }
}
