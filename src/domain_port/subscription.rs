use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Handle the producer uses to drop a listener.
pub trait ListenerRegistration: Send + Sync {
    fn remove(&self);
}

/// Listener backed by a spawned task that watches the token.
impl ListenerRegistration for CancellationToken {
    fn remove(&self) {
        self.cancel();
    }
}

/// A standing listener. Unregistered on `cancel` or when dropped.
pub struct Subscription<T> {
    events: UnboundedReceiver<T>,
    registration: Option<Box<dyn ListenerRegistration>>,
}

impl<T> Subscription<T> {
    pub fn new(events: UnboundedReceiver<T>, registration: Box<dyn ListenerRegistration>) -> Self {
        Self {
            events,
            registration: Some(registration),
        }
    }

    /// Next delivery, or `None` once the producer is gone or the subscription
    /// was cancelled and drained.
    pub async fn next(&mut self) -> Option<T> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<T> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.remove();
        }
        self.events.close();
    }

    pub fn is_active(&self) -> bool {
        self.registration.is_some()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
