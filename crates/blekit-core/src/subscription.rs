//! Listener-registration handles.
//!
//! Every listener-registration call on the session returns a
//! [`SubscriptionHandle`]: an opaque token holding exactly one release
//! action. Releasing twice is a no-op, and the underlying native
//! registration is released at most once. Dropping an unreleased handle
//! performs a best-effort release on the current runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::warn;

use blekit_types::{AdapterState, CanonicalUuid};

type ReleaseFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ReleaseAction = Box<dyn FnOnce() -> ReleaseFuture + Send>;

/// Opaque token for one listener registration.
pub struct SubscriptionHandle {
    release: Mutex<Option<ReleaseAction>>,
}

impl SubscriptionHandle {
    pub(crate) fn new<F, Fut>(release: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            release: Mutex::new(Some(Box::new(move || Box::pin(release())))),
        }
    }

    /// Release the underlying registration.
    ///
    /// Safe to call more than once; every call after the first is a no-op.
    pub async fn release(&self) {
        let action = self
            .release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(action) = action {
            action().await;
        }
    }

    /// Whether the handle has already been released.
    pub fn is_released(&self) -> bool {
        self.release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let action = self
            .release
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(action) = action {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(action());
            } else {
                warn!("no tokio runtime available to release subscription on drop");
            }
        }
    }
}

/// A characteristic subscription: a value stream paired with its handle.
///
/// Releasing performs the corresponding native unsubscribe; a failure of that
/// best-effort unsubscribe is logged, never propagated.
pub struct CharacteristicMonitor {
    device_id: String,
    characteristic: CanonicalUuid,
    values: mpsc::Receiver<Vec<u8>>,
    handle: SubscriptionHandle,
}

impl CharacteristicMonitor {
    pub(crate) fn new(
        device_id: String,
        characteristic: CanonicalUuid,
        values: mpsc::Receiver<Vec<u8>>,
        handle: SubscriptionHandle,
    ) -> Self {
        Self {
            device_id,
            characteristic,
            values,
            handle,
        }
    }

    /// The device the subscription belongs to.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The subscribed characteristic.
    pub fn characteristic(&self) -> &CanonicalUuid {
        &self.characteristic
    }

    /// Receive the next value, or `None` once the subscription ends.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.values.recv().await
    }

    /// Release the subscription. Safe to call more than once.
    pub async fn release(&self) {
        self.handle.release().await;
    }

    /// The underlying registration handle.
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl std::fmt::Debug for CharacteristicMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacteristicMonitor")
            .field("device_id", &self.device_id)
            .field("characteristic", &self.characteristic)
            .finish_non_exhaustive()
    }
}

/// An adapter-state subscription: a state stream paired with its handle.
pub struct AdapterStateMonitor {
    states: mpsc::Receiver<AdapterState>,
    handle: SubscriptionHandle,
}

impl AdapterStateMonitor {
    pub(crate) fn new(states: mpsc::Receiver<AdapterState>, handle: SubscriptionHandle) -> Self {
        Self { states, handle }
    }

    /// Receive the next adapter state, or `None` once the subscription ends.
    pub async fn recv(&mut self) -> Option<AdapterState> {
        self.states.recv().await
    }

    /// Release the subscription. Safe to call more than once.
    pub async fn release(&self) {
        self.handle.release().await;
    }

    /// The underlying registration handle.
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl std::fmt::Debug for AdapterStateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterStateMonitor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_release_runs_once() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&released);
        let handle = SubscriptionHandle::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!handle.is_released());
        handle.release().await;
        handle.release().await;
        handle.release().await;

        assert!(handle.is_released());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_performs_best_effort_release() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&released);
        {
            let _handle = SubscriptionHandle::new(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // the release runs on a spawned task
        tokio::task::yield_now().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_after_release_does_nothing() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&released);
        {
            let handle = SubscriptionHandle::new(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            handle.release().await;
        }
        tokio::task::yield_now().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
