//! Physical unplug detection for one session.
//!
//! The device monitor reports every removal on the host. A [`DisconnectWatch`]
//! registers one listener bound to the identity captured at connect time and
//! forwards only matching events to a handler task. Events for other devices,
//! or for a later attachment of the same hardware, never reach the handler.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transport::{DeviceHandleId, DeviceMonitor, DisconnectCallback, ListenerId};

/// A registered disconnect listener and the task waiting on it.
pub(crate) struct DisconnectWatch {
    monitor: Arc<dyn DeviceMonitor>,
    device: DeviceHandleId,
    /// `None` once deregistered.
    listener: Option<ListenerId>,
    cancel: CancellationToken,
}

impl DisconnectWatch {
    /// Registers a listener for `device` and spawns the task that runs
    /// `on_unplug` the first time a matching removal is reported.
    pub(crate) fn register<F, Fut>(
        monitor: Arc<dyn DeviceMonitor>,
        device: DeviceHandleId,
        on_unplug: F,
    ) -> Self
    where
        F: FnOnce(DeviceHandleId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let callback: DisconnectCallback = Arc::new(move |removed: DeviceHandleId| {
            if removed != device {
                tracing::trace!(%removed, expected = %device, "Ignoring removal of another device");
                return;
            }
            // The watcher may already be gone after teardown.
            let _ = tx.send(removed);
        });
        let listener = monitor.add_disconnect_listener(callback);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    tracing::trace!(%device, "Disconnect watcher cancelled");
                }
                Some(removed) = rx.recv() => on_unplug(removed).await,
            }
        });

        tracing::debug!(%device, listener = listener.0, "Registered disconnect listener");

        Self {
            monitor,
            device,
            listener: Some(listener),
            cancel,
        }
    }

    /// Identity of the watched attachment.
    pub(crate) fn device(&self) -> DeviceHandleId {
        self.device
    }

    /// Removes the listener and stops the watcher.
    ///
    /// Only the first call touches the monitor; returns whether it did.
    pub(crate) fn deregister(&mut self) -> bool {
        self.cancel.cancel();
        let Some(listener) = self.listener.take() else {
            return false;
        };
        if !self.monitor.remove_disconnect_listener(listener) {
            tracing::warn!(device = %self.device, listener = listener.0, "Disconnect listener was already gone");
        } else {
            tracing::debug!(device = %self.device, listener = listener.0, "Removed disconnect listener");
        }
        true
    }
}

impl Drop for DisconnectWatch {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct TestMonitor {
        next: AtomicU64,
        listeners: Mutex<HashMap<u64, DisconnectCallback>>,
    }

    impl TestMonitor {
        fn fire(&self, id: DeviceHandleId) {
            let callbacks: Vec<_> = self.listeners.lock().unwrap().values().cloned().collect();
            for callback in callbacks {
                callback(id);
            }
        }

        fn count(&self) -> usize {
            self.listeners.lock().unwrap().len()
        }
    }

    impl DeviceMonitor for TestMonitor {
        fn add_disconnect_listener(&self, callback: DisconnectCallback) -> ListenerId {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            self.listeners.lock().unwrap().insert(id, callback);
            ListenerId(id)
        }

        fn remove_disconnect_listener(&self, id: ListenerId) -> bool {
            self.listeners.lock().unwrap().remove(&id.0).is_some()
        }
    }

    #[tokio::test]
    async fn test_matching_removal_runs_handler() {
        let monitor = Arc::new(TestMonitor::default());
        let device = DeviceHandleId::new();
        let (tx, rx) = oneshot::channel();

        let _watch = DisconnectWatch::register(monitor.clone(), device, move |removed| async move {
            let _ = tx.send(removed);
        });

        monitor.fire(device);
        let removed = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed, device);
    }

    #[tokio::test]
    async fn test_other_device_is_ignored() {
        let monitor = Arc::new(TestMonitor::default());
        let device = DeviceHandleId::new();
        let (tx, mut rx) = oneshot::channel::<DeviceHandleId>();

        let _watch = DisconnectWatch::register(monitor.clone(), device, move |removed| async move {
            let _ = tx.send(removed);
        });

        monitor.fire(DeviceHandleId::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deregister_removes_listener_once() {
        let monitor = Arc::new(TestMonitor::default());
        let mut watch = DisconnectWatch::register(monitor.clone(), DeviceHandleId::new(), |_| async {});
        assert_eq!(monitor.count(), 1);

        assert!(watch.deregister());
        assert!(!watch.deregister());
        assert_eq!(monitor.count(), 0);
    }

    #[tokio::test]
    async fn test_drop_removes_listener() {
        let monitor = Arc::new(TestMonitor::default());
        let watch = DisconnectWatch::register(monitor.clone(), DeviceHandleId::new(), |_| async {});
        drop(watch);
        assert_eq!(monitor.count(), 0);
    }
}
