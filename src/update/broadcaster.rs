use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::models::UpdateState;

/// Anything that wants to be told about update state changes (a window, the tray menu).
///
/// Called synchronously on every transition, so implementations should hand the
/// snapshot off (emit, send on a channel) rather than do slow work inline.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, state: &UpdateState);
}

struct Registration {
    id: Uuid,
    observer: Weak<dyn StatusObserver>,
}

/// Fans state snapshots out to every attached observer.
#[derive(Clone, Default)]
pub struct StatusBroadcaster {
    observers: Arc<Mutex<Vec<Registration>>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer. It stays attached until the returned handle is
    /// detached or dropped, or until the observer itself is dropped.
    #[must_use = "dropping the handle detaches the observer"]
    pub fn attach(&self, observer: Arc<dyn StatusObserver>) -> ObserverHandle {
        let id = Uuid::new_v4();
        self.observers.lock().push(Registration {
            id,
            observer: Arc::downgrade(&observer),
        });
        log::debug!("Status observer {} attached", id);
        ObserverHandle {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Push `state` to all live observers. Observers that went away are pruned.
    pub fn publish(&self, state: &UpdateState) {
        // Collect strong refs first so observers never run under our lock
        let live: Vec<Arc<dyn StatusObserver>> = {
            let mut observers = self.observers.lock();
            observers.retain(|r| r.observer.strong_count() > 0);
            observers.iter().filter_map(|r| r.observer.upgrade()).collect()
        };

        for observer in live {
            observer.on_status(state);
        }
    }

    pub fn observer_count(&self) -> usize {
        let mut observers = self.observers.lock();
        observers.retain(|r| r.observer.strong_count() > 0);
        observers.len()
    }
}

/// Disposer returned by [`StatusBroadcaster::attach`].
pub struct ObserverHandle {
    id: Uuid,
    observers: Weak<Mutex<Vec<Registration>>>,
}

impl ObserverHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn detach(self) {
        // Drop does the work
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.lock().retain(|r| r.id != self.id);
            log::debug!("Status observer {} detached", self.id);
        }
    }
}

/// Forwards every snapshot into a tokio channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UpdateState>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<UpdateState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl StatusObserver for ChannelObserver {
    fn on_status(&self, state: &UpdateState) {
        // Receiver gone means the window closed; nothing to do
        let _ = self.tx.send(state.clone());
    }
}

/// Writes every transition to the log.
pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn on_status(&self, state: &UpdateState) {
        match state {
            UpdateState::Downloading { info, progress } => {
                log::debug!("Update status: downloading {} ({}%)", info.version, progress)
            }
            UpdateState::Error { message, retry_count } => {
                log::info!("Update status: error ({}), retries: {}", message, retry_count)
            }
            other => match other.info() {
                Some(info) => log::info!("Update status: {} {}", other.name(), info.version),
                None => log::info!("Update status: {}", other.name()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_observers_is_noop() {
        let broadcaster = StatusBroadcaster::new();
        broadcaster.publish(&UpdateState::Checking);
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[test]
    fn test_every_observer_gets_snapshot() {
        let broadcaster = StatusBroadcaster::new();
        let (first, mut first_rx) = ChannelObserver::new();
        let (second, mut second_rx) = ChannelObserver::new();
        let _h1 = broadcaster.attach(first.clone());
        let _h2 = broadcaster.attach(second.clone());

        broadcaster.publish(&UpdateState::Checking);

        assert_eq!(first_rx.try_recv().unwrap(), UpdateState::Checking);
        assert_eq!(second_rx.try_recv().unwrap(), UpdateState::Checking);
    }

    #[test]
    fn test_detach_stops_delivery() {
        let broadcaster = StatusBroadcaster::new();
        let (observer, mut rx) = ChannelObserver::new();
        let handle = broadcaster.attach(observer.clone());
        handle.detach();

        broadcaster.publish(&UpdateState::Idle);
        assert!(rx.try_recv().is_err());
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let broadcaster = StatusBroadcaster::new();
        let (observer, rx) = ChannelObserver::new();
        let _handle = broadcaster.attach(observer);
        drop(rx);

        // Observer Arc was moved into attach and dropped, only the weak ref remains
        broadcaster.publish(&UpdateState::Checking);
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[test]
    fn test_closed_receiver_does_not_panic() {
        let broadcaster = StatusBroadcaster::new();
        let (observer, rx) = ChannelObserver::new();
        let _handle = broadcaster.attach(observer.clone());
        drop(rx);
        broadcaster.publish(&UpdateState::Checking);
        assert_eq!(broadcaster.observer_count(), 1);
    }
}
