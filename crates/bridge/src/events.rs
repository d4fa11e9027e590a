use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::protocol::{RemoteError, WorkerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<T: ?Sized> {
    id: ListenerId,
    callback: Arc<dyn Fn(&T) + Send + Sync>,
    once: bool,
}

/// Listeners for one event, called in registration order.
///
/// Callbacks run on the thread that emits, outside the internal lock, so a
/// callback may add or remove listeners.
pub struct Listeners<T: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Listeners<T> {
    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(Arc::new(callback), false, false)
    }

    pub fn once<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(Arc::new(callback), true, false)
    }

    pub fn prepend<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(Arc::new(callback), false, true)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        before != entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Calls every listener with `value` and returns how many were called.
    pub fn emit(&self, value: &T) -> usize {
        let callbacks: Vec<Arc<dyn Fn(&T) + Send + Sync>> = {
            let mut entries = self.lock();
            let callbacks = entries.iter().map(|entry| entry.callback.clone()).collect();
            entries.retain(|entry| !entry.once);
            callbacks
        };
        for callback in &callbacks {
            callback(value);
        }
        callbacks.len()
    }

    fn insert(
        &self,
        callback: Arc<dyn Fn(&T) + Send + Sync>,
        once: bool,
        front: bool,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry { id, callback, once };
        let mut entries = self.lock();
        if front {
            entries.insert(0, entry);
        } else {
            entries.push(entry);
        }
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuitStatus {
    pub status: i32,
    pub error: Option<String>,
}

/// Everything a controller can observe without issuing a request.
#[derive(Default)]
pub struct ClientEvents {
    pub ready: Listeners<()>,
    pub error: Listeners<RemoteError>,
    pub exit: Listeners<i32>,
    pub quit: Listeners<QuitStatus>,
    pub message: Listeners<WorkerMessage>,
    pub stdout: Listeners<str>,
    pub stderr: Listeners<str>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn emit_fans_out_in_registration_order() {
        let listeners: Listeners<str> = Listeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            listeners.on(move |chunk: &str| seen.lock().unwrap().push(format!("{tag}:{chunk}")));
        }
        let seen_front = seen.clone();
        listeners.prepend(move |chunk: &str| seen_front.lock().unwrap().push(format!("z:{chunk}")));

        assert_eq!(listeners.emit("x"), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["z:x", "a:x", "b:x"]);
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let listeners: Listeners<i32> = Listeners::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        listeners.once(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        listeners.emit(&1);
        listeners.emit(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn off_removes_listener() {
        let listeners: Listeners<()> = Listeners::default();
        let id = listeners.on(|_| {});
        listeners.on(|_| {});
        assert!(listeners.off(id));
        assert!(!listeners.off(id));
        assert_eq!(listeners.emit(&()), 1);
    }

    #[test]
    fn listener_may_unsubscribe_itself_while_emitting() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::default());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let inner_listeners = listeners.clone();
        let inner_slot = slot.clone();
        let id = listeners.on(move |_| {
            if let Some(id) = *inner_slot.lock().unwrap() {
                inner_listeners.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);
        assert_eq!(listeners.emit(&()), 1);
        assert_eq!(listeners.emit(&()), 0);
    }
}
