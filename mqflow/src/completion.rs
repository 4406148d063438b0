use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ChannelClosed;
use crate::types::PublishStatus;

/// Outcome of an outbound publish: a terminal status, or `ChannelClosed` if the
/// message never left the overflow queue.
pub type DeliveryResult = Result<PublishStatus, ChannelClosed>;
pub type PublishCompletion = Completion<DeliveryResult>;

type Listener<T> = Box<dyn FnOnce(&T) + Send>;

struct Inner<T> {
    value: OnceCell<T>,
    listeners: Mutex<Vec<Listener<T>>>,
    notify: Notify,
}

/// Single-assignment result cell.
///
/// The first `resolve` wins, later attempts return `false` and are otherwise ignored.
/// Listeners run on the thread of the resolving call, or immediately when added
/// to an already resolved cell.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    #[inline]
    pub fn new() -> Self {
        Completion {
            inner: Arc::new(Inner { value: OnceCell::new(), listeners: Mutex::new(Vec::new()), notify: Notify::new() }),
        }
    }

    pub fn resolve(&self, value: T) -> bool {
        if self.inner.value.set(value).is_err() {
            return false;
        }
        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        if let Some(v) = self.inner.value.get() {
            for listener in listeners {
                listener(v);
            }
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        if let Some(v) = self.inner.value.get() {
            drop(listeners);
            f(v);
        } else {
            listeners.push(Box::new(f));
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.inner.value.get().is_some()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> Completion<T> {
    #[inline]
    pub fn get(&self) -> Option<T> {
        self.inner.value.get().cloned()
    }

    pub async fn wait(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(v) = self.inner.value.get() {
                return v.clone();
            }
            notified.await;
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.value.get() {
            Some(v) => write!(f, "Completion({:?})", v),
            None => write!(f, "Completion(<pending>)"),
        }
    }
}
