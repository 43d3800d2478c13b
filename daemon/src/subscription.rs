/// Ordered callback registry shared by the log bus, the calendar listeners and
/// the config store.
///
/// Every registration hands back a [`Subscription`] that owns the right to
/// remove it.  Callbacks are invoked outside the registry lock, so a callback
/// may subscribe or unsubscribe (including itself) while being notified.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Entries<F: ?Sized> {
    next_id: u64,
    list: Vec<(u64, Arc<F>)>,
}

trait Unregister: Send + Sync {
    fn remove(&self, id: u64);
}

impl<F: ?Sized + Send + Sync> Unregister for Mutex<Entries<F>> {
    fn remove(&self, id: u64) {
        lock(self).list.retain(|(entry_id, _)| *entry_id != id);
    }
}

/// A list of callbacks of type `F`, notified in registration order.
pub struct Subscribers<F: ?Sized> {
    entries: Arc<Mutex<Entries<F>>>,
}

impl<F: ?Sized> Clone for Subscribers<F> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for Subscribers<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized + Send + Sync + 'static> Subscribers<F> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                list: Vec::new(),
            })),
        }
    }

    /// Appends `callback` to the list.
    pub fn add(&self, callback: Arc<F>) -> Subscription {
        let id = {
            let mut entries = lock(&self.entries);
            let id = entries.next_id;
            entries.next_id += 1;
            entries.list.push((id, callback));
            id
        };
        let entries: Arc<dyn Unregister> = self.entries.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&entries),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `notify` once per subscriber, in registration order.
    ///
    /// A panicking subscriber is logged and skipped; the remaining subscribers
    /// still run.
    pub fn emit(&self, mut notify: impl FnMut(&F)) {
        let snapshot: Vec<Arc<F>> = lock(&self.entries)
            .list
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| notify(&callback))).is_err() {
                tracing::error!("subscriber panicked; remaining subscribers still notified");
            }
        }
    }
}

/// Removal handle for one registered callback.
///
/// Dropping the handle leaves the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.  Use [`SubscriptionGuard`] for
/// scope-bound registrations.
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Unregister>,
}

impl Subscription {
    /// Removes the callback.  Consumes the handle, so it can only happen once.
    pub fn unsubscribe(self) {
        self.remove();
    }

    /// Idempotent removal used by self-disposing callbacks.
    pub(crate) fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    /// Second handle to the same registration, for callbacks that dispose of
    /// themselves while the caller keeps the original.
    pub(crate) fn handle(&self) -> Subscription {
        Subscription {
            id: self.id,
            registry: self.registry.clone(),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Unsubscribes when dropped, on every exit path of the owning scope.
pub struct SubscriptionGuard(Option<Subscription>);

impl SubscriptionGuard {
    pub fn new(subscription: Subscription) -> Self {
        Self(Some(subscription))
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            subscription.unsubscribe();
        }
    }
}
