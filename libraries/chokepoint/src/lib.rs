//! Coalesces concurrent lookups of the same key into one computation.
//!
//! A `ChokePoint` is an owned object, not a global: build one per consumer and drop
//! (or [`ChokePoint::clear`]) it when that consumer goes away. It is `!Send` and meant
//! for single-threaded executors; values are handed out as `Rc`s.

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::time::Instant;

type SharedResult<V, E> = Shared<LocalBoxFuture<'static, Result<Rc<V>, E>>>;

pub struct ChokePoint<K, V, E> {
    entries: Rc<RefCell<HashMap<K, Entry<V, E>>>>,
    next_id: Cell<u64>,
    fresh_for: Option<Duration>,
}

enum Entry<V, E> {
    // In-flight computation, shared by every caller that asks meanwhile
    Computing { id: u64, future: SharedResult<V, E> },
    Completed { value: Rc<V>, at: Instant },
}

impl<K, V, E> Default for ChokePoint<K, V, E>
where
    K: Clone + Eq + Hash + 'static,
    V: 'static,
    E: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> ChokePoint<K, V, E>
where
    K: Clone + Eq + Hash + 'static,
    V: 'static,
    E: Clone + 'static,
{
    /// Completed values are kept until invalidated.
    pub fn new() -> Self {
        Self {
            entries: Rc::new(RefCell::new(HashMap::new())),
            next_id: Cell::new(0),
            fresh_for: None,
        }
    }

    /// Completed values older than `fresh_for` are recomputed on the next lookup.
    pub fn with_freshness(fresh_for: Duration) -> Self {
        Self {
            fresh_for: Some(fresh_for),
            ..Self::new()
        }
    }

    /// Return the cached value for `key`, join the computation already running for
    /// it, or start `compute`. `compute` is dropped unpolled when it isn't needed.
    /// Errors are handed to every waiter and are never cached.
    pub async fn get<Fut>(&self, key: K, compute: Fut) -> Result<Rc<V>, E>
    where
        Fut: Future<Output = Result<V, E>> + 'static,
    {
        let pending = {
            let mut entries = self.entries.borrow_mut();
            match entries.get(&key) {
                Some(Entry::Completed { value, at }) if self.is_fresh(*at) => {
                    return Ok(Rc::clone(value));
                }
                Some(Entry::Computing { future, .. }) => future.clone(),
                _ => {
                    let id = self.next_id.get();
                    self.next_id.set(id + 1);
                    let future = Self::settle(Rc::downgrade(&self.entries), key.clone(), id, compute);
                    entries.insert(key, Entry::Computing { id, future: future.clone() });
                    future
                }
            }
        };

        pending.await
    }

    /// Forget whatever is known about `key`. A computation still running for it will
    /// finish for its current waiters but won't be cached.
    pub fn invalidate(&self, key: &K) {
        self.entries.borrow_mut().remove(key);
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn is_computing(&self, key: &K) -> bool {
        matches!(
            self.entries.borrow().get(key),
            Some(Entry::Computing { .. })
        )
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn is_fresh(&self, at: Instant) -> bool {
        self.fresh_for.is_none_or(|fresh_for| at.elapsed() < fresh_for)
    }

    fn settle<Fut>(
        entries: Weak<RefCell<HashMap<K, Entry<V, E>>>>,
        key: K,
        id: u64,
        compute: Fut,
    ) -> SharedResult<V, E>
    where
        Fut: Future<Output = Result<V, E>> + 'static,
    {
        async move {
            let result = compute.await.map(Rc::new);

            // The map is gone if the ChokePoint was dropped mid-flight
            if let Some(entries) = entries.upgrade() {
                let mut entries = entries.borrow_mut();
                let still_ours = matches!(
                    entries.get(&key),
                    Some(Entry::Computing { id: current, .. }) if *current == id
                );
                if still_ours {
                    match &result {
                        Ok(value) => {
                            entries.insert(
                                key,
                                Entry::Completed {
                                    value: Rc::clone(value),
                                    at: Instant::now(),
                                },
                            );
                        }
                        Err(_) => {
                            entries.remove(&key);
                        }
                    }
                }
            }

            result
        }
        .boxed_local()
        .shared()
    }
}
