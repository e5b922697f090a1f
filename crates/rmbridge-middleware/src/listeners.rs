//! Reference-counted, token-addressed listener table.
//!
//! Many independent subscribers can share one underlying native
//! registration per key. The table tracks the subscribers and tells the
//! caller when to install and tear down that registration:
//!
//! ```text
//!  Unsubscribed ──add()──▶ Subscribed(1) ──add()──▶ Subscribed(N)
//!        ▲                                               │
//!        └──────────────remove() of the last token───────┘
//! ```
//!
//! Structural changes (add, remove, install, teardown) are serialised by a
//! single table lock. Delivery takes a snapshot of the subscribers, drops
//! the table lock, and then calls each subscriber in isolation: a panicking
//! subscriber is logged and the rest still run. Deliveries for the same key
//! never interleave.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rmbridge_types::{BridgeError, Token, TokenGenerator};
use tracing::{debug, error};

struct Subscribers<F: ?Sized> {
    listeners: Vec<(Token, Arc<F>)>,
    // Held for the duration of one fan-out.
    delivery: Arc<Mutex<()>>,
}

impl<F: ?Sized> Default for Subscribers<F> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            delivery: Arc::new(Mutex::new(())),
        }
    }
}

/// Subscribers grouped by key `K`. `F` is the (usually unsized) callback
/// type, e.g. `dyn Fn(&KeyResult) + Send + Sync`.
pub struct ListenerTable<K, F: ?Sized> {
    tokens: Arc<TokenGenerator>,
    entries: Mutex<HashMap<K, Subscribers<F>>>,
}

impl<K, F> ListenerTable<K, F>
where
    K: Copy + Eq + Hash + Debug,
    F: ?Sized,
{
    /// Create a table drawing tokens from `tokens`.
    pub fn new(tokens: Arc<TokenGenerator>) -> Self {
        Self {
            tokens,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register `listener` for `key`.
    ///
    /// `install` runs, under the table lock, only when this is the first
    /// listener for `key`.
    ///
    /// # Errors
    ///
    /// Whatever `install` returns. The listener is not added in that case.
    pub fn add<I>(&self, key: K, listener: Arc<F>, install: I) -> Result<Token, BridgeError>
    where
        I: FnOnce() -> Result<(), BridgeError>,
    {
        let mut entries = self.lock();
        let first = entries.get(&key).is_none_or(|s| s.listeners.is_empty());
        if first {
            install()?;
            debug!(?key, "native subscription installed");
        }

        let token = self.tokens.next();
        entries.entry(key).or_default().listeners.push((token, listener));
        Ok(token)
    }

    /// Remove the listener registered under `token` for `key`.
    ///
    /// `teardown` runs, under the table lock, when the last listener for
    /// `key` goes away.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotFound`] if `token` is not registered for `key`.
    pub fn remove<T>(&self, key: K, token: Token, teardown: T) -> Result<(), BridgeError>
    where
        T: FnOnce(),
    {
        let mut entries = self.lock();
        let subscribers = entries
            .get_mut(&key)
            .ok_or(BridgeError::NotFound(token.id()))?;
        let position = subscribers
            .listeners
            .iter()
            .position(|(t, _)| *t == token)
            .ok_or(BridgeError::NotFound(token.id()))?;
        subscribers.listeners.remove(position);

        if subscribers.listeners.is_empty() {
            entries.remove(&key);
            teardown();
            debug!(?key, "native subscription torn down");
        }
        Ok(())
    }

    /// Call `invoke` once for every listener registered for `key` at the
    /// time of the call. Returns how many listeners were invoked.
    pub fn deliver<C>(&self, key: K, invoke: C) -> usize
    where
        C: Fn(&F),
    {
        let snapshot = {
            let entries = self.lock();
            entries.get(&key).map(|s| {
                let listeners: Vec<Arc<F>> = s.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
                (Arc::clone(&s.delivery), listeners)
            })
        };
        let Some((gate, listeners)) = snapshot else {
            return 0;
        };

        let _in_order = gate.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in &listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| invoke(listener.as_ref()))).is_err() {
                error!(?key, "listener panicked during delivery");
            }
        }
        listeners.len()
    }

    /// Number of listeners currently registered for `key`.
    pub fn count(&self, key: K) -> usize {
        self.lock().get(&key).map_or(0, |s| s.listeners.len())
    }

    /// Total number of listeners across all keys.
    pub fn len(&self) -> usize {
        self.lock().values().map(|s| s.listeners.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener without running teardown. Returns the keys that
    /// had subscribers.
    pub fn clear(&self) -> Vec<K> {
        self.lock().drain().map(|(k, _)| k).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Subscribers<F>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    type Listener = dyn Fn(u32) + Send + Sync;

    fn table() -> ListenerTable<u32, Listener> {
        ListenerTable::new(Arc::new(TokenGenerator::new()))
    }

    fn counting(hits: &Arc<AtomicUsize>) -> Arc<Listener> {
        let h = Arc::clone(hits);
        Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn install_once_teardown_once() -> Result<(), BridgeError> {
        let table = table();
        let installs = AtomicUsize::new(0);
        let teardowns = AtomicUsize::new(0);
        let hits = Arc::new(AtomicUsize::new(0));

        let mut tokens = Vec::new();
        for _ in 0..5 {
            tokens.push(table.add(7, counting(&hits), || {
                installs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?);
        }
        assert_eq!(table.count(7), 5);

        // Remove in a scrambled order.
        for i in [3, 0, 4, 1, 2] {
            table.remove(7, tokens[i], || {
                teardowns.fetch_add(1, Ordering::SeqCst);
            })?;
        }

        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn failed_install_adds_nothing() {
        let table = table();
        let hits = Arc::new(AtomicUsize::new(0));
        let result = table.add(1, counting(&hits), || Err(BridgeError::NotConnected));

        assert!(matches!(result, Err(BridgeError::NotConnected)));
        assert_eq!(table.count(1), 0);
        assert_eq!(table.deliver(1, |l| l(0)), 0);
    }

    #[test]
    fn unknown_token_is_not_found() -> Result<(), BridgeError> {
        let table = table();
        let hits = Arc::new(AtomicUsize::new(0));
        let token = table.add(1, counting(&hits), || Ok(()))?;

        assert!(matches!(
            table.remove(2, token, || {}),
            Err(BridgeError::NotFound(_))
        ));
        table.remove(1, token, || {})?;
        assert!(matches!(
            table.remove(1, token, || {}),
            Err(BridgeError::NotFound(id)) if id == token.id()
        ));
        Ok(())
    }

    #[test]
    fn panicking_listener_does_not_block_others() -> Result<(), BridgeError> {
        let table = table();
        let hits = Arc::new(AtomicUsize::new(0));
        table.add(1, counting(&hits), || Ok(()))?;
        table.add(1, Arc::new(|_| panic!("listener failure")), || Ok(()))?;
        table.add(1, counting(&hits), || Ok(()))?;

        assert_eq!(table.deliver(1, |l| l(42)), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn removal_mid_delivery_keeps_snapshot() -> Result<(), BridgeError> {
        let table = Arc::new(table());
        let hits = Arc::new(AtomicUsize::new(0));
        let victim = Arc::new(Mutex::new(None::<Token>));

        let remover = {
            let table = Arc::clone(&table);
            let victim = Arc::clone(&victim);
            let hits = Arc::clone(&hits);
            Arc::new(move |_: u32| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(token) = victim.lock().unwrap().take() {
                    table.remove(1, token, || {}).expect("victim registered");
                }
            }) as Arc<Listener>
        };

        table.add(1, remover, || Ok(()))?;
        let token = table.add(1, counting(&hits), || Ok(()))?;
        table.add(1, counting(&hits), || Ok(()))?;
        *victim.lock().unwrap() = Some(token);

        assert_eq!(table.deliver(1, |l| l(0)), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(table.count(1), 2);

        hits.store(0, Ordering::SeqCst);
        table.deliver(1, |l| l(0));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn concurrent_add_remove_balances() {
        let table = Arc::new(table());
        let installs = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let installs = Arc::clone(&installs);
                let teardowns = Arc::clone(&teardowns);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let token = table
                            .add(3, Arc::new(|_| {}), || {
                                installs.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .expect("install never fails");
                        table
                            .remove(3, token, || {
                                teardowns.fetch_add(1, Ordering::SeqCst);
                            })
                            .expect("token registered");
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("worker panicked");
        }

        assert_eq!(table.count(3), 0);
        assert_eq!(
            installs.load(Ordering::SeqCst),
            teardowns.load(Ordering::SeqCst)
        );
    }
}
