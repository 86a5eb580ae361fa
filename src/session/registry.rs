//! Session registry
//!
//! Maps (mode, workspace root) to the one live [`Session`] serving it.
//! Creation is single-flight: the first caller for a key runs the factory
//! and every concurrent caller for the same key waits for that result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use super::{Session, SessionKey};
use crate::error::{ProxyError, Result};

type Slot = Arc<OnceCell<Arc<Session>>>;

/// Snapshot of registry occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Initialized sessions
    pub sessions: usize,
    /// Sessions still being created
    pub starting: usize,
    /// Requests in flight across all sessions
    pub in_flight: usize,
}

/// Registry of live sessions, owned by the proxy
pub struct SessionRegistry {
    slots: Mutex<HashMap<SessionKey, Slot>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Return the live session for `key`, creating it with `factory` if needed
    ///
    /// Concurrent callers for the same key share one factory run. A session
    /// whose backend has died is replaced. If the factory fails, the error is
    /// returned and no entry is left behind once no other caller is waiting.
    pub async fn get_or_create<F, Fut>(&self, key: &SessionKey, factory: F) -> Result<Arc<Session>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>>>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(key).cloned() {
                Some(slot) => {
                    let current = slot.get().cloned();
                    match current {
                        Some(session) if session.is_alive() => return Ok(session),
                        Some(dead) => {
                            tracing::info!("Replacing dead session {} for {}", dead.id(), key);
                            tokio::spawn(async move { dead.shutdown().await });
                            self.insert_slot(&mut slots, key)?
                        }
                        None => slot,
                    }
                }
                None => self.insert_slot(&mut slots, key)?,
            }
        };

        let result = slot.get_or_try_init(factory).await.cloned();

        if result.is_err() {
            let mut slots = self.slots.lock();
            let abandoned = slots.get(key).is_some_and(|current| {
                // The map and this caller hold the only references
                Arc::ptr_eq(current, &slot) && !current.initialized() && Arc::strong_count(current) == 2
            });
            if abandoned {
                slots.remove(key);
            }
        }
        result
    }

    fn insert_slot(&self, slots: &mut HashMap<SessionKey, Slot>, key: &SessionKey) -> Result<Slot> {
        slots.remove(key);
        if slots.len() >= self.max_sessions {
            return Err(ProxyError::resource_exhausted(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }
        let slot = Slot::default();
        slots.insert(key.clone(), slot.clone());
        Ok(slot)
    }

    /// Initialized session for `key`, if any
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.slots.lock().get(key).and_then(|slot| slot.get().cloned())
    }

    /// Detach the session for `key`
    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let slot = self.slots.lock().remove(key)?;
        slot.get().cloned()
    }

    /// Detach `session` if it is still the registered one for its key
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut slots = self.slots.lock();
        let registered = slots
            .get(session.key())
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            slots.remove(session.key());
        }
        registered
    }

    /// Sessions idle longer than `older_than` with no requests in flight
    ///
    /// A zero duration lists every idle session.
    pub fn list_idle_older_than(&self, older_than: Duration) -> Vec<Arc<Session>> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| slot.get())
            .filter(|session| session.is_idle_longer_than(older_than))
            .cloned()
            .collect()
    }

    /// Atomically re-check idleness, retire and detach `session`
    ///
    /// Returns false if the session picked up work, was already retired, or
    /// is no longer the registered session for its key.
    pub fn retire_idle(&self, session: &Arc<Session>, older_than: Duration) -> bool {
        let mut slots = self.slots.lock();
        let registered = slots
            .get(session.key())
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if !registered || !session.try_retire(older_than) {
            return false;
        }
        slots.remove(session.key());
        true
    }

    /// All initialized sessions
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    /// Number of entries, including sessions still starting
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let slots = self.slots.lock();
        let mut stats = RegistryStats::default();
        for slot in slots.values() {
            match slot.get() {
                Some(session) => {
                    stats.sessions += 1;
                    stats.in_flight += session.in_flight();
                }
                None => stats.starting += 1,
            }
        }
        stats
    }

    /// Detach and retire every session
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        drained
            .into_iter()
            .filter_map(|slot| slot.get().cloned())
            .inspect(|session| session.retire())
            .collect()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("max_sessions", &self.max_sessions)
            .field("stats", &self.stats())
            .finish()
    }
}
