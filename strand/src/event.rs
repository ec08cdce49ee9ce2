//! Hierarchical event dispatch
//!
//! Event names are dot-separated (`connection.state_changed.idle`). A
//! listener registered on `prefix.*` receives every event below `prefix`.
//! For a given event, wildcard listeners run first, shallowest prefix first,
//! then listeners of the exact name. Any listener can stop the dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Whether dispatch continues to the next listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Continue,
    Stop,
}

/// Handle returned by [`EventManager::listen`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&str, &T) -> Propagation + Send + Sync>;

/// Registry of listeners for events carrying a `T` payload.
pub struct EventManager<T> {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener<T>)>>>,
    next_id: AtomicU64,
}

impl<T> Default for EventManager<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> EventManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for an exact name or a `prefix.*` pattern.
    pub fn listen<F>(&self, pattern: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&str, &T) -> Propagation + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(pattern.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn forget(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(entry, _)| *entry != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Dispatch an event. Listeners run without any lock held, so they may
    /// register listeners or emit further events.
    pub fn emit(&self, name: &str, payload: &T) -> Propagation {
        let chain = self.chain(name);
        for listener in chain {
            if listener(name, payload) == Propagation::Stop {
                return Propagation::Stop;
            }
        }
        Propagation::Continue
    }

    pub fn has_listeners(&self, name: &str) -> bool {
        !self.chain(name).is_empty()
    }

    fn chain(&self, name: &str) -> Vec<Listener<T>> {
        let listeners = self.listeners.read();
        let mut chain = Vec::new();
        for (i, _) in name.match_indices('.') {
            let pattern = format!("{}.*", &name[..i]);
            if let Some(entries) = listeners.get(&pattern) {
                chain.extend(entries.iter().map(|(_, l)| Arc::clone(l)));
            }
        }
        if let Some(entries) = listeners.get(name) {
            chain.extend(entries.iter().map(|(_, l)| Arc::clone(l)));
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(
        events: &EventManager<u32>,
        log: &Arc<Mutex<Vec<String>>>,
        pattern: &str,
        result: Propagation,
    ) -> ListenerId {
        let log = Arc::clone(log);
        let tag = pattern.to_string();
        events.listen(pattern, move |name, payload| {
            log.lock().push(format!("{} <- {}:{}", tag, name, payload));
            result
        })
    }

    #[test]
    fn test_wildcards_run_before_exact_name() {
        let events = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&events, &log, "connection.state_changed.idle", Propagation::Continue);
        recorder(&events, &log, "connection.state_changed.*", Propagation::Continue);
        recorder(&events, &log, "connection.*", Propagation::Continue);
        recorder(&events, &log, "pool.*", Propagation::Continue);

        assert_eq!(
            events.emit("connection.state_changed.idle", &7),
            Propagation::Continue
        );
        assert_eq!(
            *log.lock(),
            vec![
                "connection.* <- connection.state_changed.idle:7",
                "connection.state_changed.* <- connection.state_changed.idle:7",
                "connection.state_changed.idle <- connection.state_changed.idle:7",
            ]
        );
    }

    #[test]
    fn test_stop_propagation() {
        let events = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&events, &log, "a.*", Propagation::Stop);
        recorder(&events, &log, "a.b", Propagation::Continue);

        assert_eq!(events.emit("a.b", &1), Propagation::Stop);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_forget() {
        let events = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = recorder(&events, &log, "a.b", Propagation::Continue);
        assert!(events.has_listeners("a.b"));
        assert!(events.forget(id));
        assert!(!events.forget(id));
        events.emit("a.b", &1);
        assert!(log.lock().is_empty());
        assert!(!events.has_listeners("a.b"));
    }

    #[test]
    fn test_listener_may_emit() {
        let events = Arc::new(EventManager::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&events, &log, "inner", Propagation::Continue);
        let nested = Arc::clone(&events);
        events.listen("outer", move |_, payload| nested.emit("inner", payload));
        events.emit("outer", &3);
        assert_eq!(*log.lock(), vec!["inner <- inner:3"]);
    }
}
