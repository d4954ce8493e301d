//! Process-wide agent registry.
//!
//! Maps event type → subscribed agents and agent name → record. Populated at
//! composition root, effectively read-only during steady state; the coarse
//! lock only matters for the startup registration pass.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::contract::{Agent, CATCH_ALL};

#[derive(Default)]
struct Indexes {
    by_type: HashMap<String, Vec<String>>,
    agents: HashMap<String, Arc<dyn Agent>>,
}

#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<Indexes>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under every event type it subscribes to.
    ///
    /// Registering a duplicate name replaces the prior entry (with a
    /// warning), including its subscriptions.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if inner.agents.contains_key(&name) {
            warn!(agent = %name, "replacing previously registered agent");
            Self::remove_from_index(&mut inner, &name);
        }

        for event_type in agent.subscriptions() {
            let subscribers = inner.by_type.entry((*event_type).to_string()).or_default();
            if !subscribers.contains(&name) {
                subscribers.push(name.clone());
            }
        }
        inner.agents.insert(name, agent);
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.agents.remove(name).is_none() {
            return false;
        }
        Self::remove_from_index(&mut inner, name);
        true
    }

    fn remove_from_index(inner: &mut Indexes, name: &str) {
        for subscribers in inner.by_type.values_mut() {
            subscribers.retain(|n| n != name);
        }
        inner.by_type.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Agents subscribed to `event_type`, plus catch-all subscribers, in
    /// registration order without duplicates.
    pub fn agents_for(&self, event_type: &str) -> Vec<Arc<dyn Agent>> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut names: Vec<&String> = Vec::new();
        for key in [event_type, CATCH_ALL] {
            if let Some(subscribers) = inner.by_type.get(key) {
                for name in subscribers {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }

        names
            .into_iter()
            .filter_map(|name| inner.agents.get(name).cloned())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = inner.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(guard) => guard.agents.len(),
            Err(poisoned) => poisoned.into_inner().agents.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
