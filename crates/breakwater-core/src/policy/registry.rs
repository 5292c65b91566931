//! Circuit registry — one breaker per endpoint name, created lazily.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{CircuitConfig, ConfigSubscriber, EndpointConfig};
use crate::events::{EventBus, EventKind};
use crate::lock::{read, write};

use super::circuit_breaker::{CircuitBreaker, Transition};

/// Keyed store of [`CircuitBreaker`]s.
///
/// The map lock is only held to find or insert a breaker; every state
/// change happens under that breaker's own lock.
pub struct CircuitRegistry {
    circuits: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: EventBus,
}

impl CircuitRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Look up a breaker without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        read(&self.circuits).get(name).cloned()
    }

    /// Return the breaker for `name`, creating it with `config` if unseen.
    pub fn get_or_create(&self, name: &str, config: &CircuitConfig) -> Arc<CircuitBreaker> {
        if let Some(cb) = self.get(name) {
            return cb;
        }
        let mut circuits = write(&self.circuits);
        if let Some(cb) = circuits.get(name) {
            return cb.clone();
        }
        let cb = Arc::new(CircuitBreaker::new(name, *config));
        circuits.insert(name.to_string(), cb.clone());
        drop(circuits);

        tracing::debug!(endpoint = name, "circuit created");
        self.events.emit(name, EventKind::CircuitCreated);
        cb
    }

    /// Known endpoint names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.circuits).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        read(&self.circuits).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force a known circuit back to `Closed`.
    pub fn reset(&self, name: &str) -> Option<Transition> {
        let transition = self.get(name)?.reset()?;
        self.events.emit(
            name,
            EventKind::StateChange {
                from: transition.from,
                to: transition.to,
            },
        );
        Some(transition)
    }
}

impl ConfigSubscriber for CircuitRegistry {
    fn config_changed(&self, endpoint: &str, config: &EndpointConfig) {
        self.get_or_create(endpoint, &config.circuit)
            .set_config(config.circuit);
    }
}

impl std::fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitRegistry")
            .field("circuits", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::policy::CircuitStatus;

    fn registry() -> (CircuitRegistry, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (CircuitRegistry::new(EventBus::new(sink.clone())), sink)
    }

    #[test]
    fn creates_once_per_name() {
        let (reg, sink) = registry();
        let a = reg.get_or_create("svc", &CircuitConfig::default());
        let b = reg.get_or_create("svc", &CircuitConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
        reg.get_or_create("other", &CircuitConfig::default());

        assert_eq!(reg.names(), vec!["other".to_string(), "svc".to_string()]);
        assert_eq!(sink.count("svc", "circuit_created"), 1);
    }

    #[test]
    fn endpoints_are_independent() {
        let (reg, _) = registry();
        let cfg = CircuitConfig { failure_threshold: 1, ..Default::default() };
        reg.get_or_create("a", &cfg).record_failure();
        assert_eq!(reg.get("a").unwrap().status(), CircuitStatus::Open);
        assert_eq!(reg.get_or_create("b", &cfg).status(), CircuitStatus::Closed);
    }

    #[test]
    fn config_change_creates_or_updates() {
        let (reg, _) = registry();
        let mut cfg = EndpointConfig::default();
        cfg.circuit.failure_threshold = 9;
        reg.config_changed("svc", &cfg);
        assert_eq!(reg.get("svc").unwrap().config().failure_threshold, 9);

        cfg.circuit.failure_threshold = 4;
        reg.config_changed("svc", &cfg);
        assert_eq!(reg.get("svc").unwrap().config().failure_threshold, 4);
    }

    #[test]
    fn reset_emits_state_change() {
        let (reg, sink) = registry();
        let cfg = CircuitConfig { failure_threshold: 1, ..Default::default() };
        reg.get_or_create("svc", &cfg).record_failure();

        assert!(reg.reset("svc").is_some());
        assert!(reg.reset("svc").is_none());
        assert!(reg.reset("missing").is_none());
        assert_eq!(sink.count("svc", "state_change"), 1);
    }
}
