//! Process-wide counter registry.
//!
//! Components register named counters once and bump them lock-free; the
//! control channel renders the whole registry as CSV on demand.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Counter::default()
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn sub(&self, amount: u64) {
        self.0.fetch_sub(amount, Ordering::Relaxed);
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

struct Registration {
    component: String,
    instance: String,
    name: String,
    counter: Counter,
}

fn registry() -> &'static RwLock<Vec<Registration>> {
    static REGISTRY: OnceLock<RwLock<Vec<Registration>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Vec::new()))
}

/// Register (or re-attach to) a counter under `component;instance;name`.
pub fn register_counter(component: &str, instance: &str, name: &str) -> Counter {
    let mut registrations = registry().write();
    if let Some(existing) = registrations
        .iter()
        .find(|r| r.component == component && r.instance == instance && r.name == name)
    {
        return existing.counter.clone();
    }
    let counter = Counter::new();
    registrations.push(Registration {
        component: component.to_string(),
        instance: instance.to_string(),
        name: name.to_string(),
        counter: counter.clone(),
    });
    counter
}

/// Drop every registration belonging to `component;instance`.
pub fn unregister_instance(component: &str, instance: &str) {
    registry()
        .write()
        .retain(|r| !(r.component == component && r.instance == instance));
}

/// Render all registered counters as `component;instance;name;value` lines.
pub fn generate_csv() -> String {
    let registrations = registry().read();
    let mut out = String::with_capacity(registrations.len() * 48);
    for r in registrations.iter() {
        out.push_str(&r.component);
        out.push(';');
        out.push_str(&r.instance);
        out.push(';');
        out.push_str(&r.name);
        out.push(';');
        out.push_str(&r.counter.get().to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_and_csv_renders() {
        let c1 = register_counter("disk_queue", "stats-test.qf", "queued");
        let c2 = register_counter("disk_queue", "stats-test.qf", "queued");
        c1.add(3);
        c2.inc();
        assert_eq!(c1.get(), 4);

        let csv = generate_csv();
        assert!(csv.contains("disk_queue;stats-test.qf;queued;4"));

        unregister_instance("disk_queue", "stats-test.qf");
        assert!(!generate_csv().contains("stats-test.qf"));
    }
}
