use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

/// Lock-free counter cycling through `0..period`.
#[derive(Debug)]
pub struct ModularCounter {
    next: AtomicUsize,
    period: usize,
}

impl ModularCounter {
    pub fn new(period: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            period: period.max(1),
        }
    }

    pub fn next(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.period
    }
}

/// Spreads sessions round-robin over `n_ports` consecutive ports starting at
/// the configured base port, with an independent cycle per host.
#[derive(Debug)]
pub struct PortRotator {
    n_ports: usize,
    hosts: RwLock<HashMap<String, ModularCounter>>,
}

impl PortRotator {
    pub fn new(n_ports: usize) -> Self {
        Self {
            n_ports,
            hosts: RwLock::new(HashMap::new()),
        }
    }

    pub fn port_for(&self, host: &str, base_port: u16) -> u16 {
        let offset = {
            let hosts = self.hosts.read();
            hosts.get(host).map(ModularCounter::next)
        };

        let offset = match offset {
            Some(offset) => offset,
            None => self
                .hosts
                .write()
                .entry(host.to_string())
                .or_insert_with(|| ModularCounter::new(self.n_ports))
                .next(),
        };

        u16::try_from(offset).map_or(u16::MAX, |offset| base_port.saturating_add(offset))
    }
}
