//! Atomic metric instruments.
//!
//! Counters track protocol traffic, gauges track how many segments sit in
//! each ownership bucket. Both render themselves in Prometheus text format
//! through [`Instrument`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    name: &'static str,
    help: &'static str,
}

/// Common surface of counters and gauges for exposition.
pub trait Instrument {
    fn name(&self) -> &'static str;
    fn help(&self) -> &'static str;
    /// Prometheus metric type.
    fn kind(&self) -> &'static str;
    fn render_value(&self) -> String;

    /// Append `# HELP`, `# TYPE` and the sample line to `out`.
    fn expose(&self, out: &mut String) {
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n",
            name = self.name(),
            help = self.help(),
            kind = self.kind(),
            value = self.render_value(),
        );
    }
}

/// Monotonic event count.
#[derive(Debug)]
pub struct Counter {
    desc: Descriptor,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Count `n` events at once, e.g. every key of a delivered batch.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Instrument for Counter {
    fn name(&self) -> &'static str {
        self.desc.name
    }

    fn help(&self) -> &'static str {
        self.desc.help
    }

    fn kind(&self) -> &'static str {
        "counter"
    }

    fn render_value(&self) -> String {
        self.get().to_string()
    }
}

/// Current size of a population, moved by transitions.
#[derive(Debug)]
pub struct Gauge {
    desc: Descriptor,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            value: AtomicI64::new(0),
        }
    }

    /// Overwrite the value, used when a population is recounted from scratch.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.add(-1);
    }

    /// Move the gauge by `delta`, which may be negative.
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Instrument for Gauge {
    fn name(&self) -> &'static str {
        self.desc.name
    }

    fn help(&self) -> &'static str {
        self.desc.help
    }

    fn kind(&self) -> &'static str {
        "gauge"
    }

    fn render_value(&self) -> String {
        self.get().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new("c", "help");
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);
        assert_eq!(c.name(), "c");
        assert_eq!(c.kind(), "counter");
    }

    #[test]
    fn test_gauge_moves_both_ways() {
        let g = Gauge::new("g", "help");
        g.inc();
        g.add(3);
        g.dec();
        assert_eq!(g.get(), 3);
        g.add(-5);
        assert_eq!(g.get(), -2);
        g.set(10);
        assert_eq!(g.get(), 10);
    }

    #[test]
    fn test_expose() {
        let g = Gauge::new("scattered_test", "Test gauge");
        g.set(4);
        let mut out = String::new();
        g.expose(&mut out);
        assert_eq!(
            out,
            "# HELP scattered_test Test gauge\n# TYPE scattered_test gauge\nscattered_test 4\n"
        );
    }
}
