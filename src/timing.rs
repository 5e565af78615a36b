//! Wall-clock accounting for the main phases of a simulation run.
//!
//! An explicit collaborator passed to whoever needs it; there is no global
//! registry. Nested or overlapping sections are allowed as long as each
//! `start` is matched by a `stop` with the same label.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct Timing {
    sections: BTreeMap<&'static str, Section>,
}

#[derive(Default)]
struct Section {
    total: Duration,
    count: u64,
    started: Option<Instant>,
}

impl Timing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, label: &'static str) {
        let s = self.sections.entry(label).or_default();
        s.started = Some(Instant::now());
    }

    pub fn stop(&mut self, label: &'static str) {
        if let Some(s) = self.sections.get_mut(label) {
            if let Some(t0) = s.started.take() {
                s.total += t0.elapsed();
                s.count += 1;
            }
        }
    }

    pub fn total(&self, label: &str) -> Duration {
        self.sections
            .get(label)
            .map(|s| s.total)
            .unwrap_or_default()
    }

    /// One line per section: label, cumulative seconds, call count.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (label, s) in &self.sections {
            out.push_str(&format!(
                "{:<28} {:>10.3} s  ({} calls)\n",
                label,
                s.total.as_secs_f64(),
                s.count
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_across_sections() {
        let mut t = Timing::new();
        t.start("sweep");
        t.stop("sweep");
        t.start("sweep");
        t.stop("sweep");
        assert!(t.report().contains("2 calls"));
    }

    #[test]
    fn unmatched_stop_is_ignored() {
        let mut t = Timing::new();
        t.stop("nothing");
        assert_eq!(t.total("nothing"), Duration::ZERO);
    }
}
