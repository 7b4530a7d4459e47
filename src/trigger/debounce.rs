// src/trigger/debounce.rs

use crate::types::DebounceKind;

/// Holds a boolean signal at its baseline until a change has persisted for
/// the whole debounce window.
#[derive(Debug, Clone)]
pub(crate) struct Debouncer {
    window_us: u64,
    kind: DebounceKind,
    baseline: bool,
    since_us: u64,
}

impl Debouncer {
    pub(crate) fn new(window_us: u64, kind: DebounceKind, now_us: u64) -> Self {
        Self {
            window_us,
            kind,
            baseline: kind == DebounceKind::Falling,
            since_us: now_us,
        }
    }

    pub(crate) fn calculate(&mut self, input: bool, now_us: u64) -> bool {
        if input == self.baseline {
            self.since_us = now_us;
        }

        if now_us.saturating_sub(self.since_us) >= self.window_us {
            if self.kind == DebounceKind::Both {
                self.baseline = input;
                self.since_us = now_us;
            }
            input
        } else {
            self.baseline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000;

    #[test]
    fn rising_needs_the_full_window() {
        let mut d = Debouncer::new(100 * MS, DebounceKind::Rising, 0);

        assert!(!d.calculate(true, 0));
        assert!(!d.calculate(true, 50 * MS));
        assert!(d.calculate(true, 100 * MS));
        // Falling edges pass straight through.
        assert!(!d.calculate(false, 110 * MS));
    }

    #[test]
    fn a_glitch_restarts_the_window() {
        let mut d = Debouncer::new(100 * MS, DebounceKind::Rising, 0);

        assert!(!d.calculate(true, 10 * MS));
        assert!(!d.calculate(false, 60 * MS));
        assert!(!d.calculate(true, 70 * MS));
        assert!(!d.calculate(true, 150 * MS));
        assert!(d.calculate(true, 160 * MS));
    }

    #[test]
    fn falling_starts_high() {
        let mut d = Debouncer::new(100 * MS, DebounceKind::Falling, 0);

        assert!(d.calculate(false, 0));
        assert!(d.calculate(false, 99 * MS));
        assert!(!d.calculate(false, 100 * MS));
        assert!(d.calculate(true, 101 * MS));
    }

    #[test]
    fn both_debounces_each_direction() {
        let mut d = Debouncer::new(100 * MS, DebounceKind::Both, 0);

        assert!(!d.calculate(true, 0));
        assert!(d.calculate(true, 100 * MS));
        assert!(d.calculate(false, 150 * MS));
        assert!(!d.calculate(false, 250 * MS));
    }
}
