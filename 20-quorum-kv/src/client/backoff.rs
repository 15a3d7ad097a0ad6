use std::time::Duration;

use rand::Rng;

/// Attempts per backoff cycle before the multiplier is redrawn.
pub const CYCLE: u32 = 3;
/// Upper bound (exclusive) of the random growth multiplier.
pub const MAX_MULTIPLIER: f64 = 2.0;

/// Randomized exponential backoff that restarts every [`CYCLE`] attempts.
///
/// The n-th attempt of a cycle waits `exp(-5 + n * multiplier)` seconds, so
/// the first retry of every cycle waits `e^-5` (about 7ms) and the longest
/// possible wait is `e^-1` (about 370ms).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Backoff {
    retries: u32,
    multiplier: f64,
}

impl Backoff {
    /// Total retries scheduled so far in the current cycle.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        if self.retries >= CYCLE {
            self.retries = 0;
        }
        if self.retries == 0 {
            self.multiplier = rng.gen_range(0.0..MAX_MULTIPLIER);
        }
        let exponent = -5.0 + f64::from(self.retries) * self.multiplier;
        self.retries += 1;
        Duration::from_secs_f64(exponent.exp())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn first_retry_of_each_cycle_waits_the_minimum() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::default();
        let floor = Duration::from_secs_f64((-5.0f64).exp());

        for cycle in 0..4 {
            let first = backoff.next_delay(&mut rng);
            assert_eq!(first, floor, "cycle {cycle}");
            let multiplier = backoff.multiplier();
            assert!((0.0..MAX_MULTIPLIER).contains(&multiplier));

            let second = backoff.next_delay(&mut rng);
            let third = backoff.next_delay(&mut rng);
            assert_eq!(backoff.multiplier(), multiplier, "multiplier is fixed within a cycle");
            assert!(second >= first && third >= second);
            assert_eq!(backoff.retries(), CYCLE);
        }
    }

    #[test]
    fn delays_stay_bounded() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = Backoff::default();
        let ceiling = Duration::from_secs_f64((-1.0f64).exp());
        for _ in 0..300 {
            assert!(backoff.next_delay(&mut rng) <= ceiling);
        }
    }
}
