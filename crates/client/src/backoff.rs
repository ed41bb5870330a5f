//! Jittered exponential backoff for the reconnect loop: initial 500 ms,
//! doubling, capped at 30 s, reset once a connection has stayed registered
//! long enough to be considered stable.

use std::time::Duration;

use rand::Rng;

const INITIAL: Duration = Duration::from_millis(500);
const CAP: Duration = Duration::from_secs(30);
/// A connection that stays up this long resets the attempt counter, so a
/// relay blip doesn't leave the client backing off at the cap forever.
const STABLE_AFTER: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn delay(&mut self) -> Duration {
        let exp = INITIAL.saturating_mul(1 << self.attempt.min(16));
        let capped = exp.min(CAP);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = rand::rng().random_range(0..=capped.as_millis() as u64 / 4);
        capped + Duration::from_millis(jitter_ms)
    }

    pub fn note_uptime(&mut self, uptime: Duration) {
        if uptime >= STABLE_AFTER {
            self.attempt = 0;
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let mut backoff = Backoff::default();
        let first = backoff.delay();
        assert!(first >= INITIAL && first < INITIAL * 2);

        for _ in 0..20 {
            backoff.delay();
        }
        let capped = backoff.delay();
        assert!(capped >= CAP && capped < CAP + Duration::from_secs(8));
    }

    #[test]
    fn stable_uptime_resets_attempt_counter() {
        let mut backoff = Backoff::default();
        backoff.delay();
        backoff.delay();
        assert!(backoff.attempt() > 0);

        backoff.note_uptime(Duration::from_secs(61));
        assert_eq!(backoff.attempt(), 0);

        backoff.note_uptime(Duration::from_secs(5));
        assert_eq!(backoff.attempt(), 0);
    }
}
