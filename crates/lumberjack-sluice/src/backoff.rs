use std::time::Duration;

/// Doubling reopen delay: `d, 2d, 4d, ...`
///
/// With a ceiling the sequence follows the same law until it reaches `max`
/// and stays there. The delay never resets.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    max: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Option<Duration>) -> Self {
        let mut backoff = Self { next: initial, max };
        backoff.next = backoff.clamp(initial);
        backoff
    }

    /// Delay the next call to [`Backoff::next_delay`] will return
    pub fn peek(&self) -> Duration {
        self.next
    }

    /// Take the current delay and double it for next time
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.clamp(self.next.saturating_mul(2));
        delay
    }

    fn clamp(&self, delay: Duration) -> Duration {
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
