use crate::platform::Clock;

/// Bounded busy-wait helper.
///
/// # Example
/// ```rust,ignore
/// let dl = Deadline::after(clock, 1_000);
/// while hw_busy() {
///     if dl.expired(clock) { return Err(ExiError::Timeout); }
///     clock.relax();
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: u64,
    timeout_us: u64,
}

impl Deadline {
    #[inline(always)]
    pub fn after<C: Clock + ?Sized>(clock: &C, timeout_us: u64) -> Self {
        Deadline {
            start: clock.now_micros(),
            timeout_us,
        }
    }

    #[inline(always)]
    pub fn elapsed_micros<C: Clock + ?Sized>(&self, clock: &C) -> u64 {
        clock.now_micros().saturating_sub(self.start)
    }

    #[inline(always)]
    pub fn expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        self.elapsed_micros(clock) > self.timeout_us
    }

    /// Spin until `done` returns true or the deadline passes.
    /// Returns whether `done` was observed.
    pub fn spin_until<C, F>(&self, clock: &C, mut done: F) -> bool
    where
        C: Clock + ?Sized,
        F: FnMut() -> bool,
    {
        loop {
            if done() {
                return true;
            }
            if self.expired(clock) {
                // one last look, the condition may have flipped while we were timing out
                return done();
            }
            clock.relax();
        }
    }
}
