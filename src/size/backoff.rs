use std::cell::Cell;
use std::hint;

// Exponential backoff for `size` calls that run into a concurrent `size`.
//
// The amount doubles every time a computation loses the race to publish
// its result, and halves every time it wins.
pub struct Backoff {
    amount: Cell<u32>,
}

impl Backoff {
    const MIN: u32 = 1;
    const MAX: u32 = 512;

    pub fn new() -> Backoff {
        Backoff {
            amount: Cell::new(Backoff::MIN),
        }
    }

    // Spins for the current backoff amount.
    #[inline]
    pub fn snooze(&self) {
        for _ in 0..self.amount.get() {
            hint::spin_loop();
        }
    }

    #[inline]
    pub fn increase(&self) {
        self.amount
            .set((self.amount.get() * 2).min(Backoff::MAX));
    }

    #[inline]
    pub fn decrease(&self) {
        self.amount
            .set((self.amount.get() / 2).max(Backoff::MIN));
    }

    #[cfg(test)]
    pub fn amount(&self) -> u32 {
        self.amount.get()
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Backoff;

    #[test]
    fn bounds() {
        let backoff = Backoff::new();
        backoff.decrease();
        assert_eq!(backoff.amount(), 1);

        for _ in 0..20 {
            backoff.increase();
        }
        assert_eq!(backoff.amount(), 512);

        backoff.decrease();
        assert_eq!(backoff.amount(), 256);
        backoff.snooze();
    }
}
