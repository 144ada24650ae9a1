//! Sliding anti-replay window (RFC 6479)
//!
//! The bitmap is a ring of 64-bit words. Advancing the window clears whole
//! words instead of shifting bits, so every operation is O(1) in the
//! common case.

const WORD_BITS: u64 = 64;
const WORDS: usize = 32;

/// Counters this far behind the highest one seen are rejected
pub const WINDOW_SIZE: u64 = (WORDS as u64 - 1) * WORD_BITS;

#[derive(Debug, Clone)]
pub struct ReplayWindow {
    bitmap: [u64; WORDS],
    /// Highest counter accepted so far
    top: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            bitmap: [0; WORDS],
            top: 0,
        }
    }

    /// Whether `counter` has not been seen and is not too old
    ///
    /// Does not record anything: call `update` once the packet
    /// authenticated.
    pub fn check(&self, counter: u64) -> bool {
        if counter > self.top {
            return true;
        }
        if self.top - counter >= WINDOW_SIZE {
            return false;
        }

        let (word, bit) = Self::position(counter);
        self.bitmap[word] & (1 << bit) == 0
    }

    pub fn update(&mut self, counter: u64) {
        if counter > self.top {
            let current = self.top / WORD_BITS;
            let target = counter / WORD_BITS;
            let advance = (target - current).min(WORDS as u64);
            for i in 1..=advance {
                self.bitmap[((current + i) % WORDS as u64) as usize] = 0;
            }
            self.top = counter;
        }

        let (word, bit) = Self::position(counter);
        self.bitmap[word] |= 1 << bit;
    }

    fn position(counter: u64) -> (usize, u64) {
        (
            ((counter / WORD_BITS) % WORDS as u64) as usize,
            counter % WORD_BITS,
        )
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
