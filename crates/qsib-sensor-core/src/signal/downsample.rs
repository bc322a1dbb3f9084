//! Deterministic seeded downsampling
//!
//! Each sample is kept or dropped based on a pseudo-random draw keyed by the
//! seed and the sample's absolute index within its modality:
//!
//! ```text
//! draw(seed, i) = ChaCha8(seed_from_u64(seed)) at word position 2i, next_u64()
//! keep(i)       = draw(seed, i) % scale <= threshold
//! ```
//!
//! ChaCha8 from `rand_chacha` is value-stable across platforms and releases
//! and supports random access, so the selected subset depends only on
//! (seed, threshold, scale) and the indices in the window. Re-exporting the
//! same window always selects the same samples, and a sample keeps its
//! verdict as the window slides.

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded acceptance filter over sample indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downsampler {
    seed: u64,
    threshold: i64,
    scale: u64,
}

impl Downsampler {
    /// Create a filter accepting roughly `(threshold + 1) / scale` of samples
    ///
    /// # Arguments
    /// * `seed` - Key for the pseudo-random draws
    /// * `threshold` - Inclusive acceptance bound; negative disables filtering
    /// * `scale` - Modulus applied to each draw; zero disables filtering
    pub fn new(seed: u64, threshold: i64, scale: u64) -> Self {
        Self {
            seed,
            threshold,
            scale,
        }
    }

    /// Filter that keeps every sample
    pub fn keep_all() -> Self {
        Self::new(0, -1, 0)
    }

    /// Whether every sample passes
    pub fn selects_all(&self) -> bool {
        self.threshold < 0 || self.scale == 0 || self.threshold as u64 >= self.scale - 1
    }

    /// Raw pseudo-random draw for sample `index` under `seed`
    pub fn draw(seed: u64, index: u64) -> u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_word_pos(u128::from(index) * 2);
        rng.next_u64()
    }

    /// Whether sample `index` passes the filter
    pub fn accepts(&self, index: u64) -> bool {
        self.selects_all() || self.keeps(Self::draw(self.seed, index))
    }

    /// Accepted indices in `from..to`, in order
    ///
    /// Walks the generator sequentially from `from`, which yields the same
    /// draws as [`Self::draw`] without reseeding per sample.
    pub fn select(&self, from: u64, to: u64) -> Selection {
        let rng = if self.selects_all() {
            None
        } else {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
            rng.set_word_pos(u128::from(from) * 2);
            Some(rng)
        };
        Selection {
            filter: *self,
            rng,
            next: from,
            end: to,
        }
    }

    fn keeps(&self, value: u64) -> bool {
        // threshold is non-negative whenever a draw is consulted
        value % self.scale <= self.threshold as u64
    }
}

impl Default for Downsampler {
    fn default() -> Self {
        Self::keep_all()
    }
}

/// Iterator over the indices a [`Downsampler`] accepts
#[derive(Debug, Clone)]
pub struct Selection {
    filter: Downsampler,
    rng: Option<ChaCha8Rng>,
    next: u64,
    end: u64,
}

impl Iterator for Selection {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.next < self.end {
            let index = self.next;
            self.next += 1;
            match self.rng.as_mut() {
                None => return Some(index),
                Some(rng) => {
                    if self.filter.keeps(rng.next_u64()) {
                        return Some(index);
                    }
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.end.saturating_sub(self.next)).unwrap_or(usize::MAX);
        match self.rng {
            None => (remaining, Some(remaining)),
            Some(_) => (0, Some(remaining)),
        }
    }
}
