//! Dirty-line tracking.
//!
//! One bit per line, packed into `AtomicU64` words. Mutators set bits
//! after updating the mirror; the flusher clears a run's bits before it
//! copies the run out of the mirror and re-sets them if the write fails.
//! With that ordering every race ends in at worst one redundant rewrite
//! of a line, never in a lost write.

use nvs_types::{LineIndex, LineRun};
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

#[derive(Debug)]
pub struct DirtyLines {
    words: Box<[AtomicU64]>,
    line_count: usize,
}

impl DirtyLines {
    #[must_use]
    pub fn new(line_count: usize) -> Self {
        let words = (0..line_count.div_ceil(WORD_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, line_count }
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Set the bits for every line in `run`.
    pub fn mark(&self, run: LineRun) {
        self.for_each_word(run, |word, mask| {
            word.fetch_or(mask, Ordering::AcqRel);
        });
    }

    /// Clear the bits for every line in `run`.
    pub fn clear(&self, run: LineRun) {
        self.for_each_word(run, |word, mask| {
            word.fetch_and(!mask, Ordering::AcqRel);
        });
    }

    pub fn clear_all(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Release);
        }
    }

    #[must_use]
    pub fn is_dirty(&self, line: LineIndex) -> bool {
        if line.0 >= self.line_count {
            return false;
        }
        let word = self.words[line.0 / WORD_BITS].load(Ordering::Acquire);
        word & (1 << (line.0 % WORD_BITS)) != 0
    }

    /// Lowest-indexed dirty line.
    #[must_use]
    pub fn first_dirty(&self) -> Option<LineIndex> {
        self.words.iter().enumerate().find_map(|(idx, word)| {
            let bits = word.load(Ordering::Acquire);
            (bits != 0).then(|| LineIndex(idx * WORD_BITS + bits.trailing_zeros() as usize))
        })
    }

    /// Longest run of consecutive dirty lines starting at `first`, capped
    /// at `max_lines`. `first` itself is always included.
    #[must_use]
    pub fn run_from(&self, first: LineIndex, max_lines: usize) -> LineRun {
        let mut count = 1;
        while count < max_lines
            && first.0 + count < self.line_count
            && self.is_dirty(LineIndex(first.0 + count))
        {
            count += 1;
        }
        LineRun::new(first, count)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.words
            .iter()
            .all(|word| word.load(Ordering::Acquire) == 0)
    }

    fn for_each_word(&self, run: LineRun, mut apply: impl FnMut(&AtomicU64, u64)) {
        let start = run.first.0.min(self.line_count);
        let end = (run.first.0 + run.count).min(self.line_count);
        if start >= end {
            return;
        }
        for idx in start / WORD_BITS..=(end - 1) / WORD_BITS {
            let base = idx * WORD_BITS;
            let lo = start.max(base) - base;
            let hi = end.min(base + WORD_BITS) - base;
            let width = hi - lo;
            let mask = if width == WORD_BITS {
                u64::MAX
            } else {
                ((1_u64 << width) - 1) << lo
            };
            apply(&self.words[idx], mask);
        }
    }
}
