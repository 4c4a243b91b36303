//! One independently locked, bitmap-tracked span of frames.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_memory_addresses::PhysicalFrame;
use kernel_sync::SleepMutex;

const BITS: usize = u64::BITS as usize;

/// Used/free bits plus the first-free hint.
///
/// ### Invariants
/// - A set bit means "allocated". Padding bits past the last frame are set.
/// - Every word before `first_free` is full.
struct Bitmap {
    words: Vec<u64>,
    first_free: usize,
}

impl Bitmap {
    fn new(frames: usize) -> Self {
        let mut words = vec![0u64; frames.div_ceil(BITS)];
        let tail = frames % BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }
        Self {
            words,
            first_free: 0,
        }
    }

    #[inline]
    fn is_set(&self, bit: usize) -> bool {
        self.words[bit / BITS] & (1 << (bit % BITS)) != 0
    }

    #[inline]
    fn set(&mut self, bit: usize) {
        self.words[bit / BITS] |= 1 << (bit % BITS);
    }

    #[inline]
    fn clear(&mut self, bit: usize) {
        self.words[bit / BITS] &= !(1 << (bit % BITS));
    }

    /// Move the hint past full words.
    fn advance_hint(&mut self) {
        while self.first_free < self.words.len() && self.words[self.first_free] == u64::MAX {
            self.first_free += 1;
        }
    }

    /// Index of the first clear bit, starting at the hint.
    fn first_clear(&mut self) -> Option<usize> {
        self.advance_hint();
        if self.first_free == self.words.len() {
            // The hint only ever moves past full words; recalculate in case a
            // free raced ahead of us.
            self.first_free = 0;
            self.advance_hint();
        }
        let word = *self.words.get(self.first_free)?;
        Some(self.first_free * BITS + (!word).trailing_zeros() as usize)
    }

    /// First run of `count` clear bits at or after the hint.
    fn first_clear_run(&self, count: usize, frames: usize) -> Option<usize> {
        let mut bit = self.first_free * BITS;
        let mut run_start = bit;
        let mut run = 0;
        while bit < frames {
            if bit % BITS == 0 && self.words[bit / BITS] == u64::MAX {
                bit += BITS;
                run = 0;
                run_start = bit;
                continue;
            }
            if self.is_set(bit) {
                run = 0;
                run_start = bit + 1;
            } else {
                run += 1;
                if run == count {
                    return Some(run_start);
                }
            }
            bit += 1;
        }
        None
    }
}

pub struct Section {
    base: PhysicalFrame,
    frames: usize,
    free: AtomicUsize,
    bitmap: SleepMutex<Bitmap>,
}

impl Section {
    pub fn new(base: PhysicalFrame, frames: usize) -> Self {
        debug_assert!(frames > 0);
        Self {
            base,
            frames,
            free: AtomicUsize::new(frames),
            bitmap: SleepMutex::new(Bitmap::new(frames)),
        }
    }

    #[inline]
    pub const fn base(&self) -> PhysicalFrame {
        self.base
    }

    #[inline]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Free frames; a racy snapshot unless the caller holds the lock.
    #[inline]
    pub fn free(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    /// One past the last frame.
    #[inline]
    pub fn end(&self) -> PhysicalFrame {
        self.base + self.frames as u64
    }

    #[inline]
    pub fn contains(&self, frame: PhysicalFrame) -> bool {
        frame >= self.base && frame < self.end()
    }

    /// Whether all of `[frame, frame + count)` lies in this section.
    #[inline]
    pub fn contains_run(&self, frame: PhysicalFrame, count: usize) -> bool {
        self.contains(frame) && (frame - self.base) as usize + count <= self.frames
    }

    pub fn first_free_hint(&self) -> usize {
        self.bitmap.lock().first_free
    }

    pub fn allocate_one(&self) -> Option<PhysicalFrame> {
        let mut bitmap = self.bitmap.lock();
        if self.free() == 0 {
            return None;
        }
        let Some(bit) = bitmap.first_clear() else {
            log::error!(
                "section at {:?}: free count {} but bitmap is full",
                self.base,
                self.free()
            );
            panic!("corrupted frame bitmap");
        };
        bitmap.set(bit);
        bitmap.advance_hint();
        self.free.fetch_sub(1, Ordering::Relaxed);
        Some(self.base + bit as u64)
    }

    pub fn allocate_run(&self, count: usize) -> Option<PhysicalFrame> {
        let mut bitmap = self.bitmap.lock();
        if self.free() < count {
            return None;
        }
        let start = bitmap.first_clear_run(count, self.frames)?;
        for bit in start..start + count {
            bitmap.set(bit);
        }
        bitmap.advance_hint();
        self.free.fetch_sub(count, Ordering::Relaxed);
        Some(self.base + start as u64)
    }

    /// Clear `count` bits starting at `frame`.
    ///
    /// # Panics
    /// If any of the frames is not currently allocated.
    pub fn free_run(&self, frame: PhysicalFrame, count: usize) {
        debug_assert!(self.contains_run(frame, count));
        let start = (frame - self.base) as usize;
        let mut bitmap = self.bitmap.lock();
        for bit in start..start + count {
            if !bitmap.is_set(bit) {
                log::error!("double free of frame {:?}", self.base + bit as u64);
                panic!("double free of a physical frame");
            }
            bitmap.clear(bit);
        }
        bitmap.first_free = bitmap.first_free.min(start / BITS);
        self.free.fetch_add(count, Ordering::Relaxed);
    }
}
