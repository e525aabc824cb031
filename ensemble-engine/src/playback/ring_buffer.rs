//! Lock-free SPSC ring buffer for audio samples
//!
//! The only data path between a track's decode thread (producer) and the
//! audio callback (consumer). Both sides are wait-free and allocation-free;
//! the audio thread must never block.
//!
//! Design:
//! - Fixed power-of-two capacity, boxed slice storage, index mask
//! - Write/read positions advance monotonically (wrapping); size is
//!   `write - read`, so empty (size 0) and full (size == capacity) are
//!   unambiguous
//! - Producer publishes the write index with Release, consumer observes it
//!   with Acquire: samples written before the publish are visible to a
//!   reader that sees the new index
//! - Partial writes and reads are permitted and reported; `write` returns 0
//!   when full and `read` returns 0 when empty — the caller decides policy

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Single-producer single-consumer f32 ring buffer.
///
/// Correctness holds for exactly one concurrent writer and one concurrent
/// reader. The producer and consumer roles are a usage discipline, not a
/// type split: the decode thread only calls `write`, the audio callback only
/// calls `read`.
#[repr(align(64))]
pub struct SampleRing {
    buffer: Box<[f32]>,

    /// Capacity in samples (power of two)
    capacity: usize,

    /// `capacity - 1`, for cheap wrapping
    mask: usize,

    /// Advanced only by the producer
    write_pos: AtomicUsize,

    /// Advanced only by the consumer (and by `clear`, which requires
    /// exclusivity)
    read_pos: AtomicUsize,

    /// Times `read` found the ring empty while samples were wanted
    underruns: AtomicU64,

    /// Times `write` found the ring full
    overruns: AtomicU64,
}

impl SampleRing {
    /// Create a ring with at least `min_capacity` samples (rounded up to a
    /// power of two).
    pub fn new(min_capacity: usize) -> Self {
        let capacity = min_capacity.max(2).next_power_of_two();
        Self {
            buffer: vec![0.0; capacity].into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples available to the reader.
    #[inline]
    pub fn available_read(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Relaxed);
        write.wrapping_sub(read)
    }

    /// Free space available to the writer.
    #[inline]
    pub fn available_write(&self) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        self.capacity - write.wrapping_sub(read)
    }

    /// Write samples from `src`; returns how many were accepted.
    ///
    /// Producer side only. Wait-free; accepts a prefix of `src` when the
    /// ring is nearly full and 0 when full.
    #[inline]
    pub fn write(&self, src: &[f32]) -> usize {
        let available = self.available_write();
        let to_write = src.len().min(available);
        if to_write == 0 {
            if !src.is_empty() {
                self.overruns.fetch_add(1, Ordering::Relaxed);
            }
            return 0;
        }

        let write = self.write_pos.load(Ordering::Relaxed);
        for (i, &sample) in src[..to_write].iter().enumerate() {
            let idx = (write.wrapping_add(i)) & self.mask;
            // SAFETY: single producer; slots in [read+cap, write) are not
            // concurrently read, and idx is always in bounds via the mask.
            unsafe {
                let ptr = self.buffer.as_ptr() as *mut f32;
                ptr.add(idx).write(sample);
            }
        }

        self.write_pos
            .store(write.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// Read samples into `dst`; returns how many were produced.
    ///
    /// Consumer side only. Wait-free; fills a prefix of `dst` when the ring
    /// holds fewer samples than requested and returns 0 when empty. Does not
    /// touch the remainder of `dst`.
    #[inline]
    pub fn read(&self, dst: &mut [f32]) -> usize {
        let available = self.available_read();
        let to_read = dst.len().min(available);
        if to_read == 0 {
            if !dst.is_empty() {
                self.underruns.fetch_add(1, Ordering::Relaxed);
            }
            return 0;
        }

        let read = self.read_pos.load(Ordering::Relaxed);
        for (i, sample) in dst[..to_read].iter_mut().enumerate() {
            let idx = (read.wrapping_add(i)) & self.mask;
            *sample = self.buffer[idx];
        }

        self.read_pos
            .store(read.wrapping_add(to_read), Ordering::Release);
        to_read
    }

    /// Drop up to `count` samples from the reader side; returns how many
    /// were discarded. Consumer side only.
    #[inline]
    pub fn skip(&self, count: usize) -> usize {
        let to_skip = count.min(self.available_read());
        if to_skip > 0 {
            let read = self.read_pos.load(Ordering::Relaxed);
            self.read_pos
                .store(read.wrapping_add(to_skip), Ordering::Release);
        }
        to_skip
    }

    /// Empty the ring.
    ///
    /// Only valid when no concurrent reader or writer is active (e.g. the
    /// audio side sees the track in a non-reading state and the decoder is
    /// the caller). Returns the number of samples discarded.
    pub fn clear(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Relaxed);
        let dropped = write.wrapping_sub(read);
        self.read_pos.store(write, Ordering::Release);
        dropped
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RingStats {
        RingStats {
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            capacity: self.capacity,
            occupied: self.available_read(),
        }
    }
}

/// Ring buffer statistics.
#[derive(Debug, Clone, Copy)]
pub struct RingStats {
    /// Reads that found the ring empty
    pub underruns: u64,

    /// Writes that found the ring full
    pub overruns: u64,

    pub capacity: usize,
    pub occupied: usize,
}

impl RingStats {
    pub fn fill_percent(&self) -> f32 {
        self.occupied as f32 / self.capacity as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rounds_capacity_to_power_of_two() {
        let ring = SampleRing::new(1000);
        assert_eq!(ring.capacity(), 1024);
    }

    #[test]
    fn write_then_read_fifo() {
        let ring = SampleRing::new(8);
        assert_eq!(ring.write(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(ring.available_read(), 3);

        let mut out = [0.0f32; 3];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert_eq!(ring.available_read(), 0);
    }

    #[test]
    fn partial_write_when_nearly_full() {
        let ring = SampleRing::new(4);
        assert_eq!(ring.write(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(ring.write(&[4.0, 5.0]), 1); // one slot left
        assert_eq!(ring.write(&[6.0]), 0); // full
        assert_eq!(ring.stats().overruns, 1);
    }

    #[test]
    fn partial_read_when_nearly_empty() {
        let ring = SampleRing::new(8);
        ring.write(&[1.0, 2.0]);

        let mut out = [9.0f32; 4];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(&out[..2], &[1.0, 2.0]);
        // untouched remainder
        assert_eq!(&out[2..], &[9.0, 9.0]);

        assert_eq!(ring.read(&mut out), 0);
        assert_eq!(ring.stats().underruns, 1);
    }

    #[test]
    fn wraps_around() {
        let ring = SampleRing::new(4);
        let mut out = [0.0f32; 4];

        for round in 0..10 {
            let base = round as f32 * 3.0;
            assert_eq!(ring.write(&[base, base + 1.0, base + 2.0]), 3);
            assert_eq!(ring.read(&mut out[..3]), 3);
            assert_eq!(&out[..3], &[base, base + 1.0, base + 2.0]);
        }
    }

    #[test]
    fn skip_discards_from_reader_side() {
        let ring = SampleRing::new(8);
        ring.write(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.skip(2), 2);

        let mut out = [0.0f32; 2];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(out, [3.0, 4.0]);

        assert_eq!(ring.skip(5), 0);
    }

    #[test]
    fn clear_empties() {
        let ring = SampleRing::new(8);
        ring.write(&[1.0; 5]);
        assert_eq!(ring.clear(), 5);
        assert_eq!(ring.available_read(), 0);
        assert_eq!(ring.available_write(), 8);
    }

    /// Concurrent FIFO property: a reader observes exactly the produced
    /// prefix, in order, and (written - read) never leaves [0, capacity].
    #[test]
    fn concurrent_fifo_order() {
        let ring = Arc::new(SampleRing::new(64));
        const TOTAL: usize = 100_000;

        let writer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut next = 0usize;
                let mut chunk = [0.0f32; 17];
                while next < TOTAL {
                    let n = chunk.len().min(TOTAL - next);
                    for (i, slot) in chunk[..n].iter_mut().enumerate() {
                        *slot = (next + i) as f32;
                    }
                    let accepted = ring.write(&chunk[..n]);
                    next += accepted;
                    if accepted == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0usize;
        let mut out = [0.0f32; 23];
        while expected < TOTAL {
            let n = ring.read(&mut out);
            for &sample in &out[..n] {
                assert_eq!(sample, expected as f32);
                expected += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }

        writer.join().unwrap();
        assert_eq!(ring.available_read(), 0);
    }
}
