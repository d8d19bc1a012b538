//! Lock-free sample-timed ring buffer bridging the IO producer and consumer.
//!
//! Unlike an index-based SPSC queue, frames here are addressed by
//! [`SampleTime`]: the producer stores a block at the cycle's output time and
//! the consumer fetches at the cycle's input time, so the two sides never
//! negotiate positions. The window of valid times is published through a
//! SeqLock-style ring of versioned slots, letting the consumer detect torn
//! reads without either side taking a lock. Both sides run on
//! time-constraint threads, so every operation is bounded and allocation
//! free.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use thiserror::Error;

/// Monotonic frame counter tied to the device's current IO session.
pub type SampleTime = i64;

/// Slots in the time-bounds publication ring.
const TIME_BOUNDS_QUEUE_SIZE: u32 = 32;
const TIME_BOUNDS_QUEUE_MASK: u32 = TIME_BOUNDS_QUEUE_SIZE - 1;

// Bounding the reader's retries turns live-lock under scheduler starvation
// into a reportable, non-fatal error.
const TIME_BOUNDS_READ_ATTEMPTS: u32 = 8;

/// Soft failures reported by [`RingBuffer`] operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The request is larger than the buffer's capacity.
    #[error("request larger than ring capacity")]
    TooMuch,
    /// The reader could not capture a consistent snapshot of the time bounds.
    #[error("could not read consistent time bounds")]
    CpuOverload,
}

#[derive(Default)]
struct TimeBoundsSlot {
    start_time: AtomicI64,
    end_time: AtomicI64,
    update_counter: AtomicU32,
}

/// Lock-free ring buffer holding interleaved `f32` frames addressed by
/// sample time.
///
/// Single producer, single consumer. The producer publishes new bounds with
/// release stores; the consumer validates its snapshot against the slot's
/// version counter.
pub struct RingBuffer {
    storage: UnsafeCell<Vec<f32>>,
    channels: usize,
    bytes_per_frame: usize,
    capacity_frames: u32,
    capacity_mask: u32,
    bounds_queue: [TimeBoundsSlot; TIME_BOUNDS_QUEUE_SIZE as usize],
    bounds_head: AtomicU32,
}

// The storage is written by one producer and read by one consumer; bounds
// arbitration makes overlapping access detectable rather than prevented.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocate a buffer for `requested_capacity_frames` frames, rounded up
    /// to the next power of two. All time-bounds slots start at `(0, 0, 0)`.
    pub fn allocate(
        channels: usize,
        bytes_per_frame: usize,
        requested_capacity_frames: u32,
    ) -> Self {
        debug_assert_eq!(
            bytes_per_frame,
            channels * std::mem::size_of::<f32>(),
            "frame layout must be interleaved f32"
        );
        let capacity_frames = requested_capacity_frames.max(1).next_power_of_two();
        let samples = capacity_frames as usize * channels;
        Self {
            storage: UnsafeCell::new(vec![0.0; samples]),
            channels,
            bytes_per_frame,
            capacity_frames,
            capacity_mask: capacity_frames - 1,
            bounds_queue: std::array::from_fn(|_| TimeBoundsSlot::default()),
            bounds_head: AtomicU32::new(0),
        }
    }

    /// Capacity in frames (always a power of two).
    pub fn capacity_frames(&self) -> u32 {
        self.capacity_frames
    }

    /// Channels per frame.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes in one interleaved frame.
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    /// Copy `frames` into the buffer at `frame_number`.
    ///
    /// Sample times should normally increase sequentially; a gap since the
    /// previous store is filled with silence, and a gap wider than the whole
    /// buffer empties it before the new block lands. Storing earlier than the
    /// current start overwrites whatever is there.
    pub fn store(&self, frames: &[f32], frame_number: SampleTime) -> Result<(), RingError> {
        let frame_count = (frames.len() / self.channels) as u32;
        if frame_count == 0 {
            return Ok(());
        }
        if frame_count > self.capacity_frames {
            return Err(RingError::TooMuch);
        }

        let start_write = frame_number;
        let end_write = frame_number + i64::from(frame_count);
        let (mut cur_start, mut cur_end) = self.time_bounds()?;

        if start_write > cur_end {
            // Frames between the previous end and this write were never
            // produced.
            if start_write - cur_end > i64::from(self.capacity_frames) {
                // Nothing previously stored can survive a gap this wide.
                cur_start = start_write;
                cur_end = start_write;
            } else {
                self.zero_range(cur_end, start_write);
            }
        }

        self.copy_in(frames, frame_number);

        let new_end = end_write.max(cur_end);
        // The start retreats only under capacity pressure.
        let new_start = (new_end - i64::from(self.capacity_frames)).max(cur_start);
        self.set_time_bounds(new_start, new_end);
        Ok(())
    }

    /// Copy frames starting at `frame_number` into `out`.
    ///
    /// The requested range is clipped to the buffer's current bounds; any
    /// portion outside them comes back as silence. On error the output is
    /// fully zeroed.
    pub fn fetch(&self, out: &mut [f32], frame_number: SampleTime) -> Result<(), RingError> {
        let frame_count = (out.len() / self.channels) as u32;
        if frame_count == 0 {
            return Ok(());
        }
        if frame_count > self.capacity_frames {
            out.fill(0.0);
            return Err(RingError::TooMuch);
        }

        let (cur_start, cur_end) = match self.time_bounds() {
            Ok(bounds) => bounds,
            Err(err) => {
                out.fill(0.0);
                return Err(err);
            }
        };

        let start_read = frame_number;
        let end_read = frame_number + i64::from(frame_count);
        let clip_start = start_read.max(cur_start);
        let clip_end = end_read.min(cur_end);
        if clip_start >= clip_end {
            out.fill(0.0);
            return Ok(());
        }

        let lead_samples = (clip_start - start_read) as usize * self.channels;
        let tail_samples = (end_read - clip_end) as usize * self.channels;
        let valid_end = out.len() - tail_samples;
        out[..lead_samples].fill(0.0);
        out[valid_end..].fill(0.0);
        self.copy_out(&mut out[lead_samples..valid_end], clip_start);
        Ok(())
    }

    /// Snapshot the window of valid sample times, `(start, end)`.
    ///
    /// Retries a bounded number of times if the producer publishes mid-read,
    /// then reports [`RingError::CpuOverload`].
    pub fn time_bounds(&self) -> Result<(SampleTime, SampleTime), RingError> {
        for _ in 0..TIME_BOUNDS_READ_ATTEMPTS {
            let head = self.bounds_head.load(Ordering::Acquire);
            let slot = &self.bounds_queue[(head & TIME_BOUNDS_QUEUE_MASK) as usize];
            let counter_before = slot.update_counter.load(Ordering::Acquire);
            let start = slot.start_time.load(Ordering::Relaxed);
            let end = slot.end_time.load(Ordering::Relaxed);
            let counter_after = slot.update_counter.load(Ordering::Acquire);
            if counter_before == head && counter_after == head {
                return Ok((start, end));
            }
        }
        Err(RingError::CpuOverload)
    }

    // Single writer: the next slot is never the one readers of the current
    // head are looking at, so a publication cannot tear the slot it lands in.
    fn set_time_bounds(&self, start: SampleTime, end: SampleTime) {
        let head = self.bounds_head.load(Ordering::Relaxed);
        let next = head.wrapping_add(1);
        let slot = &self.bounds_queue[(next & TIME_BOUNDS_QUEUE_MASK) as usize];
        slot.start_time.store(start, Ordering::Relaxed);
        slot.end_time.store(end, Ordering::Relaxed);
        slot.update_counter.store(next, Ordering::Release);
        self.bounds_head.store(next, Ordering::Release);
    }

    fn frame_offset(&self, frame_number: SampleTime) -> usize {
        ((frame_number as u64) & u64::from(self.capacity_mask)) as usize * self.channels
    }

    #[allow(clippy::mut_from_ref)]
    fn data_mut(&self) -> &mut [f32] {
        unsafe { &mut *self.storage.get() }
    }

    fn data(&self) -> &[f32] {
        unsafe { &*self.storage.get() }
    }

    fn copy_in(&self, frames: &[f32], frame_number: SampleTime) {
        let data = self.data_mut();
        let offset = self.frame_offset(frame_number);
        let first = (data.len() - offset).min(frames.len());
        data[offset..offset + first].copy_from_slice(&frames[..first]);
        if first < frames.len() {
            data[..frames.len() - first].copy_from_slice(&frames[first..]);
        }
    }

    fn copy_out(&self, out: &mut [f32], frame_number: SampleTime) {
        let data = self.data();
        let offset = self.frame_offset(frame_number);
        let first = (data.len() - offset).min(out.len());
        out[..first].copy_from_slice(&data[offset..offset + first]);
        let out_len = out.len();
        if first < out_len {
            out[first..].copy_from_slice(&data[..out_len - first]);
        }
    }

    fn zero_range(&self, from: SampleTime, to: SampleTime) {
        let frames = (to - from).min(i64::from(self.capacity_frames));
        if frames <= 0 {
            return;
        }
        // Only the trailing capacity-worth of the gap is addressable.
        let from = to - frames;
        let data = self.data_mut();
        let offset = self.frame_offset(from);
        let samples = frames as usize * self.channels;
        let first = (data.len() - offset).min(samples);
        data[offset..offset + first].fill(0.0);
        if first < samples {
            data[..samples - first].fill(0.0);
        }
    }
}
