//! The device's input and output stream objects.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::device::{SAMPLE_RATE_MAX, SAMPLE_RATE_MIN};
use crate::error::DriverError;

/// The wire format of a stream: interleaved `{L, R, L, R, …}` host-endian
/// samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AudioFormat {
    /// Frames per second.
    pub sample_rate: f64,
    /// Samples per frame.
    pub channels: u32,
    /// Width of one sample.
    pub bits_per_sample: u32,
}

impl AudioFormat {
    /// The only layout this device speaks, at the given rate.
    pub fn stereo_float(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            channels: 2,
            bits_per_sample: 32,
        }
    }

    /// Bytes in one interleaved frame.
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

/// One direction of the device's IO.
///
/// Both streams always carry the device's nominal sample rate; a stream
/// cannot change format on its own, it can only ask the device to run the
/// config-change dance.
pub struct Stream {
    object_id: u32,
    is_input: bool,
    active: AtomicBool,
    sample_rate: Mutex<f64>,
}

impl Stream {
    /// Create a stream at the given rate. Starts inactive.
    pub fn new(object_id: u32, is_input: bool, sample_rate: f64) -> Self {
        Self {
            object_id,
            is_input,
            active: AtomicBool::new(false),
            sample_rate: Mutex::new(sample_rate),
        }
    }

    /// The stream's audio object id.
    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// Whether this is the input (capture) side.
    pub fn is_input(&self) -> bool {
        self.is_input
    }

    /// Publish the stream to the host.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Withdraw the stream from the host.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the stream is currently published.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The advertised sample rate.
    pub fn sample_rate(&self) -> f64 {
        *self.sample_rate.lock()
    }

    // Only the device may move a stream's rate, after the host has quiesced
    // IO.
    pub(crate) fn set_sample_rate(&self, sample_rate: f64) {
        *self.sample_rate.lock() = sample_rate;
    }

    /// The stream's current format.
    pub fn format(&self) -> AudioFormat {
        AudioFormat::stereo_float(self.sample_rate())
    }

    /// Validate a format a client wants to set. Everything but the rate is
    /// fixed.
    pub fn check_format(&self, format: &AudioFormat) -> Result<(), DriverError> {
        if format.channels != 2 || format.bits_per_sample != 32 {
            return Err(DriverError::UnsupportedFormat(format.sample_rate));
        }
        if !(SAMPLE_RATE_MIN..=SAMPLE_RATE_MAX).contains(&format.sample_rate) {
            return Err(DriverError::UnsupportedFormat(format.sample_rate));
        }
        Ok(())
    }
}
