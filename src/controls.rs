//! Volume and mute controls exposed on the device's output side.
//!
//! Control values are set from ordinary host threads but consulted on the IO
//! path, so each control publishes what the realtime side needs as atomics:
//! the volume keeps its curve-transformed amplitude in a bit-cast `f32`, and
//! the mute keeps a plain flag.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dasp_frame::{Frame, Stereo};
use parking_lot::Mutex;
use tracing::debug;

/// Transfer curves mapping a control scalar in `[0, 1]` to a linear
/// amplitude.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferCurve {
    /// Straight pass-through.
    Linear,
    /// `x^2`. Steeper than linear near the bottom of the slider, which
    /// matches how loudness is perceived.
    #[default]
    Pow2Over1,
    /// `x^3`.
    Pow3Over1,
}

impl TransferCurve {
    /// Convert a scalar into a linear gain.
    pub fn scalar_to_amplitude(self, scalar: f32) -> f32 {
        let scalar = scalar.clamp(0.0, 1.0);
        match self {
            TransferCurve::Linear => scalar,
            TransferCurve::Pow2Over1 => scalar * scalar,
            TransferCurve::Pow3Over1 => scalar * scalar * scalar,
        }
    }
}

struct VolumeState {
    scalar: f32,
    curve: TransferCurve,
}

/// Master output volume control.
pub struct VolumeControl {
    object_id: u32,
    active: AtomicBool,
    will_apply_to_audio: AtomicBool,
    // Curve-transformed amplitude, published for the realtime path.
    amplitude_bits: AtomicU32,
    state: Mutex<VolumeState>,
}

impl VolumeControl {
    /// Create a full-volume control. Starts inactive.
    pub fn new(object_id: u32) -> Self {
        Self {
            object_id,
            active: AtomicBool::new(false),
            will_apply_to_audio: AtomicBool::new(false),
            amplitude_bits: AtomicU32::new(1.0f32.to_bits()),
            state: Mutex::new(VolumeState {
                scalar: 1.0,
                curve: TransferCurve::default(),
            }),
        }
    }

    /// The control's audio object id.
    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// Publish the control to the host.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Withdraw the control from the host.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the control is currently published.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Set the scalar value, clamped to `[0, 1]`.
    pub fn set_volume_scalar(&self, scalar: f32) {
        let mut state = self.state.lock();
        state.scalar = scalar.clamp(0.0, 1.0);
        let amplitude = state.curve.scalar_to_amplitude(state.scalar);
        self.amplitude_bits
            .store(amplitude.to_bits(), Ordering::Relaxed);
        debug!(scalar = state.scalar, amplitude, "volume changed");
    }

    /// The current scalar value.
    pub fn volume_scalar(&self) -> f32 {
        self.state.lock().scalar
    }

    /// Replace the transfer curve, re-deriving the published amplitude.
    pub fn set_transfer_curve(&self, curve: TransferCurve) {
        let mut state = self.state.lock();
        state.curve = curve;
        let amplitude = state.curve.scalar_to_amplitude(state.scalar);
        self.amplitude_bits
            .store(amplitude.to_bits(), Ordering::Relaxed);
    }

    /// Configure whether the device applies this volume to the mix itself.
    pub fn set_will_apply_to_audio(&self, will_apply: bool) {
        self.will_apply_to_audio.store(will_apply, Ordering::Relaxed);
    }

    /// Whether the IO path should scale audio with this control.
    pub fn will_apply_to_audio_rt(&self) -> bool {
        self.active.load(Ordering::Relaxed) && self.will_apply_to_audio.load(Ordering::Relaxed)
    }

    /// Scale a stereo interleaved buffer in place. Reads the published
    /// amplitude without locking.
    pub fn apply_to_audio_rt(&self, buffer: &mut [f32]) {
        if !self.will_apply_to_audio_rt() {
            return;
        }
        let amplitude = f32::from_bits(self.amplitude_bits.load(Ordering::Relaxed));
        if amplitude == 1.0 {
            return;
        }
        for frame in buffer.chunks_exact_mut(2) {
            frame[0] *= amplitude;
            frame[1] *= amplitude;
        }
    }
}

/// Master output mute control.
pub struct MuteControl {
    object_id: u32,
    active: AtomicBool,
    muted: AtomicBool,
}

impl MuteControl {
    /// Create an unmuted control. Starts inactive.
    pub fn new(object_id: u32) -> Self {
        Self {
            object_id,
            active: AtomicBool::new(false),
            muted: AtomicBool::new(false),
        }
    }

    /// The control's audio object id.
    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// Publish the control to the host.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Withdraw the control from the host.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the control is currently published.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Set the mute flag.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        debug!(muted, "mute changed");
    }

    /// The current mute flag.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Silence a stereo interleaved buffer when muted.
    pub fn apply_to_audio_rt(&self, buffer: &mut [f32]) {
        if self.is_active() && self.is_muted() {
            for frame in buffer.chunks_exact_mut(2) {
                frame.copy_from_slice(&Stereo::<f32>::EQUILIBRIUM);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_transforms_the_applied_amplitude() {
        let volume = VolumeControl::new(5);
        volume.activate();
        volume.set_will_apply_to_audio(true);
        volume.set_volume_scalar(0.5);

        let mut buffer = vec![1.0f32; 8];
        volume.apply_to_audio_rt(&mut buffer);
        // pow(2/1) curve: 0.5 scalar scales by 0.25.
        assert!(buffer.iter().all(|s| (*s - 0.25).abs() < 1e-6));

        volume.set_transfer_curve(TransferCurve::Linear);
        let mut buffer = vec![1.0f32; 8];
        volume.apply_to_audio_rt(&mut buffer);
        assert!(buffer.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn inactive_volume_leaves_audio_alone() {
        let volume = VolumeControl::new(5);
        volume.set_will_apply_to_audio(true);
        volume.set_volume_scalar(0.1);

        let mut buffer = vec![1.0f32; 4];
        volume.apply_to_audio_rt(&mut buffer);
        assert_eq!(buffer, vec![1.0f32; 4]);
    }

    #[test]
    fn scalar_is_clamped() {
        let volume = VolumeControl::new(5);
        volume.set_volume_scalar(3.0);
        assert_eq!(volume.volume_scalar(), 1.0);
        volume.set_volume_scalar(-1.0);
        assert_eq!(volume.volume_scalar(), 0.0);
    }

    #[test]
    fn mute_zeroes_frames_only_while_active() {
        let mute = MuteControl::new(6);
        mute.set_muted(true);

        let mut buffer = vec![0.7f32; 6];
        mute.apply_to_audio_rt(&mut buffer);
        assert_eq!(buffer, vec![0.7f32; 6]);

        mute.activate();
        mute.apply_to_audio_rt(&mut buffer);
        assert_eq!(buffer, vec![0.0f32; 6]);
    }
}
