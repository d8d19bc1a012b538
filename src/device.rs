//! The virtual loopback device: streams, controls, clients, ring buffer, and
//! the clock that ties them together.
//!
//! The device sits between two worlds. Host control threads configure it
//! under `state`; the host's IO threads run the per-cycle operations under
//! `io`. Anything that would invalidate in-flight IO — a sample-rate change,
//! enabling or disabling a control — goes through the host's
//! request/perform config-change protocol so the host can quiesce IO first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clients::{Client, Clients};
use crate::clock::LoopbackClock;
use crate::controls::{MuteControl, TransferCurve, VolumeControl};
use crate::driver::{ChangeAction, HostBridge};
use crate::error::DriverError;
use crate::ring::{RingBuffer, RingError, SampleTime};
use crate::stream::Stream;
use crate::tasks::TaskQueue;
use crate::{
    OBJECT_ID_DEVICE, OBJECT_ID_MUTE_CONTROL, OBJECT_ID_STREAM_INPUT, OBJECT_ID_STREAM_OUTPUT,
    OBJECT_ID_VOLUME_CONTROL,
};

/// Frames in the loopback ring buffer, and the period of the device's zero
/// time stamps.
pub const LOOPBACK_RING_BUFFER_FRAMES: u32 = 16384;

/// Sample rate the device starts at.
pub const SAMPLE_RATE_DEFAULT: f64 = 44_100.0;
/// Lowest settable sample rate. Zero would divide the loopback clock by
/// zero, and wouldn't make sense anyway.
pub const SAMPLE_RATE_MIN: f64 = 1.0;
/// Highest settable sample rate. Arbitrary but comfortably above any real
/// device.
pub const SAMPLE_RATE_MAX: f64 = 1_000_000_000.0;

/// How long to wait for external hardware to come up before giving up on a
/// start. Some devices legitimately take tens of seconds.
pub const START_IO_TIMEOUT: Duration = Duration::from_secs(30);

const CHANNELS: usize = 2;
const BYTES_PER_FRAME: usize = CHANNELS * std::mem::size_of::<f32>();

/// Coarse lifecycle state of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceActivityState {
    /// Not published to the host.
    Inactive,
    /// Published, no client running IO.
    ActiveIdle,
    /// Published with at least one client running IO.
    ActiveRunning,
}

/// The IO operations the host cycles through each period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOperation {
    /// Umbrella operation bracketing one host IO thread's participation.
    Thread,
    /// Read loopback frames into the input buffer.
    ReadInput,
    /// Device-level processing of the mixed output.
    ProcessMix,
    /// Write the mixed output into the loopback buffer.
    WriteMix,
    /// Per-client processing of output buffers.
    ProcessOutput,
    /// Phases this device does not participate in.
    Other,
}

/// Per-cycle timing handed down by the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoCycleInfo {
    /// Sample time the input side of the cycle reads at.
    pub input_time: SampleTime,
    /// Sample time the output side of the cycle writes at.
    pub output_time: SampleTime,
}

struct DeviceState {
    sample_rate: f64,
    pending_sample_rate: f64,
    pending_volume_enabled: bool,
    pending_mute_enabled: bool,
}

struct IoState {
    ring: RingBuffer,
    clock: LoopbackClock,
}

/// The loopback device.
pub struct Device {
    object_id: u32,
    active: AtomicBool,
    // Guards configuration. Never taken on the IO path.
    state: Mutex<DeviceState>,
    // Guards the ring buffer and clock during IO operations. Held only for
    // short, bounded work.
    io: Mutex<IoState>,
    clients: Arc<Clients>,
    task_queue: Arc<TaskQueue>,
    input_stream: Stream,
    output_stream: Stream,
    volume_control: VolumeControl,
    mute_control: MuteControl,
    host: Arc<HostBridge>,
}

impl Device {
    /// Build the device in its default configuration: 44.1kHz, both output
    /// controls owned, volume on a pow(2/1) curve applied by the device
    /// itself.
    pub fn new(host: Arc<HostBridge>) -> Arc<Self> {
        let task_queue = Arc::new(TaskQueue::new());
        let clients = Clients::new(OBJECT_ID_DEVICE, task_queue.clone(), host.clone());

        let device = Arc::new(Self {
            object_id: OBJECT_ID_DEVICE,
            active: AtomicBool::new(false),
            state: Mutex::new(DeviceState {
                sample_rate: SAMPLE_RATE_DEFAULT,
                pending_sample_rate: SAMPLE_RATE_DEFAULT,
                pending_volume_enabled: true,
                pending_mute_enabled: true,
            }),
            io: Mutex::new(IoState {
                ring: RingBuffer::allocate(CHANNELS, BYTES_PER_FRAME, LOOPBACK_RING_BUFFER_FRAMES),
                clock: LoopbackClock::new(SAMPLE_RATE_DEFAULT, LOOPBACK_RING_BUFFER_FRAMES),
            }),
            clients,
            task_queue,
            input_stream: Stream::new(OBJECT_ID_STREAM_INPUT, true, SAMPLE_RATE_DEFAULT),
            output_stream: Stream::new(OBJECT_ID_STREAM_OUTPUT, false, SAMPLE_RATE_DEFAULT),
            volume_control: VolumeControl::new(OBJECT_ID_VOLUME_CONTROL),
            mute_control: MuteControl::new(OBJECT_ID_MUTE_CONTROL),
            host,
        });

        device.volume_control.set_transfer_curve(TransferCurve::Pow2Over1);
        device.volume_control.set_volume_scalar(1.0);
        device.volume_control.set_will_apply_to_audio(true);
        device
    }

    /// The device's audio object id.
    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// Publish the device: activate its streams and enabled controls and
    /// ready the loopback machinery at the current sample rate.
    pub fn activate(&self) {
        let state = self.state.lock();
        self.init_loopback(state.sample_rate);
        self.input_stream.activate();
        self.output_stream.activate();
        self.volume_control.activate();
        self.mute_control.activate();
        self.active.store(true, Ordering::Release);
        debug!("device activated");
    }

    /// Withdraw the device. Safe against concurrent IO: takes both locks.
    pub fn deactivate(&self) {
        let _state = self.state.lock();
        let _io = self.io.lock();
        self.input_stream.deactivate();
        self.output_stream.deactivate();
        self.volume_control.deactivate();
        self.mute_control.deactivate();
        self.active.store(false, Ordering::Release);
        debug!("device deactivated");
    }

    /// Where the device currently is in its lifecycle.
    pub fn activity_state(&self) -> DeviceActivityState {
        if !self.active.load(Ordering::Acquire) {
            DeviceActivityState::Inactive
        } else if self.clients.clients_running_io() {
            DeviceActivityState::ActiveRunning
        } else {
            DeviceActivityState::ActiveIdle
        }
    }

    /// Register a client with the device.
    pub fn add_client(&self, client: Client) -> Result<(), DriverError> {
        let _state = self.state.lock();
        debug!(client_id = client.client_id, "adding client");
        self.clients.add_client(client)
    }

    /// Remove a client from the device.
    pub fn remove_client(&self, client_id: u32) -> Result<Client, DriverError> {
        let _state = self.state.lock();
        debug!(client_id, "removing client");
        self.clients.remove_client(client_id)
    }

    /// Host request to start IO on behalf of `client_id`.
    ///
    /// The update runs through the task queue rather than inline because the
    /// per-thread begin/end operations queue the same updates, and they all
    /// have to apply in the order the host issued them. The engine starts
    /// only when the first client starts.
    pub fn start_io(&self, client_id: u32) -> Result<(), DriverError> {
        let _state = self.state.lock();
        let did_start = self
            .task_queue
            .queue_sync_start_client_io(self.clients.clone(), client_id)?;
        if did_start {
            self.hw_start_io();
        }
        Ok(())
    }

    /// Host request to stop IO on behalf of `client_id`. The engine stops
    /// only when the last client stops.
    pub fn stop_io(&self, client_id: u32) -> Result<(), DriverError> {
        let _state = self.state.lock();
        let did_stop = self
            .task_queue
            .queue_sync_stop_client_io(self.clients.clone(), client_id)?;
        if did_stop {
            debug!("last client stopped io");
        }
        Ok(())
    }

    fn hw_start_io(&self) {
        // A fresh IO session gets a fresh epoch.
        let mut io = self.io.lock();
        io.clock.reset();
        debug!("io engine started");
    }

    /// The current `(sample_time, host_time, seed)` zero time stamp.
    pub fn zero_time_stamp(&self) -> (f64, u64, u64) {
        let mut io = self.io.lock();
        io.clock.zero_time_stamp()
    }

    /// Which IO operations the device participates in, and whether it works
    /// in place.
    pub fn will_do_io_operation(&self, operation: IoOperation) -> (bool, bool) {
        match operation {
            IoOperation::Thread
            | IoOperation::ReadInput
            | IoOperation::WriteMix
            | IoOperation::ProcessOutput => (true, true),
            IoOperation::ProcessMix => (self.volume_control.will_apply_to_audio_rt(), true),
            IoOperation::Other => (false, true),
        }
    }

    /// Called as a host IO thread enters its cycle.
    ///
    /// The host only calls `start_io`/`stop_io` for the first and last
    /// clients, so the per-thread operation keeps the remaining clients' IO
    /// state honest. Queued async because this runs on a realtime thread.
    pub fn begin_io_operation(&self, operation: IoOperation, client_id: u32) {
        if operation == IoOperation::Thread {
            self.task_queue
                .queue_async_start_client_io(self.clients.clone(), client_id);
        }
    }

    /// Called as a host IO thread leaves its cycle.
    pub fn end_io_operation(&self, operation: IoOperation, client_id: u32) {
        if operation == IoOperation::Thread {
            self.task_queue
                .queue_async_stop_client_io(self.clients.clone(), client_id);
        }
    }

    /// Run one IO operation over `buffer` for the cycle described by
    /// `cycle`.
    pub fn do_io_operation(
        &self,
        operation: IoOperation,
        cycle: &IoCycleInfo,
        buffer: &mut [f32],
    ) -> Result<(), DriverError> {
        match operation {
            IoOperation::ReadInput => self.read_input(buffer, cycle.input_time),
            IoOperation::WriteMix => self.write_mix(buffer, cycle.output_time),
            IoOperation::ProcessMix => {
                let _io = self.io.lock();
                self.volume_control.apply_to_audio_rt(buffer);
                Ok(())
            }
            IoOperation::ProcessOutput => {
                self.mute_control.apply_to_audio_rt(buffer);
                Ok(())
            }
            IoOperation::Thread | IoOperation::Other => {
                debug!(?operation, "unexpected io operation");
                Ok(())
            }
        }
    }

    fn read_input(&self, buffer: &mut [f32], input_time: SampleTime) -> Result<(), DriverError> {
        let io = self.io.lock();
        match io.ring.fetch(buffer, input_time) {
            Ok(()) => Ok(()),
            // The fetch zeroed the buffer; a torn bounds read is temporary,
            // so the cycle still succeeds.
            Err(RingError::CpuOverload) => Ok(()),
            Err(RingError::TooMuch) => Err(DriverError::IllegalOperation(
                "input read larger than the loopback buffer",
            )),
        }
    }

    fn write_mix(&self, buffer: &[f32], output_time: SampleTime) -> Result<(), DriverError> {
        let io = self.io.lock();
        match io.ring.store(buffer, output_time) {
            Ok(()) | Err(RingError::CpuOverload) => Ok(()),
            Err(RingError::TooMuch) => Err(DriverError::IllegalOperation(
                "mix write larger than the loopback buffer",
            )),
        }
    }

    /// The device's nominal sample rate.
    pub fn sample_rate(&self) -> f64 {
        self.state.lock().sample_rate
    }

    /// Stage a sample-rate change and ask the host to schedule it.
    ///
    /// The new rate lands in `pending_sample_rate`; the host quiesces IO and
    /// calls [`Device::perform_config_change`], which applies it.
    pub fn request_sample_rate(&self, sample_rate: f64) -> Result<(), DriverError> {
        if !(SAMPLE_RATE_MIN..=SAMPLE_RATE_MAX).contains(&sample_rate) {
            return Err(DriverError::UnsupportedFormat(sample_rate));
        }

        let mut state = self.state.lock();
        if sample_rate != state.sample_rate {
            debug!(sample_rate, "sample rate change requested");
            state.pending_sample_rate = sample_rate;
            self.host
                .request_config_change(self.object_id, ChangeAction::SetSampleRate.as_code());
        }
        Ok(())
    }

    /// Stage a control-set change and ask the host to schedule it.
    pub fn request_enabled_controls(&self, volume_enabled: bool, mute_enabled: bool) {
        let mut state = self.state.lock();
        let change_volume = self.volume_control.is_active() != volume_enabled;
        let change_mute = self.mute_control.is_active() != mute_enabled;

        if change_volume {
            debug!(volume_enabled, "staging volume control change");
            state.pending_volume_enabled = volume_enabled;
        }
        if change_mute {
            debug!(mute_enabled, "staging mute control change");
            state.pending_mute_enabled = mute_enabled;
        }
        if change_volume || change_mute {
            self.host
                .request_config_change(self.object_id, ChangeAction::SetEnabledControls.as_code());
        }
    }

    /// Host callback applying a previously requested change. The host has
    /// quiesced IO by the time this runs.
    pub fn perform_config_change(&self, action: u64) -> Result<(), DriverError> {
        debug!(action, "performing config change");
        match ChangeAction::from_code(action) {
            Some(ChangeAction::SetSampleRate) => {
                let pending = self.state.lock().pending_sample_rate;
                self.set_sample_rate(pending, false)
            }
            Some(ChangeAction::SetEnabledControls) => {
                let (volume_enabled, mute_enabled) = {
                    let state = self.state.lock();
                    (state.pending_volume_enabled, state.pending_mute_enabled)
                };
                self.set_enabled_controls(volume_enabled, mute_enabled);
                Ok(())
            }
            None => Err(DriverError::IllegalOperation(
                "unknown config change action",
            )),
        }
    }

    /// Host callback abandoning a requested change. Nothing to undo: the
    /// pending fields only become real in `perform_config_change`.
    pub fn abort_config_change(&self, _action: u64) {}

    /// The `[volume, mute]` enabled flags.
    pub fn enabled_controls(&self) -> (bool, bool) {
        let _state = self.state.lock();
        (
            self.volume_control.is_active(),
            self.mute_control.is_active(),
        )
    }

    fn set_sample_rate(&self, sample_rate: f64, force: bool) -> Result<(), DriverError> {
        if !(SAMPLE_RATE_MIN..=SAMPLE_RATE_MAX).contains(&sample_rate) {
            return Err(DriverError::UnsupportedFormat(sample_rate));
        }

        let mut state = self.state.lock();
        if sample_rate != state.sample_rate || force {
            debug!(from = state.sample_rate, to = sample_rate, "changing sample rate");
            state.sample_rate = sample_rate;
            self.init_loopback(sample_rate);
            self.input_stream.set_sample_rate(sample_rate);
            self.output_stream.set_sample_rate(sample_rate);
        }
        Ok(())
    }

    fn set_enabled_controls(&self, volume_enabled: bool, mute_enabled: bool) {
        let _state = self.state.lock();
        if self.volume_control.is_active() != volume_enabled {
            debug!(volume_enabled, "switching volume control");
            if volume_enabled {
                self.volume_control.activate();
            } else {
                self.volume_control.deactivate();
            }
        }
        if self.mute_control.is_active() != mute_enabled {
            debug!(mute_enabled, "switching mute control");
            if mute_enabled {
                self.mute_control.activate();
            } else {
                self.mute_control.deactivate();
            }
        }
    }

    // Reset the clock ratio and (re)allocate the loopback buffer for a
    // sample rate. Runs with IO quiesced; the brief io lock keeps the
    // replacement atomic with respect to stragglers.
    fn init_loopback(&self, sample_rate: f64) {
        let mut io = self.io.lock();
        io.clock.set_sample_rate(sample_rate);
        io.ring = RingBuffer::allocate(CHANNELS, BYTES_PER_FRAME, LOOPBACK_RING_BUFFER_FRAMES);
    }

    /// Host clock ticks per frame at the current sample rate.
    pub fn host_ticks_per_frame(&self) -> f64 {
        self.io.lock().clock.host_ticks_per_frame()
    }

    /// Frames the ring buffer holds; also the zero-time-stamp period.
    pub fn ring_capacity_frames(&self) -> u32 {
        self.io.lock().ring.capacity_frames()
    }

    /// Whether `object_id` names one of this device's streams.
    pub fn is_stream_id(&self, object_id: u32) -> bool {
        object_id == self.input_stream.object_id() || object_id == self.output_stream.object_id()
    }

    /// The capture-side stream.
    pub fn input_stream(&self) -> &Stream {
        &self.input_stream
    }

    /// The render-side stream.
    pub fn output_stream(&self) -> &Stream {
        &self.output_stream
    }

    /// The master volume control.
    pub fn volume_control(&self) -> &VolumeControl {
        &self.volume_control
    }

    /// The master mute control.
    pub fn mute_control(&self) -> &MuteControl {
        &self.mute_control
    }

    /// The client registry.
    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }
}
