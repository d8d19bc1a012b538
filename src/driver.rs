//! The host-facing driver surface.
//!
//! The host consumes the core through a function table; here that table is
//! the [`AudioServerPlugInDriver`] trait, and [`LoopbackDriver`] is the one
//! implementation, dispatching each call to the plug-in object, the device,
//! or one of its sub-objects by id. Calls back up into the host go through
//! [`HostBridge`], which is bound to a real [`HostHook`] when the host
//! initializes the plug-in. Property plumbing is deliberately thin: a typed
//! selector/value pair rather than raw buffers, with the byte-size
//! bookkeeping the host's size queries need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::clients::Client;
use crate::device::{Device, IoCycleInfo, IoOperation, LOOPBACK_RING_BUFFER_FRAMES};
use crate::error::DriverError;
use crate::stream::AudioFormat;
use crate::{
    OBJECT_ID_DEVICE, OBJECT_ID_MUTE_CONTROL, OBJECT_ID_NULL_DEVICE, OBJECT_ID_NULL_STREAM,
    OBJECT_ID_PLUGIN, OBJECT_ID_STREAM_INPUT, OBJECT_ID_STREAM_OUTPUT, OBJECT_ID_VOLUME_CONTROL,
};

/// Actions used with the host's config-change protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    /// Apply the staged sample rate.
    SetSampleRate = 1,
    /// Apply the staged control-set change.
    SetEnabledControls = 2,
}

impl ChangeAction {
    /// The wire value passed through the host.
    pub fn as_code(self) -> u64 {
        self as u64
    }

    /// Decode a wire value.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(ChangeAction::SetSampleRate),
            2 => Some(ChangeAction::SetEnabledControls),
            _ => None,
        }
    }
}

/// Property selectors the core understands. The full property bag lives in
/// the host glue; only what the core itself answers for is typed here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertySelector {
    /// Human-readable object name.
    Name,
    /// Human-readable maker name.
    Manufacturer,
    /// Persistent device identity token.
    DeviceUid,
    /// Persistent device-kind identity token.
    ModelUid,
    /// Whether any client is running IO.
    DeviceIsRunning,
    /// Whether the device may be the default output.
    DeviceCanBeDefault,
    /// The device's nominal sample rate. Settable; runs the config-change
    /// dance.
    NominalSampleRate,
    /// The range of supported sample rates.
    AvailableNominalSampleRates,
    /// Frames between successive zero time stamps.
    ZeroTimeStampPeriod,
    /// Which channels to use for stereo, 1-based.
    PreferredChannelsForStereo,
    /// A stream's format. Settable; a rate change runs the config-change
    /// dance.
    StreamFormat,
    /// A control's value: volume scalar or mute flag.
    ControlValue,
    /// Custom: `[volume, mute]` enabled flags on the device. Settable.
    EnabledOutputControls,
    /// Custom: whether the null device is published. Settable on the
    /// plug-in.
    NullDeviceActive,
}

/// Typed property values crossing the core boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// A boolean, carried as a 32-bit flag on the wire.
    Bool(bool),
    /// A 32-bit integer.
    U32(u32),
    /// A pair of 32-bit integers.
    U32Pair(u32, u32),
    /// A 32-bit float.
    F32(f32),
    /// A 64-bit float.
    F64(f64),
    /// An inclusive range of 64-bit floats.
    F64Range(f64, f64),
    /// A static string.
    Text(&'static str),
    /// The `[volume, mute]` flag pair.
    BoolPair(bool, bool),
    /// A stream format.
    Format(AudioFormat),
}

impl PropertyValue {
    /// Bytes this value occupies in the host's buffer convention.
    pub fn byte_size(&self) -> usize {
        match self {
            PropertyValue::Bool(_) | PropertyValue::U32(_) | PropertyValue::F32(_) => 4,
            PropertyValue::U32Pair(..) | PropertyValue::F64(_) | PropertyValue::BoolPair(..) => 8,
            PropertyValue::F64Range(..) => 16,
            PropertyValue::Text(_) => std::mem::size_of::<usize>(),
            PropertyValue::Format(_) => std::mem::size_of::<AudioFormat>(),
        }
    }
}

/// Calls the core makes back up into the plug-in host.
///
/// Both methods may be invoked with driver locks held; implementations must
/// hand the work to another thread rather than re-enter the driver
/// synchronously, mirroring how the host's own dispatch behaves.
pub trait HostHook: Send + Sync {
    /// One or more properties on `object_id` changed.
    fn properties_changed(&self, object_id: u32, selector: PropertySelector);

    /// Ask the host to quiesce IO and later call
    /// `perform_device_configuration_change(action)`.
    fn request_config_change(&self, device_id: u32, action: u64);
}

/// Late-bound host registration shared by the device and the task queue.
///
/// The plug-in objects exist before the host hands over its interface, so
/// callbacks route through this bridge; until `initialize` binds a hook they
/// are logged and dropped.
#[derive(Default)]
pub struct HostBridge {
    hook: RwLock<Option<Arc<dyn HostHook>>>,
}

impl HostBridge {
    /// Bind the host's interface.
    pub fn set_hook(&self, hook: Arc<dyn HostHook>) {
        *self.hook.write() = Some(hook);
    }

    /// Forward a property-changed notification, if a host is bound.
    pub fn properties_changed(&self, object_id: u32, selector: PropertySelector) {
        match &*self.hook.read() {
            Some(hook) => hook.properties_changed(object_id, selector),
            None => debug!(object_id, ?selector, "dropping notification, no host bound"),
        }
    }

    /// Forward a config-change request, if a host is bound.
    pub fn request_config_change(&self, device_id: u32, action: u64) {
        match &*self.hook.read() {
            Some(hook) => hook.request_config_change(device_id, action),
            None => debug!(device_id, action, "dropping config request, no host bound"),
        }
    }
}

/// The silent placeholder device, published on demand.
///
/// It owns a single null stream, does no IO, and exists so the host always
/// has an output to fall back to.
pub struct NullDevice {
    object_id: u32,
    stream_id: u32,
    active: AtomicBool,
}

impl NullDevice {
    fn new() -> Self {
        Self {
            object_id: OBJECT_ID_NULL_DEVICE,
            stream_id: OBJECT_ID_NULL_STREAM,
            active: AtomicBool::new(false),
        }
    }

    /// The null device's audio object id.
    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// The null stream's audio object id.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Whether the null device is currently published.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        debug!(active, "null device toggled");
    }
}

/// The entry points the host invokes through its function table.
///
/// The raw C shim translates function pointers into these calls on one side
/// and converts every [`DriverError`] to a status code on the other.
pub trait AudioServerPlugInDriver: Send + Sync {
    /// Bind the host interface. First call the host makes.
    fn initialize(&self, host: Arc<dyn HostHook>) -> Result<(), DriverError>;

    /// This driver's object graph is fixed; dynamic devices are unsupported.
    fn create_device(&self) -> Result<u32, DriverError>;

    /// Counterpart of [`AudioServerPlugInDriver::create_device`]; also
    /// unsupported.
    fn destroy_device(&self, device_id: u32) -> Result<(), DriverError>;

    /// Attach a client of `device_id`.
    fn add_device_client(&self, device_id: u32, client: Client) -> Result<(), DriverError>;

    /// Detach a client of `device_id`.
    fn remove_device_client(&self, device_id: u32, client_id: u32) -> Result<(), DriverError>;

    /// Apply a staged configuration change. IO is quiesced when this runs.
    fn perform_device_configuration_change(
        &self,
        device_id: u32,
        action: u64,
    ) -> Result<(), DriverError>;

    /// Abandon a staged configuration change.
    fn abort_device_configuration_change(
        &self,
        device_id: u32,
        action: u64,
    ) -> Result<(), DriverError>;

    /// Start IO for a client.
    fn start_io(&self, device_id: u32, client_id: u32) -> Result<(), DriverError>;

    /// Stop IO for a client.
    fn stop_io(&self, device_id: u32, client_id: u32) -> Result<(), DriverError>;

    /// The device's current zero time stamp.
    fn get_zero_time_stamp(&self, device_id: u32) -> Result<(f64, u64, u64), DriverError>;

    /// `(will_do, in_place)` for one IO operation.
    fn will_do_io_operation(
        &self,
        device_id: u32,
        operation: IoOperation,
    ) -> Result<(bool, bool), DriverError>;

    /// Bracket the start of a host IO thread's cycle.
    fn begin_io_operation(
        &self,
        device_id: u32,
        operation: IoOperation,
        client_id: u32,
    ) -> Result<(), DriverError>;

    /// Run one IO operation over a buffer.
    fn do_io_operation(
        &self,
        device_id: u32,
        stream_id: u32,
        client_id: u32,
        operation: IoOperation,
        cycle: &IoCycleInfo,
        buffer: &mut [f32],
    ) -> Result<(), DriverError>;

    /// Bracket the end of a host IO thread's cycle.
    fn end_io_operation(
        &self,
        device_id: u32,
        operation: IoOperation,
        client_id: u32,
    ) -> Result<(), DriverError>;

    /// Whether `object_id` implements `selector`.
    fn has_property(&self, object_id: u32, selector: PropertySelector) -> bool;

    /// Whether `selector` on `object_id` can be set.
    fn is_property_settable(
        &self,
        object_id: u32,
        selector: PropertySelector,
    ) -> Result<bool, DriverError>;

    /// Bytes a `get` of this property will produce.
    fn property_data_size(
        &self,
        object_id: u32,
        selector: PropertySelector,
    ) -> Result<usize, DriverError>;

    /// Read a property.
    fn property_data(
        &self,
        object_id: u32,
        selector: PropertySelector,
    ) -> Result<PropertyValue, DriverError>;

    /// Write a settable property.
    fn set_property_data(
        &self,
        object_id: u32,
        selector: PropertySelector,
        value: &PropertyValue,
    ) -> Result<(), DriverError>;
}

/// The plug-in: owns the loopback device, the null device, and the host
/// bridge.
pub struct LoopbackDriver {
    host: Arc<HostBridge>,
    device: Arc<Device>,
    null_device: NullDevice,
}

impl LoopbackDriver {
    /// Build and activate the fixed object graph.
    pub fn new() -> Self {
        crate::init_tracing();
        let host = Arc::new(HostBridge::default());
        let device = Device::new(host.clone());
        device.activate();
        Self {
            host,
            device,
            null_device: NullDevice::new(),
        }
    }

    /// The loopback device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The null device.
    pub fn null_device(&self) -> &NullDevice {
        &self.null_device
    }

    /// The bridge used for calls back into the host.
    pub fn host(&self) -> &Arc<HostBridge> {
        &self.host
    }

    fn check_main_device(&self, device_id: u32) -> Result<(), DriverError> {
        if device_id == self.device.object_id() {
            Ok(())
        } else {
            Err(DriverError::BadObject(device_id))
        }
    }

    fn known_object(&self, object_id: u32) -> bool {
        matches!(
            object_id,
            OBJECT_ID_PLUGIN
                | OBJECT_ID_DEVICE
                | OBJECT_ID_STREAM_INPUT
                | OBJECT_ID_STREAM_OUTPUT
                | OBJECT_ID_VOLUME_CONTROL
                | OBJECT_ID_MUTE_CONTROL
                | OBJECT_ID_NULL_DEVICE
                | OBJECT_ID_NULL_STREAM
        )
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioServerPlugInDriver for LoopbackDriver {
    fn initialize(&self, host: Arc<dyn HostHook>) -> Result<(), DriverError> {
        self.host.set_hook(host);
        debug!("host bound");
        Ok(())
    }

    fn create_device(&self) -> Result<u32, DriverError> {
        Err(DriverError::Unsupported)
    }

    fn destroy_device(&self, _device_id: u32) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    fn add_device_client(&self, device_id: u32, client: Client) -> Result<(), DriverError> {
        if device_id == self.null_device.object_id() {
            // The null device does no IO; nothing to track.
            return Ok(());
        }
        self.check_main_device(device_id)?;
        self.device.add_client(client)
    }

    fn remove_device_client(&self, device_id: u32, client_id: u32) -> Result<(), DriverError> {
        if device_id == self.null_device.object_id() {
            return Ok(());
        }
        self.check_main_device(device_id)?;
        self.device.remove_client(client_id).map(|_| ())
    }

    fn perform_device_configuration_change(
        &self,
        device_id: u32,
        action: u64,
    ) -> Result<(), DriverError> {
        self.check_main_device(device_id)?;
        self.device.perform_config_change(action)
    }

    fn abort_device_configuration_change(
        &self,
        device_id: u32,
        action: u64,
    ) -> Result<(), DriverError> {
        self.check_main_device(device_id)?;
        self.device.abort_config_change(action);
        Ok(())
    }

    fn start_io(&self, device_id: u32, client_id: u32) -> Result<(), DriverError> {
        if device_id == self.null_device.object_id() {
            return Ok(());
        }
        self.check_main_device(device_id)?;
        self.device.start_io(client_id)
    }

    fn stop_io(&self, device_id: u32, client_id: u32) -> Result<(), DriverError> {
        if device_id == self.null_device.object_id() {
            return Ok(());
        }
        self.check_main_device(device_id)?;
        self.device.stop_io(client_id)
    }

    fn get_zero_time_stamp(&self, device_id: u32) -> Result<(f64, u64, u64), DriverError> {
        self.check_main_device(device_id)?;
        Ok(self.device.zero_time_stamp())
    }

    fn will_do_io_operation(
        &self,
        device_id: u32,
        operation: IoOperation,
    ) -> Result<(bool, bool), DriverError> {
        self.check_main_device(device_id)?;
        Ok(self.device.will_do_io_operation(operation))
    }

    fn begin_io_operation(
        &self,
        device_id: u32,
        operation: IoOperation,
        client_id: u32,
    ) -> Result<(), DriverError> {
        self.check_main_device(device_id)?;
        self.device.begin_io_operation(operation, client_id);
        Ok(())
    }

    fn do_io_operation(
        &self,
        device_id: u32,
        stream_id: u32,
        _client_id: u32,
        operation: IoOperation,
        cycle: &IoCycleInfo,
        buffer: &mut [f32],
    ) -> Result<(), DriverError> {
        self.check_main_device(device_id)?;
        if !self.device.is_stream_id(stream_id) {
            return Err(DriverError::BadObject(stream_id));
        }
        self.device.do_io_operation(operation, cycle, buffer)
    }

    fn end_io_operation(
        &self,
        device_id: u32,
        operation: IoOperation,
        client_id: u32,
    ) -> Result<(), DriverError> {
        self.check_main_device(device_id)?;
        self.device.end_io_operation(operation, client_id);
        Ok(())
    }

    fn has_property(&self, object_id: u32, selector: PropertySelector) -> bool {
        use PropertySelector::*;
        match object_id {
            OBJECT_ID_PLUGIN => matches!(selector, Name | Manufacturer | NullDeviceActive),
            OBJECT_ID_DEVICE => matches!(
                selector,
                Name | Manufacturer
                    | DeviceUid
                    | ModelUid
                    | DeviceIsRunning
                    | DeviceCanBeDefault
                    | NominalSampleRate
                    | AvailableNominalSampleRates
                    | ZeroTimeStampPeriod
                    | PreferredChannelsForStereo
                    | EnabledOutputControls
            ),
            OBJECT_ID_STREAM_INPUT | OBJECT_ID_STREAM_OUTPUT => {
                matches!(selector, Name | StreamFormat)
            }
            OBJECT_ID_VOLUME_CONTROL | OBJECT_ID_MUTE_CONTROL => {
                matches!(selector, Name | ControlValue)
            }
            OBJECT_ID_NULL_DEVICE | OBJECT_ID_NULL_STREAM => matches!(selector, Name),
            _ => false,
        }
    }

    fn is_property_settable(
        &self,
        object_id: u32,
        selector: PropertySelector,
    ) -> Result<bool, DriverError> {
        if !self.known_object(object_id) {
            return Err(DriverError::BadObject(object_id));
        }
        if !self.has_property(object_id, selector) {
            return Err(DriverError::BadProperty);
        }
        use PropertySelector::*;
        Ok(match (object_id, selector) {
            (OBJECT_ID_PLUGIN, NullDeviceActive) => true,
            (OBJECT_ID_DEVICE, NominalSampleRate | EnabledOutputControls) => true,
            (OBJECT_ID_STREAM_INPUT | OBJECT_ID_STREAM_OUTPUT, StreamFormat) => true,
            (OBJECT_ID_VOLUME_CONTROL | OBJECT_ID_MUTE_CONTROL, ControlValue) => true,
            _ => false,
        })
    }

    fn property_data_size(
        &self,
        object_id: u32,
        selector: PropertySelector,
    ) -> Result<usize, DriverError> {
        self.property_data(object_id, selector)
            .map(|value| value.byte_size())
    }

    fn property_data(
        &self,
        object_id: u32,
        selector: PropertySelector,
    ) -> Result<PropertyValue, DriverError> {
        if !self.known_object(object_id) {
            return Err(DriverError::BadObject(object_id));
        }
        use PropertySelector::*;
        let value = match (object_id, selector) {
            (OBJECT_ID_PLUGIN, Name) => PropertyValue::Text("Loopback Audio Plug-In"),
            (OBJECT_ID_PLUGIN, NullDeviceActive) => {
                PropertyValue::Bool(self.null_device.is_active())
            }
            (OBJECT_ID_DEVICE, Name) => PropertyValue::Text("Loopback Audio"),
            (OBJECT_ID_DEVICE, DeviceUid) => PropertyValue::Text("LoopbackDevice"),
            (OBJECT_ID_DEVICE, ModelUid) => PropertyValue::Text("LoopbackDeviceModelUID"),
            (OBJECT_ID_PLUGIN | OBJECT_ID_DEVICE, Manufacturer) => {
                PropertyValue::Text("Loopback Audio Project")
            }
            (OBJECT_ID_DEVICE, DeviceIsRunning) => {
                PropertyValue::Bool(self.device.clients().clients_running_io())
            }
            (OBJECT_ID_DEVICE, DeviceCanBeDefault) => PropertyValue::Bool(true),
            (OBJECT_ID_DEVICE, NominalSampleRate) => {
                PropertyValue::F64(self.device.sample_rate())
            }
            (OBJECT_ID_DEVICE, AvailableNominalSampleRates) => PropertyValue::F64Range(
                crate::device::SAMPLE_RATE_MIN,
                crate::device::SAMPLE_RATE_MAX,
            ),
            (OBJECT_ID_DEVICE, ZeroTimeStampPeriod) => {
                PropertyValue::U32(LOOPBACK_RING_BUFFER_FRAMES)
            }
            (OBJECT_ID_DEVICE, PreferredChannelsForStereo) => PropertyValue::U32Pair(1, 2),
            (OBJECT_ID_DEVICE, EnabledOutputControls) => {
                let (volume, mute) = self.device.enabled_controls();
                PropertyValue::BoolPair(volume, mute)
            }
            (OBJECT_ID_STREAM_INPUT, Name) => PropertyValue::Text("Loopback Input"),
            (OBJECT_ID_STREAM_OUTPUT, Name) => PropertyValue::Text("Loopback Output"),
            (OBJECT_ID_STREAM_INPUT, StreamFormat) => {
                PropertyValue::Format(self.device.input_stream().format())
            }
            (OBJECT_ID_STREAM_OUTPUT, StreamFormat) => {
                PropertyValue::Format(self.device.output_stream().format())
            }
            (OBJECT_ID_VOLUME_CONTROL, Name) => PropertyValue::Text("Master Volume"),
            (OBJECT_ID_VOLUME_CONTROL, ControlValue) => {
                PropertyValue::F32(self.device.volume_control().volume_scalar())
            }
            (OBJECT_ID_MUTE_CONTROL, Name) => PropertyValue::Text("Master Mute"),
            (OBJECT_ID_MUTE_CONTROL, ControlValue) => {
                PropertyValue::Bool(self.device.mute_control().is_muted())
            }
            (OBJECT_ID_NULL_DEVICE, Name) => PropertyValue::Text("Null Device"),
            (OBJECT_ID_NULL_STREAM, Name) => PropertyValue::Text("Null Stream"),
            _ => return Err(DriverError::BadProperty),
        };
        Ok(value)
    }

    fn set_property_data(
        &self,
        object_id: u32,
        selector: PropertySelector,
        value: &PropertyValue,
    ) -> Result<(), DriverError> {
        if !self.is_property_settable(object_id, selector)? {
            return Err(DriverError::IllegalOperation("property is read-only"));
        }
        use PropertySelector::*;
        match (object_id, selector, value) {
            (OBJECT_ID_PLUGIN, NullDeviceActive, PropertyValue::Bool(active)) => {
                self.null_device.set_active(*active);
                self.host
                    .properties_changed(OBJECT_ID_PLUGIN, NullDeviceActive);
                Ok(())
            }
            (OBJECT_ID_DEVICE, NominalSampleRate, PropertyValue::F64(rate)) => {
                self.device.request_sample_rate(*rate)
            }
            (OBJECT_ID_DEVICE, EnabledOutputControls, PropertyValue::BoolPair(volume, mute)) => {
                self.device.request_enabled_controls(*volume, *mute);
                Ok(())
            }
            (
                OBJECT_ID_STREAM_INPUT | OBJECT_ID_STREAM_OUTPUT,
                StreamFormat,
                PropertyValue::Format(format),
            ) => {
                let stream = if object_id == OBJECT_ID_STREAM_INPUT {
                    self.device.input_stream()
                } else {
                    self.device.output_stream()
                };
                stream.check_format(format)?;
                // The stream's advertised rate only moves once the device has
                // run the change through the host.
                self.device.request_sample_rate(format.sample_rate)
            }
            (OBJECT_ID_VOLUME_CONTROL, ControlValue, PropertyValue::F32(scalar)) => {
                self.device.volume_control().set_volume_scalar(*scalar);
                self.host
                    .properties_changed(OBJECT_ID_VOLUME_CONTROL, ControlValue);
                Ok(())
            }
            (OBJECT_ID_MUTE_CONTROL, ControlValue, PropertyValue::Bool(muted)) => {
                self.device.mute_control().set_muted(*muted);
                self.host
                    .properties_changed(OBJECT_ID_MUTE_CONTROL, ControlValue);
                Ok(())
            }
            _ => Err(DriverError::IllegalOperation(
                "wrong value type for property",
            )),
        }
    }
}

static DRIVER: Lazy<LoopbackDriver> = Lazy::new(LoopbackDriver::new);

/// The process-wide driver instance, created lazily on the first host call.
pub fn shared_driver() -> &'static LoopbackDriver {
    &DRIVER
}
