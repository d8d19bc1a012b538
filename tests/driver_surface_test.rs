use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use loopback_driver::{
    error, status_from, AudioFormat, AudioServerPlugInDriver, ChangeAction, Client, HostHook,
    IoCycleInfo, IoOperation, LoopbackDriver, PropertySelector, PropertyValue,
    LOOPBACK_RING_BUFFER_FRAMES, OBJECT_ID_DEVICE, OBJECT_ID_MUTE_CONTROL, OBJECT_ID_PLUGIN,
    OBJECT_ID_STREAM_INPUT, OBJECT_ID_STREAM_OUTPUT, OBJECT_ID_VOLUME_CONTROL,
};

struct ChannelHost {
    notifications: Sender<(u32, PropertySelector)>,
    config_requests: Sender<(u32, u64)>,
}

impl HostHook for ChannelHost {
    fn properties_changed(&self, object_id: u32, selector: PropertySelector) {
        let _ = self.notifications.send((object_id, selector));
    }

    fn request_config_change(&self, device_id: u32, action: u64) {
        let _ = self.config_requests.send((device_id, action));
    }
}

fn initialized_driver() -> (
    LoopbackDriver,
    Receiver<(u32, PropertySelector)>,
    Receiver<(u32, u64)>,
) {
    let driver = LoopbackDriver::new();
    let (notify_tx, notify_rx) = unbounded();
    let (config_tx, config_rx) = unbounded();
    driver
        .initialize(Arc::new(ChannelHost {
            notifications: notify_tx,
            config_requests: config_tx,
        }))
        .unwrap();
    (driver, notify_rx, config_rx)
}

#[test]
fn dynamic_devices_are_unsupported() {
    let (driver, _notify, _config) = initialized_driver();
    assert_eq!(
        status_from(driver.create_device()),
        error::STATUS_UNSUPPORTED
    );
    assert_eq!(
        status_from(driver.destroy_device(OBJECT_ID_DEVICE)),
        error::STATUS_UNSUPPORTED
    );
}

#[test]
fn unknown_objects_map_to_bad_object_status() {
    let (driver, _notify, _config) = initialized_driver();
    assert_eq!(
        status_from(driver.property_data(99, PropertySelector::Name)),
        error::STATUS_BAD_OBJECT
    );
    assert_eq!(
        status_from(driver.start_io(99, 1)),
        error::STATUS_BAD_OBJECT
    );
    assert!(!driver.has_property(99, PropertySelector::Name));
}

#[test]
fn device_reports_its_static_properties() {
    let (driver, _notify, _config) = initialized_driver();

    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::NominalSampleRate)
            .unwrap(),
        PropertyValue::F64(44_100.0)
    );
    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::ZeroTimeStampPeriod)
            .unwrap(),
        PropertyValue::U32(LOOPBACK_RING_BUFFER_FRAMES)
    );
    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::PreferredChannelsForStereo)
            .unwrap(),
        PropertyValue::U32Pair(1, 2)
    );
    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::AvailableNominalSampleRates)
            .unwrap(),
        PropertyValue::F64Range(1.0, 1_000_000_000.0)
    );
    assert_eq!(
        driver
            .property_data_size(OBJECT_ID_DEVICE, PropertySelector::NominalSampleRate)
            .unwrap(),
        8
    );
    assert!(driver
        .is_property_settable(OBJECT_ID_DEVICE, PropertySelector::NominalSampleRate)
        .unwrap());
    assert!(!driver
        .is_property_settable(OBJECT_ID_DEVICE, PropertySelector::ZeroTimeStampPeriod)
        .unwrap());
}

#[test]
fn sample_rate_set_runs_through_the_host() {
    let (driver, _notify, config_rx) = initialized_driver();

    driver
        .set_property_data(
            OBJECT_ID_DEVICE,
            PropertySelector::NominalSampleRate,
            &PropertyValue::F64(48_000.0),
        )
        .unwrap();

    // The driver must not change anything until the host quiesces IO.
    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::NominalSampleRate)
            .unwrap(),
        PropertyValue::F64(44_100.0)
    );

    let (device_id, action) = config_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(device_id, OBJECT_ID_DEVICE);
    driver
        .perform_device_configuration_change(device_id, action)
        .unwrap();

    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::NominalSampleRate)
            .unwrap(),
        PropertyValue::F64(48_000.0)
    );
    let input_format = driver
        .property_data(OBJECT_ID_STREAM_INPUT, PropertySelector::StreamFormat)
        .unwrap();
    assert_eq!(
        input_format,
        PropertyValue::Format(AudioFormat::stereo_float(48_000.0))
    );
}

#[test]
fn out_of_range_sample_rates_are_rejected() {
    let (driver, _notify, config_rx) = initialized_driver();
    let status = status_from(driver.set_property_data(
        OBJECT_ID_DEVICE,
        PropertySelector::NominalSampleRate,
        &PropertyValue::F64(0.0),
    ));
    assert_eq!(status, error::STATUS_UNSUPPORTED_FORMAT);
    assert!(config_rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn stream_format_change_is_validated_then_forwarded() {
    let (driver, _notify, config_rx) = initialized_driver();

    let bad = AudioFormat {
        sample_rate: 48_000.0,
        channels: 6,
        bits_per_sample: 32,
    };
    assert_eq!(
        status_from(driver.set_property_data(
            OBJECT_ID_STREAM_OUTPUT,
            PropertySelector::StreamFormat,
            &PropertyValue::Format(bad),
        )),
        error::STATUS_UNSUPPORTED_FORMAT
    );

    driver
        .set_property_data(
            OBJECT_ID_STREAM_OUTPUT,
            PropertySelector::StreamFormat,
            &PropertyValue::Format(AudioFormat::stereo_float(96_000.0)),
        )
        .unwrap();
    let (_, action) = config_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(action, ChangeAction::SetSampleRate.as_code());
}

#[test]
fn enabled_controls_toggle_through_the_dance() {
    let (driver, _notify, config_rx) = initialized_driver();

    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::EnabledOutputControls)
            .unwrap(),
        PropertyValue::BoolPair(true, true)
    );

    driver
        .set_property_data(
            OBJECT_ID_DEVICE,
            PropertySelector::EnabledOutputControls,
            &PropertyValue::BoolPair(false, false),
        )
        .unwrap();
    let (device_id, action) = config_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(action, ChangeAction::SetEnabledControls.as_code());
    driver
        .perform_device_configuration_change(device_id, action)
        .unwrap();

    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::EnabledOutputControls)
            .unwrap(),
        PropertyValue::BoolPair(false, false)
    );
    assert_eq!(
        driver
            .will_do_io_operation(OBJECT_ID_DEVICE, IoOperation::ProcessMix)
            .unwrap(),
        (false, true)
    );
}

#[test]
fn null_device_toggles_via_the_plugin_property() {
    let (driver, notify_rx, _config) = initialized_driver();
    assert_eq!(
        driver
            .property_data(OBJECT_ID_PLUGIN, PropertySelector::NullDeviceActive)
            .unwrap(),
        PropertyValue::Bool(false)
    );

    driver
        .set_property_data(
            OBJECT_ID_PLUGIN,
            PropertySelector::NullDeviceActive,
            &PropertyValue::Bool(true),
        )
        .unwrap();
    assert_eq!(
        driver
            .property_data(OBJECT_ID_PLUGIN, PropertySelector::NullDeviceActive)
            .unwrap(),
        PropertyValue::Bool(true)
    );
    assert_eq!(
        notify_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        (OBJECT_ID_PLUGIN, PropertySelector::NullDeviceActive)
    );
}

#[test]
fn control_values_round_trip() {
    let (driver, _notify, _config) = initialized_driver();

    driver
        .set_property_data(
            OBJECT_ID_VOLUME_CONTROL,
            PropertySelector::ControlValue,
            &PropertyValue::F32(0.5),
        )
        .unwrap();
    assert_eq!(
        driver
            .property_data(OBJECT_ID_VOLUME_CONTROL, PropertySelector::ControlValue)
            .unwrap(),
        PropertyValue::F32(0.5)
    );

    driver
        .set_property_data(
            OBJECT_ID_MUTE_CONTROL,
            PropertySelector::ControlValue,
            &PropertyValue::Bool(true),
        )
        .unwrap();
    assert_eq!(
        driver
            .property_data(OBJECT_ID_MUTE_CONTROL, PropertySelector::ControlValue)
            .unwrap(),
        PropertyValue::Bool(true)
    );

    // A mistyped value is an illegal operation, not a crash.
    assert_eq!(
        status_from(driver.set_property_data(
            OBJECT_ID_VOLUME_CONTROL,
            PropertySelector::ControlValue,
            &PropertyValue::Bool(true),
        )),
        error::STATUS_ILLEGAL_OPERATION
    );
}

#[test]
fn full_io_session_through_the_driver_surface() {
    let (driver, notify_rx, _config) = initialized_driver();

    driver
        .add_device_client(OBJECT_ID_DEVICE, Client::new(7, 100, Some("app.a".into())))
        .unwrap();
    driver.start_io(OBJECT_ID_DEVICE, 7).unwrap();
    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::DeviceIsRunning)
            .unwrap(),
        PropertyValue::Bool(true)
    );
    assert_eq!(
        notify_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        (OBJECT_ID_DEVICE, PropertySelector::DeviceIsRunning)
    );

    let (sample_time, _host_time, seed) = driver.get_zero_time_stamp(OBJECT_ID_DEVICE).unwrap();
    assert!(sample_time >= 0.0);
    assert_eq!(seed, 1);

    // One IO cycle: render 256 frames, then capture them.
    let cycle = IoCycleInfo {
        input_time: 512,
        output_time: 512,
    };
    let mut rendered: Vec<f32> = (0..512).map(|i| i as f32 / 512.0).collect();
    let expected = rendered.clone();
    driver
        .do_io_operation(
            OBJECT_ID_DEVICE,
            OBJECT_ID_STREAM_OUTPUT,
            7,
            IoOperation::WriteMix,
            &cycle,
            &mut rendered,
        )
        .unwrap();

    let mut captured = vec![0.0f32; 512];
    driver
        .do_io_operation(
            OBJECT_ID_DEVICE,
            OBJECT_ID_STREAM_INPUT,
            7,
            IoOperation::ReadInput,
            &cycle,
            &mut captured,
        )
        .unwrap();
    assert_eq!(captured, expected);

    driver.stop_io(OBJECT_ID_DEVICE, 7).unwrap();
    assert_eq!(
        driver
            .property_data(OBJECT_ID_DEVICE, PropertySelector::DeviceIsRunning)
            .unwrap(),
        PropertyValue::Bool(false)
    );

    driver.remove_device_client(OBJECT_ID_DEVICE, 7).unwrap();
    // Removing twice is an error the host sees as a status code.
    assert_eq!(
        status_from(driver.remove_device_client(OBJECT_ID_DEVICE, 7)),
        error::STATUS_ILLEGAL_OPERATION
    );
}

#[test]
fn do_io_rejects_foreign_stream_ids() {
    let (driver, _notify, _config) = initialized_driver();
    let mut buffer = vec![0.0f32; 8];
    let status = status_from(driver.do_io_operation(
        OBJECT_ID_DEVICE,
        OBJECT_ID_VOLUME_CONTROL,
        1,
        IoOperation::WriteMix,
        &IoCycleInfo::default(),
        &mut buffer,
    ));
    assert_eq!(status, error::STATUS_BAD_OBJECT);
}
