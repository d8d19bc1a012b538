use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use crate::clients::Client;
use crate::device::{Device, DeviceActivityState, IoCycleInfo, IoOperation};
use crate::driver::{ChangeAction, HostBridge, PropertySelector};
use crate::tests::RecordingHost;
use crate::OBJECT_ID_DEVICE;

const BLOCK_FRAMES: usize = 256;

fn device_with_recording_host() -> (
    Arc<Device>,
    crossbeam_channel::Receiver<(u32, PropertySelector)>,
    crossbeam_channel::Receiver<(u32, u64)>,
) {
    let bridge = Arc::new(HostBridge::default());
    let (hook, notify_rx, config_rx) = RecordingHost::new();
    bridge.set_hook(hook);
    let device = Device::new(bridge);
    device.activate();
    (device, notify_rx, config_rx)
}

fn sine_block(frequency_hz: f32, sample_rate: f32) -> Vec<f32> {
    let mut block = vec![0.0f32; BLOCK_FRAMES * 2];
    for (i, frame) in block.chunks_exact_mut(2).enumerate() {
        let value = (frequency_hz * i as f32 / sample_rate * TAU).sin() * 0.5;
        frame[0] = value;
        frame[1] = value;
    }
    block
}

#[test]
fn rendered_audio_loops_back_to_the_input() {
    let (device, _notify, _config) = device_with_recording_host();

    let input = sine_block(1_000.0, 44_100.0);
    let mut rendered = input.clone();
    let cycle = IoCycleInfo {
        input_time: 4_096,
        output_time: 4_096,
    };

    // Full volume: the mix passes through untouched.
    device
        .do_io_operation(IoOperation::ProcessMix, &cycle, &mut rendered)
        .unwrap();
    device
        .do_io_operation(IoOperation::WriteMix, &cycle, &mut rendered)
        .unwrap();

    let mut captured = vec![0.0f32; BLOCK_FRAMES * 2];
    device
        .do_io_operation(IoOperation::ReadInput, &cycle, &mut captured)
        .unwrap();
    assert_eq!(captured, input);
}

#[test]
fn device_volume_scales_the_mix() {
    let (device, _notify, _config) = device_with_recording_host();
    device.volume_control().set_volume_scalar(0.5);

    let mut rendered = vec![1.0f32; BLOCK_FRAMES * 2];
    let cycle = IoCycleInfo::default();
    device
        .do_io_operation(IoOperation::ProcessMix, &cycle, &mut rendered)
        .unwrap();

    // 0.5 through the pow(2/1) curve is a gain of 0.25.
    assert!(rendered.iter().all(|s| (*s - 0.25).abs() < 1e-6));
}

#[test]
fn mute_silences_the_output_stage() {
    let (device, _notify, _config) = device_with_recording_host();
    device.mute_control().set_muted(true);

    let mut rendered = vec![0.8f32; BLOCK_FRAMES * 2];
    device
        .do_io_operation(IoOperation::ProcessOutput, &IoCycleInfo::default(), &mut rendered)
        .unwrap();
    assert!(rendered.iter().all(|s| *s == 0.0));
}

#[test]
fn io_refcount_returns_the_device_to_idle() {
    let (device, notify_rx, _config) = device_with_recording_host();
    device.add_client(Client::new(1, 100, Some("a".into()))).unwrap();
    device.add_client(Client::new(2, 101, Some("b".into()))).unwrap();
    assert_eq!(device.activity_state(), DeviceActivityState::ActiveIdle);

    device.start_io(1).unwrap();
    assert_eq!(device.activity_state(), DeviceActivityState::ActiveRunning);
    device.start_io(2).unwrap();

    device.stop_io(2).unwrap();
    assert_eq!(device.activity_state(), DeviceActivityState::ActiveRunning);
    device.stop_io(1).unwrap();
    assert_eq!(device.activity_state(), DeviceActivityState::ActiveIdle);

    // Exactly two is-running transitions: up at the first start, down at the
    // last stop.
    let first = notify_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first, (OBJECT_ID_DEVICE, PropertySelector::DeviceIsRunning));
    let second = notify_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(second, (OBJECT_ID_DEVICE, PropertySelector::DeviceIsRunning));
    assert!(notify_rx.try_recv().is_err());
}

#[test]
fn per_thread_operations_keep_client_state_honest() {
    let (device, _notify, _config) = device_with_recording_host();
    device.add_client(Client::new(1, 100, None)).unwrap();

    // The host started this client's IO thread without calling start_io.
    device.begin_io_operation(IoOperation::Thread, 1);
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while !device.clients().clients_running_io() {
        assert!(std::time::Instant::now() < deadline, "start never applied");
        std::thread::yield_now();
    }

    device.end_io_operation(IoOperation::Thread, 1);
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while device.clients().clients_running_io() {
        assert!(std::time::Instant::now() < deadline, "stop never applied");
        std::thread::yield_now();
    }
}

#[test]
fn sample_rate_change_runs_the_config_dance() {
    let (device, _notify, config_rx) = device_with_recording_host();

    device.request_sample_rate(48_000.0).unwrap();
    // Nothing changes until the host performs the action.
    assert_eq!(device.sample_rate(), 44_100.0);

    let (device_id, action) = config_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(device_id, OBJECT_ID_DEVICE);
    assert_eq!(action, ChangeAction::SetSampleRate.as_code());

    let capacity_before = device.ring_capacity_frames();
    let ticks_before = device.host_ticks_per_frame();
    device.perform_config_change(action).unwrap();

    assert_eq!(device.sample_rate(), 48_000.0);
    assert_eq!(device.input_stream().sample_rate(), 48_000.0);
    assert_eq!(device.output_stream().sample_rate(), 48_000.0);
    assert_eq!(device.ring_capacity_frames(), capacity_before);
    let expected = ticks_before * 44_100.0 / 48_000.0;
    assert!((device.host_ticks_per_frame() - expected).abs() < 1e-6);
}

#[test]
fn redundant_sample_rate_request_is_not_forwarded() {
    let (device, _notify, config_rx) = device_with_recording_host();
    device.request_sample_rate(44_100.0).unwrap();
    assert!(config_rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn control_set_change_runs_the_config_dance() {
    let (device, _notify, config_rx) = device_with_recording_host();
    assert_eq!(device.enabled_controls(), (true, true));

    device.request_enabled_controls(false, true);
    assert_eq!(device.enabled_controls(), (true, true));

    let (_, action) = config_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(action, ChangeAction::SetEnabledControls.as_code());
    device.perform_config_change(action).unwrap();
    assert_eq!(device.enabled_controls(), (false, true));

    // With the volume control gone, the device opts out of ProcessMix.
    let (will_do, _) = device.will_do_io_operation(IoOperation::ProcessMix);
    assert!(!will_do);
}

#[test]
fn zero_time_stamps_are_monotonic_per_session() {
    let (device, _notify, _config) = device_with_recording_host();
    device.add_client(Client::new(1, 100, None)).unwrap();
    device.start_io(1).unwrap();

    let (mut last_sample, mut last_host, seed) = device.zero_time_stamp();
    assert_eq!(seed, 1);
    for _ in 0..50 {
        let (sample_time, host_time, _) = device.zero_time_stamp();
        assert!(sample_time >= last_sample);
        assert!(host_time >= last_host);
        last_sample = sample_time;
        last_host = host_time;
    }
    device.stop_io(1).unwrap();
}

#[test]
fn deactivation_takes_the_device_down() {
    let (device, _notify, _config) = device_with_recording_host();
    assert_eq!(device.activity_state(), DeviceActivityState::ActiveIdle);
    device.deactivate();
    assert_eq!(device.activity_state(), DeviceActivityState::Inactive);
    assert!(!device.input_stream().is_active());
    assert!(!device.volume_control().is_active());
}
