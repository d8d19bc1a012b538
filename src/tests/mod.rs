use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::driver::{HostHook, PropertySelector};

mod client_map;
mod loopback_roundtrip;

/// Test host that forwards every callback onto a channel.
pub(crate) struct RecordingHost {
    notifications: Sender<(u32, PropertySelector)>,
    config_requests: Sender<(u32, u64)>,
}

impl RecordingHost {
    pub(crate) fn new() -> (
        Arc<Self>,
        Receiver<(u32, PropertySelector)>,
        Receiver<(u32, u64)>,
    ) {
        let (notify_tx, notify_rx) = unbounded();
        let (config_tx, config_rx) = unbounded();
        (
            Arc::new(Self {
                notifications: notify_tx,
                config_requests: config_tx,
            }),
            notify_rx,
            config_rx,
        )
    }
}

impl HostHook for RecordingHost {
    fn properties_changed(&self, object_id: u32, selector: PropertySelector) {
        let _ = self.notifications.send((object_id, selector));
    }

    fn request_config_change(&self, device_id: u32, action: u64) {
        let _ = self.config_requests.send((device_id, action));
    }
}
