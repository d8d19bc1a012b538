//! Client bookkeeping: who is attached, and whether anyone is running IO.

pub mod map;

mod client;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

pub use client::{Client, ClientRt};
pub use map::ClientMap;

use crate::driver::{HostBridge, PropertySelector};
use crate::error::DriverError;
use crate::tasks::TaskQueue;

/// Thin layer above [`ClientMap`] that reference-counts the clients
/// currently doing IO.
///
/// The count matters because the host usually calls start/stop only for the
/// first client to start and the last to stop, but is allowed to call them
/// for every client. IO state updates must run through the task queue so
/// they are processed in the order the host issued them.
pub struct Clients {
    owner_device_id: u32,
    map: Arc<ClientMap>,
    task_queue: Arc<TaskQueue>,
    host: Arc<HostBridge>,
    start_count: Mutex<u64>,
}

impl Clients {
    /// Create the registry for the device with id `owner_device_id`.
    pub fn new(
        owner_device_id: u32,
        task_queue: Arc<TaskQueue>,
        host: Arc<HostBridge>,
    ) -> Arc<Self> {
        Arc::new(Self {
            owner_device_id,
            map: ClientMap::new(task_queue.clone()),
            task_queue,
            host,
            start_count: Mutex::new(0),
        })
    }

    /// Register a client with the device.
    pub fn add_client(&self, client: Client) -> Result<(), DriverError> {
        self.map.add(client)
    }

    /// Remove a client, returning its record.
    pub fn remove_client(&self, client_id: u32) -> Result<Client, DriverError> {
        self.map.remove(client_id)
    }

    /// Mark `client_id` as doing IO.
    ///
    /// Returns true iff this start took the count from zero to one, i.e. the
    /// device's IO engine should start. Only the task queue's non-realtime
    /// worker may call this, so starts and stops apply in host order.
    pub(crate) fn start_io_non_rt(&self, client_id: u32) -> Result<bool, DriverError> {
        let mut count = self.start_count.lock();
        let client = self
            .map
            .get_non_rt(client_id)
            .ok_or(DriverError::InvalidClient(client_id))?;

        let mut did_start = false;
        if !client.doing_io {
            if *count == u64::MAX {
                return Err(DriverError::IllegalOperation(
                    "io start count already at maximum",
                ));
            }
            debug!(client_id, pid = client.process_id, "client starting io");
            self.map.set_doing_io(client_id, true)?;
            *count += 1;
            did_start = *count == 1;
        }

        if did_start {
            self.notify_is_running();
        }
        Ok(did_start)
    }

    /// Mark `client_id` as no longer doing IO.
    ///
    /// Returns true iff this stop took the count back to zero.
    pub(crate) fn stop_io_non_rt(&self, client_id: u32) -> Result<bool, DriverError> {
        let mut count = self.start_count.lock();
        let client = self
            .map
            .get_non_rt(client_id)
            .ok_or(DriverError::InvalidClient(client_id))?;

        let mut did_stop = false;
        if client.doing_io {
            debug!(client_id, pid = client.process_id, "client stopping io");
            self.map.set_doing_io(client_id, false)?;
            if *count == 0 {
                return Err(DriverError::IllegalOperation("io start count underflow"));
            }
            *count -= 1;
            did_stop = *count == 0;
        }

        if did_stop {
            self.notify_is_running();
        }
        Ok(did_stop)
    }

    /// Whether any client is currently running IO.
    pub fn clients_running_io(&self) -> bool {
        *self.start_count.lock() > 0
    }

    /// Realtime-safe lookup of a client.
    pub fn get_rt(&self, client_id: u32) -> Option<ClientRt> {
        self.map.get_rt(client_id)
    }

    /// Non-realtime lookup of a client.
    pub fn get_non_rt(&self, client_id: u32) -> Option<Client> {
        self.map.get_non_rt(client_id)
    }

    /// All clients owned by a process.
    pub fn clients_by_pid(&self, pid: i32) -> Vec<Client> {
        self.map.clients_by_pid(pid)
    }

    /// The retained record for a bundle id.
    pub fn past_client(&self, bundle_id: &str) -> Option<Client> {
        self.map.past_client(bundle_id)
    }

    fn notify_is_running(&self) {
        self.task_queue.queue_async_send_property_notification(
            self.host.clone(),
            self.owner_device_id,
            PropertySelector::DeviceIsRunning,
        );
    }
}
