//! Primary/shadow client registry read from the realtime IO path.
//!
//! The registry keeps two structurally identical sides. The realtime path
//! reads the primary side under a lock it can afford to spin on briefly,
//! because that lock is only ever held by another time-constraint thread —
//! the realtime worker performing a swap. All mutation work, including
//! allocation, happens on non-realtime threads against the shadow side:
//! mutate the shadow, have the realtime worker swap the sides, then repeat
//! the mutation so the pair is identical again.
//!
//! Secondary indices store client ids rather than pointers into the id map;
//! lookups return copies. Each side owns its values outright, so swapping
//! sides is a handful of pointer-sized moves.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::clients::{Client, ClientRt};
use crate::error::DriverError;
use crate::tasks::TaskQueue;

#[derive(Default, PartialEq)]
struct MapSide {
    by_id: HashMap<u32, Client>,
    by_pid: HashMap<i32, Vec<u32>>,
    by_bundle: HashMap<String, Vec<u32>>,
}

impl MapSide {
    fn insert(&mut self, client: &Client) -> Result<(), DriverError> {
        if self.by_id.contains_key(&client.client_id) {
            return Err(DriverError::InvalidClient(client.client_id));
        }
        self.by_id.insert(client.client_id, client.clone());
        self.by_pid
            .entry(client.process_id)
            .or_default()
            .push(client.client_id);
        if let Some(bundle) = &client.bundle_id {
            self.by_bundle
                .entry(bundle.clone())
                .or_default()
                .push(client.client_id);
        }
        Ok(())
    }

    fn remove(&mut self, client_id: u32) -> Result<Client, DriverError> {
        let client = self
            .by_id
            .remove(&client_id)
            .ok_or(DriverError::InvalidClient(client_id))?;
        if let Some(ids) = self.by_pid.get_mut(&client.process_id) {
            ids.retain(|id| *id != client_id);
            if ids.is_empty() {
                self.by_pid.remove(&client.process_id);
            }
        }
        if let Some(bundle) = &client.bundle_id {
            if let Some(ids) = self.by_bundle.get_mut(bundle) {
                ids.retain(|id| *id != client_id);
                if ids.is_empty() {
                    self.by_bundle.remove(bundle);
                }
            }
        }
        Ok(client)
    }

    fn set_doing_io(&mut self, client_id: u32, doing_io: bool) -> Result<(), DriverError> {
        let client = self
            .by_id
            .get_mut(&client_id)
            .ok_or(DriverError::InvalidClient(client_id))?;
        client.doing_io = doing_io;
        Ok(())
    }
}

/// The registry of clients the host has attached to the device.
///
/// Mutators fail without touching either side when their precondition does
/// not hold, so the two sides are deep-equal whenever no mutator is
/// mid-flight.
pub struct ClientMap {
    task_queue: Arc<TaskQueue>,
    // Handle to ourselves for handing the swap task to the realtime worker.
    weak_self: Weak<ClientMap>,
    // Read from the realtime IO path; swapped by the realtime worker.
    primary: Mutex<MapSide>,
    // Serializes mutators. Held across the whole mutate-swap-mutate cycle
    // and only ever taken by non-realtime threads.
    mutators: Mutex<()>,
    // Shadow side data. Taken briefly by the serialized mutator and by the
    // swap task; never by the realtime IO path.
    shadow: Mutex<MapSide>,
    // Last-seen client per bundle id, surviving removal. No shadow: only
    // non-realtime threads look at it.
    past_clients: Mutex<HashMap<String, Client>>,
}

impl ClientMap {
    /// Create an empty registry whose swaps run on `task_queue`'s realtime
    /// worker.
    pub fn new(task_queue: Arc<TaskQueue>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            task_queue,
            weak_self: weak.clone(),
            primary: Mutex::new(MapSide::default()),
            mutators: Mutex::new(()),
            shadow: Mutex::new(MapSide::default()),
            past_clients: Mutex::new(HashMap::new()),
        })
    }

    /// Register a client. Fails with `InvalidClient` if the id is already in
    /// use.
    pub fn add(&self, client: Client) -> Result<(), DriverError> {
        let _serial = self.mutators.lock();

        self.shadow.lock().insert(&client)?;
        self.swap_in_shadow_maps();
        // The old primary, now the shadow, is still missing the client.
        self.shadow.lock().insert(&client)?;

        // Recorded at add rather than remove so every client of a bundle
        // sees the same retained record.
        if let Some(bundle) = &client.bundle_id {
            self.past_clients
                .lock()
                .insert(bundle.clone(), client.clone());
        }
        Ok(())
    }

    /// Remove and return a client. Fails with `InvalidClient` if the id was
    /// never added.
    pub fn remove(&self, client_id: u32) -> Result<Client, DriverError> {
        let _serial = self.mutators.lock();

        let client = self.shadow.lock().remove(client_id)?;
        self.swap_in_shadow_maps();
        self.shadow.lock().remove(client_id)?;
        Ok(client)
    }

    /// Flip a client's IO flag through the same shadow-then-swap protocol.
    pub fn set_doing_io(&self, client_id: u32, doing_io: bool) -> Result<(), DriverError> {
        let _serial = self.mutators.lock();

        self.shadow.lock().set_doing_io(client_id, doing_io)?;
        self.swap_in_shadow_maps();
        self.shadow.lock().set_doing_io(client_id, doing_io)
    }

    fn swap_in_shadow_maps(&self) {
        // A `&self` exists, so the upgrade cannot fail outside of drop.
        let map = self.weak_self.upgrade().expect("client map alive");
        self.task_queue.queue_sync_swap_client_shadow_maps(map);
    }

    /// Swap the primary and shadow sides.
    ///
    /// Runs on the realtime worker while the submitting mutator holds the
    /// serial lock, so the shadow lock is uncontended and the primary lock is
    /// only ever contended with realtime readers.
    pub(crate) fn swap_in_shadow_maps_rt(&self) {
        let mut primary = self.primary.lock();
        let mut shadow = self.shadow.lock();
        std::mem::swap(&mut *primary, &mut *shadow);
    }

    /// Realtime-safe lookup against the primary side.
    pub fn get_rt(&self, client_id: u32) -> Option<ClientRt> {
        self.primary.lock().by_id.get(&client_id).map(ClientRt::from)
    }

    /// Non-realtime lookup. Blocks behind any in-flight mutator.
    pub fn get_non_rt(&self, client_id: u32) -> Option<Client> {
        let _serial = self.mutators.lock();
        self.shadow.lock().by_id.get(&client_id).cloned()
    }

    /// All clients owned by `pid`, in registration order.
    pub fn clients_by_pid(&self, pid: i32) -> Vec<Client> {
        let _serial = self.mutators.lock();
        let side = self.shadow.lock();
        match side.by_pid.get(&pid) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| side.by_id.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The retained record for a bundle id, if any client with it was ever
    /// added.
    pub fn past_client(&self, bundle_id: &str) -> Option<Client> {
        self.past_clients.lock().get(bundle_id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn sides_identical(&self) -> bool {
        let _serial = self.mutators.lock();
        *self.primary.lock() == *self.shadow.lock()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        let _serial = self.mutators.lock();
        let primary = self.primary.lock();
        primary.by_id.is_empty() && primary.by_pid.is_empty() && primary.by_bundle.is_empty()
    }
}
