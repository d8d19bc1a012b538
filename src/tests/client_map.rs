use std::sync::Arc;

use crate::clients::map::ClientMap;
use crate::clients::{Client, Clients};
use crate::driver::HostBridge;
use crate::error::DriverError;
use crate::tasks::TaskQueue;

fn new_map() -> Arc<ClientMap> {
    ClientMap::new(Arc::new(TaskQueue::new()))
}

fn client(id: u32, pid: i32, bundle: &str) -> Client {
    Client::new(id, pid, Some(bundle.to_string()))
}

#[test]
fn sides_stay_identical_through_mutations() {
    let map = new_map();
    assert!(map.sides_identical());

    map.add(client(7, 100, "a")).unwrap();
    assert!(map.sides_identical());

    map.add(client(8, 100, "a")).unwrap();
    assert!(map.sides_identical());

    map.set_doing_io(7, true).unwrap();
    assert!(map.sides_identical());

    map.remove(7).unwrap();
    assert!(map.sides_identical());

    map.remove(8).unwrap();
    assert!(map.sides_identical());
}

#[test]
fn add_then_remove_restores_prior_state_except_past_clients() {
    let map = new_map();
    map.add(client(7, 100, "a")).unwrap();
    assert_eq!(map.clients_by_pid(100).len(), 1);

    let removed = map.remove(7).unwrap();
    assert_eq!(removed.client_id, 7);
    assert!(map.clients_by_pid(100).is_empty());
    assert!(map.is_empty());
    assert!(map.sides_identical());

    let past = map.past_client("a").expect("past client retained");
    assert_eq!(past.client_id, 7);
    assert_eq!(past.process_id, 100);
}

#[test]
fn duplicate_add_fails_and_changes_nothing() {
    let map = new_map();
    map.add(client(7, 100, "a")).unwrap();
    assert_eq!(
        map.add(client(7, 200, "b")),
        Err(DriverError::InvalidClient(7))
    );
    assert!(map.sides_identical());
    assert_eq!(map.get_non_rt(7).unwrap().process_id, 100);
    assert!(map.past_client("b").is_none());
}

#[test]
fn remove_of_unknown_client_fails() {
    let map = new_map();
    assert_eq!(map.remove(42), Err(DriverError::InvalidClient(42)));
    assert!(map.sides_identical());
}

#[test]
fn lookups_see_both_sides() {
    let map = new_map();
    map.add(client(7, 100, "a")).unwrap();

    let rt = map.get_rt(7).expect("rt lookup");
    assert_eq!(rt.process_id, 100);
    assert!(!rt.doing_io);

    let non_rt = map.get_non_rt(7).expect("non-rt lookup");
    assert_eq!(non_rt.bundle_id.as_deref(), Some("a"));

    map.set_doing_io(7, true).unwrap();
    assert!(map.get_rt(7).unwrap().doing_io);
    assert!(map.get_non_rt(7).unwrap().doing_io);
}

#[test]
fn clients_without_bundles_are_not_retained() {
    let map = new_map();
    map.add(Client::new(9, 200, None)).unwrap();
    map.remove(9).unwrap();
    assert!(map.sides_identical());
}

#[test]
fn same_pid_clients_share_the_pid_index() {
    let map = new_map();
    map.add(client(1, 100, "a")).unwrap();
    map.add(client(2, 100, "b")).unwrap();
    assert_eq!(map.clients_by_pid(100).len(), 2);

    map.remove(1).unwrap();
    // The other client of the process must survive in the index.
    let remaining = map.clients_by_pid(100);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].client_id, 2);
    assert!(map.sides_identical());
}

#[test]
fn rt_lookups_race_mutations_without_breaking() {
    let map = new_map();
    map.add(client(1, 50, "keep")).unwrap();

    let reader_map = map.clone();
    let reader = std::thread::spawn(move || {
        for _ in 0..5_000 {
            // Client 1 is never removed; the racing client may or may not be
            // visible.
            assert!(reader_map.get_rt(1).is_some());
            let _ = reader_map.get_rt(2);
        }
    });

    for i in 0..200 {
        map.add(client(2, 60, "churn")).unwrap();
        map.set_doing_io(2, i % 2 == 0).unwrap();
        map.remove(2).unwrap();
    }
    reader.join().unwrap();
    assert!(map.sides_identical());
}

#[test]
fn io_refcount_tracks_first_and_last_client() {
    let queue = Arc::new(TaskQueue::new());
    let host = Arc::new(HostBridge::default());
    let clients = Clients::new(2, queue.clone(), host);

    clients.add_client(client(1, 100, "a")).unwrap();
    clients.add_client(client(2, 100, "b")).unwrap();
    assert!(!clients.clients_running_io());

    // First start brings the device up; the second changes nothing.
    assert!(queue
        .queue_sync_start_client_io(clients.clone(), 1)
        .unwrap());
    assert!(clients.clients_running_io());
    assert!(!queue
        .queue_sync_start_client_io(clients.clone(), 2)
        .unwrap());

    // Starting an already-started client does not double count.
    assert!(!queue
        .queue_sync_start_client_io(clients.clone(), 1)
        .unwrap());

    assert!(!queue.queue_sync_stop_client_io(clients.clone(), 1).unwrap());
    assert!(clients.clients_running_io());
    assert!(queue.queue_sync_stop_client_io(clients.clone(), 2).unwrap());
    assert!(!clients.clients_running_io());

    // Stopping an already-stopped client changes nothing.
    assert!(!queue.queue_sync_stop_client_io(clients.clone(), 1).unwrap());
}

#[test]
fn sync_io_update_for_unknown_client_surfaces_an_error() {
    let queue = Arc::new(TaskQueue::new());
    let host = Arc::new(HostBridge::default());
    let clients = Clients::new(2, queue.clone(), host);

    let result = queue.queue_sync_start_client_io(clients.clone(), 99);
    assert!(matches!(result, Err(DriverError::IllegalOperation(_))));
}

#[test]
fn async_io_updates_apply_in_submission_order() {
    let queue = Arc::new(TaskQueue::new());
    let host = Arc::new(HostBridge::default());
    let clients = Clients::new(2, queue.clone(), host);
    clients.add_client(client(1, 100, "a")).unwrap();

    for _ in 0..50 {
        queue.queue_async_start_client_io(clients.clone(), 1);
        queue.queue_async_stop_client_io(clients.clone(), 1);
    }

    // A sync task on the same queue flushes everything queued before it.
    let _ = queue.queue_sync_stop_client_io(clients.clone(), 1);
    assert!(!clients.clients_running_io());
    assert!(!clients.get_non_rt(1).unwrap().doing_io);
}
