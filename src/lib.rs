#![deny(missing_docs)]

//! User-space virtual loopback audio device core.
//!
//! The driver publishes one virtual output device to the host's audio
//! subsystem. Frames an application renders to the device land in a
//! sample-timed lock-free [`ring::RingBuffer`] from which a companion
//! capture path reads them back, so the device hears exactly what was
//! played. Everything interesting lives on the realtime/non-realtime
//! boundary:
//!
//! - [`ring`] — the ring buffer, with its SeqLock-style time-bounds
//!   publication.
//! - [`clients`] — a primary/shadow client registry whose primary side is
//!   read from the realtime IO path while mutation happens off it.
//! - [`tasks`] — a dual task queue with one time-constraint worker and one
//!   time-share worker, used to marshal work between the two worlds.
//! - [`device`] — the state machine sequencing client add/remove, IO
//!   start/stop, and the host's config-change protocol.
//!
//! The host consumes all of it through the
//! [`driver::AudioServerPlugInDriver`] trait; see [`driver::shared_driver`]
//! for the lazily-created process-wide instance.

use std::sync::Once;

pub mod clients;
pub mod clock;
pub mod controls;
pub mod device;
pub mod driver;
pub mod error;
pub mod ring;
pub mod stream;
pub mod tasks;

#[cfg(test)]
mod tests;

/// The plug-in object. Ids are fixed: this driver's object graph never
/// changes shape.
pub const OBJECT_ID_PLUGIN: u32 = 1;
/// The loopback device.
pub const OBJECT_ID_DEVICE: u32 = 2;
/// The device's capture-side stream.
pub const OBJECT_ID_STREAM_INPUT: u32 = 3;
/// The device's render-side stream.
pub const OBJECT_ID_STREAM_OUTPUT: u32 = 4;
/// The master output volume control.
pub const OBJECT_ID_VOLUME_CONTROL: u32 = 5;
/// The master output mute control.
pub const OBJECT_ID_MUTE_CONTROL: u32 = 6;
/// The silent placeholder device.
pub const OBJECT_ID_NULL_DEVICE: u32 = 7;
/// The placeholder device's stream.
pub const OBJECT_ID_NULL_STREAM: u32 = 8;

pub use clients::{Client, ClientRt};
pub use device::{
    Device, DeviceActivityState, IoCycleInfo, IoOperation, LOOPBACK_RING_BUFFER_FRAMES,
    SAMPLE_RATE_DEFAULT,
};
pub use driver::{
    shared_driver, AudioServerPlugInDriver, ChangeAction, HostBridge, HostHook, LoopbackDriver,
    PropertySelector, PropertyValue,
};
pub use error::{status_from, DriverError, OsStatus};
pub use ring::{RingBuffer, RingError, SampleTime};
pub use stream::AudioFormat;

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber, once.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}
