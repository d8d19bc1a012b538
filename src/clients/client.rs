//! Client records registered with the device by the host.

/// One app registered with the host to do IO with the device at some point.
///
/// Fields mirror what the host hands over when it attaches a client. The id
/// is unique among currently registered clients but may be reused after a
/// removal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Client {
    /// Id assigned by the host.
    pub client_id: u32,
    /// Process id of the client app.
    pub process_id: i32,
    /// Bundle id of the client app, when the host knows it.
    pub bundle_id: Option<String>,
    /// Whether the client shares the device's endianness.
    pub is_native_endian: bool,
    /// True while the client is running IO with the device.
    pub doing_io: bool,
}

impl Client {
    /// Build a freshly registered client; IO state starts out false.
    pub fn new(client_id: u32, process_id: i32, bundle_id: Option<String>) -> Self {
        Self {
            client_id,
            process_id,
            bundle_id,
            is_native_endian: true,
            doing_io: false,
        }
    }
}

/// The subset of a client's fields the realtime path needs. Copying one does
/// not allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientRt {
    /// Id assigned by the host.
    pub client_id: u32,
    /// Process id of the client app.
    pub process_id: i32,
    /// True while the client is running IO with the device.
    pub doing_io: bool,
    /// Whether the client shares the device's endianness.
    pub is_native_endian: bool,
}

impl From<&Client> for ClientRt {
    fn from(client: &Client) -> Self {
        Self {
            client_id: client.client_id,
            process_id: client.process_id,
            doing_io: client.doing_io,
            is_native_endian: client.is_native_endian,
        }
    }
}
