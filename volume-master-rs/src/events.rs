//! Events marshalled from OS callback threads to the coordinator.

use crate::audio::property::{ObjectId, PropertyAddress};
use crate::input::keys::MediaKey;
use crossbeam_channel::{Receiver, Sender};

/// Everything that can arrive asynchronously at the coordinator.
///
/// Per-source order is preserved by the queue, cross-source order is not.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Observed properties changed on an audio object
    PropertiesChanged {
        object: ObjectId,
        addresses: Vec<PropertyAddress>,
    },

    /// The system device list changed
    DeviceListChanged,

    /// A volume key was pressed and swallowed by the key tap
    MediaKey(MediaKey),

    /// Another application became frontmost
    AppActivated,
}

/// Creates the coordinator's event queue.
pub fn create_event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    crossbeam_channel::unbounded()
}
