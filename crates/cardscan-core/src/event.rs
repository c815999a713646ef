use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::media::FileRecord;
use crate::storage::Availability;

/// Availability of the scanner's primary medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardState {
    Ready,
    /// No removable medium present.
    NoCard,
    /// The medium is mounted elsewhere, e.g. by a host PC over USB.
    Unmounted,
}

impl From<Availability> for CardState {
    fn from(value: Availability) -> Self {
        match value {
            Availability::Available => CardState::Ready,
            Availability::Unavailable => CardState::NoCard,
            Availability::Shared => CardState::Unmounted,
        }
    }
}

impl fmt::Display for CardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            CardState::Ready => "ready",
            CardState::NoCard => "nocard",
            CardState::Unmounted => "unmounted",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ScannerEvent {
    Ready,
    ScanStart,
    ScanEnd,
    Insert { record: FileRecord, position: usize },
    Delete { record: FileRecord, position: usize },
    Unavailable { reason: CardState },
}

type Callback = Box<dyn FnMut(ScannerEvent) + Send>;

/// Runs the callback, containing a panic so it cannot take the caller down.
fn deliver(callback: &mut Callback, event: ScannerEvent) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        warn!("event callback panicked: {}", message);
    }
}

enum Slot {
    Buffered(Vec<ScannerEvent>),
    Attached(Callback),
}

/// Single-slot event sink. Events raised before a callback is attached are
/// queued and handed to the first callback in order.
///
/// Callbacks run with the slot locked and must not register a new callback.
/// A panicking callback is logged and the event dropped.
pub struct Notifier {
    slot: Mutex<Slot>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Buffered(Vec::new())),
        }
    }

    pub fn notify(&self, event: ScannerEvent) {
        let mut slot = self.slot.lock();
        match &mut *slot {
            Slot::Buffered(queue) => queue.push(event),
            Slot::Attached(callback) => deliver(callback, event),
        }
    }

    /// Attaches `callback`, replacing any earlier one.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(ScannerEvent) + Send + 'static,
    {
        let mut callback: Callback = Box::new(callback);
        let mut slot = self.slot.lock();
        if let Slot::Buffered(queue) = &mut *slot {
            for event in queue.drain(..) {
                deliver(&mut callback, event);
            }
        }
        *slot = Slot::Attached(callback);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attached = matches!(*self.slot.lock(), Slot::Attached(_));
        f.debug_struct("Notifier")
            .field("attached", &attached)
            .finish()
    }
}
