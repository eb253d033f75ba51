//! Latest-value handoff between the label subscription and the reconciler
//!
//! The subscription publishes every observed value of the mode label; the
//! reconciler only cares about the newest one. Values published while a
//! cycle is running are coalesced, and a value equal to the one last handed
//! out wakes nobody.

use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
struct Slot {
    current: String,
    last_read: String,
}

/// Single-slot watcher for the desired mode label
#[derive(Debug, Default)]
pub struct LabelWatcher {
    slot: Mutex<Slot>,
    changed: Notify,
}

impl LabelWatcher {
    /// Create a watcher with an empty initial value
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a watcher that treats `value` as already handed out
    pub fn with_initial(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            slot: Mutex::new(Slot {
                current: value.clone(),
                last_read: value,
            }),
            changed: Notify::new(),
        }
    }

    /// Publish a new observed value
    pub async fn set(&self, value: impl Into<String>) {
        let mut slot = self.slot.lock().await;
        slot.current = value.into();
        self.changed.notify_one();
    }

    /// Wait until the value differs from the one last returned, then return it
    pub async fn get(&self) -> String {
        loop {
            {
                let mut slot = self.slot.lock().await;
                if slot.current != slot.last_read {
                    slot.last_read = slot.current.clone();
                    return slot.current.clone();
                }
            }
            // A permit stored by notify_one survives until this call
            self.changed.notified().await;
        }
    }
}
