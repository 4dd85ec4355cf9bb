//! Slot store the dispatcher and its clients coordinate through.

use eds_core::channel_ipc::SlotEvent;
use eds_core::SlotName;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

pub const DEFAULT_MAX_SLOT_BYTES: usize = 256 * 1024;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("value for {slot} is too large: {size} > {max}")]
    ValueTooLarge {
        slot: SlotName,
        size: usize,
        max: usize,
    },
}

/// Named single-value registers with change notification.
///
/// Every mutation that changes a slot is announced on the subscription
/// stream: a write as `NewValue`, a removal as `Deleted`. Removing a slot
/// that does not exist announces nothing.
pub trait Channel: Send + Sync {
    fn write(&self, slot: &SlotName, value: &[u8]) -> Result<(), ChannelError>;
    fn read(&self, slot: &SlotName) -> Result<Option<Vec<u8>>, ChannelError>;
    /// Reads and removes in one step.
    fn read_and_clear(&self, slot: &SlotName) -> Result<Option<Vec<u8>>, ChannelError>;
    /// Returns whether the slot existed.
    fn delete(&self, slot: &SlotName) -> Result<bool, ChannelError>;
    fn delete_prefix(&self, prefix: &str) -> Result<Vec<SlotName>, ChannelError>;
    fn subscribe(&self) -> broadcast::Receiver<SlotEvent>;

    fn exists(&self, slot: &SlotName) -> Result<bool, ChannelError> {
        Ok(self.read(slot)?.is_some())
    }
}

pub struct MemoryChannel {
    slots: Mutex<HashMap<SlotName, Vec<u8>>>,
    events: broadcast::Sender<SlotEvent>,
    max_slot_bytes: usize,
}

impl MemoryChannel {
    pub fn new(max_slot_bytes: usize) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            slots: Mutex::new(HashMap::new()),
            events,
            max_slot_bytes,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SlotName, Vec<u8>>>, ChannelError> {
        self.slots
            .lock()
            .map_err(|_| ChannelError::Unavailable("slot store lock poisoned".to_string()))
    }

    fn announce(&self, event: SlotEvent) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(event);
    }

    pub fn slot_names(&self) -> Result<Vec<SlotName>, ChannelError> {
        let mut names = self.lock()?.keys().cloned().collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SLOT_BYTES)
    }
}

impl Channel for MemoryChannel {
    fn write(&self, slot: &SlotName, value: &[u8]) -> Result<(), ChannelError> {
        if value.len() > self.max_slot_bytes {
            return Err(ChannelError::ValueTooLarge {
                slot: slot.clone(),
                size: value.len(),
                max: self.max_slot_bytes,
            });
        }
        let mut slots = self.lock()?;
        slots.insert(slot.clone(), value.to_vec());
        // Announced under the lock so subscribers see changes in store order.
        self.announce(SlotEvent::new_value(slot.clone()));
        Ok(())
    }

    fn read(&self, slot: &SlotName) -> Result<Option<Vec<u8>>, ChannelError> {
        Ok(self.lock()?.get(slot).cloned())
    }

    fn read_and_clear(&self, slot: &SlotName) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut slots = self.lock()?;
        let value = slots.remove(slot);
        if value.is_some() {
            self.announce(SlotEvent::deleted(slot.clone()));
        }
        Ok(value)
    }

    fn delete(&self, slot: &SlotName) -> Result<bool, ChannelError> {
        let mut slots = self.lock()?;
        let existed = slots.remove(slot).is_some();
        if existed {
            self.announce(SlotEvent::deleted(slot.clone()));
        }
        Ok(existed)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<Vec<SlotName>, ChannelError> {
        let mut slots = self.lock()?;
        let mut doomed = slots
            .keys()
            .filter(|slot| slot.starts_with(prefix))
            .cloned()
            .collect::<Vec<_>>();
        doomed.sort();
        for slot in &doomed {
            slots.remove(slot);
            self.announce(SlotEvent::deleted(slot.clone()));
        }
        Ok(doomed)
    }

    fn subscribe(&self) -> broadcast::Receiver<SlotEvent> {
        self.events.subscribe()
    }
}
