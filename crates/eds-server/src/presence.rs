use crate::channel::{Channel, ChannelError};
use eds_core::slots::PRESENCE_VALUE;
use eds_core::SlotName;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the "server is running" slot for the lifetime of the server.
///
/// Dropping an advertiser that is still advertising withdraws the slot, so
/// unwinding out of the server loop leaves no stale presence behind.
pub struct PresenceAdvertiser {
    channel: Arc<dyn Channel>,
    slot: SlotName,
    advertising: bool,
}

impl PresenceAdvertiser {
    pub fn new(channel: Arc<dyn Channel>, slot: SlotName) -> Self {
        Self {
            channel,
            slot,
            advertising: false,
        }
    }

    pub fn slot(&self) -> &SlotName {
        &self.slot
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn start(&mut self) -> Result<(), ChannelError> {
        self.channel.write(&self.slot, PRESENCE_VALUE)?;
        self.advertising = true;
        info!(event = "presence_advertised", slot = %self.slot);
        Ok(())
    }

    /// Called when the presence slot was deleted by someone else.
    pub fn handle_deleted(&mut self) {
        if !self.advertising {
            return;
        }
        match self.channel.write(&self.slot, PRESENCE_VALUE) {
            Ok(()) => info!(event = "presence_reasserted", slot = %self.slot),
            Err(err) => warn!(event = "presence_reassert_error", slot = %self.slot, error = %err),
        }
    }

    /// Re-creates the slot if it went missing while notifications were lost.
    pub fn ensure(&mut self) {
        if !self.advertising {
            return;
        }
        match self.channel.exists(&self.slot) {
            Ok(true) => {}
            Ok(false) => self.handle_deleted(),
            Err(err) => warn!(event = "presence_check_error", slot = %self.slot, error = %err),
        }
    }

    pub fn stop(&mut self) {
        if !self.advertising {
            return;
        }
        self.advertising = false;
        match self.channel.delete(&self.slot) {
            Ok(_) => info!(event = "presence_withdrawn", slot = %self.slot),
            Err(err) => warn!(event = "presence_withdraw_error", slot = %self.slot, error = %err),
        }
    }
}

impl Drop for PresenceAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    fn advertiser() -> (Arc<MemoryChannel>, PresenceAdvertiser) {
        let channel = Arc::new(MemoryChannel::default());
        let presence = PresenceAdvertiser::new(
            channel.clone(),
            SlotName::from("NEDIT_SERVER_EXISTS_box_alice_"),
        );
        (channel, presence)
    }

    #[test]
    fn start_publishes_and_stop_withdraws() {
        let (channel, mut presence) = advertiser();
        presence.start().expect("start");
        assert_eq!(
            channel.read(presence.slot()).expect("read"),
            Some(b"True".to_vec())
        );
        presence.stop();
        assert!(!channel.exists(presence.slot()).expect("exists"));
    }

    #[test]
    fn foreign_deletion_is_reasserted_only_while_advertising() {
        let (channel, mut presence) = advertiser();
        presence.handle_deleted();
        assert!(!channel.exists(presence.slot()).expect("exists"));

        presence.start().expect("start");
        channel.delete(presence.slot()).expect("delete");
        presence.handle_deleted();
        assert!(channel.exists(presence.slot()).expect("exists"));
    }

    #[test]
    fn dropping_withdraws_presence() {
        let (channel, mut presence) = advertiser();
        presence.start().expect("start");
        let slot = presence.slot().clone();
        drop(presence);
        assert!(!channel.exists(&slot).expect("exists"));
    }

    #[test]
    fn ensure_recreates_missing_slot() {
        let (channel, mut presence) = advertiser();
        presence.start().expect("start");
        channel.delete(presence.slot()).expect("delete");
        presence.ensure();
        assert!(channel.exists(presence.slot()).expect("exists"));
    }
}
