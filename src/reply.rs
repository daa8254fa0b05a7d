//! Pending-reply tracking.
//!
//! Forwarding a reply-expecting method call reserves a slot recording that
//! exactly one reply is owed from the receiver back to the sender under the
//! call's serial. The slot is released by the matching reply or by either
//! peer disappearing.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use thiserror::Error;

use crate::user::{user_charge, QuotaExceeded, User, UserCharge, UserSlot};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    /// A slot for this `(sender, serial)` already exists; sending a second
    /// reply-expecting call with the same serial is a protocol violation.
    #[error("a reply for this serial is already expected")]
    Exists,
    #[error(transparent)]
    Quota(#[from] QuotaExceeded),
}

#[derive(Debug)]
pub struct ReplySlot {
    sender_id: u64,
    serial: u32,
    _charge: UserCharge,
}

impl ReplySlot {
    pub fn sender_id(&self) -> u64 {
        self.sender_id
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }
}

/// The replies one peer owes, keyed by the calling peer and its serial.
#[derive(Debug, Default)]
pub struct ReplyRegistry {
    slots: HashMap<(u64, u32), ReplySlot>,
}

impl ReplyRegistry {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Resolves the slot for a reply to `sender_id` with `serial`.
    pub(crate) fn take(&mut self, sender_id: u64, serial: u32) -> Option<ReplySlot> {
        self.slots.remove(&(sender_id, serial))
    }

    pub(crate) fn drain(&mut self) -> Vec<ReplySlot> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }
}

/// Back-references from a calling peer to every reply owed to it, as
/// `(replier id, serial)` pairs indexing the replier's registry.
#[derive(Debug, Default)]
pub struct ReplyOwner {
    slots: BTreeSet<(u64, u32)>,
}

impl ReplyOwner {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn forget(&mut self, replier_id: u64, serial: u32) {
        self.slots.remove(&(replier_id, serial));
    }

    pub(crate) fn drain(&mut self) -> Vec<(u64, u32)> {
        std::mem::take(&mut self.slots).into_iter().collect()
    }
}

/// Reserves the reply slot for a call from `sender_id` with `serial`,
/// directed at the peer owning `registry`.
///
/// The slot is accounted on the receiving side but paid by the *sender's*
/// user, so that a busy target cannot be starved by its callers.
pub(crate) fn reply_slot_new(
    registry: &mut ReplyRegistry,
    owner: &mut ReplyOwner,
    replier_id: u64,
    replier_user: &Arc<User>,
    sender_user: &Arc<User>,
    sender_id: u64,
    serial: u32,
) -> Result<(), ReplyError> {
    if registry.slots.contains_key(&(sender_id, serial)) {
        return Err(ReplyError::Exists);
    }
    let charge = user_charge(replier_user, Some(sender_user), UserSlot::Replies, 1)?;
    registry
        .slots
        .insert((sender_id, serial), ReplySlot { sender_id, serial, _charge: charge });
    owner.slots.insert((replier_id, serial));
    Ok(())
}
