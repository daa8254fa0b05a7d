//! Per-user resource accounting.
//!
//! Every peer is accounted against the [`User`] of its uid. Resources are
//! only ever acquired through [`user_charge`], which hands out a scoped
//! [`UserCharge`] that refunds the reservation on drop.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use thiserror::Error;

/// The accountable resource slots.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UserSlot {
    Bytes = 0,
    Fds = 1,
    Matches = 2,
    Objects = 3,
    Names = 4,
    Replies = 5,
}

const N_SLOTS: usize = 6;

impl UserSlot {
    pub const ALL: [UserSlot; N_SLOTS] = [
        UserSlot::Bytes,
        UserSlot::Fds,
        UserSlot::Matches,
        UserSlot::Objects,
        UserSlot::Names,
        UserSlot::Replies,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-slot hard caps, applied to every user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_bytes: u64,
    pub max_fds: u64,
    pub max_matches: u64,
    pub max_objects: u64,
    pub max_names: u64,
    pub max_replies: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024 * 1024,
            max_fds: 64,
            max_matches: 256,
            max_objects: 512,
            max_names: 256,
            max_replies: 128,
        }
    }
}

impl Limits {
    fn for_slot(&self, slot: UserSlot) -> u64 {
        match slot {
            UserSlot::Bytes => self.max_bytes,
            UserSlot::Fds => self.max_fds,
            UserSlot::Matches => self.max_matches,
            UserSlot::Objects => self.max_objects,
            UserSlot::Names => self.max_names,
            UserSlot::Replies => self.max_replies,
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("per-user {slot:?} quota exhausted")]
pub struct QuotaExceeded {
    pub slot: UserSlot,
}

/// One accounted user, shared by every peer connected under its uid.
#[derive(Debug)]
pub struct User {
    uid: u32,
    used: [AtomicU64; N_SLOTS],
    max: [u64; N_SLOTS],
}

impl User {
    fn new(uid: u32, limits: &Limits) -> Self {
        Self {
            uid,
            used: std::array::from_fn(|_| AtomicU64::new(0)),
            max: std::array::from_fn(|i| limits.for_slot(UserSlot::ALL[i])),
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn used(&self, slot: UserSlot) -> u64 {
        self.used[slot.index()].load(Ordering::Acquire)
    }

    pub fn max(&self, slot: UserSlot) -> u64 {
        self.max[slot.index()]
    }

    fn try_reserve(&self, slot: UserSlot, amount: u64) -> bool {
        let max = self.max[slot.index()];
        self.used[slot.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(amount).filter(|&n| n <= max)
            })
            .is_ok()
    }

    fn release(&self, slot: UserSlot, amount: u64) {
        let prev = self.used[slot.index()].fetch_sub(amount, Ordering::AcqRel);
        debug_assert!(prev >= amount);
    }

    fn has_headroom(&self, slot: UserSlot, amount: u64) -> bool {
        self.used(slot) + amount <= self.max(slot)
    }
}

/// A scoped reservation against a user's quota; refunds itself on drop.
#[derive(Debug)]
pub struct UserCharge {
    payer: Arc<User>,
    slot: UserSlot,
    amount: u64,
}

impl UserCharge {
    pub fn slot(&self) -> UserSlot {
        self.slot
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

impl Drop for UserCharge {
    fn drop(&mut self) {
        self.payer.release(self.slot, self.amount);
    }
}

/// Reserves `amount` units of `slot`.
///
/// The reservation is paid by `chargee` when one is given (the fairness
/// account, e.g. the sender of a message queued on someone else's
/// connection) and by `owner` otherwise. When payer and owner differ, the
/// owner's headroom is checked as well so that neither side can be pushed
/// past its cap by the other.
pub fn user_charge(
    owner: &Arc<User>,
    chargee: Option<&Arc<User>>,
    slot: UserSlot,
    amount: u64,
) -> Result<UserCharge, QuotaExceeded> {
    let payer = chargee.unwrap_or(owner);
    if !Arc::ptr_eq(payer, owner) && !owner.has_headroom(slot, amount) {
        return Err(QuotaExceeded { slot });
    }
    if !payer.try_reserve(slot, amount) {
        return Err(QuotaExceeded { slot });
    }
    Ok(UserCharge { payer: payer.clone(), slot, amount })
}

/// Uid-keyed registry of accounted users.
///
/// Users are shared by reference; the registry only retains weak entries so
/// a uid's accounting disappears with its last peer.
#[derive(Debug)]
pub struct UserRegistry {
    limits: Limits,
    users: Mutex<HashMap<u32, Weak<User>>>,
}

impl UserRegistry {
    pub fn new(limits: Limits) -> Self {
        Self { limits, users: Mutex::new(HashMap::new()) }
    }

    /// Returns the accounted user for `uid`, creating it on first reference.
    pub fn ref_user(&self, uid: u32) -> Arc<User> {
        let mut users = self.users.lock();
        if let Some(user) = users.get(&uid).and_then(Weak::upgrade) {
            return user;
        }
        let user = Arc::new(User::new(uid, &self.limits));
        users.retain(|_, u| u.strong_count() > 0);
        users.insert(uid, Arc::downgrade(&user));
        user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> UserRegistry {
        UserRegistry::new(Limits { max_matches: 2, ..Default::default() })
    }

    #[test]
    fn charge_and_refund() {
        let user = registry().ref_user(1000);
        let charge = user_charge(&user, None, UserSlot::Bytes, 512).unwrap();
        assert_eq!(user.used(UserSlot::Bytes), 512);
        drop(charge);
        assert_eq!(user.used(UserSlot::Bytes), 0);
    }

    #[test]
    fn used_is_sum_of_live_charges() {
        let user = registry().ref_user(1000);
        let charges: Vec<_> = (0..5)
            .map(|_| user_charge(&user, None, UserSlot::Objects, 3).unwrap())
            .collect();
        assert_eq!(user.used(UserSlot::Objects), charges.iter().map(UserCharge::amount).sum());
        drop(charges);
        assert_eq!(user.used(UserSlot::Objects), 0);
    }

    #[test]
    fn quota_is_a_hard_cap() {
        let user = registry().ref_user(1000);
        let _a = user_charge(&user, None, UserSlot::Matches, 1).unwrap();
        let _b = user_charge(&user, None, UserSlot::Matches, 1).unwrap();
        let err = user_charge(&user, None, UserSlot::Matches, 1).unwrap_err();
        assert_eq!(err, QuotaExceeded { slot: UserSlot::Matches });
        drop(_a);
        user_charge(&user, None, UserSlot::Matches, 1).unwrap();
    }

    #[test]
    fn chargee_pays() {
        let registry = registry();
        let owner = registry.ref_user(1000);
        let sender = registry.ref_user(1001);
        let charge = user_charge(&owner, Some(&sender), UserSlot::Replies, 1).unwrap();
        assert_eq!(sender.used(UserSlot::Replies), 1);
        assert_eq!(owner.used(UserSlot::Replies), 0);
        drop(charge);
        assert_eq!(sender.used(UserSlot::Replies), 0);
    }

    #[test]
    fn differing_chargee_checks_both_counters() {
        let registry = UserRegistry::new(Limits { max_replies: 1, ..Default::default() });
        let owner = registry.ref_user(1000);
        let sender = registry.ref_user(1001);
        let _held = user_charge(&owner, None, UserSlot::Replies, 1).unwrap();
        // The owner is full even though the payer is not.
        assert!(user_charge(&owner, Some(&sender), UserSlot::Replies, 1).is_err());
    }

    #[test]
    fn users_are_shared_per_uid_and_dropped_with_the_last_ref() {
        let registry = registry();
        let a = registry.ref_user(1000);
        let b = registry.ref_user(1000);
        assert!(Arc::ptr_eq(&a, &b));
        let _charge = user_charge(&a, None, UserSlot::Bytes, 7).unwrap();
        drop(a);
        // Still alive through `b` and the charge.
        assert_eq!(registry.ref_user(1000).used(UserSlot::Bytes), 7);
        drop(b);
        drop(_charge);
        assert_eq!(registry.ref_user(1000).used(UserSlot::Bytes), 0);
    }
}
