//! Well-known name ownership.
//!
//! Every name maps to an ordered ownership queue; the head of the queue is
//! the primary owner. Primary transitions are atomic and produce a
//! [`NameOwnerChanged`] record, which the driver turns into the
//! corresponding signal.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    mem::size_of,
    sync::Arc,
};

use enumflags2::BitFlags;
use zbus::{
    fdo::{ReleaseNameReply, RequestNameFlags, RequestNameReply},
    names::OwnedUniqueName,
};

use crate::{
    address,
    match_rules::registry::MatchRegistry,
    user::{user_charge, QuotaExceeded, User, UserCharge, UserSlot},
};

/// A primary-ownership transition of one name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameOwnerChanged {
    pub name: String,
    pub old_owner: Option<OwnedUniqueName>,
    pub new_owner: Option<OwnedUniqueName>,
}

#[derive(Debug)]
struct NameOwnership {
    peer_id: u64,
    flags: BitFlags<RequestNameFlags>,
    _charges: [UserCharge; 2],
}

impl NameOwnership {
    fn new(
        peer_id: u64,
        flags: BitFlags<RequestNameFlags>,
        user: &Arc<User>,
        name: &str,
    ) -> Result<Self, QuotaExceeded> {
        let bytes = user_charge(
            user,
            None,
            UserSlot::Bytes,
            (size_of::<NameOwnership>() + name.len()) as u64,
        )?;
        let names = user_charge(user, None, UserSlot::Names, 1)?;
        Ok(Self { peer_id, flags, _charges: [bytes, names] })
    }
}

/// One live well-known name.
///
/// A name stays live while its queue is non-empty or while match rules
/// subscribe to it; the rules keep their subscription across primary-owner
/// changes since they are linked to the name, not the peer.
#[derive(Debug, Default)]
pub struct Name {
    queue: VecDeque<NameOwnership>,
    pub(crate) matches: MatchRegistry,
    n_match_refs: usize,
}

impl Name {
    pub fn primary(&self) -> Option<u64> {
        self.queue.front().map(|o| o.peer_id)
    }

    pub fn queue(&self) -> impl Iterator<Item = u64> + '_ {
        self.queue.iter().map(|o| o.peer_id)
    }
}

/// The names one peer holds an ownership (primary or queued) in.
#[derive(Debug, Default)]
pub struct NameOwner {
    names: BTreeSet<String>,
}

impl NameOwner {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub(crate) fn as_set(&self) -> &BTreeSet<String> {
        &self.names
    }
}

#[derive(Debug, Default)]
pub struct NameRegistry {
    names: HashMap<String, Name>,
    owners: HashMap<u64, NameOwner>,
}

impl NameRegistry {
    /// The primary owner of `name`.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.names.get(name).and_then(Name::primary)
    }

    pub fn get(&self, name: &str) -> Option<&Name> {
        self.names.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Name> {
        self.names.get_mut(name)
    }

    pub fn all_names(&self) -> impl Iterator<Item = (&str, &Name)> {
        self.names.iter().map(|(n, name)| (n.as_str(), name))
    }

    pub fn owner(&self, peer_id: u64) -> Option<&NameOwner> {
        self.owners.get(&peer_id)
    }

    /// The names `peer_id` currently holds primary ownership of.
    pub fn primary_names(&self, peer_id: u64) -> impl Iterator<Item = &str> {
        self.owners
            .get(&peer_id)
            .into_iter()
            .flat_map(|owner| owner.iter())
            .filter(move |name| self.lookup(name) == Some(peer_id))
    }

    pub fn request_name(
        &mut self,
        peer_id: u64,
        user: &Arc<User>,
        name: &str,
        flags: BitFlags<RequestNameFlags>,
    ) -> Result<(RequestNameReply, Option<NameOwnerChanged>), QuotaExceeded> {
        let entry = self.names.entry(name.to_string()).or_default();

        let pos = entry.queue.iter().position(|o| o.peer_id == peer_id);
        if pos == Some(0) {
            entry.queue[0].flags = flags;
            return Ok((RequestNameReply::AlreadyOwner, None));
        }

        let can_replace = flags.contains(RequestNameFlags::ReplaceExisting)
            && entry
                .queue
                .front()
                .is_some_and(|head| head.flags.contains(RequestNameFlags::AllowReplacement));

        // Re-requests re-use the existing ownership and its charges.
        let ownership = match pos {
            Some(pos) if can_replace => {
                let mut ownership = entry.queue.remove(pos).unwrap();
                ownership.flags = flags;
                ownership
            }
            Some(pos) => {
                entry.queue[pos].flags = flags;
                return Ok((RequestNameReply::InQueue, None));
            }
            None => match NameOwnership::new(peer_id, flags, user, name) {
                Ok(ownership) => ownership,
                Err(err) => {
                    self.release_if_dead(name);
                    return Err(err);
                }
            },
        };

        let reply = if let Some(head) = entry.queue.front() {
            if can_replace {
                let old_id = head.peer_id;
                if head.flags.contains(RequestNameFlags::DoNotQueue) {
                    entry.queue.pop_front();
                    self.owner_forgets(old_id, name);
                }
                // re-borrow after the owner index update
                let entry = self.names.get_mut(name).unwrap();
                entry.queue.push_front(ownership);
                self.owner_remembers(peer_id, name);
                let change = NameOwnerChanged {
                    name: name.to_string(),
                    old_owner: Some(address::unique_name(old_id)),
                    new_owner: Some(address::unique_name(peer_id)),
                };
                return Ok((RequestNameReply::PrimaryOwner, Some(change)));
            } else if flags.contains(RequestNameFlags::DoNotQueue) {
                // `ownership` is dropped and its charges refunded
                RequestNameReply::Exists
            } else {
                entry.queue.push_back(ownership);
                self.owner_remembers(peer_id, name);
                RequestNameReply::InQueue
            }
        } else {
            entry.queue.push_back(ownership);
            self.owner_remembers(peer_id, name);
            let change = NameOwnerChanged {
                name: name.to_string(),
                old_owner: None,
                new_owner: Some(address::unique_name(peer_id)),
            };
            return Ok((RequestNameReply::PrimaryOwner, Some(change)));
        };

        self.release_if_dead(name);
        Ok((reply, None))
    }

    pub fn release_name(
        &mut self,
        peer_id: u64,
        name: &str,
    ) -> (ReleaseNameReply, Option<NameOwnerChanged>) {
        let Some(entry) = self.names.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, None);
        };
        if entry.queue.is_empty() {
            // live only through match-rule references
            return (ReleaseNameReply::NonExistent, None);
        }
        let Some(pos) = entry.queue.iter().position(|o| o.peer_id == peer_id) else {
            return (ReleaseNameReply::NotOwner, None);
        };
        entry.queue.remove(pos);
        let change = (pos == 0).then(|| NameOwnerChanged {
            name: name.to_string(),
            old_owner: Some(address::unique_name(peer_id)),
            new_owner: entry.primary().map(address::unique_name),
        });
        self.owner_forgets(peer_id, name);
        self.release_if_dead(name);
        (ReleaseNameReply::Released, change)
    }

    /// Releases every ownership of `peer_id`, returning the primary
    /// transitions this caused in name order.
    pub fn release_all(&mut self, peer_id: u64) -> Vec<NameOwnerChanged> {
        let Some(owner) = self.owners.remove(&peer_id) else {
            return vec![];
        };
        let mut changes = vec![];
        for name in owner.names {
            let entry = self.names.get_mut(&name).unwrap();
            let pos = entry.queue.iter().position(|o| o.peer_id == peer_id).unwrap();
            entry.queue.remove(pos);
            if pos == 0 {
                changes.push(NameOwnerChanged {
                    name: name.clone(),
                    old_owner: Some(address::unique_name(peer_id)),
                    new_owner: entry.primary().map(address::unique_name),
                });
            }
            self.release_if_dead(&name);
        }
        changes
    }

    /// Takes a match-rule reference on `name`, creating it if needed.
    pub(crate) fn ref_name(&mut self, name: &str) -> &mut Name {
        let entry = self.names.entry(name.to_string()).or_default();
        entry.n_match_refs += 1;
        entry
    }

    pub(crate) fn unref_name(&mut self, name: &str) {
        let entry = self.names.get_mut(name).expect("unref of unknown name");
        debug_assert!(entry.n_match_refs > 0);
        entry.n_match_refs -= 1;
        self.release_if_dead(name);
    }

    fn release_if_dead(&mut self, name: &str) {
        if let Some(entry) = self.names.get(name) {
            if entry.queue.is_empty() && entry.n_match_refs == 0 {
                self.names.remove(name);
            }
        }
    }

    fn owner_remembers(&mut self, peer_id: u64, name: &str) {
        self.owners.entry(peer_id).or_default().names.insert(name.to_string());
    }

    fn owner_forgets(&mut self, peer_id: u64, name: &str) {
        if let Some(owner) = self.owners.get_mut(&peer_id) {
            owner.names.remove(name);
            if owner.names.is_empty() {
                self.owners.remove(&peer_id);
            }
        }
    }
}
