//! The bus: process-wide registries and the routing engine.
//!
//! Everything a driver implementation needs sits behind [`Bus`]: peer
//! lifecycle, name requests, match-rule installation and the three routing
//! paths (unicast call, unicast reply, broadcast). The connection layer
//! feeds decoded messages in and drains per-peer egress queues.

use std::{collections::BTreeSet, sync::Arc};

use enumflags2::BitFlags;
use tracing::{debug, trace, warn};
use zbus::{
    fdo::{ReleaseNameReply, RequestNameFlags, RequestNameReply},
    names::OwnedUniqueName,
    Guid,
};

use crate::{
    address::Address,
    connection::Connection,
    creds::PeerCredentials,
    match_rules::{
        registry::{
            self, MatchOwner, MatchRegistry, MatchRule, RuleArena, RuleHandle, RuleList,
            RuleTarget,
        },
        MatchFilter,
    },
    message::Message,
    name_registry::{NameOwner, NameOwnerChanged, NameRegistry},
    peer::{Peer, PeerError},
    peers::PeerRegistry,
    policy::{PeerNames, PolicyRegistry, PolicySnapshot, TrafficContext},
    reply,
    user::{Limits, User, UserRegistry},
};

static EMPTY_NAMES: BTreeSet<String> = BTreeSet::new();

/// The driver's reserved bus name.
pub const DRIVER_NAME: &str = "org.freedesktop.DBus";

/// The immutable slice of sender state a routing operation needs, snapshot
/// up front so the borrow of the peer registry can be released.
struct SenderCtx {
    id: u64,
    user: Arc<User>,
    policy: PolicySnapshot,
    unique_name: OwnedUniqueName,
}

impl SenderCtx {
    fn of(peer: &Peer) -> Self {
        Self {
            id: peer.id(),
            user: peer.user().clone(),
            policy: peer.policy.clone(),
            unique_name: peer.unique_name().clone(),
        }
    }
}

fn traffic_context(msg: &Message) -> TrafficContext<'_> {
    TrafficContext {
        interface: msg.header.interface.as_deref(),
        member: msg.header.member.as_deref(),
        path: msg.header.path.as_deref(),
        ty: msg.header.ty,
    }
}

/// The bus.
#[derive(Debug)]
pub struct Bus {
    guid: Guid<'static>,
    users: UserRegistry,
    peers: PeerRegistry,
    names: NameRegistry,
    rules: RuleArena,
    /// Rules with no sender constraint, plus rules pinned to a unique id
    /// that has not been allocated yet.
    wildcard_matches: MatchRegistry,
    /// Rules on traffic originated by the driver itself.
    driver_matches: MatchRegistry,
    transaction_ids: u64,
    policy: PolicyRegistry,
    /// The broker's own user.
    user: Arc<User>,
}

impl Bus {
    pub fn new(limits: Limits, policy: PolicyRegistry, uid: u32) -> Self {
        let users = UserRegistry::new(limits);
        let user = users.ref_user(uid);
        Self {
            guid: Guid::generate(),
            users,
            peers: PeerRegistry::default(),
            names: NameRegistry::default(),
            rules: RuleArena::with_key(),
            wildcard_matches: MatchRegistry::default(),
            driver_matches: MatchRegistry::default(),
            transaction_ids: 0,
            policy,
            user,
        }
    }

    pub fn guid(&self) -> &Guid<'static> {
        &self.guid
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn names(&self) -> &NameRegistry {
        &self.names
    }

    pub fn peer(&self, id: u64) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: u64) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    /// Resolves a destination string to a registered peer.
    pub fn resolve(&self, destination: &str) -> Option<u64> {
        match Address::from_str(destination) {
            Address::Id(id) => self.peers.find_peer(id).map(Peer::id),
            Address::Name(name) => self.names.lookup(name),
            Address::Other => None,
        }
    }

    //
    // Peer lifecycle
    //

    /// Creates the broker-side state for a freshly accepted connection and
    /// returns its id.
    pub fn create_peer(&mut self, creds: PeerCredentials) -> Result<u64, PeerError> {
        let user = self.users.ref_user(creds.uid);
        let id = self.peers.next_id();
        let peer = Peer::new(id, creds, user, &self.policy)?;
        trace!("created peer {}", peer.unique_name());
        self.peers.add(peer);
        Ok(id)
    }

    /// Whether group-based policy is configured, in which case peer
    /// credentials must include the auxiliary groups.
    pub fn needs_groups(&self) -> bool {
        self.policy.needs_groups()
    }

    /// Marks the peer registered once its connection answered `Hello`,
    /// returning the unique name to reply with.
    pub fn register_peer(&mut self, id: u64) -> Result<OwnedUniqueName, PeerError> {
        let peer = self.peers.get_mut(id).ok_or(PeerError::NoSuchPeer)?;
        peer.register();
        Ok(peer.unique_name().clone())
    }

    pub fn unregister_peer(&mut self, id: u64) -> Result<(), PeerError> {
        let peer = self.peers.get_mut(id).ok_or(PeerError::NoSuchPeer)?;
        peer.unregister();
        Ok(())
    }

    pub fn peer_is_privileged(&self, id: u64) -> bool {
        self.peers
            .get(id)
            .is_some_and(|p| p.user().uid() == 0 || p.user().uid() == self.user.uid())
    }

    /// Tears a peer down: releases its names, match rules and reply slots,
    /// and drops its connection. The returned name changes drive the
    /// driver's goodbye signals.
    pub fn remove_peer(&mut self, id: u64) -> Option<Vec<NameOwnerChanged>> {
        let mut peer = self.peers.remove(id)?;
        debug!("removing peer {}", peer.unique_name());
        peer.unregister();

        let changes = self.names.release_all(id);

        // this peer's rules
        for handle in peer.owned_matches.take_all() {
            let rule = self.rules.remove(handle).unwrap();
            self.unlink_match(handle, &rule);
        }
        // rules other peers have on this peer's traffic: the sender is
        // gone for good, so they can never fire again
        for handle in peer.matches.take_all() {
            if let Some(rule) = self.rules.get_mut(handle) {
                rule.target = None;
            }
        }
        // replies this peer still owed; the callers get no error
        for slot in peer.replies_outgoing.drain() {
            if let Some(caller) = self.peers.get_mut(slot.sender_id()) {
                caller.owned_replies.forget(id, slot.serial());
            }
        }
        // replies owed to this peer
        for (replier_id, serial) in peer.owned_replies.drain() {
            if let Some(replier) = self.peers.get_mut(replier_id) {
                replier.replies_outgoing.take(id, serial);
            }
        }

        peer.connection_mut().close();
        Some(changes)
    }

    /// Tears down every peer, silently; used on shutdown.
    pub fn flush_peers(&mut self) {
        let ids: Vec<_> = self.peers.iter().map(Peer::id).collect();
        for id in ids {
            self.remove_peer(id);
        }
    }

    //
    // Names
    //

    pub fn request_name(
        &mut self,
        peer_id: u64,
        name: &str,
        flags: BitFlags<RequestNameFlags>,
    ) -> Result<(RequestNameReply, Option<NameOwnerChanged>), PeerError> {
        if name == DRIVER_NAME {
            return Err(PeerError::NameReserved);
        }
        if name.starts_with(':') {
            return Err(PeerError::NameUnique);
        }
        let peer = self.peers.get(peer_id).ok_or(PeerError::NoSuchPeer)?;
        peer.policy.check_own(name).map_err(|_| PeerError::NameRefused)?;
        let user = peer.user().clone();
        Ok(self.names.request_name(peer_id, &user, name, flags)?)
    }

    pub fn release_name(
        &mut self,
        peer_id: u64,
        name: &str,
    ) -> Result<(ReleaseNameReply, Option<NameOwnerChanged>), PeerError> {
        if name == DRIVER_NAME {
            return Err(PeerError::NameReserved);
        }
        if name.starts_with(':') {
            return Err(PeerError::NameUnique);
        }
        if self.peers.get(peer_id).is_none() {
            return Err(PeerError::NoSuchPeer);
        }
        Ok(self.names.release_name(peer_id, name))
    }

    //
    // Match rules
    //

    pub fn add_match(&mut self, peer_id: u64, rule_string: &str) -> Result<(), PeerError> {
        let peer = self.peers.get_mut(peer_id).ok_or(PeerError::NoSuchPeer)?;
        let user = peer.user().clone();
        let handle = registry::owner_ref_rule(
            &mut self.rules,
            &mut peer.owned_matches,
            peer_id,
            &user,
            rule_string,
        )?;
        self.link_match(handle, false);
        Ok(())
    }

    pub fn remove_match(&mut self, peer_id: u64, rule_string: &str) -> Result<(), PeerError> {
        let peer = self.peers.get_mut(peer_id).ok_or(PeerError::NoSuchPeer)?;
        let handle = registry::owner_find_rule(&peer.owned_matches, rule_string)?;
        if let Some(rule) = registry::owner_unref_rule(&mut self.rules, &mut peer.owned_matches, handle)
        {
            self.unlink_match(handle, &rule);
        }
        Ok(())
    }

    /// Builds the rule set a `BecomeMonitor` call hands over. An empty
    /// list means one match-everything rule.
    pub fn monitor_owner(
        &mut self,
        peer_id: u64,
        rule_strings: &[&str],
    ) -> Result<MatchOwner, PeerError> {
        let peer = self.peers.get(peer_id).ok_or(PeerError::NoSuchPeer)?;
        let user = peer.user().clone();
        let mut owner = MatchOwner::default();
        let match_all = [""];
        let strings = if rule_strings.is_empty() { &match_all[..] } else { rule_strings };
        for rule_string in strings {
            let res =
                registry::owner_ref_rule(&mut self.rules, &mut owner, peer_id, &user, rule_string);
            if let Err(err) = res {
                self.discard_match_owner(owner);
                return Err(err.into());
            }
        }
        Ok(owner)
    }

    /// Drops a rule set built with [`Bus::monitor_owner`] that was never
    /// taken over.
    pub fn discard_match_owner(&mut self, mut owner: MatchOwner) {
        for handle in owner.take_all() {
            self.rules.remove(handle);
        }
    }

    /// Turns an unregistered peer into a monitor: it takes over `owned`,
    /// every rule forced to eavesdrop and linked into the monitor lists.
    pub fn become_monitor(&mut self, peer_id: u64, owned: MatchOwner) -> Result<(), PeerError> {
        let peer = self.peers.get_mut(peer_id).ok_or(PeerError::NoSuchPeer)?;
        debug_assert!(!peer.is_registered() && !peer.is_monitor());
        debug_assert!(peer.owned_matches.is_empty());
        peer.owned_matches = owned;
        let handles: Vec<_> = peer.owned_matches.iter().collect();
        for handle in handles {
            {
                let rule = &mut self.rules[handle];
                rule.keys.eavesdrop = true;
                rule.owner = peer_id;
            }
            self.link_match(handle, true);
        }
        self.peers.get_mut(peer_id).unwrap().set_monitor();
        debug!("peer :1.{peer_id} became a monitor");
        Ok(())
    }

    fn link_match(&mut self, handle: RuleHandle, monitor: bool) {
        let (eavesdrop, sender) = {
            let rule = &self.rules[handle];
            if rule.target.is_some() {
                return;
            }
            (rule.keys.eavesdrop, rule.keys.sender.clone())
        };
        let list = if monitor {
            RuleList::Monitor
        } else if eavesdrop {
            RuleList::Eavesdrop
        } else {
            RuleList::Regular
        };
        let target = match sender.as_deref() {
            None => {
                self.wildcard_matches.link(handle, list);
                Some(RuleTarget::Wildcard)
            }
            Some(DRIVER_NAME) => {
                self.driver_matches.link(handle, list);
                Some(RuleTarget::Driver)
            }
            Some(sender) => match Address::from_str(sender) {
                Address::Id(id) => {
                    if let Some(sender_peer) = self.peers.find_peer_mut(id) {
                        sender_peer.matches.link(handle, list);
                        Some(RuleTarget::Peer(id))
                    } else if id >= self.peers.next_id() {
                        // Not allocated yet, but it could be: park the rule
                        // with the wildcards, pinned to the id so it
                        // activates when the id is assigned. It stays there
                        // even if the peer later appears.
                        self.rules[handle].keys.sender_id = Some(id);
                        self.wildcard_matches.link(handle, list);
                        Some(RuleTarget::Wildcard)
                    } else {
                        // The id is stale and will never reappear. Keep
                        // the rule in its owner, linked nowhere.
                        None
                    }
                }
                Address::Name(_) | Address::Other => {
                    let name = sender.to_string();
                    self.names.ref_name(&name).matches.link(handle, list);
                    Some(RuleTarget::Name(name))
                }
            },
        };
        if let Some(target) = target {
            self.rules[handle].target = Some((target, list));
        }
    }

    fn unlink_match(&mut self, handle: RuleHandle, rule: &MatchRule) {
        let Some((target, list)) = &rule.target else {
            return;
        };
        match target {
            RuleTarget::Wildcard => self.wildcard_matches.unlink(handle, *list),
            RuleTarget::Driver => self.driver_matches.unlink(handle, *list),
            RuleTarget::Peer(id) => {
                if let Some(peer) = self.peers.get_mut(*id) {
                    peer.matches.unlink(handle, *list);
                }
            }
            RuleTarget::Name(name) => {
                if let Some(entry) = self.names.get_mut(name) {
                    entry.matches.unlink(handle, *list);
                }
                self.names.unref_name(name);
            }
        }
    }

    //
    // Routing
    //

    /// Routes a method call (or any unicast non-reply) to `receiver_id`,
    /// then fans it out to eavesdroppers and monitors.
    pub fn queue_call(
        &mut self,
        sender_id: u64,
        receiver_id: u64,
        msg: &Arc<Message>,
    ) -> Result<(), PeerError> {
        let sender = self.peers.get(sender_id).ok_or(PeerError::NoSuchPeer)?;
        let sender_ctx = SenderCtx::of(sender);
        let receiver = self.peers.get(receiver_id).ok_or(PeerError::NoSuchPeer)?;
        let receiver_user = receiver.user().clone();
        let serial = msg.header.serial;

        let mut slot_created = false;
        if msg.expects_reply() {
            let mut sender_replies =
                std::mem::take(&mut self.peers.get_mut(sender_id).unwrap().owned_replies);
            let receiver = self.peers.get_mut(receiver_id).unwrap();
            let res = reply::reply_slot_new(
                &mut receiver.replies_outgoing,
                &mut sender_replies,
                receiver_id,
                &receiver_user,
                &sender_ctx.user,
                sender_id,
                serial,
            );
            self.peers.get_mut(sender_id).unwrap().owned_replies = sender_replies;
            res?;
            slot_created = true;
        }

        let ctx = traffic_context(msg);
        let verdict = {
            let receiver = self.peers.get(receiver_id).unwrap();
            let sender_names = PeerNames {
                unique: Some(sender_ctx.unique_name.as_str()),
                well_known: self.names_of(sender_id),
            };
            let receiver_names = PeerNames {
                unique: Some(receiver.unique_name().as_str()),
                well_known: self.names_of(receiver_id),
            };
            receiver
                .policy
                .check_receive(&sender_names, &ctx)
                .map_err(|_| PeerError::ReceiveDenied)
                .and_then(|()| {
                    sender_ctx
                        .policy
                        .check_send(&receiver_names, &ctx)
                        .map_err(|_| PeerError::SendDenied)
                })
        };
        if let Err(err) = verdict {
            if slot_created {
                self.drop_reply_slot(receiver_id, sender_id, serial);
            }
            return Err(err);
        }

        let queued =
            self.peers.get_mut(receiver_id).unwrap().conn.queue(Some(&sender_ctx.user), 0, msg);
        if let Err(quota) = queued {
            if slot_created {
                self.drop_reply_slot(receiver_id, sender_id, serial);
            }
            return Err(quota.into());
        }

        self.broadcast_internal(Some(&sender_ctx), Some(receiver_id), msg);
        Ok(())
    }

    /// Routes a method return or error back over its reply slot, then fans
    /// it out to eavesdroppers and monitors.
    pub fn queue_reply(&mut self, sender_id: u64, msg: &Arc<Message>) -> Result<(), PeerError> {
        let destination =
            msg.header.destination.as_deref().ok_or(PeerError::UnexpectedReply)?;
        let Address::Id(receiver_id) = Address::from_str(destination) else {
            return Err(PeerError::UnexpectedReply);
        };
        let reply_serial = msg.header.reply_serial.ok_or(PeerError::UnexpectedReply)?;

        let sender = self.peers.get_mut(sender_id).ok_or(PeerError::NoSuchPeer)?;
        let slot = sender
            .replies_outgoing
            .take(receiver_id, reply_serial)
            .ok_or(PeerError::UnexpectedReply)?;
        drop(slot);
        let sender_ctx = SenderCtx::of(self.peers.get(sender_id).unwrap());

        if let Some(receiver) = self.peers.get_mut(receiver_id) {
            receiver.owned_replies.forget(sender_id, reply_serial);
            if receiver.conn.queue(None, 0, msg).is_err() {
                // an overflowing reply receiver is shut down, the sender
                // is not at fault
                warn!("reply receiver :1.{receiver_id} overflowed, shutting it down");
                receiver.conn.shutdown();
            }
        }

        self.broadcast_internal(Some(&sender_ctx), Some(receiver_id), msg);
        Ok(())
    }

    /// Broadcasts a message from a peer to every subscribed receiver.
    pub fn broadcast(&mut self, sender_id: u64, msg: &Arc<Message>) -> Result<(), PeerError> {
        let sender = self.peers.get(sender_id).ok_or(PeerError::NoSuchPeer)?;
        let sender_ctx = SenderCtx::of(sender);
        self.broadcast_internal(Some(&sender_ctx), None, msg);
        Ok(())
    }

    /// Broadcasts a message originated by the driver itself.
    pub fn broadcast_from_driver(&mut self, msg: &Arc<Message>) {
        self.broadcast_internal(None, None, msg);
    }

    fn broadcast_internal(
        &mut self,
        sender: Option<&SenderCtx>,
        destination: Option<u64>,
        msg: &Arc<Message>,
    ) {
        let filter = MatchFilter::for_message(msg, sender.map(|s| s.id), destination);
        let ctx = traffic_context(msg);

        // a fresh transaction, so overlapping match paths deliver once
        self.transaction_ids += 1;
        let transaction_id = self.transaction_ids;

        let mut receivers = vec![];
        self.collect_matches(&self.wildcard_matches, sender, destination, &filter, &ctx, &mut receivers);
        if let Some(sender_ctx) = sender {
            if let Some(sender_peer) = self.peers.get(sender_ctx.id) {
                self.collect_matches(
                    &sender_peer.matches,
                    sender,
                    destination,
                    &filter,
                    &ctx,
                    &mut receivers,
                );
            }
            let primary_names: Vec<String> =
                self.names.primary_names(sender_ctx.id).map(str::to_string).collect();
            for name in primary_names {
                let entry = self.names.get(&name).unwrap();
                self.collect_matches(&entry.matches, sender, destination, &filter, &ctx, &mut receivers);
            }
        } else {
            self.collect_matches(&self.driver_matches, sender, destination, &filter, &ctx, &mut receivers);
        }

        for receiver_id in receivers {
            let Some(receiver) = self.peers.get_mut(receiver_id) else {
                continue;
            };
            if receiver.conn.queue(None, transaction_id, msg).is_err() {
                // broadcast receivers that cannot keep up are disconnected
                warn!("broadcast receiver :1.{receiver_id} overflowed, shutting it down");
                receiver.conn.shutdown();
            }
        }
    }

    fn collect_matches(
        &self,
        matches: &MatchRegistry,
        sender: Option<&SenderCtx>,
        destination: Option<u64>,
        filter: &MatchFilter<'_>,
        ctx: &TrafficContext<'_>,
        receivers: &mut Vec<u64>,
    ) {
        for handle in matches.iter_matches(&self.rules, filter) {
            let receiver_id = self.rules[handle].owner;
            // the destination already got its copy on the unicast path
            if destination == Some(receiver_id) {
                continue;
            }
            let Some(receiver) = self.peers.get(receiver_id) else {
                continue;
            };
            if let Some(sender_ctx) = sender {
                let receiver_names = PeerNames {
                    unique: Some(receiver.unique_name().as_str()),
                    well_known: self.names_of(receiver_id),
                };
                if sender_ctx.policy.check_send(&receiver_names, ctx).is_err() {
                    continue;
                }
            }
            let sender_names = PeerNames {
                unique: sender.map(|s| s.unique_name.as_str()),
                well_known: sender.map_or(&EMPTY_NAMES, |s| self.names_of(s.id)),
            };
            if receiver.policy.check_receive(&sender_names, ctx).is_err() {
                continue;
            }
            receivers.push(receiver_id);
        }
        // monitors bypass the destination exclusion and the policy gate
        for handle in matches.iter_monitor_matches(&self.rules, filter) {
            receivers.push(self.rules[handle].owner);
        }
    }

    fn drop_reply_slot(&mut self, replier_id: u64, sender_id: u64, serial: u32) {
        if let Some(replier) = self.peers.get_mut(replier_id) {
            replier.replies_outgoing.take(sender_id, serial);
        }
        if let Some(sender) = self.peers.get_mut(sender_id) {
            sender.owned_replies.forget(replier_id, serial);
        }
    }

    fn names_of(&self, id: u64) -> &BTreeSet<String> {
        self.names.owner(id).map(NameOwner::as_set).unwrap_or(&EMPTY_NAMES)
    }

    /// Drains one peer's egress; what the I/O layer would write out.
    pub fn drain_egress(&mut self, id: u64) -> Vec<Arc<Message>> {
        let Some(peer) = self.peers.get_mut(id) else {
            return vec![];
        };
        let mut out = vec![];
        while let Some(msg) = peer.conn.dequeue() {
            out.push(msg);
        }
        out
    }

    #[doc(hidden)]
    pub fn connection_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.peers.get_mut(id).map(Peer::connection_mut)
    }
}
