//! Dispatch-side containers for match rules.
//!
//! Rules live in a bus-wide arena and are referenced from two sides: the
//! [`MatchOwner`] of the installing peer (an ordered, deduplicating index
//! over canonical keys) and the [`MatchRegistry`] they are linked into for
//! dispatch (per sender peer, per name, or the bus-wide wildcard/driver
//! registries).

use std::{collections::BTreeMap, mem::size_of, sync::Arc};

use slotmap::{new_key_type, SlotMap};

use super::{MatchError, MatchFilter, MatchRuleKeys};
use crate::user::{user_charge, User, UserCharge, UserSlot};

new_key_type! {
    /// Stable generational handle to a rule in the arena.
    pub struct RuleHandle;
}

pub type RuleArena = SlotMap<RuleHandle, MatchRule>;

/// Where a rule is linked for dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleTarget {
    Wildcard,
    Driver,
    Peer(u64),
    Name(String),
}

/// Which list of a registry a rule sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleList {
    Regular,
    Eavesdrop,
    Monitor,
}

#[derive(Debug)]
pub struct MatchRule {
    pub keys: MatchRuleKeys,
    /// Id of the peer whose [`MatchOwner`] holds this rule.
    pub owner: u64,
    /// Registry the rule is linked into, if any. Rules naming a stale
    /// unique-id sender stay unlinked; they can never fire.
    pub target: Option<(RuleTarget, RuleList)>,
    pub n_user_refs: usize,
    _charges: [UserCharge; 2],
}

/// The rules installed by one peer, at most one per canonical key tuple.
#[derive(Debug, Default)]
pub struct MatchOwner {
    rules: BTreeMap<MatchRuleKeys, RuleHandle>,
}

impl MatchOwner {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = RuleHandle> + '_ {
        self.rules.values().copied()
    }

    pub(crate) fn find(&self, keys: &MatchRuleKeys) -> Option<RuleHandle> {
        self.rules.get(keys).copied()
    }

    pub(crate) fn take_all(&mut self) -> Vec<RuleHandle> {
        std::mem::take(&mut self.rules).into_values().collect()
    }
}

/// Parses `rule_string` and installs the rule for `owner`, charging
/// `user`. Installing a rule identical to an existing one takes another
/// user reference on it instead.
pub(crate) fn owner_ref_rule(
    arena: &mut RuleArena,
    owner: &mut MatchOwner,
    owner_id: u64,
    user: &Arc<User>,
    rule_string: &str,
) -> Result<RuleHandle, MatchError> {
    let keys = MatchRuleKeys::parse(rule_string)?;
    if let Some(handle) = owner.find(&keys) {
        arena[handle].n_user_refs += 1;
        return Ok(handle);
    }
    let bytes = user_charge(
        user,
        None,
        UserSlot::Bytes,
        (size_of::<MatchRule>() + rule_string.len()) as u64,
    )?;
    let slots = user_charge(user, None, UserSlot::Matches, 1)?;
    let handle = arena.insert(MatchRule {
        keys: keys.clone(),
        owner: owner_id,
        target: None,
        n_user_refs: 1,
        _charges: [bytes, slots],
    });
    owner.rules.insert(keys, handle);
    Ok(handle)
}

/// Looks up the rule an identical `rule_string` previously installed.
pub(crate) fn owner_find_rule(
    owner: &MatchOwner,
    rule_string: &str,
) -> Result<RuleHandle, MatchError> {
    let keys = MatchRuleKeys::parse(rule_string)?;
    owner.find(&keys).ok_or(MatchError::NotFound)
}

/// Drops one user reference; at zero the rule is removed from its owner and
/// the arena and handed back so the caller can unlink it.
pub(crate) fn owner_unref_rule(
    arena: &mut RuleArena,
    owner: &mut MatchOwner,
    handle: RuleHandle,
) -> Option<MatchRule> {
    let rule = &mut arena[handle];
    debug_assert!(rule.n_user_refs > 0);
    rule.n_user_refs -= 1;
    if rule.n_user_refs > 0 {
        return None;
    }
    let rule = arena.remove(handle).unwrap();
    // removal by handle, not key: a monitor conversion may have rewritten
    // the keys after they were indexed
    owner.rules.retain(|_, h| *h != handle);
    Some(rule)
}

/// The rules subscribed to one traffic source.
///
/// Broadcast walks the eavesdrop list first, then the regular list; for
/// messages with an explicit destination only eavesdroppers are
/// considered. The monitor list is a separate channel.
#[derive(Debug, Default)]
pub struct MatchRegistry {
    rule_list: Vec<RuleHandle>,
    eavesdrop_list: Vec<RuleHandle>,
    monitor_list: Vec<RuleHandle>,
}

impl MatchRegistry {
    pub fn is_empty(&self) -> bool {
        self.rule_list.is_empty() && self.eavesdrop_list.is_empty() && self.monitor_list.is_empty()
    }

    pub(crate) fn link(&mut self, handle: RuleHandle, list: RuleList) {
        match list {
            RuleList::Regular => self.rule_list.push(handle),
            RuleList::Eavesdrop => self.eavesdrop_list.push(handle),
            RuleList::Monitor => self.monitor_list.push(handle),
        }
    }

    pub(crate) fn unlink(&mut self, handle: RuleHandle, list: RuleList) {
        let list = match list {
            RuleList::Regular => &mut self.rule_list,
            RuleList::Eavesdrop => &mut self.eavesdrop_list,
            RuleList::Monitor => &mut self.monitor_list,
        };
        list.retain(|&h| h != handle);
    }

    pub(crate) fn take_all(&mut self) -> Vec<RuleHandle> {
        let mut handles = std::mem::take(&mut self.eavesdrop_list);
        handles.append(&mut self.rule_list);
        handles.append(&mut self.monitor_list);
        handles
    }

    /// Iterates the rules matching `filter`, eavesdroppers first. The
    /// iterator borrows the registry and the arena; neither can be mutated
    /// during traversal.
    pub fn iter_matches<'a>(
        &'a self,
        arena: &'a RuleArena,
        filter: &'a MatchFilter<'a>,
    ) -> impl Iterator<Item = RuleHandle> + 'a {
        let regular: &[RuleHandle] =
            if filter.destination.is_some() { &[] } else { &self.rule_list };
        self.eavesdrop_list
            .iter()
            .chain(regular.iter())
            .copied()
            .filter(move |&handle| arena[handle].keys.matches_filter(filter))
    }

    /// Iterates the monitor rules matching `filter`.
    pub fn iter_monitor_matches<'a>(
        &'a self,
        arena: &'a RuleArena,
        filter: &'a MatchFilter<'a>,
    ) -> impl Iterator<Item = RuleHandle> + 'a {
        self.monitor_list
            .iter()
            .copied()
            .filter(move |&handle| arena[handle].keys.matches_filter(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{Limits, UserRegistry};

    fn setup() -> (RuleArena, MatchOwner, Arc<User>) {
        let registry = UserRegistry::new(Limits { max_matches: 2, ..Default::default() });
        (RuleArena::with_key(), MatchOwner::default(), registry.ref_user(1000))
    }

    #[test]
    fn duplicate_rules_share_one_slot() {
        let (mut arena, mut owner, user) = setup();
        let a = owner_ref_rule(&mut arena, &mut owner, 1, &user, "type='signal'").unwrap();
        let b = owner_ref_rule(&mut arena, &mut owner, 1, &user, "type=signal").unwrap();
        assert_eq!(a, b);
        assert_eq!(owner.len(), 1);
        assert_eq!(arena[a].n_user_refs, 2);
        assert_eq!(user.used(UserSlot::Matches), 1);

        assert!(owner_unref_rule(&mut arena, &mut owner, a).is_none());
        assert_eq!(arena[a].n_user_refs, 1);
        let rule = owner_unref_rule(&mut arena, &mut owner, a).unwrap();
        assert_eq!(rule.keys.ty, Some(crate::message::MessageType::Signal));
        assert!(owner.is_empty());
        assert!(arena.is_empty());
        assert_eq!(user.used(UserSlot::Matches), 0);
    }

    #[test]
    fn distinct_rules_hit_the_match_quota() {
        let (mut arena, mut owner, user) = setup();
        owner_ref_rule(&mut arena, &mut owner, 1, &user, "type='signal'").unwrap();
        owner_ref_rule(&mut arena, &mut owner, 1, &user, "member='M'").unwrap();
        let err = owner_ref_rule(&mut arena, &mut owner, 1, &user, "member='N'").unwrap_err();
        assert!(matches!(err, MatchError::Quota(_)));
    }

    #[test]
    fn find_uses_canonical_keys() {
        let (mut arena, mut owner, user) = setup();
        let handle =
            owner_ref_rule(&mut arena, &mut owner, 1, &user, "interface='i.f',type='signal'")
                .unwrap();
        assert_eq!(
            owner_find_rule(&owner, "type=signal,interface=i.f").unwrap(),
            handle
        );
        assert_eq!(owner_find_rule(&owner, "type='signal'"), Err(MatchError::NotFound));
    }

    #[test]
    fn eavesdrop_rules_come_first_and_regular_rules_skip_unicast() {
        let (mut arena, mut owner, user) = setup();
        let regular = owner_ref_rule(&mut arena, &mut owner, 1, &user, "member='M'").unwrap();
        let eaves =
            owner_ref_rule(&mut arena, &mut owner, 1, &user, "member='M',eavesdrop='true'")
                .unwrap();
        let mut registry = MatchRegistry::default();
        registry.link(regular, RuleList::Regular);
        registry.link(eaves, RuleList::Eavesdrop);

        let msg = crate::message::Message::signal(1, ":1.1", "/", "i.f", "M");
        let broadcast = MatchFilter::for_message(&msg, Some(1), None);
        let hits: Vec<_> = registry.iter_matches(&arena, &broadcast).collect();
        assert_eq!(hits, vec![eaves, regular]);

        let unicast = MatchFilter::for_message(&msg, Some(1), Some(2));
        let hits: Vec<_> = registry.iter_matches(&arena, &unicast).collect();
        assert_eq!(hits, vec![eaves]);
    }
}
