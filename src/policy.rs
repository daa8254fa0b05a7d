//! The policy gate.
//!
//! A [`PolicyRegistry`] holds ordered allow/deny rules per context
//! (default, per group, per user, mandatory). At connection time the rules
//! applying to a peer's `(uid, gids)` are compiled into an immutable
//! [`PolicySnapshot`]; the routing layer consults its pure check functions
//! on every name request and message.
//!
//! Loading rules from configuration files is the embedder's concern; the
//! registry is populated programmatically.

use std::{collections::BTreeSet, sync::Arc};

use thiserror::Error;

use crate::message::MessageType;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("access denied by policy")]
pub struct AccessDenied;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

/// How a rule matches a bus name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameMatch {
    Any,
    Exact(String),
    Prefix(String),
}

impl NameMatch {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Any => true,
            NameMatch::Exact(exact) => name == exact,
            NameMatch::Prefix(prefix) => {
                name.strip_prefix(prefix)
                    .is_some_and(|tail| tail.is_empty() || tail.starts_with('.'))
            }
        }
    }
}

/// Constraints of one send or receive rule; unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrafficRule {
    /// Matched against the other side's names: the receiver's for send
    /// rules, the sender's for receive rules.
    pub name: Option<NameMatch>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub ty: Option<MessageType>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Checked when a connection is established.
    Connect { user: Option<u32>, group: Option<u32> },
    /// Checked when a connection attempts to own a well-known name.
    Own(NameMatch),
    /// Checked when a connection attempts to send a message.
    Send(TrafficRule),
    /// Checked for each prospective recipient of a message.
    Receive(TrafficRule),
}

pub type Rule = (Access, Operation);

/// The context a set of rules applies in, in increasing precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyContext {
    Default,
    Group(u32),
    User(u32),
    Mandatory,
}

#[derive(Clone, Debug, Default)]
pub struct PolicyRegistry {
    default_rules: Vec<Rule>,
    group_rules: Vec<(u32, Vec<Rule>)>,
    user_rules: Vec<(u32, Vec<Rule>)>,
    mandatory_rules: Vec<Rule>,
}

impl PolicyRegistry {
    pub fn add_rules(&mut self, context: PolicyContext, rules: Vec<Rule>) {
        match context {
            PolicyContext::Default => self.default_rules.extend(rules),
            PolicyContext::Group(gid) => self.group_rules.push((gid, rules)),
            PolicyContext::User(uid) => self.user_rules.push((uid, rules)),
            PolicyContext::Mandatory => self.mandatory_rules.extend(rules),
        }
    }

    /// Whether instantiation needs the peer's auxiliary groups.
    pub fn needs_groups(&self) -> bool {
        !self.group_rules.is_empty()
            || self.all_rules().any(|(_, op)| {
                matches!(op, Operation::Connect { group: Some(_), .. })
            })
    }

    fn all_rules(&self) -> impl Iterator<Item = &Rule> {
        self.default_rules
            .iter()
            .chain(self.group_rules.iter().flat_map(|(_, r)| r))
            .chain(self.user_rules.iter().flat_map(|(_, r)| r))
            .chain(self.mandatory_rules.iter())
    }

    /// Compiles the snapshot for one peer, evaluating connect rules on the
    /// spot.
    pub fn instantiate(&self, uid: u32, gids: &[u32]) -> Result<PolicySnapshot, AccessDenied> {
        let mut own = vec![];
        let mut send = vec![];
        let mut receive = vec![];
        let mut connect = Access::Allow;

        let applicable = self
            .default_rules
            .iter()
            .chain(
                self.group_rules
                    .iter()
                    .filter(|(gid, _)| gids.contains(gid))
                    .flat_map(|(_, r)| r),
            )
            .chain(
                self.user_rules.iter().filter(|(u, _)| *u == uid).flat_map(|(_, r)| r),
            )
            .chain(self.mandatory_rules.iter());

        for (access, op) in applicable {
            match op {
                Operation::Connect { user, group } => {
                    let user_ok = user.map_or(true, |u| u == uid);
                    let group_ok = group.map_or(true, |g| gids.contains(&g));
                    if user_ok && group_ok {
                        connect = *access;
                    }
                }
                Operation::Own(name) => own.push((*access, name.clone())),
                Operation::Send(rule) => send.push((*access, rule.clone())),
                Operation::Receive(rule) => receive.push((*access, rule.clone())),
            }
        }

        if connect == Access::Deny {
            return Err(AccessDenied);
        }
        Ok(PolicySnapshot(Arc::new(SnapshotRules { own, send, receive })))
    }
}

#[derive(Debug, Default)]
struct SnapshotRules {
    own: Vec<(Access, NameMatch)>,
    send: Vec<(Access, TrafficRule)>,
    receive: Vec<(Access, TrafficRule)>,
}

/// The immutable compilation of the registry for one peer.
#[derive(Clone, Debug)]
pub struct PolicySnapshot(Arc<SnapshotRules>);

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self(Arc::new(SnapshotRules::default()))
    }
}

/// The names of the peer on the other side of a check.
#[derive(Clone, Copy, Debug)]
pub struct PeerNames<'a> {
    pub unique: Option<&'a str>,
    pub well_known: &'a BTreeSet<String>,
}

impl PeerNames<'_> {
    fn any(&self, m: &NameMatch) -> bool {
        if *m == NameMatch::Any {
            return true;
        }
        self.unique.map(|n| m.matches(n)).unwrap_or(false)
            || self.well_known.iter().any(|n| m.matches(n))
    }
}

/// The message fields a send/receive check consults.
#[derive(Clone, Copy, Debug)]
pub struct TrafficContext<'a> {
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub ty: MessageType,
}

impl TrafficRule {
    fn matches(&self, other: &PeerNames<'_>, ctx: &TrafficContext<'_>) -> bool {
        if let Some(name) = &self.name {
            if !other.any(name) {
                return false;
            }
        }
        let field = |want: &Option<String>, have: Option<&str>| match want {
            None => true,
            Some(want) => have == Some(want.as_str()),
        };
        field(&self.interface, ctx.interface)
            && field(&self.member, ctx.member)
            && field(&self.path, ctx.path)
            && self.ty.map_or(true, |ty| ty == ctx.ty)
    }
}

fn verdict<T>(rules: &[(Access, T)], matches: impl Fn(&T) -> bool) -> Result<(), AccessDenied> {
    match rules.iter().rev().find(|(_, rule)| matches(rule)) {
        Some((Access::Deny, _)) => Err(AccessDenied),
        _ => Ok(()),
    }
}

impl PolicySnapshot {
    pub fn check_own(&self, name: &str) -> Result<(), AccessDenied> {
        verdict(&self.0.own, |rule| rule.matches(name))
    }

    pub fn check_send(
        &self,
        receiver: &PeerNames<'_>,
        ctx: &TrafficContext<'_>,
    ) -> Result<(), AccessDenied> {
        verdict(&self.0.send, |rule| rule.matches(receiver, ctx))
    }

    pub fn check_receive(
        &self,
        sender: &PeerNames<'_>,
        ctx: &TrafficContext<'_>,
    ) -> Result<(), AccessDenied> {
        verdict(&self.0.receive, |rule| rule.matches(sender, ctx))
    }
}
