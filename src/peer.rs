//! Per-connection broker state.

use std::{mem::size_of, sync::Arc};

use thiserror::Error;
use zbus::names::OwnedUniqueName;

use crate::{
    address,
    connection::Connection,
    creds::PeerCredentials,
    match_rules::{
        registry::{MatchOwner, MatchRegistry},
        MatchError,
    },
    policy::{PolicyRegistry, PolicySnapshot},
    reply::{ReplyError, ReplyOwner, ReplyRegistry},
    user::{user_charge, QuotaExceeded, User, UserCharge, UserSlot},
};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error(transparent)]
    Quota(#[from] QuotaExceeded),
    #[error("connection refused by policy")]
    ConnectionRefused,
    #[error("no such peer")]
    NoSuchPeer,
    #[error("the name is reserved")]
    NameReserved,
    #[error("unique names cannot be requested or released")]
    NameUnique,
    #[error("owning the name was refused by policy")]
    NameRefused,
    #[error("invalid match rule")]
    MatchInvalid,
    #[error("no such match rule")]
    MatchNotFound,
    #[error("a reply to this call is already expected")]
    ExpectedReplyExists,
    #[error("unexpected reply")]
    UnexpectedReply,
    #[error("sending denied by policy")]
    SendDenied,
    #[error("receiving denied by policy")]
    ReceiveDenied,
}

impl From<MatchError> for PeerError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::Invalid => PeerError::MatchInvalid,
            MatchError::NotFound => PeerError::MatchNotFound,
            MatchError::Quota(quota) => PeerError::Quota(quota),
        }
    }
}

impl From<ReplyError> for PeerError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::Exists => PeerError::ExpectedReplyExists,
            ReplyError::Quota(quota) => PeerError::Quota(quota),
        }
    }
}

/// One connected peer.
#[derive(Debug)]
pub struct Peer {
    id: u64,
    unique_name: OwnedUniqueName,
    creds: PeerCredentials,
    pub(crate) user: Arc<User>,
    pub(crate) policy: PolicySnapshot,
    pub(crate) conn: Connection,
    /// Rules this peer installed.
    pub(crate) owned_matches: MatchOwner,
    /// Rules other peers installed on this peer's traffic.
    pub(crate) matches: MatchRegistry,
    /// Replies this peer owes.
    pub(crate) replies_outgoing: ReplyRegistry,
    /// Replies owed to this peer.
    pub(crate) owned_replies: ReplyOwner,
    registered: bool,
    monitor: bool,
    _charges: [UserCharge; 3],
}

impl Peer {
    pub(crate) fn new(
        id: u64,
        creds: PeerCredentials,
        user: Arc<User>,
        policy: &PolicyRegistry,
    ) -> Result<Self, PeerError> {
        let bytes = user_charge(&user, None, UserSlot::Bytes, size_of::<Peer>() as u64)?;
        let fds = user_charge(&user, None, UserSlot::Fds, 1)?;
        let objects = user_charge(&user, None, UserSlot::Objects, 1)?;
        let snapshot = policy
            .instantiate(creds.uid, &creds.groups)
            .map_err(|_| PeerError::ConnectionRefused)?;
        Ok(Self {
            id,
            unique_name: address::unique_name(id),
            conn: Connection::new(user.clone()),
            creds,
            user,
            policy: snapshot,
            owned_matches: MatchOwner::default(),
            matches: MatchRegistry::default(),
            replies_outgoing: ReplyRegistry::default(),
            owned_replies: ReplyOwner::default(),
            registered: false,
            monitor: false,
            _charges: [bytes, fds, objects],
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unique_name(&self) -> &OwnedUniqueName {
        &self.unique_name
    }

    pub fn creds(&self) -> &PeerCredentials {
        &self.creds
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_monitor(&self) -> bool {
        self.monitor
    }

    /// Marks the peer registered, after the connection answered `Hello`.
    pub(crate) fn register(&mut self) {
        debug_assert!(!self.registered && !self.monitor);
        self.registered = true;
    }

    pub(crate) fn unregister(&mut self) {
        self.registered = false;
    }

    pub(crate) fn set_monitor(&mut self) {
        debug_assert!(!self.registered);
        self.monitor = true;
    }
}
