use std::sync::Arc;

use brokerd::{
    bus::Bus,
    creds::PeerCredentials,
    message::{HeaderFlag, Message},
    peer::PeerError,
    policy::PolicyRegistry,
    user::{Limits, UserSlot},
};
use enumflags2::BitFlags;
use ntest::timeout;

fn bus() -> Bus {
    Bus::new(Limits::default(), PolicyRegistry::default(), 0)
}

fn bus_with(limits: Limits) -> Bus {
    Bus::new(limits, PolicyRegistry::default(), 0)
}

fn connect(bus: &mut Bus, uid: u32) -> u64 {
    let id = bus.create_peer(PeerCredentials::for_uid(uid)).unwrap();
    bus.register_peer(id).unwrap();
    id
}

fn call(serial: u32, sender: u64, receiver: u64) -> Arc<Message> {
    Arc::new(Message::method_call(
        serial,
        &format!(":1.{sender}"),
        &format!(":1.{receiver}"),
        "/com/x",
        "com.x.Iface",
        "Frob",
    ))
}

fn signal(sender: u64) -> Arc<Message> {
    Arc::new(Message::signal(1, &format!(":1.{sender}"), "/com/x", "com.x.Iface", "Changed"))
}

#[test]
#[timeout(10000)]
fn calls_route_to_the_destination_and_replies_come_back() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);

    bus.queue_call(a, b, &call(7, a, b)).unwrap();
    let delivered = bus.drain_egress(b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].header.serial, 7);

    let reply = Arc::new(Message::method_return(1, ":1.1", ":1.0", 7));
    bus.queue_reply(b, &reply).unwrap();
    let delivered = bus.drain_egress(a);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].header.reply_serial, Some(7));

    // the slot is gone, a second reply is unexpected
    let dup = Arc::new(Message::method_return(2, ":1.1", ":1.0", 7));
    assert_eq!(bus.queue_reply(b, &dup), Err(PeerError::UnexpectedReply));
}

#[test]
#[timeout(10000)]
fn duplicate_serials_violate_the_reply_contract() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);

    bus.queue_call(a, b, &call(7, a, b)).unwrap();
    assert_eq!(bus.queue_call(a, b, &call(7, a, b)), Err(PeerError::ExpectedReplyExists));

    // calls that expect no reply take no slot
    let oneway =
        Arc::new((*call(7, a, b)).clone().with_flags(HeaderFlag::NoReplyExpected.into()));
    bus.queue_call(a, b, &oneway).unwrap();
}

#[test]
#[timeout(10000)]
fn reply_quota_is_charged_to_the_caller() {
    let limits = Limits { max_replies: 2, ..Default::default() };
    let mut bus = bus_with(limits);
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);

    bus.queue_call(a, b, &call(1, a, b)).unwrap();
    bus.queue_call(a, b, &call(2, a, b)).unwrap();
    let err = bus.queue_call(a, b, &call(3, a, b)).unwrap_err();
    assert!(matches!(err, PeerError::Quota(_)));
    assert_eq!(bus.peer(a).unwrap().user().used(UserSlot::Replies), 2);
}

#[test]
#[timeout(10000)]
fn broadcast_excludes_the_unicast_destination() {
    let mut bus = bus();
    let s = connect(&mut bus, 1000);
    let d = connect(&mut bus, 1001);
    let e = connect(&mut bus, 1002);

    bus.add_match(e, "eavesdrop='true'").unwrap();

    bus.queue_call(s, d, &call(5, s, d)).unwrap();
    assert_eq!(bus.drain_egress(d).len(), 1);
    assert_eq!(bus.drain_egress(e).len(), 1);
    assert!(bus.drain_egress(s).is_empty());
}

#[test]
#[timeout(10000)]
fn overlapping_match_paths_deliver_once() {
    let mut bus = bus();
    let s = connect(&mut bus, 1000);
    let r = connect(&mut bus, 1001);

    // all three subscriptions select the same signal
    bus.add_match(r, "type='signal'").unwrap();
    bus.add_match(r, &format!("sender=':1.{s}'")).unwrap();
    bus.request_name(s, "com.x", BitFlags::empty()).unwrap();
    bus.add_match(r, "sender='com.x'").unwrap();

    bus.broadcast(s, &signal(s)).unwrap();
    assert_eq!(bus.drain_egress(r).len(), 1);

    // a later broadcast is a fresh transaction
    bus.broadcast(s, &signal(s)).unwrap();
    assert_eq!(bus.drain_egress(r).len(), 1);
}

#[test]
#[timeout(10000)]
fn monitors_see_everything_once() {
    let mut bus = bus();
    let s = connect(&mut bus, 1000);
    let d = connect(&mut bus, 1001);
    let m = bus.create_peer(PeerCredentials::for_uid(1002)).unwrap();

    let rules = bus.monitor_owner(m, &[]).unwrap();
    bus.become_monitor(m, rules).unwrap();
    assert!(bus.peer(m).unwrap().is_monitor());

    bus.broadcast(s, &signal(s)).unwrap();
    assert_eq!(bus.drain_egress(m).len(), 1);

    bus.queue_call(s, d, &call(9, s, d)).unwrap();
    assert_eq!(bus.drain_egress(m).len(), 1);
    assert_eq!(bus.drain_egress(d).len(), 1);

    let reply = Arc::new(Message::method_return(1, ":1.1", ":1.0", 9));
    bus.queue_reply(d, &reply).unwrap();
    assert_eq!(bus.drain_egress(m).len(), 1);
}

#[test]
#[timeout(10000)]
fn driver_broadcasts_reach_driver_subscriptions() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);
    bus.add_match(a, "sender='org.freedesktop.DBus'").unwrap();

    let signal = Arc::new(Message::signal(
        1,
        "org.freedesktop.DBus",
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
        "NameOwnerChanged",
    ));
    bus.broadcast_from_driver(&signal);
    assert_eq!(bus.drain_egress(a).len(), 1);
    assert!(bus.drain_egress(b).is_empty());

    // peer-originated traffic does not hit the driver registry
    bus.broadcast(b, &self::signal(b)).unwrap();
    assert!(bus.drain_egress(a).is_empty());
}

#[test]
#[timeout(10000)]
fn peer_ids_are_never_reused() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    bus.remove_peer(a).unwrap();
    let b = connect(&mut bus, 1000);
    assert!(b > a);
    assert!(bus.peer(a).is_none());
}

#[test]
#[timeout(10000)]
fn removing_a_peer_leaves_no_residue() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);
    let user = bus.peer(a).unwrap().user().clone();

    bus.request_name(a, "com.x", BitFlags::empty()).unwrap();
    bus.add_match(a, "type='signal'").unwrap();
    bus.add_match(a, &format!("sender=':1.{b}'")).unwrap();
    bus.add_match(a, "sender='com.dormant'").unwrap();
    bus.add_match(b, &format!("sender=':1.{a}'")).unwrap();
    bus.queue_call(a, b, &call(4, a, b)).unwrap();

    let changes = bus.remove_peer(a).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].name, "com.x");
    assert_eq!(changes[0].new_owner, None);

    // nothing on the bus refers to the dead peer any more
    assert!(bus.names().lookup("com.x").is_none());
    assert!(bus.names().get("com.dormant").is_none());
    assert!(bus.peer(a).is_none());

    // the undelivered call still holds bytes paid by the dead peer's
    // user; draining the receiver refunds the last of it
    bus.drain_egress(b);
    for slot in UserSlot::ALL {
        assert_eq!(user.used(slot), 0, "{slot:?} not fully refunded");
    }

    // the reply owed to the dead peer is gone with it
    let reply = Arc::new(Message::method_return(1, &format!(":1.{b}"), &format!(":1.{a}"), 4));
    assert_eq!(bus.queue_reply(b, &reply), Err(PeerError::UnexpectedReply));

    // b's subscription to the dead peer's traffic is inert but removable
    bus.remove_match(b, &format!("sender=':1.{a}'")).unwrap();
}

#[test]
#[timeout(10000)]
fn removing_the_receiver_drops_the_pending_reply() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);
    let user = bus.peer(a).unwrap().user().clone();

    bus.queue_call(a, b, &call(4, a, b)).unwrap();
    assert_eq!(user.used(UserSlot::Replies), 1);

    bus.remove_peer(b).unwrap();
    // the reply slot died with the receiver, no error reaches the caller
    assert_eq!(user.used(UserSlot::Replies), 0);
    assert!(bus.drain_egress(a).is_empty());
}

#[test]
#[timeout(10000)]
fn flushing_the_bus_drops_every_peer() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);
    let c = connect(&mut bus, 1002);

    bus.request_name(a, "com.x", BitFlags::empty()).unwrap();
    bus.request_name(b, "com.x", BitFlags::empty()).unwrap();
    bus.add_match(b, "sender='com.x'").unwrap();
    bus.add_match(c, &format!("sender=':1.{a}'")).unwrap();
    bus.queue_call(a, b, &call(1, a, b)).unwrap();
    bus.queue_call(c, a, &call(2, c, a)).unwrap();

    bus.flush_peers();
    assert!(bus.peers().is_empty());
    assert!(bus.names().get("com.x").is_none());
}

#[test]
#[timeout(10000)]
fn overflowing_broadcast_receivers_are_shut_down() {
    let limits = Limits { max_bytes: 4096, ..Default::default() };
    let mut bus = bus_with(limits);
    let s = connect(&mut bus, 1000);
    let r = connect(&mut bus, 1001);
    bus.add_match(r, "type='signal'").unwrap();

    // broadcast egress is paid by the receiver itself; once its byte
    // quota fills up without being drained it is disconnected
    let mut shut_down = false;
    for _ in 0..128 {
        bus.broadcast(s, &signal(s)).unwrap();
        if !bus.peer(r).unwrap().connection().is_running() {
            shut_down = true;
            break;
        }
    }
    assert!(shut_down, "receiver was never shut down");
}
