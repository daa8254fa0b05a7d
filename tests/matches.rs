use std::sync::Arc;

use brokerd::{
    bus::Bus,
    creds::PeerCredentials,
    message::{Arg, Message},
    peer::PeerError,
    policy::PolicyRegistry,
    user::Limits,
};
use ntest::timeout;

fn bus() -> Bus {
    Bus::new(Limits::default(), PolicyRegistry::default(), 0)
}

fn connect(bus: &mut Bus, uid: u32) -> u64 {
    let id = bus.create_peer(PeerCredentials::for_uid(uid)).unwrap();
    bus.register_peer(id).unwrap();
    id
}

fn signal_with_arg0(sender: u64, arg0: &str) -> Arc<Message> {
    Arc::new(
        Message::signal(1, &format!(":1.{sender}"), "/", "com.x.Iface", "Changed")
            .with_args(vec![Arg::Str(arg0.to_string())]),
    )
}

#[test]
#[timeout(10000)]
fn arg0namespace_subscription() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);

    bus.add_match(a, "type='signal',arg0namespace='a.b'").unwrap();

    bus.broadcast(b, &signal_with_arg0(b, "a.b.c")).unwrap();
    assert_eq!(bus.drain_egress(a).len(), 1);

    bus.broadcast(b, &signal_with_arg0(b, "ab.c")).unwrap();
    assert!(bus.drain_egress(a).is_empty());
}

#[test]
#[timeout(10000)]
fn duplicate_add_match_needs_matching_removes() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);
    let rule = "type='signal',interface='com.x.Iface'";

    bus.add_match(a, rule).unwrap();
    bus.add_match(a, rule).unwrap();

    bus.remove_match(a, rule).unwrap();
    // one user reference left, the rule still fires
    bus.broadcast(b, &signal_with_arg0(b, "x")).unwrap();
    assert_eq!(bus.drain_egress(a).len(), 1);

    bus.remove_match(a, rule).unwrap();
    bus.broadcast(b, &signal_with_arg0(b, "x")).unwrap();
    assert!(bus.drain_egress(a).is_empty());

    assert_eq!(bus.remove_match(a, rule), Err(PeerError::MatchNotFound));
}

#[test]
#[timeout(10000)]
fn match_quota() {
    let limits = Limits { max_matches: 2, ..Default::default() };
    let mut bus = Bus::new(limits, PolicyRegistry::default(), 0);
    let p = connect(&mut bus, 1000);

    bus.add_match(p, "interface='com.a'").unwrap();
    bus.add_match(p, "interface='com.b'").unwrap();
    let err = bus.add_match(p, "interface='com.c'").unwrap_err();
    assert!(matches!(err, PeerError::Quota(_)));
}

#[test]
#[timeout(10000)]
fn invalid_rules_are_rejected() {
    let mut bus = bus();
    let p = connect(&mut bus, 1000);
    assert_eq!(bus.add_match(p, "nonsense='x'"), Err(PeerError::MatchInvalid));
    assert_eq!(bus.add_match(p, "type='signal"), Err(PeerError::MatchInvalid));
    assert_eq!(bus.remove_match(p, "arg99='x'"), Err(PeerError::MatchInvalid));
}

#[test]
#[timeout(10000)]
fn sender_rule_follows_the_well_known_name() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    let b = connect(&mut bus, 1001);
    let c = connect(&mut bus, 1002);

    bus.add_match(a, "sender='com.x'").unwrap();
    bus.request_name(b, "com.x", Default::default()).unwrap();
    bus.request_name(c, "com.x", Default::default()).unwrap();

    bus.broadcast(b, &signal_with_arg0(b, "x")).unwrap();
    assert_eq!(bus.drain_egress(a).len(), 1);
    // c is only queued, its traffic does not reach the subscription
    bus.broadcast(c, &signal_with_arg0(c, "x")).unwrap();
    assert!(bus.drain_egress(a).is_empty());

    // the subscription rebinds to the next primary automatically
    bus.release_name(b, "com.x").unwrap();
    bus.broadcast(c, &signal_with_arg0(c, "x")).unwrap();
    assert_eq!(bus.drain_egress(a).len(), 1);
}

#[test]
#[timeout(10000)]
fn wildcard_sender_rule_binds_to_a_future_peer() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);
    bus.add_match(a, "sender=':1.20'").unwrap();

    // nothing matches while the id is unallocated
    let b = connect(&mut bus, 1001);
    bus.broadcast(b, &signal_with_arg0(b, "x")).unwrap();
    assert!(bus.drain_egress(a).is_empty());

    // churn until the pinned id is assigned
    while bus.peers().next_id() < 20 {
        let id = bus.create_peer(PeerCredentials::for_uid(1001)).unwrap();
        bus.remove_peer(id).unwrap();
    }
    let target = bus.create_peer(PeerCredentials::for_uid(1001)).unwrap();
    assert_eq!(target, 20);
    bus.register_peer(target).unwrap();
    bus.broadcast(target, &signal_with_arg0(target, "x")).unwrap();
    assert_eq!(bus.drain_egress(a).len(), 1);
}

#[test]
#[timeout(10000)]
fn stale_sender_rule_never_fires() {
    let mut bus = bus();
    let a = connect(&mut bus, 1000);

    // churn past the id without ever registering it
    while bus.peers().next_id() <= 30 {
        let id = bus.create_peer(PeerCredentials::for_uid(1001)).unwrap();
        bus.remove_peer(id).unwrap();
    }
    bus.add_match(a, "sender=':1.30'").unwrap();

    let b = connect(&mut bus, 1001);
    bus.broadcast(b, &signal_with_arg0(b, "x")).unwrap();
    assert!(bus.drain_egress(a).is_empty());

    // the rule is still tracked by its owner and can be removed
    bus.remove_match(a, "sender=':1.30'").unwrap();
}
