//! The broker-side half of a peer connection.
//!
//! The wire codec and the readiness loop live outside the engine; what the
//! engine owns is the outbound queue: lifecycle state, byte accounting for
//! queued messages, and the bus-global transaction-id deduplication that
//! gives broadcasts at-most-once delivery per receiver.

use std::{collections::VecDeque, sync::Arc};

use crate::{
    message::Message,
    user::{user_charge, QuotaExceeded, User, UserCharge, UserSlot},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Running,
    /// Egress drains, then the connection closes.
    ShuttingDown,
    Closed,
}

#[derive(Debug)]
struct QueuedMessage {
    msg: Arc<Message>,
    _charge: UserCharge,
}

#[derive(Debug)]
pub struct Connection {
    user: Arc<User>,
    state: State,
    egress: VecDeque<QueuedMessage>,
    last_transaction: u64,
}

impl Connection {
    pub fn new(user: Arc<User>) -> Self {
        Self { user, state: State::Running, egress: VecDeque::new(), last_transaction: 0 }
    }

    /// Enqueues a message for delivery.
    ///
    /// A `transaction_id` of zero always enqueues (unicast); a nonzero id
    /// enqueues only if this connection has not seen it yet, so a broadcast
    /// selecting the same receiver through several match paths delivers
    /// once. Queued bytes are accounted against this connection's user,
    /// paid by `chargee` when given.
    pub(crate) fn queue(
        &mut self,
        chargee: Option<&Arc<User>>,
        transaction_id: u64,
        msg: &Arc<Message>,
    ) -> Result<(), QuotaExceeded> {
        if self.state != State::Running {
            // undeliverable; the peer is on its way out
            return Ok(());
        }
        if transaction_id != 0 && self.last_transaction == transaction_id {
            return Ok(());
        }
        let charge = user_charge(&self.user, chargee, UserSlot::Bytes, msg.size as u64)?;
        if transaction_id != 0 {
            self.last_transaction = transaction_id;
        }
        self.egress.push_back(QueuedMessage { msg: msg.clone(), _charge: charge });
        Ok(())
    }

    /// Hands the next message to the I/O layer, refunding its charge.
    pub fn dequeue(&mut self) -> Option<Arc<Message>> {
        let entry = self.egress.pop_front();
        if self.state == State::ShuttingDown && self.egress.is_empty() {
            self.state = State::Closed;
        }
        entry.map(|e| e.msg)
    }

    /// Stops accepting traffic; already queued egress still drains.
    pub fn shutdown(&mut self) {
        if self.state == State::Running {
            self.state =
                if self.egress.is_empty() { State::Closed } else { State::ShuttingDown };
        }
    }

    /// Closes immediately, dropping pending egress.
    pub fn close(&mut self) {
        self.egress.clear();
        self.state = State::Closed;
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    pub fn queued(&self) -> usize {
        self.egress.len()
    }

    pub fn egress(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.egress.iter().map(|e| &e.msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{Limits, UserRegistry};

    fn connection(max_bytes: u64) -> Connection {
        let users = UserRegistry::new(Limits { max_bytes, ..Default::default() });
        Connection::new(users.ref_user(1000))
    }

    fn msg() -> Arc<Message> {
        Arc::new(Message::signal(1, ":1.1", "/", "i.f", "M"))
    }

    #[test]
    fn unicast_always_enqueues() {
        let mut conn = connection(1 << 20);
        conn.queue(None, 0, &msg()).unwrap();
        conn.queue(None, 0, &msg()).unwrap();
        assert_eq!(conn.queued(), 2);
    }

    #[test]
    fn transactions_deliver_at_most_once() {
        let mut conn = connection(1 << 20);
        let msg = msg();
        conn.queue(None, 7, &msg).unwrap();
        conn.queue(None, 7, &msg).unwrap();
        assert_eq!(conn.queued(), 1);
        conn.queue(None, 8, &msg).unwrap();
        assert_eq!(conn.queued(), 2);
    }

    #[test]
    fn queued_bytes_are_charged_and_refunded() {
        let mut conn = connection(1 << 20);
        let msg = msg();
        conn.queue(None, 0, &msg).unwrap();
        assert_eq!(conn.user.used(UserSlot::Bytes), msg.size as u64);
        conn.dequeue().unwrap();
        assert_eq!(conn.user.used(UserSlot::Bytes), 0);
    }

    #[test]
    fn quota_overflow_is_reported() {
        let mut conn = connection(16);
        assert!(conn.queue(None, 0, &msg()).is_err());
        assert_eq!(conn.queued(), 0);
    }

    #[test]
    fn shutdown_drains_then_closes() {
        let mut conn = connection(1 << 20);
        conn.queue(None, 0, &msg()).unwrap();
        conn.shutdown();
        assert!(!conn.is_running());
        // new traffic is silently dropped, existing egress survives
        conn.queue(None, 0, &msg()).unwrap();
        assert_eq!(conn.queued(), 1);
        assert!(conn.dequeue().is_some());
        assert!(conn.dequeue().is_none());
        assert_eq!(conn.queued(), 0);
    }

    #[test]
    fn close_discards_egress() {
        let mut conn = connection(1 << 20);
        let msg = msg();
        conn.queue(None, 0, &msg).unwrap();
        conn.close();
        assert_eq!(conn.queued(), 0);
        assert_eq!(conn.user.used(UserSlot::Bytes), 0);
        assert!(conn.dequeue().is_none());
    }
}
