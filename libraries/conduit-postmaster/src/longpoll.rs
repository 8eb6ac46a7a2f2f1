//! Rendezvous between a publish and a parked get. Process-local: one
//! single-slot channel per mailbox, at most one waiter at a time. A publish
//! that finds no waiter (or a full slot) is dropped; the message is already
//! persisted and the next poll will pick it up.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use crate::mailboxes::Message;

/// Parked gets wake somewhere in this window; the spread staggers fleet-wide
/// reconnects.
const PARK_TIMEOUT_RANGE_SECS: std::ops::RangeInclusive<u64> = 200..=700;

struct Waiter {
    ticket: u64,
    tx: mpsc::Sender<Message>,
}

#[derive(Clone, Default)]
pub struct PollHub {
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
    tickets: Arc<AtomicU64>,
}

impl PollHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a message published to `mailbox`, up to `timeout`.
    ///
    /// Installing the slot displaces any previous waiter for the same
    /// mailbox; the displaced get simply times out on its own and returns
    /// empty. On exit the slot is removed unless somebody newer owns it.
    pub async fn park(&self, mailbox: &str, timeout: Duration) -> Option<Message> {
        let (tx, mut rx) = mpsc::channel(1);
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .lock()
            .insert(mailbox.to_string(), Waiter { ticket, tx });

        let outcome = tokio::time::timeout(timeout, rx.recv()).await;

        let mut waiters = self.waiters.lock();
        if waiters.get(mailbox).is_some_and(|w| w.ticket == ticket) {
            waiters.remove(mailbox);
        }
        match outcome {
            Ok(Some(msg)) => Some(msg),
            // channel closed (we were displaced) or timer fired
            _ => None,
        }
    }

    /// Hand a message to the parked waiter, if any. Never blocks; returns
    /// whether a waiter took it.
    pub fn publish(&self, mailbox: &str, msg: Message) -> bool {
        let tx = {
            let waiters = self.waiters.lock();
            waiters.get(mailbox).map(|w| w.tx.clone())
        };
        match tx {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Whether a waiter is currently parked on the mailbox.
    pub fn is_online(&self, mailbox: &str) -> bool {
        self.waiters.lock().contains_key(mailbox)
    }

    pub fn connected(&self) -> usize {
        self.waiters.lock().len()
    }

    /// A fresh randomized park timeout for one `/get` call.
    pub fn park_timeout() -> Duration {
        Duration::from_secs(rand::rng().random_range(PARK_TIMEOUT_RANGE_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, mailbox: &str) -> Message {
        Message {
            id: id.to_string(),
            mailbox: mailbox.to_string(),
            deployment: "dep".to_string(),
            body: "run()".to_string(),
            created_at: 0,
            receive_count: 0,
            last_received_at: None,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn publish_wakes_the_parked_waiter() {
        let hub = PollHub::new();
        let parked = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.park("alpha", Duration::from_secs(5)).await })
        };
        // let the waiter install its slot
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.is_online("alpha"));
        assert!(hub.publish("alpha", message("m1", "alpha")));

        let got = parked.await.expect("join").expect("message");
        assert_eq!(got.id, "m1");
        assert!(!hub.is_online("alpha"));
    }

    #[tokio::test]
    async fn park_times_out_empty() {
        let hub = PollHub::new();
        let got = hub.park("alpha", Duration::from_millis(30)).await;
        assert!(got.is_none());
        assert_eq!(hub.connected(), 0);
    }

    #[tokio::test]
    async fn publish_without_waiter_is_dropped() {
        let hub = PollHub::new();
        assert!(!hub.publish("alpha", message("m1", "alpha")));
    }

    #[tokio::test]
    async fn a_new_waiter_displaces_the_old_one() {
        let hub = PollHub::new();
        let first = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.park("alpha", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.park("alpha", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.connected(), 1);

        // the displaced waiter comes back empty; the new one gets the message
        assert!(first.await.expect("join").is_none());
        assert!(hub.publish("alpha", message("m2", "alpha")));
        let got = second.await.expect("join").expect("message");
        assert_eq!(got.id, "m2");
    }

    #[test]
    fn park_timeout_stays_in_window() {
        for _ in 0..32 {
            let t = PollHub::park_timeout().as_secs();
            assert!((200..=700).contains(&t));
        }
    }
}
