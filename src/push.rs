//! Rendezvous between push requests and the connections they solicit.
//!
//! A worker that cannot reach a firewalled source asks it (via its push
//! proxies) to connect back, then parks here. When the pushed connection
//! arrives it carries only the peer GUID and whatever address the socket
//! shows, so matching is two-stage: exact address match first, then any
//! waiter whose recorded address is private or a placeholder and thus
//! cannot be verified against the inbound socket at all.
//!
//! The pending set lives behind a single lock; register and match are
//! linearizable, so no two callers can claim the same waiter. Every
//! observer is notified exactly once, with a connection or with a
//! shutdown signal.

use crate::source::PeerGuid;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// What a parked worker eventually receives.
#[derive(Debug)]
pub enum PushSignal<S> {
    /// The pushed connection showed up.
    Connected(S),
    /// Give up waiting; the rendezvous is shutting down or timed out.
    Shutdown,
}

/// Handle for the exact-match path: all three parts must be equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTicket {
    pub guid: PeerGuid,
    pub target_addr: String,
    pub correlation_id: Uuid,
}

struct PendingEntry<S> {
    target_addr: String,
    correlation_id: Uuid,
    observer: oneshot::Sender<PushSignal<S>>,
}

/// Registry of workers waiting for a pushed connection, keyed by the
/// remote peer's GUID.
pub struct PushRendezvous<S> {
    pending: Mutex<HashMap<PeerGuid, Vec<PendingEntry<S>>>>,
}

impl<S> Default for PushRendezvous<S> {
    fn default() -> Self {
        PushRendezvous::new()
    }
}

impl<S> PushRendezvous<S> {
    pub fn new() -> Self {
        PushRendezvous {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Parks a waiter for `guid` at `target_addr`. Two registrations for
    /// the same GUID are told apart by the returned correlation id.
    pub fn register(
        &self,
        guid: PeerGuid,
        target_addr: &str,
    ) -> (PushTicket, oneshot::Receiver<PushSignal<S>>) {
        let (tx, rx) = oneshot::channel();
        let correlation_id = Uuid::new_v4();
        let entry = PendingEntry {
            target_addr: target_addr.to_string(),
            correlation_id,
            observer: tx,
        };
        self.pending.lock().unwrap().entry(guid).or_default().push(entry);
        debug!(guid = %guid, addr = target_addr, %correlation_id, "registered push waiter");
        let ticket = PushTicket {
            guid,
            target_addr: target_addr.to_string(),
            correlation_id,
        };
        (ticket, rx)
    }

    /// Removes the waiter whose GUID, recorded address and correlation id
    /// all equal the ticket's; `None` if it was already matched.
    pub fn match_exact(&self, ticket: &PushTicket) -> Option<oneshot::Sender<PushSignal<S>>> {
        let mut pending = self.pending.lock().unwrap();
        let entries = pending.get_mut(&ticket.guid)?;
        let index = entries.iter().position(|e| {
            e.target_addr == ticket.target_addr && e.correlation_id == ticket.correlation_id
        })?;
        let entry = entries.remove(index);
        if entries.is_empty() {
            pending.remove(&ticket.guid);
        }
        Some(entry.observer)
    }

    /// Finds the waiter for an inbound pushed connection.
    ///
    /// An entry whose recorded address equals the inbound address exactly
    /// always wins. Failing that, any entry with a private or placeholder
    /// address is accepted, since such an address can never be verified
    /// against the socket. Otherwise the pool is left untouched.
    pub fn match_best(
        &self,
        guid: &PeerGuid,
        inbound_addr: &str,
    ) -> Option<oneshot::Sender<PushSignal<S>>> {
        let mut pending = self.pending.lock().unwrap();
        let entries = pending.get_mut(guid)?;
        let index = entries
            .iter()
            .position(|e| e.target_addr == inbound_addr)
            .or_else(|| {
                entries
                    .iter()
                    .position(|e| is_unverifiable_addr(&e.target_addr))
            })?;
        let entry = entries.remove(index);
        if entries.is_empty() {
            pending.remove(guid);
        }
        debug!(guid = %guid, addr = inbound_addr, "matched inbound push");
        Some(entry.observer)
    }

    /// Removes and returns every pending observer, so each can be told to
    /// abandon its wait on shutdown.
    pub fn drain_all(&self) -> Vec<oneshot::Sender<PushSignal<S>>> {
        let mut pending = self.pending.lock().unwrap();
        pending
            .drain()
            .flat_map(|(_, entries)| entries)
            .map(|e| e.observer)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().values().map(Vec::len).sum()
    }
}

/// True when the recorded address cannot be checked against an inbound
/// socket: private or link-local space, loopback, the `0.0.0.0`
/// placeholder, or anything that does not parse as an IP at all.
fn is_unverifiable_addr(addr: &str) -> bool {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || v4.is_unspecified()
        }
        Ok(IpAddr::V6(v6)) => v6.is_loopback() || v6.is_unspecified(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(byte: u8) -> PeerGuid {
        PeerGuid([byte; 16])
    }

    /// Stand-in for a pushed connection in tests.
    #[derive(Debug, PartialEq)]
    struct FakeSocket(u32);

    #[test]
    fn test_exact_address_match_wins() {
        let rendezvous = PushRendezvous::<FakeSocket>::new();
        let (_t1, rx1) = rendezvous.register(guid(1), "192.168.1.5");
        let (_t2, mut rx2) = rendezvous.register(guid(1), "203.0.113.5");

        let observer = rendezvous.match_best(&guid(1), "203.0.113.5").unwrap();
        observer.send(PushSignal::Connected(FakeSocket(7))).ok();
        match rx2.try_recv().unwrap() {
            PushSignal::Connected(sock) => assert_eq!(sock, FakeSocket(7)),
            PushSignal::Shutdown => panic!("expected a connection"),
        }
        // The private-address waiter is still parked.
        assert_eq!(rendezvous.pending_count(), 1);
        drop(rx1);
    }

    #[test]
    fn test_private_address_fallback() {
        let rendezvous = PushRendezvous::<FakeSocket>::new();
        let (_ticket, _rx) = rendezvous.register(guid(2), "192.168.1.5");
        // Inbound address differs, but the recorded address is private and
        // cannot be verified, so the waiter is accepted.
        assert!(rendezvous.match_best(&guid(2), "203.0.113.80").is_some());
        assert_eq!(rendezvous.pending_count(), 0);
    }

    #[test]
    fn test_no_match_leaves_pool_untouched() {
        let rendezvous = PushRendezvous::<FakeSocket>::new();
        let (_ticket, _rx) = rendezvous.register(guid(3), "198.51.100.9");
        assert!(rendezvous.match_best(&guid(3), "203.0.113.80").is_none());
        assert!(rendezvous.match_best(&guid(4), "198.51.100.9").is_none());
        assert_eq!(rendezvous.pending_count(), 1);
    }

    #[test]
    fn test_match_exact_requires_all_three_parts() {
        let rendezvous = PushRendezvous::<FakeSocket>::new();
        let (ticket, _rx) = rendezvous.register(guid(5), "203.0.113.5");

        let wrong_addr = PushTicket {
            target_addr: "203.0.113.6".into(),
            ..ticket.clone()
        };
        assert!(rendezvous.match_exact(&wrong_addr).is_none());

        let wrong_correlation = PushTicket {
            correlation_id: Uuid::new_v4(),
            ..ticket.clone()
        };
        assert!(rendezvous.match_exact(&wrong_correlation).is_none());

        assert!(rendezvous.match_exact(&ticket).is_some());
        // Exactly-once removal.
        assert!(rendezvous.match_exact(&ticket).is_none());
    }

    #[test]
    fn test_same_guid_twice_distinguished_by_correlation() {
        let rendezvous = PushRendezvous::<FakeSocket>::new();
        let (first, _rx1) = rendezvous.register(guid(6), "203.0.113.5");
        let (second, _rx2) = rendezvous.register(guid(6), "203.0.113.5");
        assert_ne!(first.correlation_id, second.correlation_id);

        assert!(rendezvous.match_exact(&second).is_some());
        assert!(rendezvous.match_exact(&first).is_some());
        assert_eq!(rendezvous.pending_count(), 0);
    }

    #[test]
    fn test_match_exact_then_best_never_double_delivers() {
        let rendezvous = PushRendezvous::<FakeSocket>::new();
        let (ticket, _rx) = rendezvous.register(guid(7), "203.0.113.5");
        assert!(rendezvous.match_exact(&ticket).is_some());
        assert!(rendezvous.match_best(&guid(7), "203.0.113.5").is_none());
    }

    #[test]
    fn test_drain_all_for_shutdown() {
        let rendezvous = PushRendezvous::<FakeSocket>::new();
        let (_t1, mut rx1) = rendezvous.register(guid(8), "203.0.113.5");
        let (_t2, mut rx2) = rendezvous.register(guid(9), "10.1.2.3");

        let observers = rendezvous.drain_all();
        assert_eq!(observers.len(), 2);
        for observer in observers {
            observer.send(PushSignal::Shutdown).ok();
        }
        assert!(matches!(rx1.try_recv().unwrap(), PushSignal::Shutdown));
        assert!(matches!(rx2.try_recv().unwrap(), PushSignal::Shutdown));
        assert_eq!(rendezvous.pending_count(), 0);
    }

    #[test]
    fn test_unverifiable_addresses() {
        assert!(is_unverifiable_addr("192.168.1.5"));
        assert!(is_unverifiable_addr("10.0.0.1:6346"));
        assert!(is_unverifiable_addr("169.254.10.1"));
        assert!(is_unverifiable_addr("127.0.0.1"));
        assert!(is_unverifiable_addr("0.0.0.0"));
        assert!(is_unverifiable_addr("not-an-address"));
        assert!(!is_unverifiable_addr("203.0.113.5"));
        assert!(!is_unverifiable_addr("203.0.113.5:6346"));
    }
}
