//! Shared protocol state: peers discovered via SD, locally offered
//! services with their cyclic-offer schedule, remote subscribers, local
//! subscriptions and in-flight requests.
//!
//! Each registry guards its map with its own mutex. Callers never hold a
//! lock across an I/O call; anything that is iterated while sending
//! (subscriber lists, offer tables) is snapshotted first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::Transport;

/// A resolved unicast endpoint of a remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub transport: Transport,
}

// ============================================================================
// PEER REGISTRY
// ============================================================================

/// A remote (service, instance) learned from an OfferService entry
#[derive(Debug, Clone)]
pub struct Peer {
    pub endpoint: Endpoint,
    /// Source address of the SD datagram; Subscribe entries go back here
    pub sd_source: SocketAddr,
    /// Interface the offer arrived on
    pub iface: usize,
    pub major_version: u8,
    pub minor_version: u32,
    /// None for infinite TTL
    pub expires_at: Option<Instant>,
}

/// (service_id, instance_id) -> resolved endpoint, maintained by the SD
/// state machine
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<HashMap<(u16, u16), Peer>>,
}

impl PeerRegistry {
    /// Insert or refresh a peer. Returns true when the endpoint changed
    /// (new peer or moved), which is the only case worth logging.
    pub fn upsert(&self, service_id: u16, instance_id: u16, peer: Peer) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.insert((service_id, instance_id), peer.clone()) {
            Some(previous) => previous.endpoint != peer.endpoint,
            None => true,
        }
    }

    pub fn remove(&self, service_id: u16, instance_id: u16) -> bool {
        self.inner
            .lock()
            .unwrap()
            .remove(&(service_id, instance_id))
            .is_some()
    }

    /// Look up a peer; instance 0xFFFF matches any instance of the service
    pub fn lookup(&self, service_id: u16, instance_id: u16) -> Option<Peer> {
        let inner = self.inner.lock().unwrap();
        if instance_id != 0xFFFF {
            return inner.get(&(service_id, instance_id)).cloned();
        }
        inner
            .iter()
            .filter(|((sid, _), _)| *sid == service_id)
            .map(|(_, peer)| peer.clone())
            .next()
    }

    /// Drop peers whose TTL elapsed; returns the removed keys
    pub fn expire(&self, now: Instant) -> Vec<(u16, u16)> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<(u16, u16)> = inner
            .iter()
            .filter(|(_, peer)| peer.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired
    }

    /// Earliest TTL deadline, for the reactor wakeup calculation
    pub fn next_expiry(&self) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter_map(|peer| peer.expires_at)
            .min()
    }
}

// ============================================================================
// LOCAL OFFER TABLE
// ============================================================================

/// Immutable identity of a locally offered service
#[derive(Debug, Clone)]
pub struct OfferedService {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
    pub transport: Transport,
    /// Event multicast group advertised alongside the unicast endpoint
    pub multicast: Option<SocketAddr>,
    /// Actually-bound RPC endpoint per interface index
    pub endpoints: Vec<(usize, SocketAddr)>,
}

impl OfferedService {
    pub fn endpoint_on(&self, iface: usize) -> Option<SocketAddr> {
        self.endpoints
            .iter()
            .find(|(i, _)| *i == iface)
            .map(|(_, addr)| *addr)
    }
}

struct OfferSlot {
    service: OfferedService,
    cycle: Duration,
    next_offer: Instant,
}

/// Locally offered services with per-entry cyclic-offer scheduling
#[derive(Default)]
pub struct OfferTable {
    inner: Mutex<Vec<OfferSlot>>,
}

impl OfferTable {
    /// Register a service; the first cyclic offer is due immediately
    pub fn insert(&self, service: OfferedService, cycle: Duration) {
        self.inner.lock().unwrap().push(OfferSlot {
            service,
            cycle,
            next_offer: Instant::now(),
        });
    }

    /// Services whose offer is due; reschedules them one cycle ahead
    pub fn take_due(&self, now: Instant) -> Vec<OfferedService> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        for slot in inner.iter_mut() {
            if slot.next_offer <= now {
                slot.next_offer = now + slot.cycle;
                due.push(slot.service.clone());
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.next_offer)
            .min()
    }

    /// Snapshot of every offered service (StopOffer emission at shutdown)
    pub fn snapshot(&self) -> Vec<OfferedService> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.service.clone())
            .collect()
    }

    /// The service offered as (service_id, instance_id) on an interface;
    /// instance 0xFFFF matches any
    pub fn find(&self, service_id: u16, instance_id: u16, iface: usize) -> Option<OfferedService> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|slot| &slot.service)
            .find(|service| {
                service.service_id == service_id
                    && (instance_id == 0xFFFF || service.instance_id == instance_id)
                    && service.endpoint_on(iface).is_some()
            })
            .cloned()
    }

    /// Any offered entry for a service id, regardless of interface
    pub fn lookup_service(&self, service_id: u16) -> Option<OfferedService> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|slot| &slot.service)
            .find(|service| service.service_id == service_id)
            .cloned()
    }

}

// ============================================================================
// REMOTE SUBSCRIBERS
// ============================================================================

/// A peer endpoint subscribed to one of our eventgroups
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub endpoint: SocketAddr,
    pub transport: Transport,
    /// None for infinite TTL
    pub expires_at: Option<Instant>,
}

/// (service_id, eventgroup_id) -> subscribed peer endpoints
#[derive(Default)]
pub struct SubscriberRegistry {
    inner: Mutex<HashMap<(u16, u16), Vec<Subscriber>>>,
}

impl SubscriberRegistry {
    /// Add or refresh a subscriber, deduplicating by endpoint address.
    /// Returns true when the subscriber is new (only new admissions are
    /// acknowledged with a fresh Ack).
    pub fn add(&self, service_id: u16, eventgroup_id: u16, subscriber: Subscriber) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let subscribers = inner.entry((service_id, eventgroup_id)).or_default();
        match subscribers
            .iter_mut()
            .find(|existing| existing.endpoint == subscriber.endpoint)
        {
            Some(existing) => {
                existing.expires_at = subscriber.expires_at;
                existing.transport = subscriber.transport;
                false
            }
            None => {
                subscribers.push(subscriber);
                true
            }
        }
    }

    pub fn remove(&self, service_id: u16, eventgroup_id: u16, endpoint: SocketAddr) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(subscribers) = inner.get_mut(&(service_id, eventgroup_id)) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.endpoint != endpoint);
        let removed = subscribers.len() < before;
        if subscribers.is_empty() {
            inner.remove(&(service_id, eventgroup_id));
        }
        removed
    }

    /// Copy of the subscriber list; the fan-out path sends without holding
    /// the registry lock
    pub fn snapshot(&self, service_id: u16, eventgroup_id: u16) -> Vec<Subscriber> {
        self.inner
            .lock()
            .unwrap()
            .get(&(service_id, eventgroup_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribers across every eventgroup of a service, deduplicated by
    /// endpoint. Notification fan-out sends each subscriber one copy.
    pub fn snapshot_service(&self, service_id: u16) -> Vec<Subscriber> {
        let inner = self.inner.lock().unwrap();
        let mut seen = Vec::new();
        let mut result: Vec<Subscriber> = Vec::new();
        for ((sid, _), subscribers) in inner.iter() {
            if *sid != service_id {
                continue;
            }
            for subscriber in subscribers {
                if !seen.contains(&subscriber.endpoint) {
                    seen.push(subscriber.endpoint);
                    result.push(subscriber.clone());
                }
            }
        }
        result
    }

    pub fn expire(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;
        inner.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| !s.expires_at.is_some_and(|at| at <= now));
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        removed
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .flatten()
            .filter_map(|subscriber| subscriber.expires_at)
            .min()
    }
}

// ============================================================================
// LOCAL SUBSCRIPTIONS
// ============================================================================

/// Our subscription to a remote eventgroup
#[derive(Debug, Clone)]
pub struct LocalSubscription {
    pub instance_id: u16,
    pub major_version: u8,
    pub ttl: u32,
    /// Local unicast endpoint advertised in the Subscribe entry
    pub endpoint: SocketAddr,
    /// Set by SubscribeEventgroupAck, cleared by a nack
    pub acked: bool,
}

/// (service_id, eventgroup_id) -> subscription state
#[derive(Default)]
pub struct SubscriptionTable {
    inner: Mutex<HashMap<(u16, u16), LocalSubscription>>,
}

impl SubscriptionTable {
    pub fn insert(&self, service_id: u16, eventgroup_id: u16, subscription: LocalSubscription) {
        self.inner
            .lock()
            .unwrap()
            .insert((service_id, eventgroup_id), subscription);
    }

    pub fn remove(&self, service_id: u16, eventgroup_id: u16) -> Option<LocalSubscription> {
        self.inner
            .lock()
            .unwrap()
            .remove(&(service_id, eventgroup_id))
    }

    pub fn set_acked(&self, service_id: u16, eventgroup_id: u16, acked: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&(service_id, eventgroup_id)) {
            Some(subscription) => {
                subscription.acked = acked;
                true
            }
            None => false,
        }
    }

    pub fn is_acked(&self, service_id: u16, eventgroup_id: u16) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(&(service_id, eventgroup_id))
            .is_some_and(|subscription| subscription.acked)
    }

    /// Subscriptions for a service, for offer-triggered renewal
    pub fn for_service(&self, service_id: u16) -> Vec<(u16, LocalSubscription)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|((sid, _), _)| *sid == service_id)
            .map(|((_, eventgroup), subscription)| (*eventgroup, subscription.clone()))
            .collect()
    }
}

// ============================================================================
// PENDING REQUESTS
// ============================================================================

/// Response delivered through a pending-request slot
#[derive(Debug, Clone)]
pub struct Response {
    pub return_code: u8,
    pub payload: Bytes,
}

/// One-shot slots for in-flight requests, keyed by
/// (service_id, method_id, session_id)
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<(u16, u16, u16), oneshot::Sender<Response>>>,
}

impl PendingRequests {
    pub fn insert(
        &self,
        service_id: u16,
        method_id: u16,
        session_id: u16,
    ) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .insert((service_id, method_id, session_id), tx);
        rx
    }

    /// Fulfill a slot. A response with no matching slot (late, duplicate or
    /// cancelled) is discarded and reported as false.
    pub fn complete(
        &self,
        service_id: u16,
        method_id: u16,
        session_id: u16,
        response: Response,
    ) -> bool {
        let slot = self
            .inner
            .lock()
            .unwrap()
            .remove(&(service_id, method_id, session_id));
        match slot {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Cancel a slot (timeout path)
    pub fn remove(&self, service_id: u16, method_id: u16, session_id: u16) {
        self.inner
            .lock()
            .unwrap()
            .remove(&(service_id, method_id, session_id));
    }

    /// Drop every slot; parked callers observe the closed channel as a
    /// shutdown error
    pub fn fail_all(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            addr: SocketAddr::from(([10, 0, 1, 1], port)),
            transport: Transport::Udp,
        }
    }

    fn peer(port: u16, expires_at: Option<Instant>) -> Peer {
        Peer {
            endpoint: endpoint(port),
            sd_source: SocketAddr::from(([10, 0, 1, 1], 30490)),
            iface: 0,
            major_version: 1,
            minor_version: 0,
            expires_at,
        }
    }

    #[test_log::test]
    fn peer_upsert_reports_endpoint_changes_only() {
        let peers = PeerRegistry::default();
        assert!(peers.upsert(0x1001, 1, peer(40000, None)));
        assert!(!peers.upsert(0x1001, 1, peer(40000, None)));
        assert!(peers.upsert(0x1001, 1, peer(40001, None)));
    }

    #[test_log::test]
    fn peer_lookup_honors_any_instance() {
        let peers = PeerRegistry::default();
        peers.upsert(0x1001, 2, peer(40000, None));

        assert!(peers.lookup(0x1001, 2).is_some());
        assert!(peers.lookup(0x1001, 1).is_none());
        assert!(peers.lookup(0x1001, 0xFFFF).is_some());
        assert!(peers.lookup(0x1002, 0xFFFF).is_none());

        assert!(peers.remove(0x1001, 2));
        assert!(peers.lookup(0x1001, 0xFFFF).is_none());
    }

    #[tokio::test]
    async fn peer_ttl_expiry() {
        let peers = PeerRegistry::default();
        let now = Instant::now();
        peers.upsert(0x1001, 1, peer(40000, Some(now + Duration::from_secs(3))));
        peers.upsert(0x1002, 1, peer(40001, None));

        assert!(peers.expire(now).is_empty());
        assert_eq!(peers.next_expiry(), Some(now + Duration::from_secs(3)));

        let expired = peers.expire(now + Duration::from_secs(4));
        assert_eq!(expired, vec![(0x1001, 1)]);
        assert!(peers.lookup(0x1001, 0xFFFF).is_none());
        // infinite TTL survives
        assert!(peers.lookup(0x1002, 1).is_some());
    }

    #[test_log::test]
    fn subscriber_dedupe_by_endpoint() {
        let subscribers = SubscriberRegistry::default();
        let addr: SocketAddr = "10.0.1.2:40500".parse().unwrap();
        let subscriber = Subscriber {
            endpoint: addr,
            transport: Transport::Udp,
            expires_at: None,
        };

        assert!(subscribers.add(0x3000, 1, subscriber.clone()));
        assert!(!subscribers.add(0x3000, 1, subscriber));
        assert_eq!(subscribers.snapshot(0x3000, 1).len(), 1);

        assert!(subscribers.remove(0x3000, 1, addr));
        assert!(subscribers.snapshot(0x3000, 1).is_empty());
    }

    #[tokio::test]
    async fn subscriber_ttl_expiry() {
        let subscribers = SubscriberRegistry::default();
        let now = Instant::now();
        subscribers.add(
            0x3000,
            1,
            Subscriber {
                endpoint: "10.0.1.2:40500".parse().unwrap(),
                transport: Transport::Udp,
                expires_at: Some(now + Duration::from_secs(3)),
            },
        );

        assert_eq!(subscribers.expire(now), 0);
        assert_eq!(subscribers.expire(now + Duration::from_secs(3)), 1);
        assert!(subscribers.snapshot(0x3000, 1).is_empty());
    }

    #[test_log::test]
    fn offer_table_schedules_cyclic_offers() {
        let offers = OfferTable::default();
        let service = OfferedService {
            service_id: 0x1001,
            instance_id: 1,
            major_version: 1,
            minor_version: 0,
            transport: Transport::Udp,
            multicast: None,
            endpoints: vec![(0, "10.0.1.1:40000".parse().unwrap())],
        };
        offers.insert(service, Duration::from_millis(100));

        // initial offer is due immediately, then one cycle later
        let now = Instant::now();
        assert_eq!(offers.take_due(now).len(), 1);
        assert!(offers.take_due(now).is_empty());
        assert_eq!(
            offers.take_due(now + Duration::from_millis(150)).len(),
            1
        );

        assert!(offers.find(0x1001, 1, 0).is_some());
        assert!(offers.find(0x1001, 0xFFFF, 0).is_some());
        assert!(offers.find(0x1001, 2, 0).is_none());
        assert!(offers.find(0x1001, 1, 9).is_none());
        assert!(offers.lookup_service(0x1001).is_some());
    }

    #[tokio::test]
    async fn pending_requests_complete_and_cancel() {
        let pending = PendingRequests::default();

        let rx = pending.insert(0x1001, 1, 42);
        assert_eq!(pending.len(), 1);
        assert!(pending.complete(
            0x1001,
            1,
            42,
            Response {
                return_code: 0,
                payload: Bytes::from_static(b"ok"),
            }
        ));
        assert!(pending.is_empty());
        assert_eq!(rx.await.unwrap().payload, Bytes::from_static(b"ok"));

        // completing an unknown slot is a no-op
        assert!(!pending.complete(
            0x1001,
            1,
            42,
            Response {
                return_code: 0,
                payload: Bytes::new(),
            }
        ));

        // cancelled slot discards the late response
        let rx = pending.insert(0x1001, 1, 43);
        pending.remove(0x1001, 1, 43);
        assert!(pending.is_empty());
        drop(rx);
    }
}
