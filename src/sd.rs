//! # Service Discovery State Machine
//!
//! Consumes parsed SD messages and maintains the peer and subscriber
//! registries. Handlers mutate registry state and return [`Action`] values
//! for the reactor to execute; they never touch a socket themselves, which
//! keeps every transition unit-testable.
//!
//! | Entry | Direction | Effect here |
//! |-------|-----------|-------------|
//! | `OfferService` (ttl>0) | in | upsert peer, renew subscriptions |
//! | `OfferService` (ttl=0) | in | drop peer |
//! | `FindService` | in | answer with unicast offers |
//! | `SubscribeEventgroup` (ttl>0) | in | admit subscriber, ack |
//! | `SubscribeEventgroup` (ttl=0) | in | drop subscriber |
//! | `SubscribeEventgroupAck` | in | mark local subscription acked/failed |

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Buf;
use tokio::time::Instant;

use crate::config::{SdTiming, Transport};
use crate::registry::{
    Endpoint, OfferTable, OfferedService, Peer, PeerRegistry, Subscriber, SubscriberRegistry,
    SubscriptionTable,
};
use crate::wire::{
    Header, L4Protocol, SdEntry, SdEntryType, SdMessage, SdOption, SD_METHOD_ID, SD_SERVICE_ID,
};

/// Side effect for the reactor to execute after a handler ran.
///
/// Unicast SD replies are not sent inline; the reactor delays them by the
/// configured `request_response_delay_ms`.
#[derive(Debug)]
pub enum Action {
    SendSd {
        iface: usize,
        target: SocketAddr,
        message: SdMessage,
    },
}

/// Interface filter of one required service: offers for it are accepted
/// only from these interfaces (empty means all)
#[derive(Debug, Clone)]
pub struct RequiredSpec {
    pub service_id: u16,
    pub find_on: Vec<usize>,
}

/// Borrowed view of the registries the SD handlers operate on
pub struct SdContext<'a> {
    pub peers: &'a PeerRegistry,
    pub offers: &'a OfferTable,
    pub subscribers: &'a SubscriberRegistry,
    pub subscriptions: &'a SubscriptionTable,
    pub required: &'a [RequiredSpec],
    pub timing: &'a SdTiming,
}

// ============================================================================
// SD SESSION COUNTERS
// ============================================================================

/// SD session-id counters, one per channel. The reboot flag stays set
/// until the counter wraps for the first time.
#[derive(Debug)]
pub struct SdSessions {
    multicast: u16,
    unicast: u16,
    multicast_wrapped: bool,
    unicast_wrapped: bool,
}

impl Default for SdSessions {
    fn default() -> Self {
        Self {
            multicast: 1,
            unicast: 1,
            multicast_wrapped: false,
            unicast_wrapped: false,
        }
    }
}

impl SdSessions {
    pub fn next_multicast(&mut self) -> u16 {
        let id = self.multicast;
        self.multicast = if id == 0xFFFF {
            self.multicast_wrapped = true;
            1
        } else {
            id + 1
        };
        id
    }

    pub fn next_unicast(&mut self) -> u16 {
        let id = self.unicast;
        self.unicast = if id == 0xFFFF {
            self.unicast_wrapped = true;
            1
        } else {
            id + 1
        };
        id
    }

    /// Flags byte for an outgoing SD message on the given channel
    pub fn flags(&self, unicast: bool) -> u8 {
        let wrapped = if unicast {
            self.unicast_wrapped
        } else {
            self.multicast_wrapped
        };
        let mut flags = 0;
        if unicast {
            flags |= SdMessage::FLAG_UNICAST;
        }
        if !wrapped {
            flags |= SdMessage::FLAG_REBOOT;
        }
        flags
    }
}

// ============================================================================
// INBOUND DISPATCH
// ============================================================================

/// Validate and process one SD message. Entries are handled in order;
/// malformed payloads are dropped whole. Returns the unicast SD replies to
/// send.
pub fn handle_sd_message(
    header: &Header,
    payload: &mut impl Buf,
    from: SocketAddr,
    iface: usize,
    ctx: &SdContext<'_>,
) -> Option<Vec<Action>> {
    if header.service_id != SD_SERVICE_ID || header.method_id != SD_METHOD_ID {
        return None;
    }

    let message = SdMessage::parse(payload)?;
    let mut actions = Vec::new();

    for entry in &message.entries {
        match entry.entry_type {
            SdEntryType::OfferService if entry.is_stop() => {
                handle_stop_offer(entry, iface, ctx);
            }
            SdEntryType::OfferService => {
                handle_offer(entry, &message, from, iface, ctx, &mut actions);
            }
            SdEntryType::FindService => {
                handle_find(entry, from, iface, ctx, &mut actions);
            }
            SdEntryType::SubscribeEventgroup if entry.is_stop() => {
                handle_unsubscribe(entry, &message, from, ctx);
            }
            SdEntryType::SubscribeEventgroup => {
                handle_subscribe(entry, &message, from, iface, ctx, &mut actions);
            }
            SdEntryType::SubscribeEventgroupAck => {
                handle_subscribe_ack(entry, ctx);
            }
        }
    }

    Some(actions)
}

/// OfferService with ttl>0: install or refresh the peer and renew any
/// active subscription for the service unicast to the offer's source.
fn handle_offer(
    entry: &SdEntry,
    message: &SdMessage,
    from: SocketAddr,
    iface: usize,
    ctx: &SdContext<'_>,
    actions: &mut Vec<Action>,
) {
    if let Some(spec) = ctx
        .required
        .iter()
        .find(|spec| spec.service_id == entry.service_id)
    {
        if !spec.find_on.is_empty() && !spec.find_on.contains(&iface) {
            tracing::trace!(
                "Ignoring offer for {:04x}:{:04x} on filtered interface {}",
                entry.service_id,
                entry.instance_id,
                iface
            );
            return;
        }
    }

    let Some((addr, protocol)) = message.any_endpoint_for(entry) else {
        tracing::warn!(
            "OfferService {:04x}:{:04x} from {} carries no endpoint option",
            entry.service_id,
            entry.instance_id,
            from
        );
        return;
    };
    // an unspecified address means "use the sender's"
    let addr = if addr.ip().is_unspecified() {
        SocketAddr::new(from.ip(), addr.port())
    } else {
        addr
    };

    let expires_at = if entry.ttl == SdEntry::TTL_INFINITE {
        None
    } else {
        Some(Instant::now() + Duration::from_secs(u64::from(entry.ttl)))
    };

    let transport = match protocol {
        L4Protocol::Udp => Transport::Udp,
        L4Protocol::Tcp => Transport::Tcp,
    };
    let changed = ctx.peers.upsert(
        entry.service_id,
        entry.instance_id,
        Peer {
            endpoint: Endpoint { addr, transport },
            sd_source: from,
            iface,
            major_version: entry.major_version,
            minor_version: entry.minor,
            expires_at,
        },
    );
    if changed {
        tracing::debug!(
            "Discovered {:04x}:{:04x} v{}.{} at {} ({:?}, ttl={})",
            entry.service_id,
            entry.instance_id,
            entry.major_version,
            entry.minor,
            addr,
            transport,
            entry.ttl
        );
    }

    // subscription renewal rides on offers, not on a timer
    for (eventgroup_id, subscription) in ctx.subscriptions.for_service(entry.service_id) {
        let message = build_subscribe_message(
            entry.service_id,
            subscription.instance_id,
            subscription.major_version,
            eventgroup_id,
            subscription.endpoint,
            subscription.ttl,
            SdMessage::FLAG_UNICAST,
        );
        actions.push(Action::SendSd {
            iface,
            target: from,
            message,
        });
    }
}

/// StopOffer: forget the peer
fn handle_stop_offer(entry: &SdEntry, iface: usize, ctx: &SdContext<'_>) {
    if ctx.peers.remove(entry.service_id, entry.instance_id) {
        tracing::debug!(
            "Peer {:04x}:{:04x} withdrew its offer (iface {})",
            entry.service_id,
            entry.instance_id,
            iface
        );
    }
}

/// FindService: answer with unicast offers for matching local services
fn handle_find(
    entry: &SdEntry,
    from: SocketAddr,
    iface: usize,
    ctx: &SdContext<'_>,
    actions: &mut Vec<Action>,
) {
    let Some(service) = ctx.offers.find(entry.service_id, entry.instance_id, iface) else {
        return;
    };
    let Some(endpoint) = service.endpoint_on(iface) else {
        return;
    };

    tracing::debug!(
        "Answering FindService {:04x}:{:04x} from {}",
        entry.service_id,
        entry.instance_id,
        from
    );
    actions.push(Action::SendSd {
        iface,
        target: from,
        message: build_offer_message(
            &service,
            endpoint,
            SdMessage::FLAG_UNICAST,
            ctx.timing.offer_ttl,
        ),
    });
}

/// SubscribeEventgroup with ttl>0: admit the subscriber and ack. A
/// subscribe for a service this node does not offer on the receiving
/// interface is not ours to answer (subscribes travel multicast in some
/// deployments) and is ignored.
fn handle_subscribe(
    entry: &SdEntry,
    message: &SdMessage,
    from: SocketAddr,
    iface: usize,
    ctx: &SdContext<'_>,
    actions: &mut Vec<Action>,
) {
    let eventgroup_id = entry.eventgroup_id();

    let Some(offered) = ctx.offers.find(entry.service_id, entry.instance_id, iface) else {
        tracing::trace!(
            "Ignoring subscribe for unoffered {:04x}:{:04x} eventgroup {:04x} from {}",
            entry.service_id,
            entry.instance_id,
            eventgroup_id,
            from
        );
        return;
    };

    // subscriber endpoint: the entry's endpoint option, source address as
    // fallback
    let (addr, protocol) = message
        .any_endpoint_for(entry)
        .unwrap_or((from, L4Protocol::Udp));
    let addr = if addr.ip().is_unspecified() {
        SocketAddr::new(from.ip(), addr.port())
    } else {
        addr
    };

    let expires_at = if entry.ttl == SdEntry::TTL_INFINITE {
        None
    } else {
        Some(Instant::now() + Duration::from_secs(u64::from(entry.ttl)))
    };

    let newly_added = ctx.subscribers.add(
        offered.service_id,
        eventgroup_id,
        Subscriber {
            endpoint: addr,
            transport: match protocol {
                L4Protocol::Udp => Transport::Udp,
                L4Protocol::Tcp => Transport::Tcp,
            },
            expires_at,
        },
    );

    // renewals refresh the TTL silently; only a new admission is acked
    if newly_added {
        tracing::debug!(
            "Subscriber {} joined {:04x} eventgroup {:04x} (ttl={})",
            addr,
            entry.service_id,
            eventgroup_id,
            entry.ttl
        );
        let mut ack = SdMessage::new(SdMessage::FLAG_UNICAST);
        ack.add_entry(SdEntry::subscribe_eventgroup_ack(
            entry.service_id,
            entry.instance_id,
            entry.major_version,
            eventgroup_id,
            entry.ttl,
        ));
        actions.push(Action::SendSd {
            iface,
            target: from,
            message: ack,
        });
    }
}

/// SubscribeEventgroup with ttl=0: drop the subscriber
fn handle_unsubscribe(entry: &SdEntry, message: &SdMessage, from: SocketAddr, ctx: &SdContext<'_>) {
    let (addr, _) = message
        .any_endpoint_for(entry)
        .unwrap_or((from, L4Protocol::Udp));
    let addr = if addr.ip().is_unspecified() {
        SocketAddr::new(from.ip(), addr.port())
    } else {
        addr
    };
    if ctx
        .subscribers
        .remove(entry.service_id, entry.eventgroup_id(), addr)
    {
        tracing::debug!(
            "Subscriber {} left {:04x} eventgroup {:04x}",
            addr,
            entry.service_id,
            entry.eventgroup_id()
        );
    }
}

/// SubscribeEventgroupAck: ttl>0 confirms our subscription, ttl=0 rejects
/// it
fn handle_subscribe_ack(entry: &SdEntry, ctx: &SdContext<'_>) {
    let eventgroup_id = entry.eventgroup_id();
    if entry.is_stop() {
        tracing::warn!(
            "Subscription to {:04x} eventgroup {:04x} was nacked",
            entry.service_id,
            eventgroup_id
        );
        ctx.subscriptions
            .set_acked(entry.service_id, eventgroup_id, false);
    } else if ctx
        .subscriptions
        .set_acked(entry.service_id, eventgroup_id, true)
    {
        tracing::debug!(
            "Subscription to {:04x} eventgroup {:04x} acknowledged",
            entry.service_id,
            eventgroup_id
        );
    }
}

// ============================================================================
// MESSAGE BUILDERS
// ============================================================================

/// Offer for one service on one interface: entry plus unicast endpoint
/// option, and the event multicast option when the service has one
pub fn build_offer_message(
    service: &OfferedService,
    endpoint: SocketAddr,
    flags: u8,
    ttl: u32,
) -> SdMessage {
    let mut message = SdMessage::new(flags);
    let first = message.add_option(SdOption::endpoint(endpoint, service.transport.l4()));
    let mut count = 1;
    if let Some(group) = service.multicast {
        message.add_option(SdOption::multicast(group));
        count += 1;
    }
    message.add_entry(SdEntry::offer_service(
        service.service_id,
        service.instance_id,
        service.major_version,
        service.minor_version,
        ttl,
        first,
        count,
    ));
    message
}

/// StopOffer for one service
pub fn build_stop_offer_message(service: &OfferedService, flags: u8) -> SdMessage {
    let mut message = SdMessage::new(flags);
    message.add_entry(SdEntry::stop_offer_service(
        service.service_id,
        service.instance_id,
        service.major_version,
        service.minor_version,
    ));
    message
}

/// FindService for a wanted (service, instance)
pub fn build_find_message(
    service_id: u16,
    instance_id: u16,
    major_version: u8,
    flags: u8,
) -> SdMessage {
    let mut message = SdMessage::new(flags);
    message.add_entry(SdEntry::find_service(
        service_id,
        instance_id,
        major_version,
        0,
        SdEntry::TTL_INFINITE,
    ));
    message
}

/// SubscribeEventgroup (or stop-subscribe with ttl=0) advertising our
/// local event endpoint
pub fn build_subscribe_message(
    service_id: u16,
    instance_id: u16,
    major_version: u8,
    eventgroup_id: u16,
    local_endpoint: SocketAddr,
    ttl: u32,
    flags: u8,
) -> SdMessage {
    let mut message = SdMessage::new(flags);
    let option = message.add_option(SdOption::endpoint(local_endpoint, L4Protocol::Udp));
    message.add_entry(SdEntry::subscribe_eventgroup(
        service_id,
        instance_id,
        major_version,
        eventgroup_id,
        ttl,
        option,
        1,
    ));
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalSubscription;
    use crate::wire::{MessageType, PROTOCOL_VERSION};

    struct Fixture {
        peers: PeerRegistry,
        offers: OfferTable,
        subscribers: SubscriberRegistry,
        subscriptions: SubscriptionTable,
        required: Vec<RequiredSpec>,
        timing: SdTiming,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                peers: PeerRegistry::default(),
                offers: OfferTable::default(),
                subscribers: SubscriberRegistry::default(),
                subscriptions: SubscriptionTable::default(),
                required: Vec::new(),
                timing: SdTiming::default(),
            }
        }

        fn ctx(&self) -> SdContext<'_> {
            SdContext {
                peers: &self.peers,
                offers: &self.offers,
                subscribers: &self.subscribers,
                subscriptions: &self.subscriptions,
                required: &self.required,
                timing: &self.timing,
            }
        }

        fn offer_locally(&self, service_id: u16) -> OfferedService {
            let service = OfferedService {
                service_id,
                instance_id: 1,
                major_version: 1,
                minor_version: 0,
                transport: Transport::Udp,
                multicast: None,
                endpoints: vec![(0, "10.0.1.1:40000".parse().unwrap())],
            };
            self.offers
                .insert(service.clone(), Duration::from_millis(1000));
            service
        }
    }

    fn sd_header(payload_len: usize) -> Header {
        Header {
            service_id: SD_SERVICE_ID,
            method_id: SD_METHOD_ID,
            length: payload_len as u32 + 8,
            client_id: 0,
            session_id: 1,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 1,
            message_type: MessageType::Notification,
            return_code: 0,
        }
    }

    fn feed(
        fixture: &Fixture,
        message: &SdMessage,
        from: SocketAddr,
        iface: usize,
    ) -> Vec<Action> {
        let payload = message.serialize_payload();
        handle_sd_message(
            &sd_header(payload.len()),
            &mut payload.clone(),
            from,
            iface,
            &fixture.ctx(),
        )
        .expect("valid SD message")
    }

    fn offer_from_peer(service_id: u16, endpoint: &str, ttl: u32) -> SdMessage {
        let mut message = SdMessage::new(0);
        let opt = message.add_option(SdOption::endpoint(
            endpoint.parse().unwrap(),
            L4Protocol::Udp,
        ));
        message.add_entry(SdEntry::offer_service(service_id, 1, 1, 0, ttl, opt, 1));
        message
    }

    #[test_log::test]
    fn offer_installs_peer_and_stop_offer_removes_it() {
        let fixture = Fixture::new();
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();

        let actions = feed(
            &fixture,
            &offer_from_peer(0x4000, "10.0.1.9:40500", 3600),
            source,
            0,
        );
        assert!(actions.is_empty());

        let peer = fixture.peers.lookup(0x4000, 0xFFFF).unwrap();
        assert_eq!(peer.endpoint.addr, "10.0.1.9:40500".parse().unwrap());
        assert_eq!(peer.endpoint.transport, Transport::Udp);
        assert_eq!(peer.sd_source, source);
        assert!(peer.expires_at.is_some());

        let mut stop = SdMessage::new(0);
        stop.add_entry(SdEntry::stop_offer_service(0x4000, 1, 1, 0));
        feed(&fixture, &stop, source, 0);
        assert!(fixture.peers.lookup(0x4000, 0xFFFF).is_none());
    }

    #[test_log::test]
    fn offer_with_unspecified_address_uses_the_source() {
        let fixture = Fixture::new();
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();

        feed(
            &fixture,
            &offer_from_peer(0x4000, "0.0.0.0:40500", 3600),
            source,
            0,
        );
        let peer = fixture.peers.lookup(0x4000, 1).unwrap();
        assert_eq!(peer.endpoint.addr, "10.0.1.9:40500".parse().unwrap());
    }

    #[test_log::test]
    fn offer_without_endpoint_option_is_ignored() {
        let fixture = Fixture::new();
        let mut message = SdMessage::new(0);
        message.add_entry(SdEntry::offer_service(0x4000, 1, 1, 0, 3600, 0, 0));

        feed(&fixture, &message, "10.0.1.9:30490".parse().unwrap(), 0);
        assert!(fixture.peers.lookup(0x4000, 0xFFFF).is_none());
    }

    #[test_log::test]
    fn find_on_filter_rejects_other_interfaces() {
        let mut fixture = Fixture::new();
        fixture.required = vec![RequiredSpec {
            service_id: 0x4000,
            find_on: vec![1],
        }];
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();

        feed(
            &fixture,
            &offer_from_peer(0x4000, "10.0.1.9:40500", 3600),
            source,
            0,
        );
        assert!(fixture.peers.lookup(0x4000, 0xFFFF).is_none());

        feed(
            &fixture,
            &offer_from_peer(0x4000, "10.0.1.9:40500", 3600),
            source,
            1,
        );
        assert!(fixture.peers.lookup(0x4000, 0xFFFF).is_some());
    }

    #[test_log::test]
    fn find_service_is_answered_with_unicast_offer() {
        let fixture = Fixture::new();
        fixture.offer_locally(0x1001);
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();

        let mut find = SdMessage::new(0);
        find.add_entry(SdEntry::find_service(0x1001, 0xFFFF, 1, 0, 3600));

        let actions = feed(&fixture, &find, source, 0);
        assert_eq!(actions.len(), 1);
        let Action::SendSd {
            iface,
            target,
            message,
        } = &actions[0];
        assert_eq!(*iface, 0);
        assert_eq!(*target, source);
        assert_eq!(message.entries.len(), 1);
        assert_eq!(message.entries[0].entry_type, SdEntryType::OfferService);
        assert_eq!(
            message.any_endpoint_for(&message.entries[0]),
            Some(("10.0.1.1:40000".parse().unwrap(), L4Protocol::Udp))
        );

        // a find for a service this node does not offer stays unanswered
        let mut other = SdMessage::new(0);
        other.add_entry(SdEntry::find_service(0x9999, 0xFFFF, 1, 0, 3600));
        assert!(feed(&fixture, &other, source, 0).is_empty());
    }

    #[test_log::test]
    fn subscribe_admits_once_and_acks_once() {
        let fixture = Fixture::new();
        fixture.offer_locally(0x3000);
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();

        let subscribe = build_subscribe_message(
            0x3000,
            1,
            1,
            0x0001,
            "10.0.1.9:40600".parse().unwrap(),
            300,
            0,
        );

        let actions = feed(&fixture, &subscribe, source, 0);
        assert_eq!(actions.len(), 1);
        let Action::SendSd { target, message, .. } = &actions[0];
        assert_eq!(*target, source);
        let ack = &message.entries[0];
        assert_eq!(ack.entry_type, SdEntryType::SubscribeEventgroupAck);
        assert_eq!(ack.eventgroup_id(), 0x0001);
        assert_eq!(ack.ttl, 300);

        let subscribers = fixture.subscribers.snapshot(0x3000, 0x0001);
        assert_eq!(subscribers.len(), 1);
        assert_eq!(
            subscribers[0].endpoint,
            "10.0.1.9:40600".parse::<SocketAddr>().unwrap()
        );

        // duplicate subscribe refreshes the TTL without a second entry or
        // a second ack
        let actions = feed(&fixture, &subscribe, source, 0);
        assert!(actions.is_empty());
        assert_eq!(fixture.subscribers.snapshot(0x3000, 0x0001).len(), 1);
    }

    #[test_log::test]
    fn subscribe_for_unoffered_service_is_ignored() {
        let fixture = Fixture::new();
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();

        let subscribe = build_subscribe_message(
            0x3000,
            1,
            1,
            0x0001,
            "10.0.1.9:40600".parse().unwrap(),
            300,
            0,
        );
        let actions = feed(&fixture, &subscribe, source, 0);
        assert!(actions.is_empty());
        assert!(fixture.subscribers.snapshot(0x3000, 0x0001).is_empty());
    }

    #[test_log::test]
    fn unsubscribe_removes_the_subscriber() {
        let fixture = Fixture::new();
        fixture.offer_locally(0x3000);
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();
        let endpoint = "10.0.1.9:40600";

        feed(
            &fixture,
            &build_subscribe_message(0x3000, 1, 1, 1, endpoint.parse().unwrap(), 300, 0),
            source,
            0,
        );
        assert_eq!(fixture.subscribers.snapshot(0x3000, 1).len(), 1);

        feed(
            &fixture,
            &build_subscribe_message(0x3000, 1, 1, 1, endpoint.parse().unwrap(), 0, 0),
            source,
            0,
        );
        assert!(fixture.subscribers.snapshot(0x3000, 1).is_empty());
    }

    #[test_log::test]
    fn ack_and_nack_update_local_subscription_state() {
        let fixture = Fixture::new();
        fixture.subscriptions.insert(
            0x3000,
            1,
            LocalSubscription {
                instance_id: 1,
                major_version: 1,
                ttl: 300,
                endpoint: "10.0.1.1:40600".parse().unwrap(),
                acked: false,
            },
        );

        let mut ack = SdMessage::new(0);
        ack.add_entry(SdEntry::subscribe_eventgroup_ack(0x3000, 1, 1, 1, 300));
        feed(&fixture, &ack, "10.0.1.9:30490".parse().unwrap(), 0);
        assert!(fixture.subscriptions.is_acked(0x3000, 1));

        let mut nack = SdMessage::new(0);
        nack.add_entry(SdEntry::subscribe_eventgroup_nack(0x3000, 1, 1, 1));
        feed(&fixture, &nack, "10.0.1.9:30490".parse().unwrap(), 0);
        assert!(!fixture.subscriptions.is_acked(0x3000, 1));
    }

    #[test_log::test]
    fn offer_triggers_subscription_renewal() {
        let fixture = Fixture::new();
        fixture.subscriptions.insert(
            0x4000,
            2,
            LocalSubscription {
                instance_id: 1,
                major_version: 1,
                ttl: 300,
                endpoint: "10.0.1.1:40600".parse().unwrap(),
                acked: true,
            },
        );
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();

        let actions = feed(
            &fixture,
            &offer_from_peer(0x4000, "10.0.1.9:40500", 3600),
            source,
            0,
        );
        assert_eq!(actions.len(), 1);
        let Action::SendSd { target, message, .. } = &actions[0];
        assert_eq!(*target, source);
        let entry = &message.entries[0];
        assert_eq!(entry.entry_type, SdEntryType::SubscribeEventgroup);
        assert_eq!(entry.eventgroup_id(), 2);
        assert_eq!(entry.ttl, 300);
    }

    #[test_log::test]
    fn entries_within_one_message_are_processed_in_order() {
        let fixture = Fixture::new();
        let source: SocketAddr = "10.0.1.9:30490".parse().unwrap();

        // offer then stop-offer in the same message: the stop wins
        let mut message = SdMessage::new(0);
        let opt = message.add_option(SdOption::endpoint(
            "10.0.1.9:40500".parse().unwrap(),
            L4Protocol::Udp,
        ));
        message.add_entry(SdEntry::offer_service(0x4000, 1, 1, 0, 3600, opt, 1));
        message.add_entry(SdEntry::stop_offer_service(0x4000, 1, 1, 0));

        feed(&fixture, &message, source, 0);
        assert!(fixture.peers.lookup(0x4000, 0xFFFF).is_none());
    }

    #[test_log::test]
    fn sd_session_counters_wrap_and_clear_reboot_flag() {
        let mut sessions = SdSessions::default();
        assert_eq!(sessions.next_multicast(), 1);
        assert!(sessions.flags(false) & SdMessage::FLAG_REBOOT != 0);
        assert!(sessions.flags(true) & SdMessage::FLAG_UNICAST != 0);

        for _ in 1..0xFFFF {
            sessions.next_multicast();
        }
        assert_eq!(sessions.next_multicast(), 1);
        assert!(sessions.flags(false) & SdMessage::FLAG_REBOOT == 0);
        // the unicast channel has its own counter and flag
        assert!(sessions.flags(true) & SdMessage::FLAG_REBOOT != 0);
    }
}
