//! # Runtime
//!
//! Construction wires the interface table, spawns one reader task per
//! socket and the reactor task, then hands back a [`Runtime`] whose
//! methods are the public operations: offer a service, create a client
//! proxy, send requests and notifications, manage eventgroup
//! subscriptions.
//!
//! Blocking operations (`send_request`, `wait_for_service`,
//! `create_client`) suspend the calling task and never the reactor; their
//! deadline is the configured `request_timeout_ms`. Everything else
//! enqueues and returns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Config, EndpointConfig, InstanceConfig, SdTiming, Transport};
use crate::error::{ConfigError, Error, Result};
use crate::iface::{offer_endpoint_name, offers_on, InterfaceTable};
use crate::reactor::{self, Command, Inbound, SdTarget, TcpPool};
use crate::registry::{
    Endpoint, LocalSubscription, OfferTable, OfferedService, Peer, PeerRegistry, PendingRequests,
    Response, SubscriberRegistry, SubscriptionTable,
};
use crate::sd::{self, RequiredSpec, SdContext};
use crate::session::SessionRegistry;
use crate::wire::{build_message, Header, MessageType, PROTOCOL_VERSION};
use crate::{Event, RequestHandler};

/// State shared between the public API, the reactor and the reader tasks
pub(crate) struct Shared {
    pub(crate) timing: SdTiming,
    pub(crate) ifaces: InterfaceTable,
    pub(crate) peers: PeerRegistry,
    pub(crate) offers: OfferTable,
    pub(crate) subscribers: SubscriberRegistry,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) pending: PendingRequests,
    pub(crate) sessions: SessionRegistry,
    pub(crate) handlers: Mutex<HashMap<u16, Arc<dyn RequestHandler>>>,
    pub(crate) listeners: Mutex<HashMap<u16, Vec<mpsc::Sender<Event>>>>,
    pub(crate) required: Vec<RequiredSpec>,
    pub(crate) tcp_pool: TcpPool,
    malformed: AtomicU64,
}

impl Shared {
    pub(crate) fn sd_context(&self) -> SdContext<'_> {
        SdContext {
            peers: &self.peers,
            offers: &self.offers,
            subscribers: &self.subscribers,
            subscriptions: &self.subscriptions,
            required: &self.required,
            timing: &self.timing,
        }
    }

    pub(crate) fn count_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Events received through a subscription
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Next event; `None` once the runtime has shut down
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// The SOME/IP runtime for one configured instance
pub struct Runtime {
    shared: Arc<Shared>,
    command_tx: mpsc::Sender<Command>,
    config: Config,
    instance: InstanceConfig,
    reactor: Option<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build the runtime for `instance_name`: bind every socket the
    /// instance needs and start the reactor. Socket setup failures are
    /// fatal here. Must be called within a tokio runtime.
    pub fn new(config: Config, instance_name: &str) -> Result<Self> {
        let instance = config.instance(instance_name)?.clone();
        let timing = config.sd_timing(&instance);
        let ifaces = InterfaceTable::bind(&config, &instance, &timing)?;

        let required = instance
            .required
            .values()
            .map(|req| RequiredSpec {
                service_id: req.service_id,
                find_on: req
                    .find_on
                    .iter()
                    .filter_map(|alias| ifaces.by_alias(alias).map(|context| context.index))
                    .collect(),
            })
            .collect();

        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(256);
        let (command_tx, command_rx) = mpsc::channel::<Command>(64);

        let shared = Arc::new(Shared {
            timing,
            ifaces,
            peers: PeerRegistry::default(),
            offers: OfferTable::default(),
            subscribers: SubscriberRegistry::default(),
            subscriptions: SubscriptionTable::default(),
            pending: PendingRequests::default(),
            sessions: SessionRegistry::new(),
            handlers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            required,
            tcp_pool: TcpPool::new(inbound_tx.clone()),
            malformed: AtomicU64::new(0),
        });

        let mut readers = Vec::new();
        for context in &shared.ifaces.contexts {
            for endpoint in &context.udp {
                readers.push(tokio::spawn(reactor::udp_reader(
                    endpoint.socket.clone(),
                    inbound_tx.clone(),
                )));
            }
            for endpoint in &context.tcp {
                readers.push(tokio::spawn(reactor::tcp_acceptor(
                    endpoint.listener.clone(),
                    inbound_tx.clone(),
                )));
            }
            for sd_socket in [&context.sd_v4, &context.sd_v6].into_iter().flatten() {
                readers.push(tokio::spawn(reactor::sd_reader(
                    context.index,
                    sd_socket.socket.clone(),
                    inbound_tx.clone(),
                )));
            }
        }

        for context in &shared.ifaces.contexts {
            tracing::info!(
                "Interface '{}' ready ({}, ifindex {})",
                context.alias,
                context.os_name,
                context.ifindex
            );
        }

        let reactor = tokio::spawn(reactor::run(shared.clone(), inbound_rx, command_rx));

        let runtime = Self {
            shared,
            command_tx,
            config,
            instance,
            reactor: Some(reactor),
            readers,
        };
        runtime.seed_static_peers();
        Ok(runtime)
    }

    /// Load the configuration file and build the runtime
    pub fn from_file(path: impl AsRef<std::path::Path>, instance_name: &str) -> Result<Self> {
        let config = Config::load(path)?;
        Self::new(config, instance_name)
    }

    /// Required services with a static endpoint skip discovery entirely
    fn seed_static_peers(&self) {
        for req in self.instance.required.values() {
            let Some(name) = &req.endpoint else { continue };
            let Some(endpoint) = self.find_endpoint(name) else {
                tracing::warn!("Static endpoint '{}' is not defined", name);
                continue;
            };
            let addr = endpoint.socket_addr();
            let iface = self
                .shared
                .ifaces
                .context_for_target(addr, req.preferred_interface.as_deref())
                .map(|context| context.index)
                .unwrap_or(0);
            let sd_source = self.shared.ifaces.contexts[iface]
                .sd_unicast_target(addr)
                .unwrap_or(SocketAddr::new(addr.ip(), crate::config::DEFAULT_SD_PORT));
            self.shared.peers.upsert(
                req.service_id,
                req.instance_id,
                Peer {
                    endpoint: Endpoint {
                        addr,
                        transport: endpoint.protocol,
                    },
                    sd_source,
                    iface,
                    major_version: req.major_version,
                    minor_version: req.minor_version,
                    expires_at: None,
                },
            );
            tracing::debug!(
                "Static peer {:04x}:{:04x} at {}",
                req.service_id,
                req.instance_id,
                addr
            );
        }
    }

    fn find_endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.config.endpoints.get(name).or_else(|| {
            self.config
                .interfaces
                .values()
                .find_map(|iface| iface.endpoints.get(name))
        })
    }

    /// Offer the service configured under `alias` with the given handler.
    /// The first offer goes out immediately; renewals follow the cyclic
    /// offer period.
    pub async fn offer_service(&self, alias: &str, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let svc = self.instance.providing.get(alias).ok_or_else(|| {
            ConfigError::new(format!("'{}' is not in this instance's providing block", alias))
        })?;

        if handler.service_id() != svc.service_id {
            tracing::warn!(
                "Handler reports service {:04x} but '{}' is configured as {:04x}; using the config",
                handler.service_id(),
                alias,
                svc.service_id
            );
        }

        let mut endpoints = Vec::new();
        let mut transport = Transport::Udp;
        for context in &self.shared.ifaces.contexts {
            if !offers_on(svc, &context.alias) {
                continue;
            }
            let name = offer_endpoint_name(svc, &context.alias, &self.instance).ok_or_else(|| {
                ConfigError::new(format!(
                    "service '{}' has no endpoint on interface '{}'",
                    alias, context.alias
                ))
            })?;
            let iface_cfg = self.config.interfaces.get(&context.alias).ok_or_else(|| {
                ConfigError::new(format!("unknown interface '{}'", context.alias))
            })?;
            let endpoint = self.config.resolve_endpoint(iface_cfg, &name).ok_or_else(|| {
                ConfigError::new(format!("endpoint '{}' is not defined", name))
            })?;
            let port = context.bound_ports.get(&name).copied().ok_or_else(|| {
                ConfigError::new(format!("endpoint '{}' was not bound at startup", name))
            })?;
            transport = endpoint.protocol;
            endpoints.push((context.index, SocketAddr::new(endpoint.ip, port)));
        }
        if endpoints.is_empty() {
            return Err(ConfigError::new(format!(
                "service '{}' is not offered on any bound interface",
                alias
            ))
            .into());
        }

        let multicast = match &svc.multicast {
            Some(name) => Some(
                self.find_endpoint(name)
                    .ok_or_else(|| {
                        ConfigError::new(format!("multicast endpoint '{}' is not defined", name))
                    })?
                    .socket_addr(),
            ),
            None => None,
        };

        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(svc.service_id, handler);

        let cycle = svc
            .cycle_offer_ms
            .unwrap_or(self.shared.timing.cycle_offer_ms);
        self.shared.offers.insert(
            OfferedService {
                service_id: svc.service_id,
                instance_id: svc.instance_id,
                major_version: svc.major_version,
                minor_version: svc.minor_version,
                transport,
                multicast,
                endpoints,
            },
            Duration::from_millis(cycle),
        );
        tracing::info!(
            "Offering service '{}' ({:04x}:{:04x})",
            alias,
            svc.service_id,
            svc.instance_id
        );

        // wake the reactor so the initial offer leaves now
        self.command_tx
            .send(Command::Refresh)
            .await
            .map_err(|_| Error::Shutdown)?;
        Ok(())
    }

    /// Resolve the service configured under the `required` alias into a
    /// proxy: immediately when a static endpoint is configured, otherwise
    /// after SD discovery within `request_timeout_ms`.
    pub async fn create_client(&self, alias: &str) -> Result<ServiceProxy> {
        let req = self.instance.required.get(alias).ok_or_else(|| {
            ConfigError::new(format!("'{}' is not in this instance's required block", alias))
        })?;

        if req.endpoint.is_none()
            && !self.wait_for_service(req.service_id, req.instance_id).await
        {
            tracing::warn!("Timeout waiting for service '{}'", alias);
            return Err(Error::ServiceUnavailable);
        }

        Ok(ServiceProxy {
            shared: self.shared.clone(),
            command_tx: self.command_tx.clone(),
            service_id: req.service_id,
            instance_id: req.instance_id,
            major_version: req.major_version,
            preferred_interface: req.preferred_interface.clone(),
        })
    }

    /// Poll the peer registry until the service shows up or the
    /// configured timeout elapses. Sends a FindService on the candidate
    /// interfaces first so a provider answering finds is discovered
    /// before its next cyclic offer.
    pub async fn wait_for_service(&self, service_id: u16, instance_id: u16) -> bool {
        if self.shared.peers.lookup(service_id, instance_id).is_some() {
            return true;
        }

        let req = self
            .instance
            .required
            .values()
            .find(|req| req.service_id == service_id);
        let major = req.map(|r| r.major_version).unwrap_or(0xFF);
        let candidates: Vec<usize> = match req.map(|r| &r.find_on) {
            Some(aliases) if !aliases.is_empty() => aliases
                .iter()
                .filter_map(|alias| self.shared.ifaces.by_alias(alias))
                .map(|context| context.index)
                .collect(),
            _ => self
                .shared
                .ifaces
                .contexts
                .iter()
                .map(|context| context.index)
                .collect(),
        };
        for iface in candidates {
            let _ = self
                .command_tx
                .send(Command::SendSd {
                    iface,
                    target: SdTarget::Multicast,
                    message: sd::build_find_message(service_id, instance_id, major, 0),
                })
                .await;
        }

        let deadline = Instant::now() + Duration::from_millis(self.shared.timing.request_timeout_ms);
        loop {
            if let Some(peer) = self.shared.peers.lookup(service_id, instance_id) {
                tracing::debug!(
                    "Service {:04x}:{:04x} v{}.{} available at {}",
                    service_id,
                    instance_id,
                    peer.major_version,
                    peer.minor_version,
                    peer.endpoint.addr
                );
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// The resolved endpoint of a discovered service, if any
    pub fn get_remote_service(&self, service_id: u16, instance_id: u16) -> Option<Endpoint> {
        self.shared
            .peers
            .lookup(service_id, instance_id)
            .map(|peer| peer.endpoint)
    }

    /// Send a request and await the correlated response
    pub async fn send_request(
        &self,
        service_id: u16,
        method_id: u16,
        payload: Bytes,
        target: Endpoint,
    ) -> Result<Response> {
        request(
            &self.shared,
            service_id,
            method_id,
            1,
            payload,
            target,
            None,
            MessageType::Request,
        )
        .await
        .map(|response| response.expect("request always yields a response or an error"))
    }

    /// Fire-and-forget request; no session is awaited
    pub async fn send_request_no_return(
        &self,
        service_id: u16,
        method_id: u16,
        payload: Bytes,
        target: Endpoint,
    ) -> Result<()> {
        request(
            &self.shared,
            service_id,
            method_id,
            1,
            payload,
            target,
            None,
            MessageType::RequestNoReturn,
        )
        .await
        .map(|_| ())
    }

    /// Fan a notification out to every subscriber of the service. One
    /// message is built per subscriber and sent on each interface the
    /// service is offered on, matched by address family.
    pub async fn send_notification(
        &self,
        service_id: u16,
        event_id: u16,
        payload: Bytes,
    ) -> Result<()> {
        let service = self
            .shared
            .offers
            .lookup_service(service_id)
            .ok_or(Error::ServiceUnavailable)?;

        let subscribers = self.shared.subscribers.snapshot_service(service_id);
        tracing::trace!(
            "Notifying {} subscribers of {:04x} event {:04x}",
            subscribers.len(),
            service_id,
            event_id
        );

        let mut ifaces: Vec<usize> = service.endpoints.iter().map(|(i, _)| *i).collect();
        ifaces.dedup();

        for subscriber in subscribers {
            let header = Header {
                service_id,
                method_id: event_id,
                length: 0,
                client_id: 0,
                session_id: self.shared.sessions.next(service_id, event_id),
                protocol_version: PROTOCOL_VERSION,
                interface_version: service.major_version,
                message_type: MessageType::Notification,
                return_code: 0,
            };
            match subscriber.transport {
                Transport::Udp => {
                    let mut sent = false;
                    for &iface in &ifaces {
                        let context = &self.shared.ifaces.contexts[iface];
                        if let Some(udp) = context.udp_for_family(subscriber.endpoint.is_ipv6()) {
                            reactor::send_udp_message(
                                &udp.socket,
                                subscriber.endpoint,
                                &header,
                                &payload,
                            )
                            .await?;
                            sent = true;
                        }
                    }
                    if !sent {
                        tracing::warn!(
                            "No socket family matches subscriber {}",
                            subscriber.endpoint
                        );
                    }
                }
                Transport::Tcp => {
                    self.shared
                        .tcp_pool
                        .send(subscriber.endpoint, build_message(header, &payload))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Subscribe to a remote eventgroup. The Subscribe entry goes unicast
    /// to the provider's SD endpoint when the peer is known, otherwise to
    /// the SD multicast group.
    pub async fn subscribe_eventgroup(
        &self,
        service_id: u16,
        instance_id: u16,
        eventgroup_id: u16,
        ttl: u32,
    ) -> Result<()> {
        let major = self
            .instance
            .required
            .values()
            .find(|req| req.service_id == service_id)
            .map(|req| req.major_version)
            .unwrap_or(1);
        subscribe(
            &self.shared,
            &self.command_tx,
            service_id,
            instance_id,
            eventgroup_id,
            major,
            ttl,
        )
        .await
    }

    /// Withdraw a subscription (Subscribe with TTL 0)
    pub async fn unsubscribe_eventgroup(
        &self,
        service_id: u16,
        instance_id: u16,
        eventgroup_id: u16,
    ) -> Result<()> {
        unsubscribe(
            &self.shared,
            &self.command_tx,
            service_id,
            instance_id,
            eventgroup_id,
        )
        .await
    }

    /// Whether the provider acknowledged our subscription
    pub fn is_subscription_acked(&self, service_id: u16, eventgroup_id: u16) -> bool {
        self.shared.subscriptions.is_acked(service_id, eventgroup_id)
    }

    /// How many remote endpoints are subscribed to one of our
    /// eventgroups (diagnostic)
    pub fn subscriber_count(&self, service_id: u16, eventgroup_id: u16) -> usize {
        self.shared.subscribers.snapshot(service_id, eventgroup_id).len()
    }

    /// Receive notifications addressed to this node for a service.
    /// Pair with [`Runtime::subscribe_eventgroup`]; generated proxies use
    /// [`ServiceProxy::subscribe`] which does both.
    pub fn listen(&self, service_id: u16) -> EventStream {
        let (tx, rx) = mpsc::channel(64);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .entry(service_id)
            .or_default()
            .push(tx);
        EventStream { rx }
    }

    /// The actually-bound port of a named endpoint on an interface.
    /// Differs from the configured port when the config asked for an
    /// ephemeral one.
    pub fn bound_port(&self, iface_alias: &str, endpoint: &str) -> Option<u16> {
        self.shared
            .ifaces
            .by_alias(iface_alias)
            .and_then(|context| context.bound_ports.get(endpoint).copied())
    }

    /// In-flight requests (diagnostic)
    pub fn pending_request_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Datagrams dropped as malformed since startup (diagnostic)
    pub fn malformed_count(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    /// Orderly shutdown: StopOffer goes out for every offered service on
    /// every interface, pending requests fail with `Shutdown`, the
    /// reactor exits and all sockets are dropped.
    pub async fn shutdown(mut self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        if let Some(handle) = self.reactor.take() {
            let _ = handle.await;
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(handle) = &self.reactor {
            handle.abort();
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

// ============================================================================
// CLIENT PROXY
// ============================================================================

/// Client handle to one discovered service. Generated proxies wrap this
/// and add typed methods on top of [`ServiceProxy::call`].
pub struct ServiceProxy {
    shared: Arc<Shared>,
    command_tx: mpsc::Sender<Command>,
    service_id: u16,
    instance_id: u16,
    major_version: u8,
    preferred_interface: Option<String>,
}

impl ServiceProxy {
    pub fn service_id(&self) -> u16 {
        self.service_id
    }

    pub fn instance_id(&self) -> u16 {
        self.instance_id
    }

    /// Current endpoint of the service, `None` once it withdrew
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.shared
            .peers
            .lookup(self.service_id, self.instance_id)
            .map(|peer| peer.endpoint)
    }

    /// Call a method and await its response
    pub async fn call(&self, method_id: u16, payload: Bytes) -> Result<Response> {
        let peer = self
            .shared
            .peers
            .lookup(self.service_id, self.instance_id)
            .ok_or(Error::Unreachable)?;
        request(
            &self.shared,
            self.service_id,
            method_id,
            self.major_version,
            payload,
            peer.endpoint,
            self.preferred_interface.as_deref(),
            MessageType::Request,
        )
        .await
        .map(|response| response.expect("request always yields a response or an error"))
    }

    /// Fire-and-forget call
    pub async fn call_no_return(&self, method_id: u16, payload: Bytes) -> Result<()> {
        let peer = self
            .shared
            .peers
            .lookup(self.service_id, self.instance_id)
            .ok_or(Error::Unreachable)?;
        request(
            &self.shared,
            self.service_id,
            method_id,
            self.major_version,
            payload,
            peer.endpoint,
            self.preferred_interface.as_deref(),
            MessageType::RequestNoReturn,
        )
        .await
        .map(|_| ())
    }

    /// Subscribe to an eventgroup and stream its notifications
    pub async fn subscribe(&self, eventgroup_id: u16, ttl: u32) -> Result<EventStream> {
        subscribe(
            &self.shared,
            &self.command_tx,
            self.service_id,
            self.instance_id,
            eventgroup_id,
            self.major_version,
            ttl,
        )
        .await?;

        let (tx, rx) = mpsc::channel(64);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .entry(self.service_id)
            .or_default()
            .push(tx);
        Ok(EventStream { rx })
    }

    pub async fn unsubscribe(&self, eventgroup_id: u16) -> Result<()> {
        unsubscribe(
            &self.shared,
            &self.command_tx,
            self.service_id,
            self.instance_id,
            eventgroup_id,
        )
        .await
    }

    pub fn is_subscription_acked(&self, eventgroup_id: u16) -> bool {
        self.shared
            .subscriptions
            .is_acked(self.service_id, eventgroup_id)
    }
}

// ============================================================================
// SHARED OPERATION BODIES
// ============================================================================

/// Correlated request path: allocate a session, install the pending slot,
/// transmit, park on the slot up to `request_timeout_ms`.
#[allow(clippy::too_many_arguments)]
async fn request(
    shared: &Arc<Shared>,
    service_id: u16,
    method_id: u16,
    interface_version: u8,
    payload: Bytes,
    target: Endpoint,
    preferred: Option<&str>,
    message_type: MessageType,
) -> Result<Option<Response>> {
    let session_id = shared.sessions.next(service_id, method_id);
    let header = Header {
        service_id,
        method_id,
        length: 0,
        client_id: 0,
        session_id,
        protocol_version: PROTOCOL_VERSION,
        interface_version,
        message_type,
        return_code: 0,
    };

    let slot = message_type
        .expects_response()
        .then(|| shared.pending.insert(service_id, method_id, session_id));

    let sent = match target.transport {
        Transport::Udp => {
            let socket = shared
                .ifaces
                .context_for_target(target.addr, preferred)
                .and_then(|context| context.udp_for_family(target.addr.is_ipv6()));
            match socket {
                Some(endpoint) => {
                    reactor::send_udp_message(&endpoint.socket, target.addr, &header, &payload)
                        .await
                        .map_err(Error::from)
                }
                // no interface speaks the target's address family
                None => Err(Error::Unreachable),
            }
        }
        Transport::Tcp => shared
            .tcp_pool
            .send(target.addr, build_message(header, &payload))
            .await
            .map_err(Error::from),
    };
    if let Err(e) = sent {
        shared.pending.remove(service_id, method_id, session_id);
        return Err(e);
    }

    let Some(slot) = slot else {
        return Ok(None);
    };
    let timeout = Duration::from_millis(shared.timing.request_timeout_ms);
    match tokio::time::timeout(timeout, slot).await {
        Ok(Ok(response)) => Ok(Some(response)),
        // slot sender dropped: the runtime is going down
        Ok(Err(_)) => Err(Error::Shutdown),
        Err(_) => {
            shared.pending.remove(service_id, method_id, session_id);
            Err(Error::Timeout)
        }
    }
}

async fn subscribe(
    shared: &Arc<Shared>,
    command_tx: &mpsc::Sender<Command>,
    service_id: u16,
    instance_id: u16,
    eventgroup_id: u16,
    major_version: u8,
    ttl: u32,
) -> Result<()> {
    match shared.peers.lookup(service_id, instance_id) {
        Some(peer) => {
            let context = &shared.ifaces.contexts[peer.iface];
            let local = context
                .udp_for_family(peer.sd_source.is_ipv6())
                .map(|udp| context.advertised_addr(udp.addr))
                .ok_or(Error::Unreachable)?;

            shared.subscriptions.insert(
                service_id,
                eventgroup_id,
                LocalSubscription {
                    instance_id,
                    major_version,
                    ttl,
                    endpoint: local,
                    acked: false,
                },
            );
            command_tx
                .send(Command::SendSd {
                    iface: peer.iface,
                    target: SdTarget::Unicast(peer.sd_source),
                    message: sd::build_subscribe_message(
                        service_id,
                        instance_id,
                        major_version,
                        eventgroup_id,
                        local,
                        ttl,
                        0,
                    ),
                })
                .await
                .map_err(|_| Error::Shutdown)?;
        }
        None => {
            // provider not resolved yet: announce on every SD interface
            let mut announced = false;
            for context in &shared.ifaces.contexts {
                let Some(udp) = context.udp_for_family(false).or_else(|| context.udp_for_family(true))
                else {
                    continue;
                };
                let local = context.advertised_addr(udp.addr);
                shared.subscriptions.insert(
                    service_id,
                    eventgroup_id,
                    LocalSubscription {
                        instance_id,
                        major_version,
                        ttl,
                        endpoint: local,
                        acked: false,
                    },
                );
                command_tx
                    .send(Command::SendSd {
                        iface: context.index,
                        target: SdTarget::Multicast,
                        message: sd::build_subscribe_message(
                            service_id,
                            instance_id,
                            major_version,
                            eventgroup_id,
                            local,
                            ttl,
                            0,
                        ),
                    })
                    .await
                    .map_err(|_| Error::Shutdown)?;
                announced = true;
            }
            if !announced {
                return Err(Error::Unreachable);
            }
        }
    }
    tracing::info!(
        "Subscribed to {:04x}:{:04x} eventgroup {:04x} (ttl={})",
        service_id,
        instance_id,
        eventgroup_id,
        ttl
    );
    Ok(())
}

async fn unsubscribe(
    shared: &Arc<Shared>,
    command_tx: &mpsc::Sender<Command>,
    service_id: u16,
    instance_id: u16,
    eventgroup_id: u16,
) -> Result<()> {
    let Some(subscription) = shared.subscriptions.remove(service_id, eventgroup_id) else {
        return Ok(());
    };

    let message = sd::build_subscribe_message(
        service_id,
        instance_id,
        subscription.major_version,
        eventgroup_id,
        subscription.endpoint,
        0,
        0,
    );
    let command = match shared.peers.lookup(service_id, instance_id) {
        Some(peer) => Command::SendSd {
            iface: peer.iface,
            target: SdTarget::Unicast(peer.sd_source),
            message,
        },
        None => Command::SendSd {
            iface: 0,
            target: SdTarget::Multicast,
            message,
        },
    };
    command_tx.send(command).await.map_err(|_| Error::Shutdown)?;
    tracing::info!(
        "Unsubscribed from {:04x}:{:04x} eventgroup {:04x}",
        service_id,
        instance_id,
        eventgroup_id
    );
    Ok(())
}
