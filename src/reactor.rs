//! # Reactor
//!
//! One background task drives all protocol work: cyclic offers, TTL
//! expiry, delayed SD replies, and dispatch of every inbound message. Each
//! socket gets a small reader task that forwards datagrams (or framed TCP
//! messages) into the reactor's channel, so the reactor itself is the only
//! place protocol state is touched from.
//!
//! Routing per framed message:
//! - service 0xFFFF -> SD state machine
//! - Request / RequestNoReturn -> registered handler, Response sent back
//!   with the caller's (client_id, session_id)
//! - Response / Error -> pending-request slot (ignored when none exists)
//! - Notification -> local event listeners
//!
//! TP messages are stripped of their 4-byte TP header and fed to the
//! reassembler; dispatch happens once with the TP bit cleared when the
//! payload is complete.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::time::Instant;

use crate::registry::{OfferedService, Response};
use crate::runtime::Shared;
use crate::sd::{self, Action, SdSessions};
use crate::tp::{self, Reassembler, Reassembly, ReassemblyKey, TpHeader};
use crate::wire::{build_message, frame_length, Header, MessageType, SdMessage, SD_SERVICE_ID};
use crate::{Event, ReturnCode};

/// Largest UDP payload sent without TP segmentation
pub(crate) const UDP_MAX_PAYLOAD: usize = 1400;

/// Reassembly state idle longer than this is evicted
const REASSEMBLY_IDLE: Duration = Duration::from_secs(5);

/// Fallback tick when nothing else is due
const TICK: Duration = Duration::from_millis(100);

const MAX_DATAGRAM: usize = 65535;

/// A framed message handed to the reactor by a reader task
pub(crate) enum Inbound {
    /// Datagram from a unicast RPC socket
    Udp {
        data: Bytes,
        from: SocketAddr,
        /// Socket it arrived on; responses go back out the same socket
        socket: Arc<UdpSocket>,
    },
    /// Datagram from an SD socket
    Sd {
        iface: usize,
        data: Bytes,
        from: SocketAddr,
    },
    /// One complete message framed from a TCP stream
    Tcp {
        data: Bytes,
        from: SocketAddr,
        /// Writer of the connection the message arrived on
        reply: mpsc::Sender<Bytes>,
    },
}

/// Where an SD message should go
pub(crate) enum SdTarget {
    Unicast(SocketAddr),
    /// The joined group(s) of the interface
    Multicast,
}

/// Control messages from the public API into the reactor
pub(crate) enum Command {
    /// Stamp flags and session id, then transmit
    SendSd {
        iface: usize,
        target: SdTarget,
        message: SdMessage,
    },
    /// Re-evaluate deadlines now (a service was just offered)
    Refresh,
    /// Emit StopOffers, fail pending requests and exit
    Shutdown { done: oneshot::Sender<()> },
}

/// Reply path of an inbound request
enum ReplyPath {
    Udp {
        socket: Arc<UdpSocket>,
        target: SocketAddr,
    },
    Tcp {
        sender: mpsc::Sender<Bytes>,
    },
}

/// A unicast SD reply waiting out `request_response_delay_ms`
struct DelayedSd {
    due: Instant,
    iface: usize,
    target: SocketAddr,
    message: SdMessage,
}

// ============================================================================
// READER TASKS
// ============================================================================

/// Forward datagrams from a unicast RPC socket
pub(crate) async fn udp_reader(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let data = Bytes::copy_from_slice(&buf[..len]);
                if tx
                    .send(Inbound::Udp {
                        data,
                        from,
                        socket: socket.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                tracing::error!("UDP receive failed: {}", e);
                return;
            }
        }
    }
}

/// Forward datagrams from an SD socket
pub(crate) async fn sd_reader(iface: usize, socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let data = Bytes::copy_from_slice(&buf[..len]);
                if tx.send(Inbound::Sd { iface, data, from }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!("SD receive failed: {}", e);
                return;
            }
        }
    }
}

/// Accept TCP connections and spawn a connection task per peer
pub(crate) async fn tcp_acceptor(listener: Arc<TcpListener>, tx: mpsc::Sender<Inbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!("Accepted TCP connection from {}", peer);
                tokio::spawn(tcp_connection(stream, peer, tx.clone()));
            }
            Err(e) => {
                tracing::error!("TCP accept failed: {}", e);
                return;
            }
        }
    }
}

/// Frame SOME/IP messages off one TCP stream by the header length field.
/// Returns the writer sender so callers (the client pool) can transmit on
/// the same connection.
fn spawn_tcp_writer(mut write_half: tokio::net::tcp::OwnedWriteHalf) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                tracing::debug!("TCP write failed: {}", e);
                return;
            }
        }
    });
    tx
}

async fn tcp_connection(stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Inbound>) {
    let (mut read_half, write_half) = stream.into_split();
    let writer = spawn_tcp_writer(write_half);

    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!("TCP connection from {} closed", peer);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("TCP read from {} failed: {}", peer, e);
                return;
            }
        }

        while buf.len() >= Header::SIZE {
            let Some(frame_len) = frame_length(&buf) else {
                // length field cannot be trusted; the stream is out of sync
                tracing::warn!("Dropping desynchronized TCP stream from {}", peer);
                return;
            };
            if buf.len() < frame_len {
                break;
            }
            let frame = buf.split_to(frame_len).freeze();
            if tx
                .send(Inbound::Tcp {
                    data: frame,
                    from: peer,
                    reply: writer.clone(),
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Outgoing TCP connections, one per remote endpoint, established on first
/// use and reused. Responses read off pooled connections flow through the
/// same inbound channel as everything else.
pub(crate) struct TcpPool {
    connections: DashMap<SocketAddr, Arc<OnceCell<mpsc::Sender<Bytes>>>>,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl TcpPool {
    pub(crate) fn new(inbound_tx: mpsc::Sender<Inbound>) -> Self {
        Self {
            connections: DashMap::new(),
            inbound_tx,
        }
    }

    /// Send on the pooled connection, dialing it first if needed. A dead
    /// connection is dropped from the pool and redialed once.
    pub(crate) async fn send(&self, target: SocketAddr, data: Bytes) -> io::Result<()> {
        for attempt in 0..2 {
            let cell = self
                .connections
                .entry(target)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let sender = cell
                .get_or_try_init(|| async {
                    let stream = TcpStream::connect(target).await?;
                    let peer = stream.peer_addr()?;
                    let (mut read_half, write_half) = stream.into_split();
                    let writer = spawn_tcp_writer(write_half);
                    let tx = self.inbound_tx.clone();
                    let reply = writer.clone();
                    tokio::spawn(async move {
                        let mut buf = BytesMut::with_capacity(8 * 1024);
                        loop {
                            match read_half.read_buf(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) => {}
                            }
                            while buf.len() >= Header::SIZE {
                                let Some(frame_len) = frame_length(&buf) else {
                                    return;
                                };
                                if buf.len() < frame_len {
                                    break;
                                }
                                let frame = buf.split_to(frame_len).freeze();
                                if tx
                                    .send(Inbound::Tcp {
                                        data: frame,
                                        from: peer,
                                        reply: reply.clone(),
                                    })
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                    });
                    Ok::<_, io::Error>(writer)
                })
                .await?
                .clone();

            if sender.send(data.clone()).await.is_ok() {
                return Ok(());
            }
            // connection task exited; forget it and redial
            self.connections.remove(&target);
            if attempt == 1 {
                break;
            }
        }
        Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "TCP connection closed",
        ))
    }
}

// ============================================================================
// SEND HELPERS
// ============================================================================

/// Send one message over UDP, segmenting through TP when the payload
/// exceeds the datagram budget. All segments reuse the caller's session id.
pub(crate) async fn send_udp_message(
    socket: &UdpSocket,
    target: SocketAddr,
    header: &Header,
    payload: &Bytes,
) -> io::Result<()> {
    if payload.len() <= UDP_MAX_PAYLOAD {
        socket
            .send_to(&build_message(header.clone(), payload), target)
            .await?;
        return Ok(());
    }

    let mut tp_header = header.clone();
    tp_header.message_type = header.message_type.with_tp_flag();
    for (tp, chunk) in tp::segment(payload, tp::DEFAULT_MAX_SEGMENT) {
        let segment_payload = tp::encode_segment(tp, &chunk);
        socket
            .send_to(&build_message(tp_header.clone(), &segment_payload), target)
            .await?;
    }
    Ok(())
}

/// Multicast the offers of a set of services on every interface they are
/// bound on
async fn send_offers(shared: &Shared, sessions: &mut SdSessions, services: &[OfferedService]) {
    for service in services {
        for (iface, bound) in &service.endpoints {
            let context = &shared.ifaces.contexts[*iface];
            let Some(sd) = context.sd_for_family(bound.is_ipv6()) else {
                continue;
            };
            let message = sd::build_offer_message(
                service,
                context.advertised_addr(*bound),
                sessions.flags(false),
                shared.timing.offer_ttl,
            );
            let bytes = message.serialize(sessions.next_multicast());
            if let Err(e) = sd.socket.send_to(&bytes, sd.group).await {
                tracing::warn!("Offer multicast on {} failed: {}", context.alias, e);
            }
        }
    }
}

/// Multicast StopOffer for every offered service (shutdown path)
async fn send_stop_offers(shared: &Shared, sessions: &mut SdSessions) {
    for service in shared.offers.snapshot() {
        for (iface, bound) in &service.endpoints {
            let context = &shared.ifaces.contexts[*iface];
            let Some(sd) = context.sd_for_family(bound.is_ipv6()) else {
                continue;
            };
            let message = sd::build_stop_offer_message(&service, sessions.flags(false));
            let bytes = message.serialize(sessions.next_multicast());
            if let Err(e) = sd.socket.send_to(&bytes, sd.group).await {
                tracing::warn!("StopOffer multicast on {} failed: {}", context.alias, e);
            }
        }
    }
}

/// Send one unicast SD message from an interface's SD socket
async fn send_sd_unicast(
    shared: &Shared,
    sessions: &mut SdSessions,
    iface: usize,
    target: SocketAddr,
    mut message: SdMessage,
) {
    let context = &shared.ifaces.contexts[iface];
    let Some(sd) = context.sd_for_family(target.is_ipv6()) else {
        tracing::warn!(
            "No SD socket for {} on interface {}",
            target,
            context.alias
        );
        return;
    };
    message.flags = sessions.flags(true);
    let bytes = message.serialize(sessions.next_unicast());
    if let Err(e) = sd.socket.send_to(&bytes, target).await {
        tracing::warn!("Unicast SD to {} failed: {}", target, e);
    }
}

/// Send one SD message to the joined group(s) of an interface
async fn send_sd_multicast(
    shared: &Shared,
    sessions: &mut SdSessions,
    iface: usize,
    mut message: SdMessage,
) {
    let context = &shared.ifaces.contexts[iface];
    for sd in [context.sd_v4.as_ref(), context.sd_v6.as_ref()]
        .into_iter()
        .flatten()
    {
        message.flags = sessions.flags(false);
        let bytes = message.serialize(sessions.next_multicast());
        if let Err(e) = sd.socket.send_to(&bytes, sd.group).await {
            tracing::warn!("Multicast SD on {} failed: {}", context.alias, e);
        }
    }
}

// ============================================================================
// REACTOR LOOP
// ============================================================================

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    mut command_rx: mpsc::Receiver<Command>,
) {
    let mut sessions = SdSessions::default();
    let mut reassembler = Reassembler::new();
    let mut delayed_sd: Vec<DelayedSd> = Vec::new();

    loop {
        let now = Instant::now();

        // due cyclic offers
        let due = shared.offers.take_due(now);
        if !due.is_empty() {
            send_offers(&shared, &mut sessions, &due).await;
        }

        // TTL expiry is a state transition, not an error
        for (service_id, instance_id) in shared.peers.expire(now) {
            tracing::debug!(
                "Peer {:04x}:{:04x} expired (TTL elapsed)",
                service_id,
                instance_id
            );
        }
        let expired = shared.subscribers.expire(now);
        if expired > 0 {
            tracing::debug!("Dropped {} expired subscribers", expired);
        }
        reassembler.evict_idle(REASSEMBLY_IDLE);

        // delayed unicast SD replies that are due
        let mut i = 0;
        while i < delayed_sd.len() {
            if delayed_sd[i].due <= now {
                let reply = delayed_sd.swap_remove(i);
                send_sd_unicast(&shared, &mut sessions, reply.iface, reply.target, reply.message)
                    .await;
            } else {
                i += 1;
            }
        }

        // wake no later than the nearest deadline
        let mut deadline = now + TICK;
        for candidate in [
            shared.offers.next_deadline(),
            shared.peers.next_expiry(),
            shared.subscribers.next_expiry(),
            delayed_sd.iter().map(|d| d.due).min(),
        ]
        .into_iter()
        .flatten()
        {
            deadline = deadline.min(candidate);
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            command = command_rx.recv() => {
                match command {
                    Some(Command::SendSd { iface, target, message }) => match target {
                        SdTarget::Unicast(addr) => {
                            send_sd_unicast(&shared, &mut sessions, iface, addr, message).await;
                        }
                        SdTarget::Multicast => {
                            send_sd_multicast(&shared, &mut sessions, iface, message).await;
                        }
                    },
                    Some(Command::Refresh) => {}
                    Some(Command::Shutdown { done }) => {
                        send_stop_offers(&shared, &mut sessions).await;
                        if !shared.pending.is_empty() {
                            tracing::debug!(
                                "Failing {} pending requests on shutdown",
                                shared.pending.len()
                            );
                        }
                        shared.pending.fail_all();
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        // runtime dropped without shutdown; exit quietly
                        shared.pending.fail_all();
                        return;
                    }
                }
            }
            inbound = inbound_rx.recv() => {
                let Some(inbound) = inbound else { return };
                handle_inbound(
                    &shared,
                    &mut sessions,
                    &mut reassembler,
                    &mut delayed_sd,
                    inbound,
                )
                .await;
            }
        }
    }
}

async fn handle_inbound(
    shared: &Arc<Shared>,
    sessions: &mut SdSessions,
    reassembler: &mut Reassembler,
    delayed_sd: &mut Vec<DelayedSd>,
    inbound: Inbound,
) {
    match inbound {
        Inbound::Sd { iface, data, from } => {
            let mut buf = data.clone();
            let Some(header) = Header::parse(&mut buf) else {
                shared.count_malformed();
                tracing::warn!("Invalid SOME/IP header on SD socket from {}", from);
                return;
            };
            if data.len() != Header::SIZE + header.payload_length() {
                shared.count_malformed();
                tracing::warn!("SD datagram from {} disagrees with its length field", from);
                return;
            }

            let ctx = shared.sd_context();
            match sd::handle_sd_message(&header, &mut buf, from, iface, &ctx) {
                Some(actions) => {
                    let due = Instant::now()
                        + Duration::from_millis(shared.timing.request_response_delay_ms);
                    for Action::SendSd {
                        iface,
                        target,
                        message,
                    } in actions
                    {
                        if shared.timing.request_response_delay_ms == 0 {
                            send_sd_unicast(shared, sessions, iface, target, message).await;
                        } else {
                            delayed_sd.push(DelayedSd {
                                due,
                                iface,
                                target,
                                message,
                            });
                        }
                    }
                }
                None => {
                    shared.count_malformed();
                    tracing::warn!("Dropped malformed SD message from {}", from);
                }
            }
        }
        Inbound::Udp { data, from, socket } => {
            handle_rpc(
                shared,
                reassembler,
                data,
                ReplyPath::Udp {
                    socket,
                    target: from,
                },
                from,
            )
            .await;
        }
        Inbound::Tcp { data, from, reply } => {
            handle_rpc(
                shared,
                reassembler,
                data,
                ReplyPath::Tcp { sender: reply },
                from,
            )
            .await;
        }
    }
}

async fn handle_rpc(
    shared: &Arc<Shared>,
    reassembler: &mut Reassembler,
    data: Bytes,
    reply: ReplyPath,
    from: SocketAddr,
) {
    let mut buf = data.clone();
    let Some(mut header) = Header::parse(&mut buf) else {
        shared.count_malformed();
        tracing::warn!("Dropped malformed message from {}", from);
        return;
    };
    // the length field must agree with what actually arrived
    if data.len() != Header::SIZE + header.payload_length() {
        shared.count_malformed();
        tracing::warn!(
            "Message from {} claims {} payload bytes but carries {}",
            from,
            header.payload_length(),
            data.len() - Header::SIZE
        );
        return;
    }

    if header.service_id == SD_SERVICE_ID {
        // SD over an RPC socket is not routed
        return;
    }

    let mut payload = buf;

    if header.message_type.is_tp() {
        let Some(tp_header) = TpHeader::parse(&mut payload) else {
            shared.count_malformed();
            return;
        };
        let key = ReassemblyKey {
            service_id: header.service_id,
            method_id: header.method_id,
            client_id: header.client_id,
            session_id: header.session_id,
        };
        match reassembler.process(key, tp_header, payload.clone()) {
            Reassembly::Complete(full) => {
                header.message_type = header.message_type.without_tp_flag();
                header.length = full.len() as u32 + 8;
                payload = full;
            }
            Reassembly::Pending => return,
            Reassembly::Malformed => {
                shared.count_malformed();
                tracing::warn!("Dropped misaligned TP segment from {}", from);
                return;
            }
        }
    }

    match header.message_type {
        MessageType::Request | MessageType::RequestNoReturn => {
            dispatch_request(shared, header, payload, reply).await;
        }
        MessageType::Response | MessageType::Error => {
            let delivered = shared.pending.complete(
                header.service_id,
                header.method_id,
                header.session_id,
                Response {
                    return_code: header.return_code,
                    payload,
                },
            );
            if !delivered {
                tracing::debug!(
                    "Response for {:04x}:{:04x} session {} has no waiter",
                    header.service_id,
                    header.method_id,
                    header.session_id
                );
            }
        }
        MessageType::Notification => deliver_event(shared, &header, payload),
        _ => {}
    }
}

async fn dispatch_request(
    shared: &Arc<Shared>,
    header: Header,
    payload: Bytes,
    reply: ReplyPath,
) {
    let handler = shared
        .handlers
        .lock()
        .unwrap()
        .get(&header.service_id)
        .cloned();

    let Some(handler) = handler else {
        tracing::warn!(
            "No handler for service {:04x} (method {:04x})",
            header.service_id,
            header.method_id
        );
        if header.message_type == MessageType::Request {
            let mut error = header.clone();
            error.message_type = MessageType::Error;
            error.return_code = ReturnCode::UnknownService as u8;
            send_reply(reply, &error, &Bytes::new()).await;
        }
        return;
    };

    let outcome = handler.handle(&header, &payload);

    match (header.message_type, outcome) {
        (MessageType::Request, Some(result)) => {
            let mut response = header.clone();
            response.message_type = MessageType::Response;
            response.return_code = result.return_code as u8;
            send_reply(reply, &response, &result.payload).await;
        }
        (MessageType::Request, None) => {
            tracing::warn!(
                "Handler for {:04x}:{:04x} produced no response to a request",
                header.service_id,
                header.method_id
            );
        }
        // fire-and-forget output is discarded
        (MessageType::RequestNoReturn, Some(_)) => {
            tracing::debug!(
                "Discarding handler output for fire-and-forget {:04x}:{:04x}",
                header.service_id,
                header.method_id
            );
        }
        _ => {}
    }
}

async fn send_reply(reply: ReplyPath, header: &Header, payload: &Bytes) {
    match reply {
        ReplyPath::Udp { socket, target } => {
            if let Err(e) = send_udp_message(&socket, target, header, payload).await {
                tracing::error!("Failed to send response to {}: {}", target, e);
            }
        }
        ReplyPath::Tcp { sender } => {
            if sender
                .send(build_message(header.clone(), payload))
                .await
                .is_err()
            {
                tracing::debug!("TCP connection closed before the response was sent");
            }
        }
    }
}

/// Hand a notification to every listener registered for the service.
/// Closed listeners are pruned; a full listener drops the event.
fn deliver_event(shared: &Arc<Shared>, header: &Header, payload: Bytes) {
    let mut listeners = shared.listeners.lock().unwrap();
    let Some(list) = listeners.get_mut(&header.service_id) else {
        return;
    };
    list.retain(|tx| {
        match tx.try_send(Event {
            event_id: header.method_id,
            payload: payload.clone(),
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Listener for {:04x} is full; event {:04x} dropped",
                    header.service_id,
                    header.method_id
                );
                true
            }
        }
    });
    if list.is_empty() {
        listeners.remove(&header.service_id);
    }
}
