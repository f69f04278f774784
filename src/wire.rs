//! # SOME/IP Wire Format
//!
//! Encoding and decoding of SOME/IP messages: the 16-byte message header,
//! Service Discovery payloads (entries and options) and the payload
//! primitives used by generated serializers. All multi-byte fields are
//! big-endian.
//!
//! ## Header layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ──────────────────────────────────────────────────────
//!   0      2    Service ID (0xFFFF reserved for SD)
//!   2      2    Method ID (bit 15 set for events)
//!   4      4    Length (payload + 8)
//!   8      2    Client ID
//!  10      2    Session ID (never 0)
//!  12      1    Protocol Version (always 0x01)
//!  13      1    Interface Version
//!  14      1    Message Type
//!  15      1    Return Code
//! ──────────────────────────────────────────────────────
//! ```
//!
//! SD messages are SOME/IP messages with service 0xFFFF, method 0x8100 and
//! message type Notification; their payload is parsed by [`SdMessage`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOME/IP protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Interface version carried by SD messages
pub const SD_INTERFACE_VERSION: u8 = 0x01;

/// SD message identifiers
pub const SD_SERVICE_ID: u16 = 0xFFFF;
pub const SD_METHOD_ID: u16 = 0x8100;
pub const SD_CLIENT_ID: u16 = 0x0000;

/// SOME/IP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Response = 0x80,
    Error = 0x81,
    TpRequest = 0x20,
    TpRequestNoReturn = 0x21,
    TpNotification = 0x22,
    TpResponse = 0xA0,
    TpError = 0xA1,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::RequestNoReturn),
            0x02 => Some(Self::Notification),
            0x80 => Some(Self::Response),
            0x81 => Some(Self::Error),
            0x20 => Some(Self::TpRequest),
            0x21 => Some(Self::TpRequestNoReturn),
            0x22 => Some(Self::TpNotification),
            0xA0 => Some(Self::TpResponse),
            0xA1 => Some(Self::TpError),
            _ => None,
        }
    }

    /// TP flag is bit 5 of the message type
    pub fn is_tp(&self) -> bool {
        (*self as u8) & 0x20 != 0
    }

    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Request | Self::TpRequest)
    }

    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Self::RequestNoReturn | Self::TpRequestNoReturn)
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification | Self::TpNotification)
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::Response | Self::TpResponse | Self::Error | Self::TpError
        )
    }

    /// The same type with the TP flag set
    pub fn with_tp_flag(&self) -> Self {
        match self {
            Self::Request => Self::TpRequest,
            Self::RequestNoReturn => Self::TpRequestNoReturn,
            Self::Notification => Self::TpNotification,
            Self::Response => Self::TpResponse,
            Self::Error => Self::TpError,
            other => *other,
        }
    }

    /// The base type with the TP flag cleared
    pub fn without_tp_flag(&self) -> Self {
        match self {
            Self::TpRequest => Self::Request,
            Self::TpRequestNoReturn => Self::RequestNoReturn,
            Self::TpNotification => Self::Notification,
            Self::TpResponse => Self::Response,
            Self::TpError => Self::Error,
            other => *other,
        }
    }
}

/// SOME/IP header (16 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub service_id: u16,
    /// Method ID, or Event ID for notifications
    pub method_id: u16,
    /// Payload length + 8 (counts everything after the length field)
    pub length: u32,
    pub client_id: u16,
    pub session_id: u16,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: u8,
}

impl Header {
    pub const SIZE: usize = 16;

    /// Parse a header from bytes.
    ///
    /// Rejects short input, unknown message types, a protocol version other
    /// than 0x01 and a length below 8 (the minimum that covers the header
    /// tail). No upper length check happens here; the receiver compares the
    /// length field against the actual datagram or frame size.
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }

        let service_id = buf.get_u16();
        let method_id = buf.get_u16();
        let length = buf.get_u32();
        let client_id = buf.get_u16();
        let session_id = buf.get_u16();
        let protocol_version = buf.get_u8();
        let interface_version = buf.get_u8();
        let message_type = MessageType::from_u8(buf.get_u8())?;
        let return_code = buf.get_u8();

        if protocol_version != PROTOCOL_VERSION {
            return None;
        }
        if length < 8 {
            return None;
        }

        Some(Self {
            service_id,
            method_id,
            length,
            client_id,
            session_id,
            protocol_version,
            interface_version,
            message_type,
            return_code,
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.service_id);
        buf.put_u16(self.method_id);
        buf.put_u32(self.length);
        buf.put_u16(self.client_id);
        buf.put_u16(self.session_id);
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.interface_version);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.return_code);
    }

    /// Payload length implied by the length field
    pub fn payload_length(&self) -> usize {
        self.length.saturating_sub(8) as usize
    }
}

/// Build a complete message (header + payload) into a fresh buffer.
/// The length field is recomputed from the payload.
pub fn build_message(mut header: Header, payload: &[u8]) -> Bytes {
    header.length = payload.len() as u32 + 8;
    let mut buf = BytesMut::with_capacity(Header::SIZE + payload.len());
    header.serialize(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Total frame size (header + payload) of the message starting at `data`,
/// if enough bytes are present to read the length field. Used for TCP
/// framing: a complete message occupies `8 + length` bytes.
pub fn frame_length(data: &[u8]) -> Option<usize> {
    if data.len() < 8 {
        return None;
    }
    let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if length < 8 {
        return None;
    }
    Some(8 + length as usize)
}

// ============================================================================
// SERVICE DISCOVERY
// ============================================================================

/// L4 protocol carried in endpoint options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum L4Protocol {
    Tcp = 0x06,
    Udp = 0x11,
}

impl L4Protocol {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x06 => Some(Self::Tcp),
            0x11 => Some(Self::Udp),
            _ => None,
        }
    }
}

/// SD entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdEntryType {
    FindService = 0x00,
    OfferService = 0x01,
    SubscribeEventgroup = 0x06,
    SubscribeEventgroupAck = 0x07,
}

impl SdEntryType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::FindService),
            0x01 => Some(Self::OfferService),
            0x06 => Some(Self::SubscribeEventgroup),
            0x07 => Some(Self::SubscribeEventgroupAck),
            _ => None,
        }
    }

    pub fn is_eventgroup_entry(&self) -> bool {
        matches!(
            self,
            Self::SubscribeEventgroup | Self::SubscribeEventgroupAck
        )
    }
}

/// A parsed 16-byte SD entry.
///
/// Bytes 12-15 hold the minor version for service entries. For eventgroup
/// entries the eventgroup id sits in the high 16 bits of the same field,
/// the encoding both ends of this stack use (see DESIGN.md for the
/// divergence from the AUTOSAR byte layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdEntry {
    pub entry_type: SdEntryType,
    /// Index of the first option in run 1
    pub index_1st_option: u8,
    /// Index of the first option in run 2
    pub index_2nd_option: u8,
    /// Number of options in run 1
    pub num_options_1: u8,
    /// Number of options in run 2
    pub num_options_2: u8,
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    /// 24-bit lifetime in seconds; 0 means stop / nack
    pub ttl: u32,
    /// Minor version (service entries) or eventgroup id << 16
    pub minor: u32,
}

impl Display for SdEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.entry_type.is_eventgroup_entry() {
            write!(
                f,
                "{:?} {:04x}:{:04x} eg={:04x} v{} ttl={}",
                self.entry_type,
                self.service_id,
                self.instance_id,
                self.eventgroup_id(),
                self.major_version,
                self.ttl
            )
        } else {
            write!(
                f,
                "{:?} {:04x}:{:04x} v{}.{} ttl={}",
                self.entry_type,
                self.service_id,
                self.instance_id,
                self.major_version,
                self.minor,
                self.ttl
            )
        }
    }
}

impl SdEntry {
    pub const SIZE: usize = 16;

    /// TTL value meaning "never expires"
    pub const TTL_INFINITE: u32 = 0xFF_FFFF;

    /// Stop / nack entries carry TTL 0
    pub fn is_stop(&self) -> bool {
        self.ttl == 0
    }

    /// Eventgroup id of a Subscribe/Ack entry
    pub fn eventgroup_id(&self) -> u16 {
        (self.minor >> 16) as u16
    }

    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }

        let entry_type = SdEntryType::from_u8(buf.get_u8())?;
        let index_1st_option = buf.get_u8();
        let index_2nd_option = buf.get_u8();
        let num_options = buf.get_u8();
        let num_options_1 = (num_options >> 4) & 0x0F;
        let num_options_2 = num_options & 0x0F;
        let service_id = buf.get_u16();
        let instance_id = buf.get_u16();
        let major_version = buf.get_u8();
        let ttl = u32::from_be_bytes([0, buf.get_u8(), buf.get_u8(), buf.get_u8()]);
        let minor = buf.get_u32();

        Some(Self {
            entry_type,
            index_1st_option,
            index_2nd_option,
            num_options_1,
            num_options_2,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor,
        })
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.entry_type as u8);
        buf.put_u8(self.index_1st_option);
        buf.put_u8(self.index_2nd_option);
        buf.put_u8((self.num_options_1 << 4) | (self.num_options_2 & 0x0F));
        buf.put_u16(self.service_id);
        buf.put_u16(self.instance_id);
        buf.put_u8(self.major_version);
        // 24-bit TTL
        buf.put_u8(((self.ttl >> 16) & 0xFF) as u8);
        buf.put_u8(((self.ttl >> 8) & 0xFF) as u8);
        buf.put_u8((self.ttl & 0xFF) as u8);
        buf.put_u32(self.minor);
    }

    pub fn find_service(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        minor_version: u32,
        ttl: u32,
    ) -> Self {
        Self {
            entry_type: SdEntryType::FindService,
            index_1st_option: 0,
            index_2nd_option: 0,
            num_options_1: 0,
            num_options_2: 0,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor: minor_version,
        }
    }

    pub fn offer_service(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        minor_version: u32,
        ttl: u32,
        option_index: u8,
        num_options: u8,
    ) -> Self {
        Self {
            entry_type: SdEntryType::OfferService,
            index_1st_option: option_index,
            index_2nd_option: 0,
            num_options_1: num_options,
            num_options_2: 0,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor: minor_version,
        }
    }

    /// `StopOfferService` is an `OfferService` with TTL 0
    pub fn stop_offer_service(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        minor_version: u32,
    ) -> Self {
        Self::offer_service(service_id, instance_id, major_version, minor_version, 0, 0, 0)
    }

    pub fn subscribe_eventgroup(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        eventgroup_id: u16,
        ttl: u32,
        option_index: u8,
        num_options: u8,
    ) -> Self {
        Self {
            entry_type: SdEntryType::SubscribeEventgroup,
            index_1st_option: option_index,
            index_2nd_option: 0,
            num_options_1: num_options,
            num_options_2: 0,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor: u32::from(eventgroup_id) << 16,
        }
    }

    pub fn subscribe_eventgroup_ack(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        eventgroup_id: u16,
        ttl: u32,
    ) -> Self {
        Self {
            entry_type: SdEntryType::SubscribeEventgroupAck,
            index_1st_option: 0,
            index_2nd_option: 0,
            num_options_1: 0,
            num_options_2: 0,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor: u32::from(eventgroup_id) << 16,
        }
    }

    /// A nack is an ack with TTL 0
    pub fn subscribe_eventgroup_nack(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        eventgroup_id: u16,
    ) -> Self {
        Self::subscribe_eventgroup_ack(service_id, instance_id, major_version, eventgroup_id, 0)
    }
}

/// SD option: unicast endpoints and multicast groups, v4 and v6
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdOption {
    Ipv4Endpoint {
        addr: Ipv4Addr,
        port: u16,
        protocol: L4Protocol,
    },
    Ipv6Endpoint {
        addr: Ipv6Addr,
        port: u16,
        protocol: L4Protocol,
    },
    Ipv4Multicast {
        addr: Ipv4Addr,
        port: u16,
    },
    Ipv6Multicast {
        addr: Ipv6Addr,
        port: u16,
    },
    Unknown {
        option_type: u8,
        data: Bytes,
    },
}

impl SdOption {
    const TYPE_IPV4_ENDPOINT: u8 = 0x04;
    const TYPE_IPV6_ENDPOINT: u8 = 0x06;
    const TYPE_IPV4_MULTICAST: u8 = 0x14;
    const TYPE_IPV6_MULTICAST: u8 = 0x16;

    /// Endpoint option for an arbitrary socket address
    pub fn endpoint(addr: SocketAddr, protocol: L4Protocol) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self::Ipv4Endpoint {
                addr: ip,
                port: addr.port(),
                protocol,
            },
            IpAddr::V6(ip) => Self::Ipv6Endpoint {
                addr: ip,
                port: addr.port(),
                protocol,
            },
        }
    }

    /// Multicast option for an arbitrary group address
    pub fn multicast(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self::Ipv4Multicast {
                addr: ip,
                port: addr.port(),
            },
            IpAddr::V6(ip) => Self::Ipv6Multicast {
                addr: ip,
                port: addr.port(),
            },
        }
    }

    /// Parse one length-prefixed option
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 3 {
            return None;
        }

        let length = buf.get_u16() as usize;
        let option_type = buf.get_u8();

        if buf.remaining() < length {
            return None;
        }

        match option_type {
            Self::TYPE_IPV4_ENDPOINT | Self::TYPE_IPV4_MULTICAST => {
                if length != 9 {
                    return None;
                }
                let _reserved = buf.get_u8();
                let addr = Ipv4Addr::from(buf.get_u32());
                let _reserved2 = buf.get_u8();
                let protocol_raw = buf.get_u8();
                let port = buf.get_u16();
                if option_type == Self::TYPE_IPV4_ENDPOINT {
                    let protocol = L4Protocol::from_u8(protocol_raw)?;
                    Some(Self::Ipv4Endpoint {
                        addr,
                        port,
                        protocol,
                    })
                } else {
                    Some(Self::Ipv4Multicast { addr, port })
                }
            }
            Self::TYPE_IPV6_ENDPOINT | Self::TYPE_IPV6_MULTICAST => {
                if length != 21 {
                    return None;
                }
                let _reserved = buf.get_u8();
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let addr = Ipv6Addr::from(octets);
                let _reserved2 = buf.get_u8();
                let protocol_raw = buf.get_u8();
                let port = buf.get_u16();
                if option_type == Self::TYPE_IPV6_ENDPOINT {
                    let protocol = L4Protocol::from_u8(protocol_raw)?;
                    Some(Self::Ipv6Endpoint {
                        addr,
                        port,
                        protocol,
                    })
                } else {
                    Some(Self::Ipv6Multicast { addr, port })
                }
            }
            _ => {
                let data = buf.copy_to_bytes(length);
                Some(Self::Unknown { option_type, data })
            }
        }
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        match self {
            Self::Ipv4Endpoint {
                addr,
                port,
                protocol,
            } => {
                buf.put_u16(9);
                buf.put_u8(Self::TYPE_IPV4_ENDPOINT);
                buf.put_u8(0);
                buf.put_slice(&addr.octets());
                buf.put_u8(0);
                buf.put_u8(*protocol as u8);
                buf.put_u16(*port);
            }
            Self::Ipv4Multicast { addr, port } => {
                buf.put_u16(9);
                buf.put_u8(Self::TYPE_IPV4_MULTICAST);
                buf.put_u8(0);
                buf.put_slice(&addr.octets());
                buf.put_u8(0);
                buf.put_u8(L4Protocol::Udp as u8);
                buf.put_u16(*port);
            }
            Self::Ipv6Endpoint {
                addr,
                port,
                protocol,
            } => {
                buf.put_u16(21);
                buf.put_u8(Self::TYPE_IPV6_ENDPOINT);
                buf.put_u8(0);
                buf.put_slice(&addr.octets());
                buf.put_u8(0);
                buf.put_u8(*protocol as u8);
                buf.put_u16(*port);
            }
            Self::Ipv6Multicast { addr, port } => {
                buf.put_u16(21);
                buf.put_u8(Self::TYPE_IPV6_MULTICAST);
                buf.put_u8(0);
                buf.put_slice(&addr.octets());
                buf.put_u8(0);
                buf.put_u8(L4Protocol::Udp as u8);
                buf.put_u16(*port);
            }
            Self::Unknown { option_type, data } => {
                buf.put_u16(data.len() as u16);
                buf.put_u8(*option_type);
                buf.put_slice(data);
            }
        }
    }

    /// Serialized size including the 2-byte length and 1-byte type prefix
    pub fn size(&self) -> usize {
        match self {
            Self::Ipv4Endpoint { .. } | Self::Ipv4Multicast { .. } => 12,
            Self::Ipv6Endpoint { .. } | Self::Ipv6Multicast { .. } => 24,
            Self::Unknown { data, .. } => 3 + data.len(),
        }
    }

    /// The unicast endpoint this option describes, if it is an endpoint option
    pub fn as_endpoint(&self) -> Option<(SocketAddr, L4Protocol)> {
        match self {
            Self::Ipv4Endpoint {
                addr,
                port,
                protocol,
            } => Some((SocketAddr::new(IpAddr::V4(*addr), *port), *protocol)),
            Self::Ipv6Endpoint {
                addr,
                port,
                protocol,
            } => Some((SocketAddr::new(IpAddr::V6(*addr), *port), *protocol)),
            _ => None,
        }
    }
}

/// Complete SD message payload: flags, entries and the options table
#[derive(Debug, Clone, Default)]
pub struct SdMessage {
    pub flags: u8,
    pub entries: Vec<SdEntry>,
    pub options: Vec<SdOption>,
}

impl SdMessage {
    /// Reboot flag (bit 31 of the flags word, bit 7 of the flags byte)
    pub const FLAG_REBOOT: u8 = 0x80;
    /// Unicast flag (bit 30)
    pub const FLAG_UNICAST: u8 = 0x40;

    pub fn new(flags: u8) -> Self {
        Self {
            flags,
            entries: Vec::new(),
            options: Vec::new(),
        }
    }

    /// Parse the payload following the SOME/IP header of an SD message.
    ///
    /// Returns `None` when the entries or options arrays exceed the buffer,
    /// an entry is malformed, or an entry references options outside the
    /// parsed table. Such datagrams are dropped whole.
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }

        let flags = buf.get_u8();
        let _reserved = [buf.get_u8(), buf.get_u8(), buf.get_u8()];

        let entries_len = buf.get_u32() as usize;
        if buf.remaining() < entries_len || entries_len % SdEntry::SIZE != 0 {
            return None;
        }

        let mut entries = Vec::with_capacity(entries_len / SdEntry::SIZE);
        for _ in 0..entries_len / SdEntry::SIZE {
            entries.push(SdEntry::parse(buf)?);
        }

        if buf.remaining() < 4 {
            return None;
        }
        let options_len = buf.get_u32() as usize;
        if buf.remaining() < options_len {
            return None;
        }

        let mut options = Vec::new();
        let options_end = buf.remaining() - options_len;
        while buf.remaining() > options_end {
            options.push(SdOption::parse(buf)?);
        }

        // An entry whose option run points outside the table is malformed
        for entry in &entries {
            let run1_end = usize::from(entry.index_1st_option) + usize::from(entry.num_options_1);
            let run2_end = usize::from(entry.index_2nd_option) + usize::from(entry.num_options_2);
            if run1_end > options.len() || run2_end > options.len() {
                return None;
            }
        }

        Some(Self {
            flags,
            entries,
            options,
        })
    }

    /// Serialize just the SD payload (without the SOME/IP header)
    pub fn serialize_payload(&self) -> Bytes {
        let entries_len = self.entries.len() * SdEntry::SIZE;
        let options_len: usize = self.options.iter().map(SdOption::size).sum();

        let mut buf = BytesMut::with_capacity(12 + entries_len + options_len);

        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(0);

        buf.put_u32(entries_len as u32);
        for entry in &self.entries {
            entry.serialize(&mut buf);
        }

        buf.put_u32(options_len as u32);
        for option in &self.options {
            option.serialize(&mut buf);
        }

        buf.freeze()
    }

    /// Serialize as a complete SOME/IP message with the given session id
    pub fn serialize(&self, session_id: u16) -> Bytes {
        let payload = self.serialize_payload();
        build_message(
            Header {
                service_id: SD_SERVICE_ID,
                method_id: SD_METHOD_ID,
                length: 0,
                client_id: SD_CLIENT_ID,
                session_id,
                protocol_version: PROTOCOL_VERSION,
                interface_version: SD_INTERFACE_VERSION,
                message_type: MessageType::Notification,
                return_code: 0x00,
            },
            &payload,
        )
    }

    /// Append an entry, returning its index
    pub fn add_entry(&mut self, entry: SdEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Append an option, returning its index
    pub fn add_option(&mut self, option: SdOption) -> u8 {
        self.options.push(option);
        (self.options.len() - 1) as u8
    }

    /// The options attached to an entry: run 1 followed by run 2
    pub fn options_for(&self, entry: &SdEntry) -> impl Iterator<Item = &SdOption> {
        let run1 = usize::from(entry.index_1st_option)
            ..usize::from(entry.index_1st_option) + usize::from(entry.num_options_1);
        let run2 = usize::from(entry.index_2nd_option)
            ..usize::from(entry.index_2nd_option) + usize::from(entry.num_options_2);
        run1.chain(run2).filter_map(|i| self.options.get(i))
    }

    /// First endpoint option of an entry carrying the wanted protocol
    pub fn endpoint_for(&self, entry: &SdEntry, protocol: L4Protocol) -> Option<SocketAddr> {
        self.options_for(entry)
            .filter_map(SdOption::as_endpoint)
            .find(|(_, p)| *p == protocol)
            .map(|(addr, _)| addr)
    }

    /// First endpoint option of an entry regardless of protocol
    pub fn any_endpoint_for(&self, entry: &SdEntry) -> Option<(SocketAddr, L4Protocol)> {
        self.options_for(entry).find_map(SdOption::as_endpoint)
    }
}

// ============================================================================
// PAYLOAD PRIMITIVES
// ============================================================================

/// Length-prefixed payload primitives used by generated serializers.
///
/// Dynamic arrays and strings are prefixed with a 4-byte big-endian byte
/// length; element counts follow from the byte length and the element
/// stride. Signed integers are two's complement big-endian.
pub mod payload {
    use bytes::{Buf, BufMut, Bytes};

    pub fn encode_i32(value: i32, buf: &mut impl BufMut) {
        buf.put_i32(value);
    }

    pub fn decode_i32(buf: &mut impl Buf) -> Option<i32> {
        (buf.remaining() >= 4).then(|| buf.get_i32())
    }

    pub fn encode_u32(value: u32, buf: &mut impl BufMut) {
        buf.put_u32(value);
    }

    pub fn decode_u32(buf: &mut impl Buf) -> Option<u32> {
        (buf.remaining() >= 4).then(|| buf.get_u32())
    }

    /// Write a dynamic byte sequence with its 4-byte length prefix
    pub fn encode_bytes(value: &[u8], buf: &mut impl BufMut) {
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }

    /// Read a dynamic byte sequence with its 4-byte length prefix
    pub fn decode_bytes(buf: &mut impl Buf) -> Option<Bytes> {
        let len = decode_u32(buf)? as usize;
        (buf.remaining() >= len).then(|| buf.copy_to_bytes(len))
    }

    /// Write a UTF-8 string with its 4-byte byte-length prefix
    pub fn encode_string(value: &str, buf: &mut impl BufMut) {
        encode_bytes(value.as_bytes(), buf);
    }

    /// Read a UTF-8 string with its 4-byte byte-length prefix
    pub fn decode_string(buf: &mut impl Buf) -> Option<String> {
        let raw = decode_bytes(buf)?;
        String::from_utf8(raw.to_vec()).ok()
    }

    /// Write a dynamic array of fixed-stride elements
    pub fn encode_array<T>(
        items: &[T],
        stride: usize,
        buf: &mut bytes::BytesMut,
        mut encode: impl FnMut(&T, &mut bytes::BytesMut),
    ) {
        buf.put_u32((items.len() * stride) as u32);
        for item in items {
            encode(item, buf);
        }
    }

    /// Read a dynamic array of fixed-stride elements
    pub fn decode_array<T>(
        stride: usize,
        buf: &mut Bytes,
        mut decode: impl FnMut(&mut Bytes) -> Option<T>,
    ) -> Option<Vec<T>> {
        let byte_len = decode_u32(buf)? as usize;
        if stride == 0 || byte_len % stride != 0 || buf.remaining() < byte_len {
            return None;
        }
        let count = byte_len / stride;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(decode(buf)?);
        }
        Some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn header_roundtrip() {
        let header = Header {
            service_id: 0x1001,
            method_id: 0x0001,
            length: 24,
            client_id: 0x0000,
            session_id: 0x0042,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 0x01,
            message_type: MessageType::Request,
            return_code: 0x00,
        };

        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), Header::SIZE);

        let parsed = Header::parse(&mut buf.freeze()).unwrap();
        assert_eq!(header, parsed);
    }

    #[test_log::test]
    fn header_rejects_wrong_protocol_version() {
        let mut buf = BytesMut::new();
        Header {
            service_id: 0x1001,
            method_id: 0x0001,
            length: 8,
            client_id: 0,
            session_id: 1,
            protocol_version: 0x02,
            interface_version: 1,
            message_type: MessageType::Request,
            return_code: 0,
        }
        .serialize(&mut buf);

        assert!(Header::parse(&mut buf.freeze()).is_none());
    }

    #[test_log::test]
    fn header_rejects_short_input_and_short_length() {
        let mut short = Bytes::from_static(&[0u8; 15]);
        assert!(Header::parse(&mut short).is_none());

        let mut buf = BytesMut::new();
        Header {
            service_id: 0x1001,
            method_id: 0x0001,
            length: 7,
            client_id: 0,
            session_id: 1,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 1,
            message_type: MessageType::Request,
            return_code: 0,
        }
        .serialize(&mut buf);
        assert!(Header::parse(&mut buf.freeze()).is_none());
    }

    #[test_log::test]
    fn build_message_sets_length_to_payload_plus_eight() {
        let payload = vec![0xAAu8; 100];
        let msg = build_message(
            Header {
                service_id: 0x1001,
                method_id: 2,
                length: 0,
                client_id: 0,
                session_id: 1,
                protocol_version: PROTOCOL_VERSION,
                interface_version: 1,
                message_type: MessageType::Request,
                return_code: 0,
            },
            &payload,
        );

        let mut cursor = msg.clone();
        let header = Header::parse(&mut cursor).unwrap();
        assert_eq!(header.length, 108);
        assert_eq!(header.payload_length(), 100);
        assert_eq!(frame_length(&msg), Some(116));
    }

    #[test_log::test]
    fn message_type_tp_flag_is_bit_5() {
        assert!(!MessageType::Request.is_tp());
        assert!(MessageType::TpRequest.is_tp());
        assert!(MessageType::TpResponse.is_tp());
        assert_eq!(MessageType::Request.with_tp_flag(), MessageType::TpRequest);
        assert_eq!(
            MessageType::TpNotification.without_tp_flag(),
            MessageType::Notification
        );
        assert_eq!(MessageType::from_u8(0xA1), Some(MessageType::TpError));
        assert!(MessageType::from_u8(0x23).is_none());
    }

    #[test_log::test]
    fn sd_entry_roundtrip_offer() {
        let entry = SdEntry::offer_service(0x2000, 0x0001, 1, 3, 0x00_0E10, 2, 1);

        let mut buf = BytesMut::new();
        entry.serialize(&mut buf);
        assert_eq!(buf.len(), SdEntry::SIZE);

        let parsed = SdEntry::parse(&mut buf.freeze()).unwrap();
        assert_eq!(entry, parsed);
        assert_eq!(parsed.ttl, 3600);
        assert_eq!(parsed.minor, 3);
    }

    #[test_log::test]
    fn sd_entry_eventgroup_sits_in_high_half_of_minor() {
        let entry = SdEntry::subscribe_eventgroup(0x3000, 1, 1, 0x0001, 3, 0, 1);

        let mut buf = BytesMut::new();
        entry.serialize(&mut buf);
        let raw = buf.freeze();

        // bytes 12-13 carry the eventgroup id, bytes 14-15 stay zero
        assert_eq!(&raw[12..16], &[0x00, 0x01, 0x00, 0x00]);

        let parsed = SdEntry::parse(&mut raw.clone()).unwrap();
        assert_eq!(parsed.eventgroup_id(), 0x0001);
    }

    #[test_log::test]
    fn sd_option_roundtrip_all_kinds() {
        let options = [
            SdOption::Ipv4Endpoint {
                addr: Ipv4Addr::new(10, 0, 1, 1),
                port: 30501,
                protocol: L4Protocol::Udp,
            },
            SdOption::Ipv4Endpoint {
                addr: Ipv4Addr::new(10, 0, 1, 2),
                port: 30502,
                protocol: L4Protocol::Tcp,
            },
            SdOption::Ipv6Endpoint {
                addr: "fd00::1".parse().unwrap(),
                port: 30503,
                protocol: L4Protocol::Udp,
            },
            SdOption::Ipv4Multicast {
                addr: Ipv4Addr::new(225, 0, 0, 3),
                port: 30895,
            },
            SdOption::Ipv6Multicast {
                addr: "ff0e::4:c".parse().unwrap(),
                port: 31890,
            },
        ];

        for option in options {
            let mut buf = BytesMut::new();
            option.serialize(&mut buf);
            assert_eq!(buf.len(), option.size());
            let parsed = SdOption::parse(&mut buf.freeze()).unwrap();
            assert_eq!(option, parsed);
        }
    }

    #[test_log::test]
    fn sd_message_roundtrip() {
        let mut msg = SdMessage::new(SdMessage::FLAG_REBOOT | SdMessage::FLAG_UNICAST);
        let opt = msg.add_option(SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(192, 168, 1, 100),
            port: 30501,
            protocol: L4Protocol::Udp,
        });
        msg.add_entry(SdEntry::offer_service(0x1001, 1, 1, 0, 3600, opt, 1));

        let bytes = msg.serialize(1);
        let mut cursor = bytes.clone();
        let header = Header::parse(&mut cursor).unwrap();
        assert_eq!(header.service_id, SD_SERVICE_ID);
        assert_eq!(header.method_id, SD_METHOD_ID);
        assert_eq!(header.message_type, MessageType::Notification);
        assert_eq!(header.payload_length(), cursor.remaining());

        let parsed = SdMessage::parse(&mut cursor).unwrap();
        assert_eq!(parsed.flags, msg.flags);
        assert_eq!(parsed.entries, msg.entries);
        assert_eq!(parsed.options, msg.options);
    }

    #[test_log::test]
    fn sd_message_resolves_entry_options_by_run() {
        let mut msg = SdMessage::new(0);
        msg.add_option(SdOption::Ipv4Multicast {
            addr: Ipv4Addr::new(225, 0, 0, 3),
            port: 30895,
        });
        msg.add_option(SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(10, 0, 1, 1),
            port: 40000,
            protocol: L4Protocol::Udp,
        });
        msg.add_option(SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(10, 0, 1, 1),
            port: 40001,
            protocol: L4Protocol::Tcp,
        });

        // run 1 = options 0..3
        let entry = SdEntry::offer_service(0x1001, 1, 1, 0, 3600, 0, 3);

        assert_eq!(
            msg.endpoint_for(&entry, L4Protocol::Udp),
            Some("10.0.1.1:40000".parse().unwrap())
        );
        assert_eq!(
            msg.endpoint_for(&entry, L4Protocol::Tcp),
            Some("10.0.1.1:40001".parse().unwrap())
        );

        // an entry referencing only the multicast option has no endpoint
        let bare = SdEntry::offer_service(0x1001, 1, 1, 0, 3600, 0, 1);
        assert!(msg.any_endpoint_for(&bare).is_none());
    }

    #[test_log::test]
    fn sd_message_rejects_out_of_range_option_reference() {
        let mut msg = SdMessage::new(0);
        let opt = msg.add_option(SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(10, 0, 1, 1),
            port: 40000,
            protocol: L4Protocol::Udp,
        });
        // claims two options where only one exists
        msg.add_entry(SdEntry::offer_service(0x1001, 1, 1, 0, 3600, opt, 2));

        let payload = msg.serialize_payload();
        assert!(SdMessage::parse(&mut payload.clone()).is_none());
    }

    #[test_log::test]
    fn sd_message_rejects_truncated_arrays() {
        let mut msg = SdMessage::new(0);
        msg.add_entry(SdEntry::find_service(0x1001, 0xFFFF, 1, 0, 3600));
        let payload = msg.serialize_payload();

        // drop the trailing options-length word
        let mut truncated = payload.slice(..payload.len() - 2);
        assert!(SdMessage::parse(&mut truncated).is_none());

        // corrupt the entries length so it overruns the buffer
        let mut corrupt = BytesMut::from(&payload[..]);
        corrupt[7] = 0xFF;
        assert!(SdMessage::parse(&mut corrupt.freeze()).is_none());
    }

    #[test_log::test]
    fn payload_primitives_roundtrip() {
        use super::payload::*;

        for value in [0i32, 1, -1, i32::MIN, i32::MAX] {
            let mut buf = BytesMut::new();
            encode_i32(value, &mut buf);
            assert_eq!(decode_i32(&mut buf.freeze()), Some(value));
        }

        let mut buf = BytesMut::new();
        encode_string("fabric", &mut buf);
        let mut cursor = buf.freeze();
        assert_eq!(cursor.clone().get_u32(), 6);
        assert_eq!(decode_string(&mut cursor).as_deref(), Some("fabric"));

        for count in [0usize, 1, 1000] {
            let items: Vec<u32> = (0..count as u32).collect();
            let mut buf = BytesMut::new();
            encode_array(&items, 4, &mut buf, |v, b| b.put_u32(*v));
            let mut cursor = buf.freeze();
            assert_eq!(cursor.clone().get_u32() as usize, count * 4);
            let decoded = decode_array(4, &mut cursor, |b| decode_u32(b)).unwrap();
            assert_eq!(decoded, items);
        }
    }
}
