//! # fabricip
//!
//! A multi-interface async SOME/IP runtime for tokio: request/response
//! RPC over UDP and TCP, multicast Service Discovery, eventgroup
//! subscription with notification fan-out, and TP segmentation for
//! payloads beyond the datagram MTU.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fabricip::{Config, Runtime, Reply, RequestHandler, ReturnCode};
//!
//! struct Echo;
//!
//! impl RequestHandler for Echo {
//!     fn service_id(&self) -> u16 { 0x1001 }
//!     fn handle(&self, _header: &fabricip::wire::Header, payload: &[u8]) -> Option<Reply> {
//!         Some(Reply::ok(payload.to_vec().into()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> fabricip::Result<()> {
//!     let config = Config::load("fabric.json")?;
//!
//!     // Server side
//!     let server = Runtime::new(config.clone(), "server_instance")?;
//!     server.offer_service("echo", std::sync::Arc::new(Echo)).await?;
//!
//!     // Client side
//!     let client = Runtime::new(config, "client_instance")?;
//!     let proxy = client.create_client("echo").await?;
//!     let response = proxy.call(1, bytes::Bytes::from_static(b"ping")).await?;
//!     assert_eq!(&response.payload[..], b"ping");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Layer | Module |
//! |-------|--------|
//! | Wire codec (header, SD, TP) | [`wire`], [`tp`] |
//! | Session-id sequencing | [`session`] |
//! | Interface table and sockets | internal |
//! | Peer / offer / subscriber state | internal, see [`Endpoint`] |
//! | SD state machine and reactor | internal |
//! | Public operations | [`Runtime`], [`ServiceProxy`] |
//!
//! Generated service stubs sit on top of [`RequestHandler`] (server side)
//! and [`ServiceProxy`] (client side) and own all payload
//! serialization; the runtime moves opaque bytes.

use bytes::Bytes;

mod iface;
mod reactor;
mod registry;
mod sd;

pub mod config;
pub mod error;
pub mod runtime;
pub mod session;
pub mod tp;
pub mod wire;

pub use config::{Config, Transport};
pub use error::{Error, Result};
pub use registry::{Endpoint, Response};
pub use runtime::{EventStream, Runtime, ServiceProxy};

/// SOME/IP return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
    WrongMessageType = 0x0A,
}

/// An event delivered to a subscribed listener
#[derive(Debug, Clone)]
pub struct Event {
    /// Event ID (method id with bit 15 set, by convention)
    pub event_id: u16,
    pub payload: Bytes,
}

/// What a handler returns for a request
#[derive(Debug, Clone)]
pub struct Reply {
    pub return_code: ReturnCode,
    pub payload: Bytes,
}

impl Reply {
    /// Successful reply with a payload
    pub fn ok(payload: Bytes) -> Self {
        Self {
            return_code: ReturnCode::Ok,
            payload,
        }
    }

    /// Error reply without a payload
    pub fn error(return_code: ReturnCode) -> Self {
        Self {
            return_code,
            payload: Bytes::new(),
        }
    }
}

/// Server-side service implementation, registered with
/// [`Runtime::offer_service`].
///
/// Generated stubs implement this: they deserialize the request payload,
/// dispatch on `header.method_id` and serialize the result. Returning
/// `None` suppresses the response, which is only valid for
/// fire-and-forget requests.
///
/// Handlers run on the reactor task and must not block.
pub trait RequestHandler: Send + Sync + 'static {
    fn service_id(&self) -> u16;

    fn major_version(&self) -> u8 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn handle(&self, header: &wire::Header, payload: &[u8]) -> Option<Reply>;
}

pub mod prelude {
    pub use crate::{
        Config, Endpoint, Error, Event, Reply, RequestHandler, Response, Result, ReturnCode,
        Runtime, ServiceProxy, Transport,
    };
}
